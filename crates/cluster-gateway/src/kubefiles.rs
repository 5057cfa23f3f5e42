//! Kubefiles rendering.
//!
//! A kubefiles directory contains one template per mode
//! (`deployment.yaml`, `initialization.yaml`, `start.yaml`, `stop.yaml`,
//! `cleanup.yaml`), each a multi-document YAML file rendered with the
//! bundle variables. After rendering, every document is stamped with the
//! build label (and the job-kind label on jobs) so the controller can
//! find everything it created.

use serde_json::Value;

use build_model::labels::{LABEL_BUILD, LABEL_JOB_KIND};

use crate::bundle::BundleRequest;
use crate::error::GatewayError;

/// Renders the bundle's template into a list of manifest documents.
pub fn render(request: &BundleRequest) -> Result<Vec<Value>, GatewayError> {
    let path = request
        .kubefiles_path
        .join(format!("{}.yaml", request.vars.mode));
    let source = std::fs::read_to_string(&path)
        .map_err(|e| GatewayError::Render(format!("cannot read {}: {e}", path.display())))?;
    render_str(&source, request)
}

/// Renders a template string. Split out so tests do not need a template
/// directory on disk.
pub fn render_str(source: &str, request: &BundleRequest) -> Result<Vec<Value>, GatewayError> {
    let env = minijinja::Environment::new();
    let rendered = env
        .template_from_str(source)
        .and_then(|tmpl| tmpl.render(&request.vars))
        .map_err(|e| GatewayError::Render(e.to_string()))?;

    let mut docs = Vec::new();
    for document in serde_yaml::Deserializer::from_str(&rendered) {
        let value: Value = serde::Deserialize::deserialize(document)
            .map_err(|e| GatewayError::Manifest(format!("invalid YAML document: {e}")))?;
        if value.is_null() {
            continue;
        }
        docs.push(stamp(value, request)?);
    }
    Ok(docs)
}

/// Stamps ownership labels onto a rendered document and validates that
/// it is addressable (kind + metadata.name).
fn stamp(mut doc: Value, request: &BundleRequest) -> Result<Value, GatewayError> {
    let kind = doc
        .get("kind")
        .and_then(Value::as_str)
        .ok_or_else(|| GatewayError::Manifest("document without kind".to_string()))?
        .to_string();
    if doc
        .pointer("/metadata/name")
        .and_then(Value::as_str)
        .is_none()
    {
        return Err(GatewayError::Manifest(format!(
            "{kind} document without metadata.name"
        )));
    }

    let build_name = request.vars.build_name.clone();
    let job_kind = request.vars.mode.job_kind();
    set_label(&mut doc, "/metadata", LABEL_BUILD, &build_name);
    if kind == "Job" {
        if let Some(job_kind) = job_kind {
            set_label(&mut doc, "/metadata", LABEL_JOB_KIND, job_kind.as_str());
        }
    }
    // Pods created from templates must carry the labels too, for log
    // lookup and label-based deletion.
    if doc.pointer("/spec/template").is_some() {
        set_label(&mut doc, "/spec/template/metadata", LABEL_BUILD, &build_name);
        if kind == "Job" {
            if let Some(job_kind) = job_kind {
                set_label(
                    &mut doc,
                    "/spec/template/metadata",
                    LABEL_JOB_KIND,
                    job_kind.as_str(),
                );
            }
        }
    }
    Ok(doc)
}

fn set_label(doc: &mut Value, meta_pointer: &str, key: &str, value: &str) {
    // Create intermediate objects as needed.
    let mut current = doc;
    for segment in meta_pointer.split('/').filter(|s| !s.is_empty()) {
        let Some(obj) = current.as_object_mut() else {
            return;
        };
        current = obj
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Default::default()));
    }
    if let Some(meta) = current.as_object_mut() {
        let labels = meta
            .entry("labels".to_string())
            .or_insert_with(|| Value::Object(Default::default()));
        if let Some(labels) = labels.as_object_mut() {
            labels.insert(key.to_string(), Value::String(value.to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::{BundleVars, DeploymentMode};
    use build_model::CommitInfo;
    use std::collections::BTreeMap;

    fn request(mode: DeploymentMode) -> BundleRequest {
        let commit = CommitInfo::new("acme/svc", "main", None, &"a".repeat(40));
        BundleRequest {
            kubefiles_path: "/nonexistent".into(),
            vars: BundleVars::new(
                "runboat-builds",
                mode,
                "acme-svc-main-aaaaaaaa",
                "builds.example.com",
                &commit,
                "img:1",
                BTreeMap::new(),
                BTreeMap::new(),
                BTreeMap::new(),
            ),
        }
    }

    const DEPLOYMENT_TMPL: &str = r#"
apiVersion: apps/v1
kind: Deployment
metadata:
  name: "{{ build_name }}"
  namespace: "{{ namespace }}"
spec:
  replicas: 0
  template:
    spec:
      containers:
        - name: app
          image: "{{ image_name }}:{{ image_tag }}"
---
apiVersion: v1
kind: Service
metadata:
  name: "{{ build_name }}"
"#;

    #[test]
    fn renders_variables_and_splits_documents() {
        let docs = render_str(DEPLOYMENT_TMPL, &request(DeploymentMode::Deployment)).unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(
            docs[0].pointer("/metadata/name").unwrap(),
            "acme-svc-main-aaaaaaaa"
        );
        assert_eq!(
            docs[0]
                .pointer("/spec/template/spec/containers/0/image")
                .unwrap(),
            "img:1"
        );
    }

    #[test]
    fn stamps_build_label_on_every_document() {
        let docs = render_str(DEPLOYMENT_TMPL, &request(DeploymentMode::Deployment)).unwrap();
        for doc in &docs {
            assert_eq!(
                doc.pointer("/metadata/labels/runboat~1build")
                    .and_then(Value::as_str),
                Some("acme-svc-main-aaaaaaaa"),
                "missing build label in {doc}"
            );
        }
        // Pod template of the workload is labelled too.
        assert_eq!(
            docs[0]
                .pointer("/spec/template/metadata/labels/runboat~1build")
                .and_then(Value::as_str),
            Some("acme-svc-main-aaaaaaaa")
        );
    }

    #[test]
    fn stamps_job_kind_on_jobs() {
        let tmpl = r#"
apiVersion: batch/v1
kind: Job
metadata:
  name: "{{ build_name }}-initialize"
spec:
  backoffLimit: 0
  template:
    spec:
      restartPolicy: Never
      containers:
        - name: init
          image: "{{ image_name }}:{{ image_tag }}"
"#;
        let docs = render_str(tmpl, &request(DeploymentMode::Initialization)).unwrap();
        assert_eq!(
            docs[0]
                .pointer("/metadata/labels/runboat~1job-kind")
                .and_then(Value::as_str),
            Some("initialize")
        );
        assert_eq!(
            docs[0]
                .pointer("/spec/template/metadata/labels/runboat~1job-kind")
                .and_then(Value::as_str),
            Some("initialize")
        );
    }

    #[test]
    fn document_without_name_is_rejected() {
        let tmpl = "apiVersion: v1\nkind: Service\nmetadata: {}\n";
        let err = render_str(tmpl, &request(DeploymentMode::Start)).unwrap_err();
        assert!(matches!(err, GatewayError::Manifest(_)));
    }

    #[test]
    fn reads_template_from_mode_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("deployment.yaml"), DEPLOYMENT_TMPL).unwrap();
        let mut req = request(DeploymentMode::Deployment);
        req.kubefiles_path = dir.path().to_path_buf();
        let docs = render(&req).unwrap();
        assert_eq!(docs.len(), 2);
    }

    #[test]
    fn missing_template_file_is_a_render_error() {
        let err = render(&request(DeploymentMode::Deployment)).unwrap_err();
        assert!(matches!(err, GatewayError::Render(_)));
    }
}
