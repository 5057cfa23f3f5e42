//! Gateway error types.

use thiserror::Error;

/// Errors that can occur when talking to the cluster.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Watch stream failed and could not be resumed
    #[error("watch stream error: {0}")]
    Watch(String),

    /// Template rendering failed
    #[error("template rendering failed: {0}")]
    Render(String),

    /// A rendered manifest was not usable
    #[error("invalid manifest: {0}")]
    Manifest(String),

    /// The target resource does not exist
    #[error("not found: {0}")]
    NotFound(String),
}

impl GatewayError {
    /// HTTP status of the underlying API error, when there is one.
    pub fn api_status(&self) -> Option<u16> {
        match self {
            GatewayError::Kube(kube::Error::Api(resp)) => Some(resp.code),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, GatewayError::NotFound(_)) || self.api_status() == Some(404)
    }

    pub fn is_conflict(&self) -> bool {
        self.api_status() == Some(409)
    }

    /// Whether retrying the call may help: server-side 5xx, throttling,
    /// or transport-level failures. Definite 4xx answers are not
    /// transient.
    pub fn is_transient(&self) -> bool {
        match self {
            GatewayError::Kube(kube::Error::Api(resp)) => resp.code >= 500 || resp.code == 429,
            GatewayError::Kube(_) => true,
            GatewayError::Watch(_) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_error(code: u16) -> GatewayError {
        GatewayError::Kube(kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "boom".to_string(),
            reason: String::new(),
            code,
        }))
    }

    #[test]
    fn server_errors_are_transient() {
        assert!(api_error(500).is_transient());
        assert!(api_error(429).is_transient());
    }

    #[test]
    fn client_errors_are_not_transient() {
        assert!(!api_error(404).is_transient());
        assert!(!api_error(409).is_transient());
        assert!(api_error(404).is_not_found());
        assert!(api_error(409).is_conflict());
    }
}
