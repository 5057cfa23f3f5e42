//! Basic authentication for mutating routes.

use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use base64::{engine::general_purpose, Engine as _};

use crate::api::error::ApiError;
use crate::settings::Settings;

/// Verifies the shared admin credential. Read-only routes never call
/// this.
pub fn require_admin(settings: &Settings, headers: &HeaderMap) -> Result<(), ApiError> {
    let header = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(ApiError::Unauthorized)?;
    let encoded = header.strip_prefix("Basic ").ok_or(ApiError::Unauthorized)?;
    let decoded = general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|_| ApiError::Unauthorized)?;
    let decoded = String::from_utf8(decoded).map_err(|_| ApiError::Unauthorized)?;
    let (user, passwd) = decoded.split_once(':').ok_or(ApiError::Unauthorized)?;
    let user_ok = constant_time_eq(user.as_bytes(), settings.api_admin_user.as_bytes());
    let passwd_ok = constant_time_eq(passwd.as_bytes(), settings.api_admin_passwd.as_bytes());
    if user_ok & passwd_ok {
        Ok(())
    } else {
        Err(ApiError::Unauthorized)
    }
}

pub(crate) fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::test_settings;

    fn headers_with(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, value.parse().unwrap());
        headers
    }

    fn basic(user: &str, passwd: &str) -> String {
        format!(
            "Basic {}",
            general_purpose::STANDARD.encode(format!("{user}:{passwd}"))
        )
    }

    #[test]
    fn accepts_the_configured_credential() {
        let settings = test_settings();
        let headers = headers_with(&basic("admin", "secret"));
        assert!(require_admin(&settings, &headers).is_ok());
    }

    #[test]
    fn rejects_wrong_or_missing_credentials() {
        let settings = test_settings();
        assert!(require_admin(&settings, &HeaderMap::new()).is_err());
        assert!(require_admin(&settings, &headers_with(&basic("admin", "wrong"))).is_err());
        assert!(require_admin(&settings, &headers_with(&basic("other", "secret"))).is_err());
        assert!(require_admin(&settings, &headers_with("Bearer token")).is_err());
        assert!(require_admin(&settings, &headers_with("Basic not-base64!")).is_err());
    }
}
