use actix_web::dev::Payload;
use actix_web::{web, FromRequest, HttpRequest};
use futures_util::future::{ready, Ready};
use log::{error, warn};
use subtle::ConstantTimeEq;

use crate::error::AppError;

/// The single shared secret admin callers must present
#[derive(Clone)]
pub struct AdminCredential {
    key: String,
}

impl AdminCredential {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }

    pub fn matches(&self, presented: &str) -> bool {
        constant_time_equal(presented, &self.key)
    }
}

/// Compares two strings in constant time to prevent timing attacks
pub fn constant_time_equal(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// Second word of an `Authorization` value, e.g. the key in `Bearer <key>`.
pub fn credential_from_header(value: &str) -> Option<&str> {
    value.split_whitespace().nth(1)
}

/// Extractor that only succeeds for requests carrying the admin credential
#[derive(Debug, Clone, Copy)]
pub struct AdminAuthorized;

impl FromRequest for AdminAuthorized {
    type Error = AppError;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        let Some(credential) = req.app_data::<web::Data<AdminCredential>>() else {
            error!("Admin credential not configured for {}", req.path());
            return ready(Err(AppError::Configuration(
                "Admin credential not configured".to_string(),
            )));
        };

        let presented = req
            .headers()
            .get("authorization")
            .and_then(|value| value.to_str().ok())
            .and_then(credential_from_header);

        match presented {
            Some(key) if credential.matches(key) => ready(Ok(AdminAuthorized)),
            _ => {
                warn!("Rejected admin request to {}", req.path());
                ready(Err(AppError::Unauthorized("Incorrect authorization.".to_string())))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::test::TestRequest;

    #[test]
    fn test_constant_time_equal() {
        assert!(constant_time_equal("secret", "secret"));
        assert!(!constant_time_equal("secret", "secreT"));
        assert!(!constant_time_equal("short", "much_longer_string"));
    }

    #[test]
    fn test_credential_from_header() {
        assert_eq!(credential_from_header("Bearer abc123"), Some("abc123"));
        assert_eq!(credential_from_header("Bearer   abc123  "), Some("abc123"));
        assert_eq!(credential_from_header("abc123"), None);
        assert_eq!(credential_from_header(""), None);
    }

    #[actix_rt::test]
    async fn test_extractor_accepts_matching_key() {
        let req = TestRequest::default()
            .app_data(web::Data::new(AdminCredential::new("k3y")))
            .insert_header(("Authorization", "Bearer k3y"))
            .to_http_request();

        assert!(AdminAuthorized::extract(&req).await.is_ok());
    }

    #[actix_rt::test]
    async fn test_extractor_rejects_wrong_or_missing_key() {
        let wrong = TestRequest::default()
            .app_data(web::Data::new(AdminCredential::new("k3y")))
            .insert_header(("Authorization", "Bearer nope"))
            .to_http_request();
        let missing = TestRequest::default()
            .app_data(web::Data::new(AdminCredential::new("k3y")))
            .to_http_request();

        assert!(matches!(AdminAuthorized::extract(&wrong).await, Err(AppError::Unauthorized(_))));
        assert!(matches!(AdminAuthorized::extract(&missing).await, Err(AppError::Unauthorized(_))));
    }
}
