use axum::http::HeaderMap;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use crate::config::AppConfig;
use crate::error::AppError;

#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub user_id: String,
}

/// HS256 bearer token verifier; `exp` and `aud` are mandatory
#[derive(Clone)]
pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    aud: String,
    exp: i64,
}

impl JwtVerifier {
    pub fn new(config: &AppConfig) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_audience(&[config.jwt_audience.as_str()]);
        validation.set_required_spec_claims(&["exp", "aud", "sub"]);

        Self {
            key: DecodingKey::from_secret(config.jwt_secret.as_bytes()),
            validation,
        }
    }

    pub fn verify(&self, token: &str) -> Result<AuthenticatedUser, AppError> {
        let decoded = decode::<Claims>(token, &self.key, &self.validation).map_err(|error| {
            AppError::unauthorized(format!("Token validation failed: {}", sanitize(&error)))
        })?;
        if decoded.claims.sub.trim().is_empty() {
            return Err(AppError::unauthorized("Token subject is missing"));
        }
        Ok(AuthenticatedUser {
            user_id: decoded.claims.sub,
        })
    }
}

pub fn extract_bearer_token(headers: &HeaderMap) -> Result<&str, AppError> {
    let header = headers
        .get("authorization")
        .ok_or_else(|| AppError::unauthorized("Missing Authorization header"))?
        .to_str()
        .map_err(|_| AppError::unauthorized("Authorization header is not valid UTF-8"))?;

    let (scheme, token) = header
        .split_once(' ')
        .ok_or_else(|| AppError::unauthorized("Authorization header must be `Bearer <token>`"))?;

    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(AppError::unauthorized(
            "Authorization scheme must be `Bearer`",
        ));
    }
    let token = token.trim();
    if token.is_empty() {
        return Err(AppError::unauthorized("Bearer token is empty"));
    }

    Ok(token)
}

fn sanitize(error: &impl std::fmt::Display) -> String {
    error.to_string().replace('\n', " ").trim().to_string()
}

/// Sign a device token; tests stand in for the credential service with this
#[cfg(test)]
pub fn issue_token(config: &AppConfig, subject: &str, ttl_secs: i64) -> String {
    use jsonwebtoken::{encode, EncodingKey, Header};

    let claims = Claims {
        sub: subject.to_string(),
        aud: config.jwt_audience.clone(),
        exp: chrono::Utc::now().timestamp() + ttl_secs,
    };
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(config.jwt_secret.as_bytes()),
    )
    .unwrap()
}

#[cfg(test)]
pub fn test_config() -> AppConfig {
    AppConfig {
        bind_addr: "127.0.0.1:0".to_string(),
        db_path: std::path::PathBuf::from(":memory:"),
        jwt_secret: "0123456789abcdef0123456789abcdef".to_string(),
        jwt_audience: "clinic-sync".to_string(),
        max_batch: 100,
        token_retry_limit: 5,
    }
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn bearer_token_extractor_accepts_standard_header() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "authorization",
            HeaderValue::from_static("Bearer abc.def.ghi"),
        );

        assert_eq!(extract_bearer_token(&headers).unwrap(), "abc.def.ghi");
    }

    #[test]
    fn bearer_token_extractor_rejects_wrong_scheme() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Basic abc"));
        assert!(extract_bearer_token(&headers).is_err());
    }

    #[test]
    fn verifier_accepts_valid_token() {
        let config = test_config();
        let token = issue_token(&config, "device-1", 300);
        let user = JwtVerifier::new(&config).verify(&token).unwrap();
        assert_eq!(user.user_id, "device-1");
    }

    #[test]
    fn verifier_rejects_expired_token() {
        let config = test_config();
        let token = issue_token(&config, "device-1", -3_600);
        assert!(JwtVerifier::new(&config).verify(&token).is_err());
    }

    #[test]
    fn verifier_rejects_wrong_audience_and_secret() {
        let config = test_config();
        let mut other = test_config();
        other.jwt_audience = "someone-else".to_string();
        let token = issue_token(&other, "device-1", 300);
        assert!(JwtVerifier::new(&config).verify(&token).is_err());

        let mut forged = test_config();
        forged.jwt_secret = "ffffffffffffffffffffffffffffffff".to_string();
        let token = issue_token(&forged, "device-1", 300);
        assert!(JwtVerifier::new(&config).verify(&token).is_err());
    }
}
