use axum::{
    extract::Request,
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

pub struct AuthService {
    enabled: bool,
    api_keys: Arc<Vec<String>>,
}

impl AuthService {
    pub fn new(enabled: bool, api_keys: Vec<String>) -> Self {
        Self {
            enabled,
            api_keys: Arc::new(api_keys),
        }
    }

    pub fn validate_key(&self, key: &str) -> bool {
        // If authentication is disabled, allow all requests
        if !self.enabled {
            return true;
        }

        // If no API keys configured but auth is enabled, allow all (dev mode)
        if self.api_keys.is_empty() {
            return true;
        }

        self.api_keys.iter().any(|k| k == key)
    }
}

/// Guards the management API. The redirect server never goes through this.
pub async fn auth_middleware(
    auth_service: Arc<AuthService>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Response {
    let api_key = headers
        .get("X-API-Key")
        .and_then(|h| h.to_str().ok())
        .unwrap_or("");

    if auth_service.validate_key(api_key) {
        next.run(request).await
    } else {
        (StatusCode::UNAUTHORIZED, "Invalid or missing API key").into_response()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    exp: usize,
}

/// Resolves an optional signed-in user from a bearer token, used only for
/// event attribution. Absent or invalid tokens mean anonymous, they never
/// fail the request.
pub struct IdentityResolver {
    decoding_key: Option<DecodingKey>,
    validation: Validation,
}

impl IdentityResolver {
    pub fn new(secret: Option<&str>) -> Self {
        Self {
            decoding_key: secret.map(|s| DecodingKey::from_secret(s.as_bytes())),
            validation: Validation::new(Algorithm::HS256),
        }
    }

    pub fn resolve(&self, headers: &HeaderMap) -> Option<String> {
        let key = self.decoding_key.as_ref()?;
        let auth = headers.get("authorization")?.to_str().ok()?;
        let token = auth.strip_prefix("Bearer ")?;

        match decode::<Claims>(token, key, &self.validation) {
            Ok(data) => Some(data.claims.sub),
            Err(e) => {
                debug!("ignoring invalid bearer token: {}", e);
                None
            }
        }
    }
}
