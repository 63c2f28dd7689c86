use axum::http::HeaderMap;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

/// Authenticated caller, lifted from a bearer token issued elsewhere.
#[derive(Debug, Clone, Serialize)]
pub struct Identity {
    pub user_id: i64,
    pub api_key_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct Claims {
    sub: serde_json::Value,
    #[serde(default)]
    api_key_id: Option<i64>,
}

/// Validates HS256 bearer tokens. Token issuance is not this service's
/// concern; with no configured secret every request is anonymous.
pub struct AuthContext {
    decoding: Option<DecodingKey>,
}

impl AuthContext {
    pub fn new(secret: &str) -> Self {
        Self {
            decoding: (!secret.is_empty()).then(|| DecodingKey::from_secret(secret.as_bytes())),
        }
    }

    /// Identity from the Authorization header; absent or invalid tokens mean
    /// an anonymous request, never an error.
    pub fn identity(&self, headers: &HeaderMap) -> Option<Identity> {
        let decoding = self.decoding.as_ref()?;
        let token = headers
            .get(axum::http::header::AUTHORIZATION)?
            .to_str()
            .ok()?
            .strip_prefix("Bearer ")?;

        let data = match decode::<Claims>(token, decoding, &Validation::new(Algorithm::HS256)) {
            Ok(data) => data,
            Err(err) => {
                tracing::debug!(error = %err, "rejected bearer token");
                return None;
            }
        };

        let user_id = match &data.claims.sub {
            serde_json::Value::Number(n) => n.as_i64()?,
            serde_json::Value::String(s) => s.parse().ok()?,
            _ => return None,
        };
        Some(Identity {
            user_id,
            api_key_id: data.claims.api_key_id,
        })
    }
}
