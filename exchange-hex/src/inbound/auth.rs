//! Bearer-token identity for incoming requests.
//!
//! Tokens are HS256 JWTs minted by the external identity provider. A request
//! without a token proceeds as an anonymous [`Actor`]; the access policy
//! decides what it may do. A token that fails verification is rejected here.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{Request, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::{Deserialize, Serialize};

use exchange_types::{AccessError, Actor, ExchangeRepository, Identity, IdentityVerifier};

use super::handlers::{ApiError, AppState};
use super::rate_limit::{RateKey, client_addr, too_many_requests};

/// Audience the identity provider stamps on user tokens unless configured otherwise.
pub const DEFAULT_AUDIENCE: &str = "authenticated";

/// Claims read from the identity provider's token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Provider subject
    pub sub: String,
    pub email: String,
    /// Expiration time (UTC timestamp)
    pub exp: usize,
}

/// Verifies HS256 tokens against a shared secret and audience.
pub struct JwtVerifier {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(secret: &str, audience: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_audience(&[audience]);
        validation.set_required_spec_claims(&["exp", "aud", "sub"]);
        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }
}

impl IdentityVerifier for JwtVerifier {
    fn verify(&self, token: &str) -> Result<Identity, AccessError> {
        let data = decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map_err(|e| AccessError::InvalidToken(format!("Invalid or expired token: {}", e)))?;
        Ok(Identity {
            external_id: data.claims.sub,
            email: data.claims.email,
        })
    }
}

/// Extracts the token from the Authorization header.
/// Expected format: "Bearer <token>" or just "<token>"
fn extract_bearer(auth_header: Option<&str>) -> Option<&str> {
    let header = auth_header?;
    let token = header.strip_prefix("Bearer ").unwrap_or(header).trim();
    if token.is_empty() { None } else { Some(token) }
}

/// Resolves the caller and stores it as an [`Actor`] request extension.
///
/// This middleware:
/// 1. Extracts the bearer token, if any
/// 2. Verifies it through the configured [`IdentityVerifier`]
/// 3. Upserts the user behind the token
/// 4. Returns 401 Unauthorized if verification fails, after charging the
///    rejected attempt to the caller's address bucket
///
/// `/health` bypasses identity entirely.
pub async fn auth_middleware<R: ExchangeRepository>(
    State(state): State<Arc<AppState<R>>>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    if request.uri().path() == "/health" {
        return next.run(request).await;
    }

    let auth_header = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    let actor = match extract_bearer(auth_header) {
        None => Actor::anonymous(),
        Some(token) => {
            let identity = match state.verifier.verify(token) {
                Ok(identity) => identity,
                Err(e) => {
                    tracing::debug!("Token rejected: {}", e);
                    let key = RateKey::for_caller(None, client_addr(&request));
                    if !state.rate_limiter.check(key) {
                        return too_many_requests(&state.rate_limiter);
                    }
                    return ApiError(e.into()).into_response();
                }
            };
            match state.service.identify(identity).await {
                Ok(actor) => actor,
                Err(e) => return ApiError(e).into_response(),
            }
        }
    };

    request.extensions_mut().insert(actor);
    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{EncodingKey, Header, encode};

    const SECRET: &str = "test-secret";

    #[derive(Serialize)]
    struct TokenClaims<'a> {
        sub: &'a str,
        email: &'a str,
        aud: &'a str,
        exp: i64,
    }

    fn token(secret: &str, aud: &str, exp: i64) -> String {
        let claims = TokenClaims {
            sub: "user-1",
            email: "client@example.com",
            aud,
            exp,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn in_an_hour() -> i64 {
        chrono::Utc::now().timestamp() + 3600
    }

    #[test]
    fn test_extract_bearer() {
        assert_eq!(extract_bearer(Some("Bearer abc.def")), Some("abc.def"));
        assert_eq!(extract_bearer(Some("abc.def")), Some("abc.def"));
        assert_eq!(extract_bearer(Some("Bearer ")), None);
        assert_eq!(extract_bearer(None), None);
    }

    #[test]
    fn test_valid_token() {
        let verifier = JwtVerifier::new(SECRET, DEFAULT_AUDIENCE);
        let identity = verifier
            .verify(&token(SECRET, DEFAULT_AUDIENCE, in_an_hour()))
            .unwrap();
        assert_eq!(identity.external_id, "user-1");
        assert_eq!(identity.email, "client@example.com");
    }

    #[test]
    fn test_wrong_secret() {
        let verifier = JwtVerifier::new(SECRET, DEFAULT_AUDIENCE);
        let result = verifier.verify(&token("other-secret", DEFAULT_AUDIENCE, in_an_hour()));
        assert!(matches!(result, Err(AccessError::InvalidToken(_))));
    }

    #[test]
    fn test_wrong_audience() {
        let verifier = JwtVerifier::new(SECRET, DEFAULT_AUDIENCE);
        let result = verifier.verify(&token(SECRET, "service_role", in_an_hour()));
        assert!(matches!(result, Err(AccessError::InvalidToken(_))));
    }

    #[test]
    fn test_expired_token() {
        let verifier = JwtVerifier::new(SECRET, DEFAULT_AUDIENCE);
        let expired = chrono::Utc::now().timestamp() - 3600;
        let result = verifier.verify(&token(SECRET, DEFAULT_AUDIENCE, expired));
        assert!(matches!(result, Err(AccessError::InvalidToken(_))));
    }

    #[test]
    fn test_garbage_token() {
        let verifier = JwtVerifier::new(SECRET, DEFAULT_AUDIENCE);
        assert!(verifier.verify("not-a-jwt").is_err());
    }
}
