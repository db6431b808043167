//! Bearer token verification for ingest and subscriber connections.
//!
//! Tokens arrive in the `Authorization: Bearer` header or, for browser
//! WebSocket clients that cannot set headers, a `token` query parameter.
//! Verification prefers an asymmetric public key (RS256) and accepts a
//! shared secret (HS256) only when explicitly configured.

use axum::http::HeaderMap;
use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::AuthConfig;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing bearer token")]
    MissingToken,

    #[error("token has expired")]
    Expired,

    #[error("malformed token: {0}")]
    Malformed(String),

    #[error("invalid signature")]
    InvalidSignature,

    #[error("audience mismatch")]
    AudienceMismatch,

    #[error("issuer mismatch")]
    IssuerMismatch,

    #[error("unsupported signing algorithm {0:?}")]
    UnsupportedAlgorithm(Algorithm),
}

/// Authenticated identity for the lifetime of one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub user_id: String,
    pub tenant_id: String,
    pub email: String,
    pub role: String,
    pub audience: String,
    pub issuer: String,
    pub expiry: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RelayClaims {
    user_id: String,
    tenant_id: String,
    email: String,
    role: String,
    exp: i64,
    iat: i64,
    aud: String,
    iss: String,
}

/// Validates bearer tokens against the configured key material and
/// audience/issuer expectations.
pub struct TokenVerifier {
    rsa_key: Option<DecodingKey>,
    hmac_key: Option<DecodingKey>,
    audience: String,
    issuer: String,
}

impl TokenVerifier {
    pub fn from_config(cfg: &AuthConfig) -> anyhow::Result<Self> {
        let rsa_key = match &cfg.public_key_path {
            Some(path) => {
                let pem = std::fs::read(path).map_err(|e| {
                    anyhow::anyhow!("failed to read AUTH_PUBLIC_KEY_PATH {}: {e}", path.display())
                })?;
                Some(DecodingKey::from_rsa_pem(&pem)?)
            }
            None => None,
        };
        let hmac_key = cfg
            .hmac_secret
            .as_ref()
            .map(|s| DecodingKey::from_secret(s.as_bytes()));
        if rsa_key.is_none() && hmac_key.is_none() {
            anyhow::bail!("token verifier needs a public key or an HMAC secret");
        }

        Ok(Self {
            rsa_key,
            hmac_key,
            audience: cfg.audience.clone(),
            issuer: cfg.issuer.clone(),
        })
    }

    /// Verifies a raw bearer token and produces the session principal.
    pub fn verify(&self, raw: &str) -> Result<Principal, AuthError> {
        let token = sanitize_token(raw);
        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }

        let header =
            decode_header(&token).map_err(|e| AuthError::Malformed(e.to_string()))?;
        let key = match header.alg {
            Algorithm::RS256 => self
                .rsa_key
                .as_ref()
                .ok_or(AuthError::UnsupportedAlgorithm(Algorithm::RS256))?,
            Algorithm::HS256 => self
                .hmac_key
                .as_ref()
                .ok_or(AuthError::UnsupportedAlgorithm(Algorithm::HS256))?,
            other => return Err(AuthError::UnsupportedAlgorithm(other)),
        };

        let mut validation = Validation::new(header.alg);
        validation.set_audience(&[&self.audience]);
        validation.set_issuer(&[&self.issuer]);
        validation.set_required_spec_claims(&["exp", "iat", "aud", "iss"]);

        let data = decode::<RelayClaims>(&token, key, &validation).map_err(map_jwt_error)?;
        let claims = data.claims;

        Ok(Principal {
            user_id: claims.user_id,
            tenant_id: claims.tenant_id,
            email: claims.email,
            role: claims.role,
            audience: claims.aud,
            issuer: claims.iss,
            expiry: Utc
                .timestamp_opt(claims.exp, 0)
                .single()
                .unwrap_or_else(Utc::now),
        })
    }
}

fn map_jwt_error(err: jsonwebtoken::errors::Error) -> AuthError {
    use jsonwebtoken::errors::ErrorKind;
    match err.kind() {
        ErrorKind::ExpiredSignature => AuthError::Expired,
        ErrorKind::InvalidSignature => AuthError::InvalidSignature,
        ErrorKind::InvalidAudience => AuthError::AudienceMismatch,
        ErrorKind::InvalidIssuer => AuthError::IssuerMismatch,
        _ => AuthError::Malformed(err.to_string()),
    }
}

/// Strips surrounding whitespace and embedded line breaks, then
/// percent-decodes once. Tokens that arrive via the query string are often
/// URL-encoded by intermediaries.
pub fn sanitize_token(raw: &str) -> String {
    let stripped: String = raw
        .trim()
        .chars()
        .filter(|c| *c != '\r' && *c != '\n')
        .collect();
    match urlencoding::decode(&stripped) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => stripped,
    }
}

/// Pulls the bearer token from the `Authorization` header, falling back to
/// the `token` query parameter.
pub fn bearer_token(headers: &HeaderMap, query_token: Option<&str>) -> Option<String> {
    if let Some(value) = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    {
        if let Some(token) = value.strip_prefix("Bearer ") {
            return Some(token.to_string());
        }
    }
    query_token.map(|t| t.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    const SECRET: &str = "unit-test-secret";
    const AUD: &str = "murmur-relay";
    const ISS: &str = "https://auth.murmur.dev";

    fn verifier() -> TokenVerifier {
        TokenVerifier {
            rsa_key: None,
            hmac_key: Some(DecodingKey::from_secret(SECRET.as_bytes())),
            audience: AUD.to_string(),
            issuer: ISS.to_string(),
        }
    }

    fn claims(exp_offset: i64) -> RelayClaims {
        let now = Utc::now().timestamp();
        RelayClaims {
            user_id: "u-1".into(),
            tenant_id: "t-1".into(),
            email: "ada@example.com".into(),
            role: "member".into(),
            exp: now + exp_offset,
            iat: now,
            aud: AUD.into(),
            iss: ISS.into(),
        }
    }

    fn sign(claims: &RelayClaims) -> String {
        encode(
            &Header::default(),
            claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn test_valid_token() {
        let principal = verifier().verify(&sign(&claims(3600))).unwrap();
        assert_eq!(principal.user_id, "u-1");
        assert_eq!(principal.tenant_id, "t-1");
        assert_eq!(principal.audience, AUD);
    }

    #[test]
    fn test_expired_token() {
        let err = verifier().verify(&sign(&claims(-3600))).unwrap_err();
        assert!(matches!(err, AuthError::Expired));
    }

    #[test]
    fn test_wrong_audience() {
        let mut c = claims(3600);
        c.aud = "someone-else".into();
        let err = verifier().verify(&sign(&c)).unwrap_err();
        assert!(matches!(err, AuthError::AudienceMismatch));
    }

    #[test]
    fn test_wrong_issuer() {
        let mut c = claims(3600);
        c.iss = "https://evil.example".into();
        let err = verifier().verify(&sign(&c)).unwrap_err();
        assert!(matches!(err, AuthError::IssuerMismatch));
    }

    #[test]
    fn test_tampered_signature() {
        let token = sign(&claims(3600));
        let mut parts: Vec<&str> = token.split('.').collect();
        let sig = "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA";
        parts[2] = sig;
        let err = verifier().verify(&parts.join(".")).unwrap_err();
        assert!(matches!(err, AuthError::InvalidSignature));
    }

    #[test]
    fn test_garbage_token() {
        let err = verifier().verify("not-a-jwt").unwrap_err();
        assert!(matches!(err, AuthError::Malformed(_)));
    }

    #[test]
    fn test_missing_claims_is_malformed() {
        #[derive(Serialize)]
        struct Thin {
            exp: i64,
            iat: i64,
            aud: String,
            iss: String,
        }
        let token = encode(
            &Header::default(),
            &Thin {
                exp: Utc::now().timestamp() + 600,
                iat: Utc::now().timestamp(),
                aud: AUD.into(),
                iss: ISS.into(),
            },
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap();
        let err = verifier().verify(&token).unwrap_err();
        assert!(matches!(err, AuthError::Malformed(_)));
    }

    #[test]
    fn test_sanitize_strips_noise() {
        assert_eq!(sanitize_token("  abc.def.ghi\n"), "abc.def.ghi");
        assert_eq!(sanitize_token("abc\r\n.def"), "abc.def");
        assert_eq!(sanitize_token("a%2Bb"), "a+b");
    }

    #[test]
    fn test_sanitized_token_still_verifies() {
        let token = sign(&claims(3600));
        let wrapped = format!("  {token}\n");
        assert!(verifier().verify(&wrapped).is_ok());
    }

    #[test]
    fn test_from_config_requires_key_material() {
        use crate::config::AuthConfig;

        let bare = AuthConfig {
            audience: AUD.into(),
            issuer: ISS.into(),
            public_key_path: None,
            hmac_secret: None,
        };
        assert!(TokenVerifier::from_config(&bare).is_err());

        let hmac_only = AuthConfig {
            hmac_secret: Some("secret".into()),
            ..bare.clone()
        };
        assert!(TokenVerifier::from_config(&hmac_only).is_ok());
    }

    #[test]
    fn test_from_config_rejects_bad_pem() {
        use crate::config::AuthConfig;
        use std::io::Write;

        let mut pem = tempfile::NamedTempFile::new().unwrap();
        pem.write_all(b"not a pem at all").unwrap();

        let cfg = AuthConfig {
            audience: AUD.into(),
            issuer: ISS.into(),
            public_key_path: Some(pem.path().to_path_buf()),
            hmac_secret: None,
        };
        assert!(TokenVerifier::from_config(&cfg).is_err());
    }

    #[test]
    fn test_bearer_token_prefers_header() {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            "Bearer from-header".parse().unwrap(),
        );
        assert_eq!(
            bearer_token(&headers, Some("from-query")).as_deref(),
            Some("from-header")
        );
        assert_eq!(
            bearer_token(&HeaderMap::new(), Some("from-query")).as_deref(),
            Some("from-query")
        );
        assert_eq!(bearer_token(&HeaderMap::new(), None), None);
    }
}
