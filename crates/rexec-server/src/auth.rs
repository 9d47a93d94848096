use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Audit actor recorded when no identity could be established.
pub const UNKNOWN_ACTOR: &str = "unknown";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: u64,
    #[serde(default)]
    pub iat: u64,
}

/// The authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub subject: String,
}

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("missing credential")]
    Missing,

    #[error("malformed authorization header")]
    Malformed,

    #[error("credential expired")]
    Expired,

    #[error("invalid credential: {0}")]
    Invalid(String),

    #[error("credential has no subject")]
    EmptySubject,
}

impl AuthError {
    /// Short stable reason for audit metadata.
    pub fn reason(&self) -> &'static str {
        match self {
            AuthError::Missing => "missing",
            AuthError::Malformed => "malformed",
            AuthError::Expired => "expired",
            AuthError::Invalid(_) => "invalid",
            AuthError::EmptySubject => "empty_subject",
        }
    }
}

/// Verifies HS256 bearer credentials against the shared secret.
#[derive(Clone)]
pub struct AuthGuard {
    key: DecodingKey,
    validation: Validation,
}

impl AuthGuard {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_required_spec_claims(&["exp", "sub"]);
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    /// Authenticate the raw value of an `authorization` header.
    pub fn authenticate(&self, header: Option<&str>) -> Result<Identity, AuthError> {
        let header = header.ok_or(AuthError::Missing)?;
        let token = bearer_token(header).ok_or(AuthError::Malformed)?;
        self.verify(token)
    }

    pub fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        let data = jsonwebtoken::decode::<Claims>(token, &self.key, &self.validation).map_err(
            |e| match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::Invalid(e.to_string()),
            },
        )?;
        let subject = data.claims.sub.trim();
        if subject.is_empty() {
            return Err(AuthError::EmptySubject);
        }
        Ok(Identity {
            subject: subject.to_string(),
        })
    }
}

fn bearer_token(header: &str) -> Option<&str> {
    let (scheme, token) = header.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

/// Mint a credential for `subject` valid for `ttl`.
pub fn issue_token(
    secret: &str,
    subject: &str,
    ttl: Duration,
) -> Result<String, jsonwebtoken::errors::Error> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let claims = Claims {
        sub: subject.to_string(),
        exp: now + ttl.as_secs(),
        iat: now,
    };
    jsonwebtoken::encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "test-secret";

    fn token_with(claims: &Claims, secret: &str) -> String {
        jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .expect("encode")
    }

    fn now() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_secs()
    }

    #[test]
    fn accepts_valid_bearer() {
        let guard = AuthGuard::new(SECRET);
        let token = issue_token(SECRET, "alice", Duration::from_secs(60)).expect("token");
        let identity = guard
            .authenticate(Some(&format!("Bearer {token}")))
            .expect("valid");
        assert_eq!(identity.subject, "alice");

        let lowercase = guard.authenticate(Some(&format!("bearer {token}")));
        assert!(lowercase.is_ok());
    }

    #[test]
    fn rejects_wrong_secret() {
        let guard = AuthGuard::new(SECRET);
        let token = issue_token("other-secret", "alice", Duration::from_secs(60)).expect("token");
        let err = guard.verify(&token).expect_err("wrong secret");
        assert!(matches!(err, AuthError::Invalid(_)));
    }

    #[test]
    fn rejects_expired() {
        let guard = AuthGuard::new(SECRET);
        let token = token_with(
            &Claims {
                sub: "alice".to_string(),
                exp: now() - 3600,
                iat: now() - 7200,
            },
            SECRET,
        );
        assert!(matches!(guard.verify(&token), Err(AuthError::Expired)));
    }

    #[test]
    fn rejects_empty_subject() {
        let guard = AuthGuard::new(SECRET);
        let token = token_with(
            &Claims {
                sub: "  ".to_string(),
                exp: now() + 60,
                iat: now(),
            },
            SECRET,
        );
        assert!(matches!(guard.verify(&token), Err(AuthError::EmptySubject)));
    }

    #[test]
    fn rejects_bad_headers() {
        let guard = AuthGuard::new(SECRET);
        assert!(matches!(guard.authenticate(None), Err(AuthError::Missing)));
        assert!(matches!(
            guard.authenticate(Some("Basic abc")),
            Err(AuthError::Malformed)
        ));
        assert!(matches!(
            guard.authenticate(Some("Bearer")),
            Err(AuthError::Malformed)
        ));
        assert!(matches!(
            guard.authenticate(Some("Bearer not.a.jwt")),
            Err(AuthError::Invalid(_))
        ));
    }
}
