//! Connection-time identity verification.
//!
//! The gateway extracts a [`Credential`] from the upgrade request and hands
//! it to an [`IdentityVerifier`] before any protocol event is processed.
//! Two verifiers ship with the server: [`JwtVerifier`] for HS256 tokens
//! minted by an external auth service, and [`StaticVerifier`], a fixed
//! token table for development and tests.

use std::collections::HashMap;

use axum::http::{HeaderMap, header};
use axum_extra::extract::cookie::CookieJar;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use murmur_proto::message::{UserId, UserProfile};
use serde::{Deserialize, Serialize};

/// Name of the session cookie consulted when no header or query token is
/// present.
pub const SESSION_COOKIE: &str = "murmur_session";

/// An opaque bearer credential presented at connection time.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    /// Wraps a raw token.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// The raw token.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Credential(..)")
    }
}

/// Reasons a connection is refused.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// No credential was presented.
    #[error("missing credential")]
    Missing,
    /// The credential is malformed, forged or unknown.
    #[error("invalid credential: {0}")]
    Invalid(String),
    /// The credential has expired.
    #[error("credential expired")]
    Expired,
    /// Verification did not finish within the authentication window.
    #[error("authentication timed out")]
    Timeout,
}

/// Turns a credential into a verified identity.
pub trait IdentityVerifier: Send + Sync {
    /// Verify `credential` and return the identity it proves.
    fn verify(
        &self,
        credential: &Credential,
    ) -> impl std::future::Future<Output = Result<UserProfile, AuthError>> + Send;
}

/// Finds the credential on an upgrade request.
///
/// Checked in order: `Authorization: Bearer <token>`, the `token` query
/// parameter, then the [`SESSION_COOKIE`] cookie.
#[must_use]
pub fn extract_credential(headers: &HeaderMap, query: Option<&str>) -> Option<Credential> {
    if let Some(token) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
    {
        return Some(Credential::new(token));
    }

    if let Some(token) = query.and_then(|q| {
        url::form_urlencoded::parse(q.as_bytes())
            .find(|(key, value)| key == "token" && !value.is_empty())
            .map(|(_, value)| value.into_owned())
    }) {
        return Some(Credential::new(token));
    }

    CookieJar::from_headers(headers)
        .get(SESSION_COOKIE)
        .map(|c| c.value().to_string())
        .filter(|t| !t.is_empty())
        .map(Credential::new)
}

/// Claims carried by a Murmur access token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User id.
    pub sub: String,
    /// Display name; defaults to the user id.
    #[serde(default)]
    pub name: Option<String>,
    /// Avatar reference.
    #[serde(default)]
    pub avatar: Option<String>,
    /// Expiry, seconds since the UNIX epoch.
    pub exp: usize,
}

/// Verifies HS256-signed JWTs.
pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    /// Creates a verifier for tokens signed with `secret`.
    #[must_use]
    pub fn new(secret: &[u8]) -> Self {
        Self {
            key: DecodingKey::from_secret(secret),
            validation: Validation::new(Algorithm::HS256),
        }
    }
}

impl IdentityVerifier for JwtVerifier {
    async fn verify(&self, credential: &Credential) -> Result<UserProfile, AuthError> {
        let data = decode::<Claims>(credential.as_str(), &self.key, &self.validation).map_err(
            |e| match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::Invalid(e.to_string()),
            },
        )?;
        let claims = data.claims;
        let id = UserId::parse(claims.sub).map_err(|e| AuthError::Invalid(e.to_string()))?;
        let display_name = claims.name.unwrap_or_else(|| id.to_string());
        Ok(UserProfile {
            id,
            display_name,
            avatar: claims.avatar,
        })
    }
}

/// Fixed token → identity table.
#[derive(Debug, Default, Clone)]
pub struct StaticVerifier {
    tokens: HashMap<String, UserProfile>,
}

impl StaticVerifier {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a token that authenticates as `profile`.
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>, profile: UserProfile) -> Self {
        self.tokens.insert(token.into(), profile);
        self
    }

    /// Every identity in the table.
    pub fn profiles(&self) -> impl Iterator<Item = &UserProfile> {
        self.tokens.values()
    }
}

impl IdentityVerifier for StaticVerifier {
    async fn verify(&self, credential: &Credential) -> Result<UserProfile, AuthError> {
        self.tokens
            .get(credential.as_str())
            .cloned()
            .ok_or_else(|| AuthError::Invalid("unknown token".into()))
    }
}

/// The verifier selected by configuration.
pub enum ConfiguredVerifier {
    /// HS256 JWTs.
    Jwt(JwtVerifier),
    /// Fixed token table.
    Static(StaticVerifier),
}

impl IdentityVerifier for ConfiguredVerifier {
    async fn verify(&self, credential: &Credential) -> Result<UserProfile, AuthError> {
        match self {
            Self::Jwt(v) => v.verify(credential).await,
            Self::Static(v) => v.verify(credential).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use jsonwebtoken::{EncodingKey, Header, encode};

    const SECRET: &[u8] = b"test-secret";

    fn token(sub: &str, exp_offset: i64) -> String {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs();
        let exp = usize::try_from(i64::try_from(now).unwrap() + exp_offset).unwrap();
        let claims = Claims {
            sub: sub.to_string(),
            name: Some("Alice A.".into()),
            avatar: None,
            exp,
        };
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(SECRET),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn jwt_valid_token_yields_profile() {
        let verifier = JwtVerifier::new(SECRET);
        let profile = verifier
            .verify(&Credential::new(token("alice", 3600)))
            .await
            .unwrap();
        assert_eq!(profile.id, UserId::new("alice"));
        assert_eq!(profile.display_name, "Alice A.");
    }

    #[tokio::test]
    async fn jwt_wrong_secret_is_invalid() {
        let verifier = JwtVerifier::new(b"other-secret");
        let result = verifier.verify(&Credential::new(token("alice", 3600))).await;
        assert!(matches!(result, Err(AuthError::Invalid(_))));
    }

    #[tokio::test]
    async fn jwt_expired_token_is_expired() {
        let verifier = JwtVerifier::new(SECRET);
        let result = verifier.verify(&Credential::new(token("alice", -3600))).await;
        assert!(matches!(result, Err(AuthError::Expired)));
    }

    #[tokio::test]
    async fn jwt_bad_subject_is_invalid() {
        let verifier = JwtVerifier::new(SECRET);
        let result = verifier.verify(&Credential::new(token("not valid", 3600))).await;
        assert!(matches!(result, Err(AuthError::Invalid(_))));
    }

    #[tokio::test]
    async fn static_verifier_lookup() {
        let verifier = StaticVerifier::new()
            .with_token("t-alice", UserProfile::new(UserId::new("alice"), "Alice"));
        assert_eq!(
            verifier.verify(&Credential::new("t-alice")).await.unwrap().id,
            UserId::new("alice")
        );
        assert!(verifier.verify(&Credential::new("nope")).await.is_err());
    }

    #[test]
    fn credential_prefers_bearer_header() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer from-header"));
        headers.insert(header::COOKIE, HeaderValue::from_static("murmur_session=from-cookie"));
        let cred = extract_credential(&headers, Some("token=from-query")).unwrap();
        assert_eq!(cred.as_str(), "from-header");
    }

    #[test]
    fn credential_falls_back_to_query_then_cookie() {
        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, HeaderValue::from_static("other=1; murmur_session=from-cookie"));
        let cred = extract_credential(&headers, Some("a=b&token=from%20query")).unwrap();
        assert_eq!(cred.as_str(), "from query");

        let cred = extract_credential(&headers, None).unwrap();
        assert_eq!(cred.as_str(), "from-cookie");
    }

    #[test]
    fn no_credential_anywhere() {
        assert!(extract_credential(&HeaderMap::new(), Some("foo=bar")).is_none());
    }

    #[test]
    fn credential_debug_hides_token() {
        assert_eq!(format!("{:?}", Credential::new("secret")), "Credential(..)");
    }
}
