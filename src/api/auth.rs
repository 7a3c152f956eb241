//! Bearer-token authorization.
//!
//! Tokens are base64url JSON claims `{ledger?, roles}`. They are not signed
//! here; production deployments put an issuer in front and these claims are
//! treated as already verified. Ledger-scoped endpoints take their ledger
//! from the token's `ledger` claim.

use axum::extract::FromRequestParts;
use axum::http::header;
use axum::http::request::Parts;
use base64::engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use serde::Deserialize;

use super::error::ApiError;
use crate::ledger::event_id::LedgerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Public,
    Admin,
    Registrar,
    Client,
    Reader,
    Appender,
}

/// What a request is trying to do, checked against the token's roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Ledger CRUD and download.
    LedgerAdmin,
    /// Registry management.
    Registry,
    /// Replay events through selectors.
    Read,
    /// Append events.
    Append,
    /// Notification channels and SSE.
    Notify,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Claims {
    #[serde(default)]
    pub ledger: Option<String>,
    #[serde(default)]
    pub roles: Vec<Role>,
}

fn role_allows(role: Role, action: Action) -> bool {
    match role {
        Role::Admin => matches!(action, Action::LedgerAdmin),
        Role::Registrar => matches!(action, Action::Registry),
        Role::Reader => matches!(action, Action::Read),
        Role::Appender => matches!(action, Action::Append),
        // A client owns notifications and inherits reader and appender.
        Role::Client => matches!(action, Action::Read | Action::Append | Action::Notify),
        Role::Public => false,
    }
}

impl Claims {
    pub fn allows(&self, action: Action) -> bool {
        self.roles.iter().any(|role| role_allows(*role, action))
    }

    pub fn require(&self, action: Action) -> Result<(), ApiError> {
        if self.allows(action) {
            Ok(())
        } else {
            Err(ApiError::Forbidden(format!(
                "token roles do not allow {action:?}"
            )))
        }
    }

    /// The ledger this token is scoped to.
    pub fn ledger_id(&self) -> Result<LedgerId, ApiError> {
        let claim = self.ledger.as_deref().ok_or_else(|| {
            ApiError::Forbidden("token is not scoped to a ledger".to_string())
        })?;
        claim
            .parse()
            .map_err(|_| ApiError::BadRequest(format!("invalid ledger claim '{claim}'")))
    }
}

/// Decode the claims out of an `Authorization: Bearer` header value.
pub fn parse_bearer(header: &str) -> Option<Claims> {
    let token = header.strip_prefix("Bearer ")?.trim();
    let bytes = URL_SAFE_NO_PAD
        .decode(token)
        .or_else(|_| URL_SAFE.decode(token))
        .ok()?;
    serde_json::from_slice(&bytes).ok()
}

/// Extractor for authorized requests. Missing or unparsable tokens reject
/// with 401 and a `WWW-Authenticate` challenge.
pub struct Auth(pub Claims);

impl<S: Send + Sync> FromRequestParts<S> for Auth {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ApiError::Unauthorized("missing bearer token".to_string()))?;
        parse_bearer(header)
            .map(Auth)
            .ok_or_else(|| ApiError::Unauthorized("invalid bearer token".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(claims: serde_json::Value) -> String {
        format!(
            "Bearer {}",
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims).unwrap())
        )
    }

    #[test]
    fn test_parse_bearer_roundtrip() {
        let claims = parse_bearer(&token(
            serde_json::json!({"ledger": "0000002a", "roles": ["client"]}),
        ))
        .unwrap();
        assert_eq!(claims.ledger.as_deref(), Some("0000002a"));
        assert_eq!(claims.roles, vec![Role::Client]);
        assert_eq!(claims.ledger_id().unwrap(), LedgerId(0x2a));
    }

    #[test]
    fn test_parse_bearer_accepts_padded_base64() {
        let padded = URL_SAFE.encode(br#"{"roles":["admin"]}"#);
        let claims = parse_bearer(&format!("Bearer {padded}")).unwrap();
        assert_eq!(claims.roles, vec![Role::Admin]);
    }

    #[test]
    fn test_parse_bearer_rejects_garbage() {
        assert!(parse_bearer("Bearer !!!").is_none());
        assert!(parse_bearer("Basic abc").is_none());
        assert!(parse_bearer(&format!("Bearer {}", URL_SAFE_NO_PAD.encode("no json"))).is_none());
    }

    #[test]
    fn test_rbac_matrix() {
        let with_roles = |roles: Vec<Role>| Claims {
            ledger: None,
            roles,
        };
        let admin = with_roles(vec![Role::Admin]);
        assert!(admin.allows(Action::LedgerAdmin));
        assert!(!admin.allows(Action::Append));

        let registrar = with_roles(vec![Role::Registrar]);
        assert!(registrar.allows(Action::Registry));
        assert!(!registrar.allows(Action::Read));

        let reader = with_roles(vec![Role::Reader]);
        assert!(reader.allows(Action::Read));
        assert!(!reader.allows(Action::Append));

        let appender = with_roles(vec![Role::Appender]);
        assert!(appender.allows(Action::Append));
        assert!(!appender.allows(Action::Read));

        let client = with_roles(vec![Role::Client]);
        assert!(client.allows(Action::Read));
        assert!(client.allows(Action::Append));
        assert!(client.allows(Action::Notify));
        assert!(!client.allows(Action::LedgerAdmin));

        let public = with_roles(vec![Role::Public]);
        assert!(!public.allows(Action::Read));
    }

    #[test]
    fn test_missing_ledger_claim_is_forbidden() {
        let claims = Claims {
            ledger: None,
            roles: vec![Role::Client],
        };
        assert!(claims.ledger_id().is_err());
    }
}
