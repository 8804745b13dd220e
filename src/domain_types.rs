//! Strongly-typed identifiers used across the broker.
//!
//! Newtypes prevent the different kinds of string identifiers (clients,
//! missions, components, correlation ids) from being mixed up at call sites.

use nutype::nutype;
use uuid::Uuid;

/// Prefix browsers prepend to their client ids; stripped on admission so the
/// rest of the process sees a single canonical form.
const BROWSER_PREFIX: &str = "browser-";

/// Canonical identifier of a connected end-user client.
#[nutype(
    sanitize(trim),
    validate(not_empty),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
        Display,
        AsRef,
        TryFrom,
        Into
    )
)]
pub struct ClientId(String);

impl ClientId {
    /// Parses a raw client id from an upgrade request, stripping the
    /// `browser-` prefix if present. Returns `None` for empty input.
    pub fn canonicalize(raw: &str) -> Option<Self> {
        let stripped = raw.strip_prefix(BROWSER_PREFIX).unwrap_or(raw);
        Self::try_new(stripped.to_string()).ok()
    }
}

/// Identifier of a mission owned by the mission controller.
#[nutype(
    sanitize(trim),
    validate(not_empty),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
        Display,
        AsRef,
        TryFrom,
        Into
    )
)]
pub struct MissionId(String);

/// Globally unique identifier of a registered backend component.
#[nutype(
    sanitize(trim),
    validate(not_empty),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
        Display,
        AsRef,
        TryFrom,
        Into
    )
)]
pub struct ComponentId(String);

/// Correlation id used by the request/reply pattern over the broker.
#[nutype(
    validate(not_empty),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
        Display,
        AsRef,
        TryFrom,
        Into
    )
)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Creates a fresh random correlation id.
    #[must_use]
    pub fn generate() -> Self {
        Self::try_new(Uuid::new_v4().to_string()).expect("uuid is never empty")
    }
}

/// Opaque authentication token carried by a client connection. The broker
/// never introspects it; it is forwarded to downstream services as-is.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthToken(String);

impl AuthToken {
    #[must_use]
    pub fn new(token: String) -> Self {
        Self(token)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Tokens must not leak into logs.
        write!(f, "AuthToken(***)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonicalize_strips_browser_prefix() {
        let id = ClientId::canonicalize("browser-foo").unwrap();
        assert_eq!(id.as_ref(), "foo");
    }

    #[test]
    fn canonicalize_keeps_plain_ids() {
        let id = ClientId::canonicalize("foo").unwrap();
        assert_eq!(id.as_ref(), "foo");
    }

    #[test]
    fn canonicalize_rejects_empty() {
        assert!(ClientId::canonicalize("").is_none());
        assert!(ClientId::canonicalize("browser-").is_none());
    }

    #[test]
    fn prefixed_and_plain_forms_collide() {
        let a = ClientId::canonicalize("browser-C1").unwrap();
        let b = ClientId::canonicalize("C1").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn auth_token_debug_is_redacted() {
        let token = AuthToken::new("secret".to_string());
        assert_eq!(format!("{token:?}"), "AuthToken(***)");
    }
}
