//! Identifier definitions.

use crate::{define_id, IdError};

define_id!(
    /// Identity of one node in a lifecycle component tree.
    ComponentId,
    "cmp"
);

/// Maximum length of a tenant token. Tokens end up in resource names and
/// topic names, which the external store caps at 63 characters.
pub const MAX_TOKEN_LEN: usize = 63;

/// Token identifying a tenant.
///
/// Tokens are lowercase DNS-label style strings (`[a-z0-9-]`, not starting or
/// ending with `-`), since they are embedded in resource and topic names.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TenantToken(String);

impl TenantToken {
    /// Validates and wraps a token.
    pub fn parse(s: &str) -> Result<Self, IdError> {
        if s.is_empty() {
            return Err(IdError::Empty);
        }
        if s.len() > MAX_TOKEN_LEN {
            return Err(invalid(s, "longer than 63 characters"));
        }
        if s.starts_with('-') || s.ends_with('-') {
            return Err(invalid(s, "must not start or end with '-'"));
        }
        if !s
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
        {
            return Err(invalid(s, "only [a-z0-9-] allowed"));
        }
        Ok(Self(s.to_string()))
    }

    /// Returns the token as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn invalid(token: &str, reason: &'static str) -> IdError {
    IdError::InvalidToken {
        token: token.to_string(),
        reason,
    }
}

impl std::fmt::Display for TenantToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for TenantToken {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl AsRef<str> for TenantToken {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl serde::Serialize for TenantToken {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for TenantToken {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_component_id_roundtrip() {
        let id = ComponentId::new();
        let parsed: ComponentId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!(id.to_string().starts_with("cmp_"));
    }

    #[test]
    fn test_component_id_invalid_prefix() {
        let result: Result<ComponentId, _> = "app_01HV4Z2WQXKJNM8GPQY6VBKC3D".parse();
        assert!(matches!(result, Err(IdError::InvalidPrefix { .. })));
    }

    #[test]
    fn test_component_id_missing_separator() {
        let result: Result<ComponentId, _> = "cmp01HV4Z2WQXKJNM8GPQY6VBKC3D".parse();
        assert!(matches!(result, Err(IdError::MissingSeparator)));
    }

    #[test]
    fn test_component_id_invalid_ulid() {
        let result: Result<ComponentId, _> = "cmp_invalid".parse();
        assert!(matches!(result, Err(IdError::InvalidUlid(_))));
    }

    #[test]
    fn test_component_id_json() {
        let id = ComponentId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id));
        let parsed: ComponentId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_tenant_token_valid() {
        let token = TenantToken::parse("acme-01").unwrap();
        assert_eq!(token.as_str(), "acme-01");
        assert_eq!(token.to_string(), "acme-01");
    }

    #[test]
    fn test_tenant_token_rejects_bad_input() {
        assert!(TenantToken::parse("").unwrap_err().is_empty());
        assert!(TenantToken::parse("Acme").is_err());
        assert!(TenantToken::parse("-acme").is_err());
        assert!(TenantToken::parse("acme_corp").is_err());
        assert!(TenantToken::parse(&"a".repeat(64)).is_err());
    }

    #[test]
    fn test_tenant_token_json_rejects_invalid() {
        let result: Result<TenantToken, _> = serde_json::from_str("\"NOT OK\"");
        assert!(result.is_err());
    }

    proptest! {
        #[test]
        fn prop_tenant_token_accepts_dns_labels(s in "[a-z0-9]([a-z0-9-]{0,40}[a-z0-9])?") {
            let token = TenantToken::parse(&s).unwrap();
            prop_assert_eq!(token.as_str(), s.as_str());
        }
    }
}
