use serde::{Deserialize, Serialize};
use std::fmt;

/// The closed set of actions a group can be granted on a resource.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum Authorization {
    Read,
    Write,
    Execute,
    Create,
    Delete,
}

impl Authorization {
    pub const ALL: [Authorization; 5] = [
        Authorization::Read,
        Authorization::Write,
        Authorization::Execute,
        Authorization::Create,
        Authorization::Delete,
    ];

    /// Case-insensitive parse from external strings. Unknown values map to
    /// `None` rather than erroring; callers decide whether that is fatal.
    pub fn parse(s: &str) -> Option<Authorization> {
        match s.trim().to_ascii_uppercase().as_str() {
            "READ" => Some(Authorization::Read),
            "WRITE" => Some(Authorization::Write),
            "EXECUTE" => Some(Authorization::Execute),
            "CREATE" => Some(Authorization::Create),
            "DELETE" => Some(Authorization::Delete),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Authorization::Read => "READ",
            Authorization::Write => "WRITE",
            Authorization::Execute => "EXECUTE",
            Authorization::Create => "CREATE",
            Authorization::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Authorization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque, case-insensitive resource type tag. Stored canonically as
/// UPPER_SNAKE; extension types register additional names at startup.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceType(String);

const WELL_KNOWN: [&str; 5] = [
    "ACCOUNT",
    "APPLICATION",
    "BUILD_SERVICE",
    "ROLE",
    "SERVICE_ACCOUNT",
];

impl ResourceType {
    pub const ACCOUNT: &'static str = "ACCOUNT";
    pub const APPLICATION: &'static str = "APPLICATION";
    pub const BUILD_SERVICE: &'static str = "BUILD_SERVICE";
    pub const ROLE: &'static str = "ROLE";
    pub const SERVICE_ACCOUNT: &'static str = "SERVICE_ACCOUNT";

    pub fn account() -> Self {
        ResourceType(Self::ACCOUNT.to_string())
    }

    pub fn application() -> Self {
        ResourceType(Self::APPLICATION.to_string())
    }

    pub fn build_service() -> Self {
        ResourceType(Self::BUILD_SERVICE.to_string())
    }

    pub fn role() -> Self {
        ResourceType(Self::ROLE.to_string())
    }

    pub fn service_account() -> Self {
        ResourceType(Self::SERVICE_ACCOUNT.to_string())
    }

    /// Placeholder tag for extension resources whose real type is applied
    /// by the factory registry after deserialization.
    pub fn extension() -> Self {
        ResourceType("EXTENSION".to_string())
    }

    /// Parse a type tag. Accepts a bare name or a colon-separated composite
    /// whose final segment is the type; plural forms of well-known types
    /// are accepted.
    pub fn parse(s: &str) -> Option<ResourceType> {
        let last = s.rsplit(':').next()?.trim();
        if last.is_empty() {
            return None;
        }
        let canonical = last.to_ascii_uppercase();
        if let Some(stripped) = canonical.strip_suffix('S') {
            if WELL_KNOWN.contains(&stripped) {
                return Some(ResourceType(stripped.to_string()));
            }
        }
        Some(ResourceType(canonical))
    }

    pub fn name(&self) -> &str {
        &self.0
    }

    /// Lowercase plural key suffix used by the key-value layout, e.g.
    /// `SERVICE_ACCOUNT` -> `service_accounts`.
    pub fn key_suffix(&self) -> String {
        let lower = self.0.to_ascii_lowercase();
        if lower.ends_with('s') {
            lower
        } else {
            format!("{lower}s")
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Serialize for ResourceType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for ResourceType {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        ResourceType::parse(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid resource type `{raw}`")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_authorization_parse_case_insensitive() {
        assert_eq!(Authorization::parse("read"), Some(Authorization::Read));
        assert_eq!(Authorization::parse("WRITE"), Some(Authorization::Write));
        assert_eq!(Authorization::parse(" Execute "), Some(Authorization::Execute));
        assert_eq!(Authorization::parse("delete"), Some(Authorization::Delete));
        assert_eq!(Authorization::parse("bogus"), None);
    }

    #[test]
    fn test_authorization_serde_uppercase() {
        let json = serde_json::to_string(&Authorization::Create).unwrap();
        assert_eq!(json, "\"CREATE\"");
        let back: Authorization = serde_json::from_str("\"EXECUTE\"").unwrap();
        assert_eq!(back, Authorization::Execute);
    }

    #[test]
    fn test_resource_type_parse_bare() {
        let t = ResourceType::parse("account").unwrap();
        assert_eq!(t, ResourceType::account());
        assert_eq!(t.name(), "ACCOUNT");
    }

    #[test]
    fn test_resource_type_parse_composite() {
        let t = ResourceType::parse("platform:resources:service_account").unwrap();
        assert_eq!(t, ResourceType::service_account());
    }

    #[test]
    fn test_resource_type_parse_plural() {
        assert_eq!(
            ResourceType::parse("accounts").unwrap(),
            ResourceType::account()
        );
        assert_eq!(
            ResourceType::parse("APPLICATIONS").unwrap(),
            ResourceType::application()
        );
        // Unknown extension types are taken verbatim, plural or not
        assert_eq!(ResourceType::parse("widgets").unwrap().name(), "WIDGETS");
    }

    #[test]
    fn test_resource_type_rejects_empty() {
        assert!(ResourceType::parse("").is_none());
        assert!(ResourceType::parse("platform:").is_none());
    }

    #[test]
    fn test_key_suffix() {
        assert_eq!(ResourceType::account().key_suffix(), "accounts");
        assert_eq!(ResourceType::build_service().key_suffix(), "build_services");
        assert_eq!(ResourceType::role().key_suffix(), "roles");
    }
}
