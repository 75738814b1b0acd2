//! NewType wrappers for the names that flow between the installer, the
//! service manager and the orchestration tool.
//!
//! These types prevent accidental mixing of semantically different strings
//! (e.g., passing a cell name where a unit name is expected).

use serde::{Deserialize, Serialize};
use std::fmt;

/// Macro to generate a NewType wrapper with standard trait implementations.
macro_rules! newtype_string {
    (
        $(#[$meta:meta])*
        $name:ident
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new instance.
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Get the inner value as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

newtype_string!(
    /// Name of a systemd unit, including its suffix (e.g. "cell-ldap.service").
    UnitName
);

newtype_string!(
    /// Logical cell name as registered in the directory service.
    CellName
);

newtype_string!(
    /// Fully qualified host name of a cell member.
    Hostname
);

newtype_string!(
    /// Operating-system account a command or service runs as.
    Identity
);

/// Maximum accepted length of a unit name.
pub const MAX_UNIT_NAME_LEN: usize = 128;

impl UnitName {
    /// Allowed characters: alphanumeric, hyphen, underscore, dot and `@`.
    /// Unit names end up in file paths and in `systemctl` argv.
    pub fn is_valid(&self) -> bool {
        let name = self.as_str();
        !name.is_empty()
            && name.len() <= MAX_UNIT_NAME_LEN
            && !name.starts_with('.')
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_name_creation() {
        let name = UnitName::new("cell-ldap.service");
        assert_eq!(name.as_str(), "cell-ldap.service");
        assert_eq!(name.to_string(), "cell-ldap.service");
    }

    #[test]
    fn test_cell_name_from_string() {
        let cell: CellName = "local".into();
        assert_eq!(cell.as_str(), "local");

        let cell: CellName = String::from("prod-1").into();
        assert_eq!(cell, CellName::new("prod-1"));
    }

    #[test]
    fn test_identity_serde() {
        let id = Identity::new("proid");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"proid\"");

        let parsed: Identity = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_safe_unit_names() {
        assert!(UnitName::new("cell-ldap.service").is_valid());
        assert!(UnitName::new("cell_master.service").is_valid());
        assert!(UnitName::new("getty@tty1.service").is_valid());
    }

    #[test]
    fn test_unsafe_unit_names() {
        assert!(!UnitName::new("").is_valid());
        assert!(!UnitName::new("../evil.service").is_valid());
        assert!(!UnitName::new(".hidden.service").is_valid());
        assert!(!UnitName::new("foo; rm -rf /").is_valid());
        assert!(!UnitName::new("a b.service").is_valid());
        assert!(!UnitName::new("a".repeat(200)).is_valid());
    }
}
