//! NewType wrappers for strong typing throughout the authentication core.
//!
//! These types prevent accidental mixing of semantically different strings
//! (e.g., passing a session id where a token subject is expected).

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

            /// Consume and return the inner String.
            pub fn into_inner(self) -> String {
                self.0
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

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::borrow::Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }
    };
}

newtype_string!(
    /// Token subject: the identity a credential was issued for.
    ///
    /// For user tokens this is the caller's subject claim; for service tokens
    /// it is the delegated user GUID in canonical string form.
    SubjectId
);

newtype_string!(
    /// Session-correlation identifier carried on delegated service tokens.
    ///
    /// Optional at issuance; when present it lets downstream consumers tie a
    /// service token back to the originating user session in audit logs.
    SessionId
);

newtype_string!(
    /// Hosting environment name (e.g., "Production", "Testing").
    ///
    /// Feeds the default-mode heuristic. Resolved once at startup from an
    /// injected lookup rather than read ambiently inside the settings logic.
    EnvironmentName
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_newtype_creation_and_access() {
        let subject = SubjectId::new("user-42");
        assert_eq!(subject.as_str(), "user-42");
        assert_eq!(subject.to_string(), "user-42");
        assert_eq!(subject.clone().into_inner(), "user-42");
    }

    #[test]
    fn test_newtype_from_conversions() {
        let a = SessionId::from("sess-1");
        let b = SessionId::from("sess-1".to_string());
        assert_eq!(a, b);
        assert_eq!(a.as_ref(), "sess-1");
    }

    #[test]
    fn test_newtype_serde_transparent() {
        let env = EnvironmentName::new("Testing");
        let json = serde_json::to_string(&env).unwrap();
        assert_eq!(json, "\"Testing\"");

        let back: EnvironmentName = serde_json::from_str(&json).unwrap();
        assert_eq!(back, env);
    }
}
