//! Branded identifier newtypes.
//!
//! Connections, sessions and plugin instances each get their own string
//! newtype so one cannot be passed where another is expected. Generated
//! values are UUID v7 (time-ordered), optionally behind a readable prefix.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! branded_id {
    ($(#[$meta:meta])* $name:ident, $prefix:expr) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Generate a fresh id.
            #[must_use]
            pub fn generate() -> Self {
                Self(format!("{}{}", $prefix, Uuid::now_v7()))
            }

            /// Wrap an id supplied by a peer or read from disk.
            #[must_use]
            pub fn from_string(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            /// Borrow the inner string.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume self and return the inner `String`.
            #[must_use]
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl std::ops::Deref for $name {
            type Target = str;
            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl std::borrow::Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }
    };
}

branded_id! {
    /// One live WebSocket connection. Never reused.
    ConnectionId, ""
}

branded_id! {
    /// A conversation. Clients may pick their own; generated ones carry a
    /// `session-` prefix.
    SessionId, "session-"
}

branded_id! {
    /// A parameterized Action or Component instance.
    InstanceId, "inst-"
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn generated_ids_are_unique() {
        let ids: HashSet<ConnectionId> = (0..200).map(|_| ConnectionId::generate()).collect();
        assert_eq!(ids.len(), 200);
    }

    #[test]
    fn generated_session_ids_carry_prefix() {
        let id = SessionId::generate();
        assert!(id.starts_with("session-"));
        assert!(InstanceId::generate().starts_with("inst-"));
    }

    #[test]
    fn client_supplied_id_is_kept_verbatim() {
        let id = SessionId::from_string("s1");
        assert_eq!(id.as_str(), "s1");
        assert_eq!(id.to_string(), "s1");
    }

    #[test]
    fn serde_is_transparent() {
        let id = SessionId::from("s1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"s1\"");
        let back: SessionId = serde_json::from_str("\"s1\"").unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn borrow_allows_str_lookup() {
        let mut map = std::collections::HashMap::new();
        let _ = map.insert(SessionId::from("abc"), 1);
        assert_eq!(map.get("abc"), Some(&1));
    }
}
