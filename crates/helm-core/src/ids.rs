//! Branded ID newtypes.
//!
//! A [`ConnectionId`] names one logical agent connection and survives
//! transient disconnects. A [`CallToken`] correlates one outstanding request
//! with its response. Both wrap a `String` so they serialize as plain JSON
//! strings on the wire.
//!
//! Freshly generated IDs are UUID v7 (time-ordered) via [`uuid::Uuid::now_v7`].

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

fn new_v7() -> String {
    Uuid::now_v7().to_string()
}

macro_rules! branded_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new random ID (UUID v7, time-ordered).
            #[must_use]
            pub fn new() -> Self {
                Self(new_v7())
            }

            /// Return the inner string as a slice.
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

        impl Default for $name {
            fn default() -> Self {
                Self::new()
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

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

branded_id! {
    /// Stable identifier for one logical agent connection.
    ///
    /// Either declared by the agent in its handshake path or generated by the
    /// broker when the agent does not know its own identity.
    ConnectionId
}

branded_id! {
    /// Correlation token for one outstanding request.
    CallToken
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_id_new_is_uuid_v7() {
        let id = ConnectionId::new();
        let parsed = Uuid::parse_str(id.as_str()).expect("should be valid UUID");
        assert_eq!(parsed.get_version(), Some(uuid::Version::SortRand));
    }

    #[test]
    fn tokens_are_unique() {
        let a = CallToken::new();
        let b = CallToken::new();
        assert_ne!(a, b);
    }

    #[test]
    fn from_str_ref() {
        let id = ConnectionId::from("abc");
        assert_eq!(id.as_str(), "abc");
    }

    #[test]
    fn display_and_deref() {
        let id = ConnectionId::from("agent-7");
        assert_eq!(format!("{id}"), "agent-7");
        let s: &str = &id;
        assert_eq!(s, "agent-7");
    }

    #[test]
    fn serde_is_transparent() {
        let token = CallToken::from("tok-1");
        let json = serde_json::to_string(&token).unwrap();
        assert_eq!(json, "\"tok-1\"");
        let back: CallToken = serde_json::from_str(&json).unwrap();
        assert_eq!(back, token);
    }

    #[test]
    fn borrow_allows_str_lookup() {
        use std::collections::HashMap;
        let mut map = HashMap::new();
        let _ = map.insert(ConnectionId::from("abc"), 1);
        assert_eq!(map.get("abc"), Some(&1));
    }

    #[test]
    fn into_inner() {
        let id = ConnectionId::from("inner");
        assert_eq!(id.into_inner(), "inner");
    }
}
