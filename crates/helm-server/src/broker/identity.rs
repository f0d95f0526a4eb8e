//! Connection identity from the WebSocket handshake path.

use std::sync::OnceLock;

use helm_core::ConnectionId;

/// The identifying part of an accepted transport.
///
/// An agent that knows its id connects to `/{id}`; one that does not
/// connects to `/` and is assigned a fresh id. The id is derived once per
/// transport and reused on every lookup.
#[derive(Debug)]
pub struct Handshake {
    path: String,
    id: OnceLock<ConnectionId>,
}

impl Handshake {
    /// Wrap a handshake request path.
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            id: OnceLock::new(),
        }
    }

    /// Raw request path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Id declared in the path, or a generated one if the path is empty.
    pub fn connection_id(&self) -> &ConnectionId {
        self.id.get_or_init(|| {
            let declared = self.path.strip_prefix('/').unwrap_or(&self.path);
            if declared.is_empty() {
                ConnectionId::new()
            } else {
                ConnectionId::from(declared)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn declared_id_strips_leading_slash() {
        assert_eq!(Handshake::new("/abc").connection_id().as_str(), "abc");
        assert_eq!(Handshake::new("abc").connection_id().as_str(), "abc");
    }

    #[test]
    fn path_is_kept_raw() {
        let handshake = Handshake::new("//abc");
        assert_eq!(handshake.connection_id().as_str(), "/abc");
        assert_eq!(handshake.path(), "//abc");
    }

    #[test]
    fn only_first_separator_is_stripped() {
        assert_eq!(Handshake::new("//abc").connection_id().as_str(), "/abc");
    }

    #[test]
    fn empty_path_generates_stable_id() {
        let handshake = Handshake::new("/");
        let first = handshake.connection_id().clone();
        assert!(!first.as_str().is_empty());
        assert_eq!(handshake.connection_id(), &first);
    }

    #[test]
    fn distinct_transports_get_distinct_generated_ids() {
        let a = Handshake::new("");
        let b = Handshake::new("");
        assert_ne!(a.connection_id(), b.connection_id());
    }
}
