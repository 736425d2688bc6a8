//! Actor identity and addressing primitives.

use std::{fmt, net::SocketAddr};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier of a running actor: a human-readable name paired with a
/// freshly generated instance token. The pair is stable for the life of the
/// process; two processes started with the same `name` never collide because
/// `instance_id` is drawn fresh each time.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Uid {
    pub name: String,
    pub instance_id: Uuid,
}

impl Uid {
    /// Generates a fresh UID for an actor named `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            instance_id: Uuid::new_v4(),
        }
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.name, self.instance_id)
    }
}

/// A listen address an actor can be reached at. Wraps [`SocketAddr`] so wire
/// messages stay serializable without pulling `std::net` semantics directly
/// into the wire format.
pub type ListenAddr = SocketAddr;

/// Address of the cluster-wide arbiter, known to every actor at startup.
pub type ArbiterAddr = SocketAddr;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_uids_with_the_same_name_never_collide() {
        let a = Uid::new("worker");
        let b = Uid::new("worker");
        assert_eq!(a.name, b.name);
        assert_ne!(a.instance_id, b.instance_id);
        assert_ne!(a, b);
    }

    #[test]
    fn display_format_is_name_bracket_instance_bracket() {
        let uid = Uid::new("arbiter");
        assert_eq!(uid.to_string(), format!("arbiter[{}]", uid.instance_id));
    }
}
