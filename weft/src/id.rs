use serde::{Deserialize, Serialize};
use std::fmt::Display;

/// Identifier of a node in the coordination topology.
///
/// Positive values are module ids, negative values below the hub base are
/// hub ids, and the small negative range holds routing sentinels. `0` is
/// never a valid addressee.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct Id(pub i32);

impl Id {
    pub const INVALID: Id = Id(0);
    /// Deliver to every node.
    pub const BROADCAST: Id = Id(-1);
    /// Marks a message that still has to travel up to the master hub
    /// before it is broadcast.
    pub const FOR_BROADCAST: Id = Id(-2);
    /// The hub this process is attached to, whichever it is.
    pub const LOCAL_HUB: Id = Id(-3);
    /// User-interface endpoints attached to the master hub.
    pub const UI: Id = Id(-4);
    pub const MASTER_HUB: Id = Id(-5);
    pub const MODULE_BASE: i32 = 1;

    pub fn module(seq: i32) -> Id {
        debug_assert!(seq >= Self::MODULE_BASE);
        Id(seq)
    }

    pub fn is_module(self) -> bool {
        self.0 >= Self::MODULE_BASE
    }

    /// True for concrete hubs and the local-hub alias, not for the
    /// broadcast sentinels.
    pub fn is_hub(self) -> bool {
        self == Self::LOCAL_HUB || self.0 <= Self::MASTER_HUB.0
    }

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

impl Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Id::INVALID => write!(f, "invalid"),
            Id::BROADCAST => write!(f, "broadcast"),
            Id::FOR_BROADCAST => write!(f, "for-broadcast"),
            Id::LOCAL_HUB => write!(f, "local-hub"),
            Id::UI => write!(f, "ui"),
            Id::MASTER_HUB => write!(f, "hub:master"),
            Id(n) if n < Id::MASTER_HUB.0 => write!(f, "hub:{}", -(n - Id::MASTER_HUB.0)),
            Id(n) => write!(f, "module:{n}"),
        }
    }
}

/// Rank inside the process group of one hub.
pub type Rank = usize;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_classification() {
        assert!(Id::module(1).is_module());
        assert!(Id::module(42).is_module());
        assert!(!Id::BROADCAST.is_module());
        assert!(!Id::MASTER_HUB.is_module());

        assert!(Id::MASTER_HUB.is_hub());
        assert!(Id::LOCAL_HUB.is_hub());
        assert!(Id(-6).is_hub());
        assert!(!Id::BROADCAST.is_hub());
        assert!(!Id::FOR_BROADCAST.is_hub());
        assert!(!Id::module(3).is_hub());

        assert!(!Id::INVALID.is_valid());
        assert!(Id::module(1).is_valid());
    }

    #[test]
    fn display_forms() {
        assert_eq!(Id::module(7).to_string(), "module:7");
        assert_eq!(Id::MASTER_HUB.to_string(), "hub:master");
        assert_eq!(Id(-6).to_string(), "hub:1");
    }
}
