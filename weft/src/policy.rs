use serde::{Deserialize, Serialize};

/// How a module's ranks are driven when objects arrive on its inputs.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum SchedulingPolicy {
    /// Each rank computes as soon as its own inputs are complete.
    Single,
    /// All ranks compute together whenever any rank's inputs are complete.
    Gang,
    /// Ranks compute together, but triggers are batched until roughly a
    /// fifth of the group has work.
    LazyGang,
}

impl Default for SchedulingPolicy {
    fn default() -> Self {
        SchedulingPolicy::Single
    }
}

/// Whether and when a module participates in the prepare/reduce bracket
/// around an execution step.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum ReducePolicy {
    /// No prepare/reduce bracket at all; the module is always ready.
    Never,
    /// Each rank reduces over its local data only.
    Locally,
    /// Reduce once per timestep across the group.
    PerTimestep,
    /// A single global reduction over everything.
    OverAll,
}

impl Default for ReducePolicy {
    fn default() -> Self {
        ReducePolicy::Locally
    }
}

/// Where an incoming object announcement has to be visible.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum ObjectReceivePolicy {
    /// Only the addressed rank needs to see the add.
    Local,
    /// Rank 0 needs a consistent view, so the add is broadcast.
    Master,
    /// Every rank needs a consistent view, so the add is broadcast.
    Distribute,
}

impl Default for ObjectReceivePolicy {
    fn default() -> Self {
        ObjectReceivePolicy::Local
    }
}

impl ObjectReceivePolicy {
    pub fn needs_broadcast(self) -> bool {
        !matches!(self, ObjectReceivePolicy::Local)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        assert_eq!(SchedulingPolicy::default(), SchedulingPolicy::Single);
        assert_eq!(ReducePolicy::default(), ReducePolicy::Locally);
        assert_eq!(ObjectReceivePolicy::default(), ObjectReceivePolicy::Local);
    }

    #[test]
    fn receive_policy_broadcast() {
        assert!(!ObjectReceivePolicy::Local.needs_broadcast());
        assert!(ObjectReceivePolicy::Master.needs_broadcast());
        assert!(ObjectReceivePolicy::Distribute.needs_broadcast());
    }
}
