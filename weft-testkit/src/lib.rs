//! Test harnesses for the weft coordination engine.
//!
//! Provides a single-process stand-in for the messaging fabric
//! ([`LoopbackFabric`]), an in-memory [`MemoryStore`], and the
//! [`TestCluster`] harness that wires a whole rank group together and
//! pumps it in lockstep.

pub mod harness;
pub mod store;
pub mod transport;

pub use harness::*;
pub use store::*;
pub use transport::*;
