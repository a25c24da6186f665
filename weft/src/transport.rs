//! Messaging capability.
//!
//! Four independent lanes, mirroring the deployment shape: rank-to-rank
//! point-to-point traffic, group-wide collectives, the hub control stream
//! (rank 0 only) and the bulk data plane. All receive calls are
//! non-blocking polls; the orchestrator loop owns the cadence. A handle is
//! constructed once at startup and passed to everything that sends, so
//! there is no process-global messaging state.

use anyhow::Result;

use crate::id::{Id, Rank};
use crate::message::Envelope;

pub trait Transport: Send + Sync {
    fn rank(&self) -> Rank;

    fn size(&self) -> usize;

    /// Id of the hub this rank group belongs to.
    fn hub_id(&self) -> Id;

    /// Whether the local hub is the master hub.
    fn is_master(&self) -> bool;

    fn send_to_rank(&self, rank: Rank, env: Envelope) -> Result<()>;

    /// Ships a message to rank 0 for handling or further broadcast there.
    fn forward_to_master(&self, env: Envelope) -> Result<()> {
        self.send_to_rank(0, env)
    }

    /// Group-wide fan-out from rank 0 to all other ranks.
    fn broadcast(&self, env: Envelope) -> Result<()>;

    /// Sends up the hub control stream. Only meaningful on rank 0.
    fn send_hub(&self, env: Envelope) -> Result<()>;

    /// Bulk data plane toward a (hub, rank) endpoint.
    fn send_data(&self, hub: Id, rank: Rank, env: Envelope) -> Result<()>;

    fn try_recv_rank(&self) -> Result<Option<Envelope>>;

    fn try_recv_broadcast(&self) -> Result<Option<Envelope>>;

    /// Polls the hub control stream. An `Err` means the stream is gone and
    /// the caller has to start an orderly shutdown.
    fn try_recv_hub(&self) -> Result<Option<Envelope>>;

    fn try_recv_data(&self) -> Result<Option<Envelope>>;

    /// Collective rank-group synchronization point.
    fn barrier(&self) -> Result<()>;

    /// Collective maximum across the rank group.
    fn all_reduce_max(&self, value: u32) -> Result<u32>;
}
