//! Weft - Distributed execution coordination for modular dataflow pipelines.
//!
//! A foundational crate providing the coordination engine for pipelines of
//! processing modules spread across ranks and hubs: message routing, the
//! prepare/compute/reduce execution bracket, scheduling policies, barriers,
//! and bulk object transfer between process groups.
//!
//! # Core Concepts
//!
//! - **Module**: A processing stage identified by an [`Id`], running one
//!   instance per rank of its hub's process group. Modules talk to the
//!   engine through a [`ModuleHandle`].
//!
//! - **Coordinator**: The [`Coordinator`] routes control messages, tracks
//!   the replicated module graph, drives execution steps downstream, and
//!   runs the barrier protocol on every rank.
//!
//! - **Port graph**: The [`PortTracker`] holds ports and connections and
//!   the per-input counters that decide when a downstream module may
//!   prepare, compute, or reduce.
//!
//! - **Transfer**: The [`TransferManager`] ships objects between hubs over
//!   the data plane, coalescing duplicate requests and pinning outbound
//!   objects until the receiver confirms.
//!
//! - **Transport**: The [`Transport`] trait abstracts the messaging
//!   fabric: rank-to-rank sends, group collectives, the hub control stream
//!   and the bulk data plane.
//!
//! - **Events**: Lifecycle transitions are published on an
//!   [`InProcCoordinationBus`] so embedding code can observe the pipeline.
//!
//! - **Runtime**: The [`runtime::Orchestrator`] ties the pieces together
//!   into a per-rank engine loop with cooperative shutdown.
//!
//! # Feature Flags
//!
//! - `metrics` - Prometheus metrics support
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use weft::{EngineConfig, runtime::Orchestrator};
//!
//! let orchestrator = Orchestrator::new(transport, store, EngineConfig::default());
//! let shutdown = orchestrator.shutdown_token();
//! tokio::spawn(orchestrator.run());
//! // ... later
//! shutdown.cancel();
//! ```

/// Configuration for the coordination engine.
///
/// The `config` module defines [`EngineConfig`] with the engine's tuning
/// knobs: lazy-gang batching, idle-loop backoff, and shutdown grace.
pub mod config;

/// Module-graph coordination.
///
/// The `coordinator` module provides the [`Coordinator`], the per-rank
/// heart of the engine, plus [`ModuleHandle`] for the module side and
/// [`DispatchOutcome`] for loop embedders.
pub mod coordinator;

/// Coordination lifecycle events.
///
/// The `events` module provides [`CoordinationEvent`] and
/// [`CoordinationEventPayload`] describing state transitions, the
/// [`EventPublisher`] trait, and the [`InProcCoordinationBus`].
pub mod events;

/// The port graph and its execution counters.
///
/// The `graph` module provides [`PortTracker`] and [`PortRef`] for
/// tracking ports, connections, and the object/reset/finish counters that
/// gate downstream execution.
pub mod graph;

/// Identifiers for modules, hubs, and well-known endpoints.
///
/// The `id` module defines [`Id`] with its sentinel values and the
/// [`Rank`] alias.
pub mod id;

/// The coordination protocol.
///
/// The `message` module defines [`Envelope`], the [`Message`] payloads,
/// the fieldless [`MessageKind`] mirror, and supporting types such as
/// [`AddObject`], [`Connection`], [`PortSpec`] and [`TransitKey`].
pub mod message;

#[cfg(feature = "metrics")]
/// Prometheus metrics.
///
/// The `metrics` module registers the engine's Prometheus series when the
/// `metrics` feature is enabled.
pub mod metrics;

/// Execution and object-delivery policies.
///
/// The `policy` module defines [`SchedulingPolicy`], [`ReducePolicy`] and
/// [`ObjectReceivePolicy`].
pub mod policy;

/// Engine runtime.
///
/// The `runtime` module provides the [`runtime::Orchestrator`] loop and
/// [`runtime::ShutdownToken`] for cooperative shutdown.
pub mod runtime;

/// Replicated module state.
///
/// The `state` module provides [`GraphState`] and [`ModuleState`],
/// the per-rank replica of which modules run where with which policies.
pub mod state;

/// Object storage capability.
///
/// The `store` module defines the [`ObjectStore`] trait the engine uses
/// to look up, pin, and (de)serialize pipeline objects, plus
/// [`ObjectHandle`] and [`MissingRef`].
pub mod store;

/// Telemetry spans and recorders.
///
/// The `telemetry` module provides tracing spans for the hot coordination
/// paths and record functions that feed the optional metrics.
pub mod telemetry;

/// Bulk object transfer between hubs.
///
/// The `transfer` module provides the [`TransferManager`] and the
/// [`CoordinatorMailbox`] back-channel into the coordination loop.
pub mod transfer;

/// Messaging capability.
///
/// The `transport` module defines the [`Transport`] trait over the
/// engine's four message lanes.
pub mod transport;

pub use config::*;
pub use coordinator::*;
pub use events::*;
pub use graph::*;
pub use id::*;
pub use message::*;
pub use policy::*;
pub use state::*;
pub use store::*;
pub use transfer::*;
pub use transport::*;
