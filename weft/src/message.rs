//! Control-plane and data-plane messages.
//!
//! Every message travels inside an [`Envelope`] carrying a uuid correlation
//! id, sender, destination and broadcast flags. Routing behavior that
//! depends on the message kind (broadcast fan-out to local modules,
//! requeue-until-handled, replay triggers) is expressed as methods on
//! [`MessageKind`] so the coordinator's handler stays a plain dispatch.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::id::{Id, Rank};
use crate::policy::{ObjectReceivePolicy, ReducePolicy, SchedulingPolicy};

/// Opaque tag for typed payload arrays referenced by objects.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct ArrayType(pub u32);

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum PortKind {
    Input,
    Output,
}

/// Declaration of a module port.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PortSpec {
    pub name: String,
    pub kind: PortKind,
    /// An input that merges all incoming connections; it must be the
    /// module's only input.
    pub combine: bool,
    /// Objects on this port never trigger a compute.
    pub no_compute: bool,
}

impl PortSpec {
    pub fn input(name: impl Into<String>) -> Self {
        Self { name: name.into(), kind: PortKind::Input, combine: false, no_compute: false }
    }

    pub fn output(name: impl Into<String>) -> Self {
        Self { name: name.into(), kind: PortKind::Output, combine: false, no_compute: false }
    }

    pub fn combine(mut self) -> Self {
        self.combine = true;
        self
    }

    pub fn no_compute(mut self) -> Self {
        self.no_compute = true;
        self
    }
}

/// One edge of the port graph, output side first.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Connection {
    pub from_module: Id,
    pub from_port: String,
    pub to_module: Id,
    pub to_port: String,
}

impl Connection {
    pub fn new(
        from_module: Id,
        from_port: impl Into<String>,
        to_module: Id,
        to_port: impl Into<String>,
    ) -> Self {
        Self {
            from_module,
            from_port: from_port.into(),
            to_module,
            to_port: to_port.into(),
        }
    }
}

/// What an `Execute` asks of a module.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ExecuteKind {
    /// Open the execution bracket.
    Prepare,
    /// Close the execution bracket.
    Reduce,
    /// Source-style trigger: compute and walk the downstream graph.
    ComputeExecute,
    /// Compute over objects already waiting on the inputs.
    ComputeObject,
}

/// Stage reports sent by module ranks during an execution step.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ProgressStage {
    Start,
    Finish,
}

/// Announcement that an output object exists and where it is headed.
///
/// The object payload itself never rides in the envelope; only the name
/// travels, and the receiving side either finds it in its shared group or
/// fetches it through the transfer manager.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AddObject {
    pub sender_module: Id,
    pub sender_port: String,
    pub sender_hub: Id,
    pub sender_rank: Rank,
    pub dest_module: Id,
    pub dest_port: String,
    pub dest_rank: Option<Rank>,
    pub object: String,
    /// The object still has to be fetched; the receiving module's queue
    /// blocks at this announcement until the unblocking copy arrives.
    pub blocker: bool,
    /// Set once the receiving side has the object mapped locally and the
    /// announcement may unblock its FIFO slot.
    pub unblocking: bool,
    pub generation: u64,
    pub iteration: u64,
}

impl AddObject {
    /// The announcement is a blocker while the object is still in flight.
    pub fn is_blocker(&self) -> bool {
        self.blocker && !self.unblocking
    }

    pub fn key(&self) -> TransitKey {
        TransitKey { object: self.object.clone(), dest_module: self.dest_module }
    }
}

/// Identity of one in-flight object transfer.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct TransitKey {
    pub object: String,
    pub dest_module: Id,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum TextKind {
    Info,
    Warning,
    Error,
    Status,
}

/// Role carried by an `Identify` exchange.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Identity {
    /// Asks the peer to identify itself.
    Request,
    Manager,
    Hub,
    Ui,
}

/// Payloads of the coordination protocol.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Connection handshake; a request is answered with the local role.
    Identify {
        identity: Identity,
    },
    Spawn {
        module: Id,
        hub: Id,
        name: String,
    },
    /// Hub-level acknowledgement that a spawned module is up.
    SpawnPrepared {
        module: Id,
        name: String,
    },
    AddPort {
        module: Id,
        port: PortSpec,
    },
    Connect(Connection),
    Disconnect(Connection),
    ModuleExit {
        crashed: bool,
        /// Set once the exit has been seen by the owning coordinator and
        /// is being echoed to everyone else.
        forwarded: bool,
    },
    Execute {
        module: Id,
        what: ExecuteKind,
        /// `None` addresses the module's whole rank group.
        dest_rank: Option<Rank>,
    },
    ExecutionProgress {
        stage: ProgressStage,
    },
    ExecutionDone,
    Busy,
    Idle,
    SetParameter {
        module: Id,
        name: String,
        value: serde_json::Value,
    },
    SetParameterChoices {
        module: Id,
        name: String,
        choices: Vec<String>,
    },
    SetSchedulingPolicy {
        module: Id,
        policy: SchedulingPolicy,
    },
    SetReducePolicy {
        module: Id,
        policy: ReducePolicy,
    },
    SetReceivePolicy {
        module: Id,
        policy: ObjectReceivePolicy,
    },
    Barrier {
        info: String,
    },
    BarrierReached,
    SendText {
        kind: TextKind,
        text: String,
    },
    Trace {
        module: Id,
        kind: Option<MessageKind>,
        on: bool,
    },
    /// Liveness probe; answered with a `Pong` carrying the same payload.
    Ping {
        payload: char,
    },
    Pong {
        payload: char,
        module: Id,
    },
    Quit {
        id: Id,
    },
    Kill {
        id: Id,
    },
    /// Ask the hub to open a forwarding tunnel; the engine only relays.
    RequestTunnel {
        src_port: u16,
        dest_host: String,
        dest_port: u16,
    },
    AddObject(AddObject),
    AddObjectCompleted {
        key: TransitKey,
        dest_rank: Rank,
    },
    /// Data-plane: ask a peer to ship an object or one of its arrays.
    RequestObject {
        hub: Id,
        rank: Rank,
        object: String,
        array_type: Option<ArrayType>,
        referrer: String,
    },
    /// Data-plane: serialized object or array on its way back.
    SendObject {
        object: String,
        referrer: String,
        array_type: Option<ArrayType>,
        payload: Vec<u8>,
    },
    /// Per-rank count of outstanding inbound transfers.
    DataTransferState {
        num_transferring: usize,
    },
}

/// Fieldless mirror of [`Message`] for trace filters and blocker matching.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    Identify,
    Spawn,
    SpawnPrepared,
    AddPort,
    Connect,
    Disconnect,
    ModuleExit,
    Execute,
    ExecutionProgress,
    ExecutionDone,
    Busy,
    Idle,
    SetParameter,
    SetParameterChoices,
    SetSchedulingPolicy,
    SetReducePolicy,
    SetReceivePolicy,
    Barrier,
    BarrierReached,
    SendText,
    Trace,
    Ping,
    Pong,
    Quit,
    Kill,
    RequestTunnel,
    AddObject,
    AddObjectCompleted,
    RequestObject,
    SendObject,
    DataTransferState,
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Identify { .. } => MessageKind::Identify,
            Message::Spawn { .. } => MessageKind::Spawn,
            Message::SpawnPrepared { .. } => MessageKind::SpawnPrepared,
            Message::AddPort { .. } => MessageKind::AddPort,
            Message::Connect(_) => MessageKind::Connect,
            Message::Disconnect(_) => MessageKind::Disconnect,
            Message::ModuleExit { .. } => MessageKind::ModuleExit,
            Message::Execute { .. } => MessageKind::Execute,
            Message::ExecutionProgress { .. } => MessageKind::ExecutionProgress,
            Message::ExecutionDone => MessageKind::ExecutionDone,
            Message::Busy => MessageKind::Busy,
            Message::Idle => MessageKind::Idle,
            Message::SetParameter { .. } => MessageKind::SetParameter,
            Message::SetParameterChoices { .. } => MessageKind::SetParameterChoices,
            Message::SetSchedulingPolicy { .. } => MessageKind::SetSchedulingPolicy,
            Message::SetReducePolicy { .. } => MessageKind::SetReducePolicy,
            Message::SetReceivePolicy { .. } => MessageKind::SetReceivePolicy,
            Message::Barrier { .. } => MessageKind::Barrier,
            Message::BarrierReached => MessageKind::BarrierReached,
            Message::SendText { .. } => MessageKind::SendText,
            Message::Trace { .. } => MessageKind::Trace,
            Message::Ping { .. } => MessageKind::Ping,
            Message::Pong { .. } => MessageKind::Pong,
            Message::Quit { .. } => MessageKind::Quit,
            Message::Kill { .. } => MessageKind::Kill,
            Message::RequestTunnel { .. } => MessageKind::RequestTunnel,
            Message::AddObject(_) => MessageKind::AddObject,
            Message::AddObjectCompleted { .. } => MessageKind::AddObjectCompleted,
            Message::RequestObject { .. } => MessageKind::RequestObject,
            Message::SendObject { .. } => MessageKind::SendObject,
            Message::DataTransferState { .. } => MessageKind::DataTransferState,
        }
    }
}

impl MessageKind {
    /// Kinds that must reach every local module once they have been
    /// broadcast across the group.
    pub fn broadcast_to_modules(self) -> bool {
        matches!(
            self,
            MessageKind::SetParameter
                | MessageKind::SetParameterChoices
                | MessageKind::SetSchedulingPolicy
                | MessageKind::SetReducePolicy
                | MessageKind::SetReceivePolicy
        )
    }

    /// Kinds that may arrive before the graph state they reference exists
    /// and are then parked for replay.
    pub fn queue_if_unhandled(self) -> bool {
        matches!(self, MessageKind::Connect | MessageKind::Disconnect)
    }

    /// Kinds whose successful handling may make parked messages handleable.
    pub fn triggers_replay(self) -> bool {
        matches!(self, MessageKind::Spawn | MessageKind::AddPort | MessageKind::Connect)
    }
}

/// A routed message with its correlation identity.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub uuid: Uuid,
    pub sender: Id,
    pub dest: Id,
    /// `None` addresses all ranks of the destination.
    pub dest_rank: Option<Rank>,
    /// Rank the message originated on.
    pub rank: Rank,
    /// Still has to travel to rank 0 / the master hub for broadcasting.
    pub for_broadcast: bool,
    /// Has already been broadcast; do not forward it again.
    pub was_broadcast: bool,
    pub payload: Message,
}

impl Envelope {
    pub fn new(sender: Id, dest: Id, payload: Message) -> Self {
        Self {
            uuid: Uuid::now_v7(),
            sender,
            dest,
            dest_rank: None,
            rank: 0,
            for_broadcast: false,
            was_broadcast: false,
            payload,
        }
    }

    pub fn with_rank(mut self, rank: Rank) -> Self {
        self.rank = rank;
        self
    }

    pub fn with_dest_rank(mut self, dest_rank: Rank) -> Self {
        self.dest_rank = Some(dest_rank);
        self
    }

    pub fn with_uuid(mut self, uuid: Uuid) -> Self {
        self.uuid = uuid;
        self
    }

    pub fn kind(&self) -> MessageKind {
        self.payload.kind()
    }

    /// Identity used when matching a reply against a blocked slot.
    pub fn block_identity(&self) -> (Uuid, MessageKind) {
        (self.uuid, self.kind())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_mirrors_payload() {
        let env = Envelope::new(
            Id::module(1),
            Id::BROADCAST,
            Message::Barrier { info: "sync".into() },
        );
        assert_eq!(env.kind(), MessageKind::Barrier);
        assert_eq!(env.block_identity(), (env.uuid, MessageKind::Barrier));
    }

    #[test]
    fn routing_flags() {
        assert!(MessageKind::Connect.queue_if_unhandled());
        assert!(MessageKind::Disconnect.queue_if_unhandled());
        assert!(!MessageKind::Execute.queue_if_unhandled());

        assert!(MessageKind::Spawn.triggers_replay());
        assert!(MessageKind::AddPort.triggers_replay());
        assert!(MessageKind::Connect.triggers_replay());
        assert!(!MessageKind::Disconnect.triggers_replay());

        assert!(MessageKind::SetParameter.broadcast_to_modules());
        assert!(MessageKind::SetParameterChoices.broadcast_to_modules());
        assert!(!MessageKind::AddObject.broadcast_to_modules());
    }

    #[test]
    fn add_object_blocker_state() {
        let add = AddObject {
            sender_module: Id::module(1),
            sender_port: "out".into(),
            sender_hub: Id::MASTER_HUB,
            sender_rank: 0,
            dest_module: Id::module(2),
            dest_port: "in".into(),
            dest_rank: None,
            object: "obj_000".into(),
            blocker: true,
            unblocking: false,
            generation: 0,
            iteration: 0,
        };
        assert!(add.is_blocker());
        let mut resolved = add.clone();
        resolved.unblocking = true;
        assert!(!resolved.is_blocker());
        assert_eq!(add.key(), resolved.key());
    }

    #[test]
    fn envelope_round_trips_as_json() {
        let env = Envelope::new(
            Id::module(3),
            Id::module(4),
            Message::Execute {
                module: Id::module(4),
                what: ExecuteKind::ComputeObject,
                dest_rank: Some(1),
            },
        )
        .with_dest_rank(1);
        let text = serde_json::to_string(&env).unwrap();
        let back: Envelope = serde_json::from_str(&text).unwrap();
        assert_eq!(env, back);
    }
}
