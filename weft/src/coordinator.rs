//! Module-graph coordination.
//!
//! One [`Coordinator`] runs on every rank of a hub's process group. It
//! routes control messages between modules, hubs and ranks, drives the
//! prepare/compute/reduce bracket around execution steps, batches work
//! according to each module's scheduling policy, and runs the barrier and
//! shutdown protocols. All methods execute on the orchestrator thread;
//! the only structure shared with module-side code is the inbox queue.
//!
//! Phase and barrier invariants are enforced with assertions: a violation
//! means replicated state has diverged and continuing would corrupt the
//! pipeline.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use anyhow::Result;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::events::{CoordinationEventPayload, InProcCoordinationBus};
use crate::graph::{PortRef, PortTracker};
use crate::id::{Id, Rank};
use crate::message::{
    AddObject, Envelope, ExecuteKind, Identity, Message, MessageKind, ProgressStage, TextKind,
};
use crate::policy::{ReducePolicy, SchedulingPolicy};
use crate::state::GraphState;
use crate::store::ObjectStore;
use crate::telemetry;
use crate::transfer::{CoordinatorMailbox, TransferManager};
use crate::transport::Transport;

/// Queue shared between module-side senders and the coordinator.
pub type SharedInbox = Arc<Mutex<VecDeque<Envelope>>>;

/// What one dispatch pass accomplished.
#[derive(Clone, Copy, Debug, Default)]
pub struct DispatchOutcome {
    /// At least one message was handled.
    pub received: bool,
    /// Quit was requested and no module is left running.
    pub done: bool,
}

/// The module side of a spawned module: submit messages to the
/// coordinator, receive deliveries from it.
#[derive(Debug)]
pub struct ModuleHandle {
    pub id: Id,
    rank: Rank,
    inbox: SharedInbox,
    deliveries: mpsc::UnboundedReceiver<Envelope>,
}

impl ModuleHandle {
    /// Submits a message to the coordinator as this module.
    pub fn submit(&self, dest: Id, payload: Message) -> Envelope {
        let env = Envelope::new(self.id, dest, payload).with_rank(self.rank);
        self.inbox.lock().push_back(env.clone());
        env
    }

    /// Submits a prebuilt envelope; the sender is forced to this module.
    pub fn submit_envelope(&self, mut env: Envelope) -> Envelope {
        env.sender = self.id;
        env.rank = self.rank;
        self.inbox.lock().push_back(env.clone());
        env
    }

    /// Next delivery from the coordinator, if any.
    pub fn try_recv(&mut self) -> Option<Envelope> {
        self.deliveries.try_recv().ok()
    }

    /// Drains all pending deliveries.
    pub fn drain(&mut self) -> Vec<Envelope> {
        let mut out = Vec::new();
        while let Some(env) = self.try_recv() {
            out.push(env);
        }
        out
    }
}

/// Per-module bookkeeping on one rank.
struct ModuleRecord {
    id: Id,
    sender: mpsc::UnboundedSender<Envelope>,
    /// FIFO discipline while announced objects are still in flight.
    blocked: bool,
    blockers: VecDeque<(Uuid, MessageKind)>,
    blocked_messages: VecDeque<Envelope>,
    /// Execute triggers parked while a step is underway.
    delayed: VecDeque<Envelope>,
    /// Messages from this module parked while it sits in a barrier.
    held: VecDeque<Envelope>,
    ranks_started: usize,
    ranks_finished: usize,
    prepared: bool,
    reduced: bool,
    busy_count: u32,
    /// Pending compute triggers per origin rank, for lazy gangs.
    object_count: Vec<u32>,
}

impl ModuleRecord {
    fn new(id: Id, sender: mpsc::UnboundedSender<Envelope>, size: usize) -> Self {
        Self {
            id,
            sender,
            blocked: false,
            blockers: VecDeque::new(),
            blocked_messages: VecDeque::new(),
            delayed: VecDeque::new(),
            held: VecDeque::new(),
            ranks_started: 0,
            ranks_finished: 0,
            prepared: false,
            reduced: true,
            busy_count: 0,
            object_count: vec![0; size],
        }
    }

    fn deliver(&self, env: Envelope) {
        // A closed receiver only means the handle was dropped.
        let _ = self.sender.send(env);
    }

    fn send(&mut self, env: Envelope) {
        if self.blocked {
            self.blocked_messages.push_back(env);
        } else {
            self.deliver(env);
        }
    }

    fn block(&mut self, uuid: Uuid, kind: MessageKind) {
        self.blocked = true;
        self.blockers.push_back((uuid, kind));
    }

    /// Resolves a blocker. When it was the frontmost one, the resolved
    /// message and everything queued behind it up to the next still-open
    /// blocker is released in order; otherwise the parked copy is
    /// replaced in place and stays queued.
    fn unblock(&mut self, env: Envelope) {
        assert!(self.blocked);
        assert!(!self.blockers.is_empty());
        let ident = env.block_identity();

        if self.blockers.front() == Some(&ident) {
            self.blockers.pop_front();
            let front = self
                .blocked_messages
                .pop_front()
                .unwrap_or_else(|| panic!("blocked queue empty while blocker {ident:?} open"));
            assert_eq!(front.block_identity(), ident);
            self.deliver(env);
            if let Some(&(next_uuid, _)) = self.blockers.front() {
                while let Some(queued) = self.blocked_messages.front() {
                    if queued.uuid == next_uuid {
                        break;
                    }
                    let queued = self.blocked_messages.pop_front().unwrap_or_else(|| {
                        panic!("blocked queue drained unexpectedly")
                    });
                    self.deliver(queued);
                }
            } else {
                self.blocked = false;
                while let Some(queued) = self.blocked_messages.pop_front() {
                    self.deliver(queued);
                }
            }
        } else if let Some(pos) = self.blockers.iter().position(|b| *b == ident) {
            self.blockers.remove(pos);
            if let Some(mpos) = self
                .blocked_messages
                .iter()
                .position(|m| m.block_identity() == ident)
            {
                self.blocked_messages[mpos] = env;
            } else {
                warn!(module = %self.id, ?ident, "no parked copy for resolved blocker");
            }
        } else {
            warn!(module = %self.id, ?ident, "unblock for unknown blocker");
        }
    }

    fn have_delayed(&self) -> bool {
        !self.delayed.is_empty()
    }
}

#[derive(Clone, Debug, Default)]
struct OutputCache {
    generation: u64,
    iteration: u64,
    adds: Vec<AddObject>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum TraceFilter {
    Off,
    All,
    Kind(MessageKind),
}

pub struct Coordinator {
    config: EngineConfig,
    transport: Arc<dyn Transport>,
    store: Arc<dyn ObjectStore>,
    transfer: Arc<TransferManager>,
    events: Arc<InProcCoordinationBus>,
    mailbox: CoordinatorMailbox,
    graph: PortTracker,
    state: GraphState,
    modules: HashMap<Id, ModuleRecord>,
    handles: HashMap<Id, ModuleHandle>,
    inbox: SharedInbox,
    /// Local modules that reached the active barrier.
    reached: HashSet<Id>,
    barrier_uuid: Option<Uuid>,
    barrier_active: bool,
    barrier_timing: Option<telemetry::TimingHandle>,
    /// Messages parked until the graph state they reference exists.
    replay_queue: Vec<Envelope>,
    /// Current (generation, iteration) output objects per output port,
    /// replayed to late-connecting destinations.
    output_cache: HashMap<PortRef, OutputCache>,
    trace: TraceFilter,
    quit_flag: bool,
    rank: Rank,
    size: usize,
    hub: Id,
}

impl Coordinator {
    pub fn new(
        transport: Arc<dyn Transport>,
        store: Arc<dyn ObjectStore>,
        transfer: Arc<TransferManager>,
        events: Arc<InProcCoordinationBus>,
        mailbox: CoordinatorMailbox,
        config: EngineConfig,
    ) -> Self {
        let rank = transport.rank();
        let size = transport.size();
        let hub = transport.hub_id();
        Self {
            config,
            transport,
            store,
            transfer,
            events,
            mailbox,
            graph: PortTracker::new(),
            state: GraphState::new(),
            modules: HashMap::new(),
            handles: HashMap::new(),
            inbox: Arc::new(Mutex::new(VecDeque::new())),
            reached: HashSet::new(),
            barrier_uuid: None,
            barrier_active: false,
            barrier_timing: None,
            replay_queue: Vec::new(),
            output_cache: HashMap::new(),
            trace: TraceFilter::Off,
            quit_flag: false,
            rank,
            size,
            hub,
        }
    }

    pub fn hub_id(&self) -> Id {
        self.hub
    }

    /// Handle given to the module side after a spawn on this rank.
    pub fn take_handle(&mut self, module: Id) -> Option<ModuleHandle> {
        self.handles.remove(&module)
    }

    pub fn num_running(&self) -> usize {
        self.modules.len()
    }

    pub fn barrier_active(&self) -> bool {
        self.barrier_active
    }

    pub fn quit_ok(&self) -> bool {
        self.quit_flag && self.num_running() == 0
    }

    pub fn graph(&self) -> &PortTracker {
        &self.graph
    }

    pub fn state(&self) -> &GraphState {
        &self.state
    }

    /// Phase accessors for embedders and tests.
    pub fn is_prepared(&self, module: Id) -> Option<bool> {
        self.modules.get(&module).map(|m| m.prepared)
    }

    pub fn is_reduced(&self, module: Id) -> Option<bool> {
        self.modules.get(&module).map(|m| m.reduced)
    }

    /// Asks all local modules to exit; returns whether they are gone.
    /// Safe to call repeatedly while draining.
    pub fn quit(&mut self) -> Result<bool> {
        if !self.quit_flag {
            let kill = Envelope::new(self.hub, Id::BROADCAST, Message::Kill { id: Id::BROADCAST })
                .with_rank(self.rank);
            self.events.emit(kill.uuid, CoordinationEventPayload::QuitRequested);
            self.send_all_local(&kill);
            info!(running = self.num_running(), "waiting for modules to quit");
        }
        if self.size > 1 {
            self.transport.barrier()?;
        }
        self.quit_flag = true;
        Ok(self.num_running() == 0)
    }

    /// One pass over module traffic. Messages from modules parked in a
    /// barrier are held back and replayed once the barrier clears.
    pub fn dispatch(&mut self) -> Result<DispatchOutcome> {
        let mut received = false;

        let unparked: Vec<Id> = self
            .modules
            .keys()
            .filter(|id| !self.reached.contains(id))
            .copied()
            .collect();
        for id in unparked {
            loop {
                let Some(env) = self.modules.get_mut(&id).and_then(|m| m.held.pop_front()) else {
                    break;
                };
                received = true;
                self.handle(env)?;
            }
        }

        let incoming = {
            let mut q = self.inbox.lock();
            std::mem::take(&mut *q)
        };
        for env in incoming {
            if self.reached.contains(&env.sender) {
                if let Some(rec) = self.modules.get_mut(&env.sender) {
                    rec.held.push_back(env);
                }
            } else {
                received = true;
                self.handle(env)?;
            }
        }

        Ok(DispatchOutcome { received, done: self.quit_ok() })
    }

    /// Drains the back-channel fed by the transfer manager and background
    /// callbacks.
    pub fn drain_mailbox(&mut self, rx: &mut mpsc::UnboundedReceiver<Envelope>) -> Result<bool> {
        let mut work = false;
        while let Ok(env) = rx.try_recv() {
            work = true;
            if env.for_broadcast && env.dest != Id::FOR_BROADCAST {
                self.broadcast_and_handle(env)?;
            } else {
                self.handle(env)?;
            }
        }
        Ok(work)
    }

    /// Fans a message out to the whole rank group and handles it locally.
    /// On rank 0 the message is broadcast and handled; elsewhere it is
    /// forwarded to rank 0 first.
    pub fn broadcast_and_handle(&mut self, mut env: Envelope) -> Result<()> {
        if self.rank == 0 {
            env.for_broadcast = false;
            env.was_broadcast = true;
            self.transport.broadcast(env.clone())?;
            self.handle(env)
        } else {
            env.for_broadcast = true;
            env.was_broadcast = false;
            self.transport.forward_to_master(env)
        }
    }

    /// Routes and handles one message.
    pub fn handle(&mut self, env: Envelope) -> Result<()> {
        if env.dest == Id::FOR_BROADCAST {
            return self.send_hub(env);
        }

        self.trace_message(&env);

        // Replicated state first, so lookups below see this message.
        // Lifecycle kinds apply inside their handlers.
        match env.kind() {
            MessageKind::Connect
            | MessageKind::Disconnect
            | MessageKind::Spawn
            | MessageKind::ModuleExit => {}
            _ => self.state.apply(&env),
        }

        if (env.was_broadcast || env.dest == Id::BROADCAST) && env.kind().broadcast_to_modules() {
            self.send_all_local(&env);
        }

        if env.dest.is_module() {
            if self.state.hub_of(env.dest) == Some(self.hub) || self.modules.contains_key(&env.dest)
            {
                // Kinds the coordinator has to see stay out of the fast
                // delivery path.
                if !matches!(
                    env.kind(),
                    MessageKind::Execute
                        | MessageKind::SetParameter
                        | MessageKind::SetParameterChoices
                        | MessageKind::AddObject
                ) {
                    return self.send_message(env.dest, env);
                }
            } else if !env.was_broadcast && self.state.hub_of(env.dest).is_some() {
                return self.send_hub(env);
            }
        }

        if env.dest.is_hub() && env.dest != self.hub && !env.was_broadcast {
            return self.send_hub(env);
        }

        let handled = match env.kind() {
            MessageKind::Identify => self.handle_identify(&env)?,
            MessageKind::Spawn => self.handle_spawn(&env)?,
            MessageKind::AddPort => self.handle_add_port(&env)?,
            MessageKind::Connect => self.handle_connect(&env)?,
            MessageKind::Disconnect => self.handle_disconnect(&env)?,
            MessageKind::ModuleExit => self.handle_module_exit(&env)?,
            MessageKind::Execute => self.handle_execute(&env)?,
            MessageKind::ExecutionProgress => self.handle_execution_progress(&env)?,
            MessageKind::Busy => self.handle_busy(&env)?,
            MessageKind::Idle => self.handle_idle(&env)?,
            MessageKind::SetParameter => self.handle_set_parameter(&env)?,
            MessageKind::SetParameterChoices => self.handle_set_parameter_choices(&env)?,
            MessageKind::Barrier => self.handle_barrier(&env)?,
            MessageKind::BarrierReached => self.handle_barrier_reached(&env)?,
            MessageKind::SendText => self.handle_send_text(env.clone())?,
            MessageKind::Trace => self.handle_trace(&env)?,
            MessageKind::Ping => self.handle_ping(&env)?,
            MessageKind::Pong => {
                debug!(sender = %env.sender, "pong");
                true
            }
            MessageKind::RequestTunnel => self.handle_request_tunnel(&env)?,
            MessageKind::Quit => self.handle_quit(&env)?,
            MessageKind::Kill => self.handle_kill(&env)?,
            MessageKind::AddObject => self.handle_add_object(&env)?,
            MessageKind::AddObjectCompleted => {
                if let Message::AddObjectCompleted { key, .. } = &env.payload {
                    self.transfer.complete_transfer(key)?;
                }
                true
            }
            MessageKind::DataTransferState => {
                if let Message::DataTransferState { num_transferring } = env.payload {
                    if self.rank == 0 {
                        self.transfer.handle_transfer_state(env.rank, num_transferring);
                    } else {
                        self.transport.forward_to_master(env.clone())?;
                    }
                }
                true
            }
            MessageKind::RequestObject | MessageKind::SendObject => {
                warn!(kind = ?env.kind(), "data-plane message on control plane, dropping");
                true
            }
            // Applied to replicated state above; nothing further here.
            MessageKind::SpawnPrepared
            | MessageKind::SetSchedulingPolicy
            | MessageKind::SetReducePolicy
            | MessageKind::SetReceivePolicy
            | MessageKind::ExecutionDone => true,
        };

        if handled {
            if env.kind().triggers_replay() {
                self.replay_messages()?;
            }
        } else if env.kind().queue_if_unhandled() {
            self.queue_message(env);
        }

        Ok(())
    }

    // ---- routing primitives ------------------------------------------

    /// Delivers to a module, wherever it runs: local record, another rank
    /// of this group, or another hub.
    fn send_message(&mut self, module: Id, env: Envelope) -> Result<()> {
        let hub = self.state.hub_of(module);
        if module.is_module() && (hub == Some(self.hub) || hub.is_none() && self.modules.contains_key(&module)) {
            if let Some(dest_rank) = env.dest_rank {
                if dest_rank != self.rank {
                    return self.transport.send_to_rank(dest_rank, env);
                }
            }
            let Some(record) = self.modules.get_mut(&module) else {
                if self.state.has_crashed(module) {
                    debug!(%module, kind = ?env.kind(), "dropping message for crashed module");
                } else {
                    warn!(%module, kind = ?env.kind(), "message for unknown module");
                }
                return Ok(());
            };
            if let Message::AddObject(add) = &env.payload {
                if add.unblocking {
                    record.unblock(env);
                    return Ok(());
                }
                if add.is_blocker() {
                    record.block(env.uuid, MessageKind::AddObject);
                }
            }
            record.send(env);
        } else {
            let mut env = env;
            env.dest = module;
            return self.send_hub(env);
        }
        Ok(())
    }

    /// Sends up the hub control stream. Only rank 0 talks to the hub;
    /// other ranks forward unless the message was already broadcast, in
    /// which case rank 0 saw its own copy.
    fn send_hub(&mut self, env: Envelope) -> Result<()> {
        if self.rank == 0 {
            self.transport.send_hub(env)
        } else if env.was_broadcast {
            Ok(())
        } else {
            self.transport.forward_to_master(env)
        }
    }

    fn send_all_local(&mut self, env: &Envelope) {
        for record in self.modules.values_mut() {
            record.send(env.clone());
        }
    }

    fn send_all_others(&mut self, exclude: Id, env: &Envelope) {
        for record in self.modules.values_mut() {
            if record.id != exclude {
                record.send(env.clone());
            }
        }
    }

    fn is_local(&self, id: Id) -> bool {
        if id.is_module() {
            self.state.hub_of(id) == Some(self.hub) || self.modules.contains_key(&id)
        } else {
            id == self.hub || id == Id::LOCAL_HUB
        }
    }

    fn queue_message(&mut self, env: Envelope) {
        debug!(kind = ?env.kind(), "parking message until the graph catches up");
        self.replay_queue.push(env);
    }

    fn replay_messages(&mut self) -> Result<()> {
        let queue = std::mem::take(&mut self.replay_queue);
        if !queue.is_empty() {
            debug!(count = queue.len(), "replaying parked messages");
        }
        for env in queue {
            self.handle(env)?;
        }
        Ok(())
    }

    fn trace_message(&self, env: &Envelope) {
        let traced = match self.trace {
            TraceFilter::Off => false,
            TraceFilter::All => true,
            TraceFilter::Kind(kind) => env.kind() == kind,
        };
        if traced {
            info!(kind = ?env.kind(), sender = %env.sender, dest = %env.dest, uuid = %env.uuid, "handle");
        }
    }

    // ---- lifecycle ---------------------------------------------------

    fn handle_spawn(&mut self, env: &Envelope) -> Result<bool> {
        let Message::Spawn { module, hub, name } = &env.payload else {
            return Ok(true);
        };
        let (module, hub, name) = (*module, *hub, name.clone());

        if env.dest == Id::BROADCAST {
            self.state.apply(env);
            self.send_all_local(env);
            return Ok(true);
        }
        if hub != self.hub {
            return Ok(true);
        }
        if !self.state.is_running(module) {
            self.state.apply(env);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.modules.insert(module, ModuleRecord::new(module, tx, self.size));
        self.handles.insert(
            module,
            ModuleHandle {
                id: module,
                rank: self.rank,
                inbox: Arc::clone(&self.inbox),
                deliveries: rx,
            },
        );
        self.transport.barrier()?;

        if self.rank == 0 {
            let prep = Envelope::new(
                self.hub,
                Id::MASTER_HUB,
                Message::SpawnPrepared { module, name: name.clone() },
            );
            self.send_hub(prep)?;
        }

        // Catch the new module up with settings everyone else has seen.
        for replay in self.state.catchup_messages().to_vec() {
            if let Some(record) = self.modules.get_mut(&module) {
                record.send(replay);
            }
        }

        self.events.emit(
            env.uuid,
            CoordinationEventPayload::ModuleSpawned { module, name },
        );
        Ok(true)
    }

    fn handle_add_port(&mut self, env: &Envelope) -> Result<bool> {
        let Message::AddPort { module, port } = &env.payload else {
            return Ok(true);
        };
        self.graph.add_port(*module, port.clone());
        Ok(true)
    }

    fn handle_connect(&mut self, env: &Envelope) -> Result<bool> {
        let Message::Connect(conn) = &env.payload else {
            return Ok(true);
        };
        let established = env.was_broadcast || env.dest == Id::BROADCAST || env.sender.is_hub();
        if !established {
            // A request; the master hub turns it into an established edge.
            self.send_hub(env.clone())?;
            return Ok(true);
        }

        self.transport.barrier()?;
        let conn = conn.clone();
        if !self.graph.add_connection(&conn) {
            return Ok(false);
        }
        self.state.apply(env);
        self.recompute_heights();

        for endpoint in [conn.from_module, conn.to_module] {
            if self.is_local(endpoint) {
                self.send_message(endpoint, env.clone())?;
            }
        }

        if self.is_local(conn.from_module) {
            self.resend_cached_outputs(&conn)?;
        }
        Ok(true)
    }

    /// Replays the current output objects of a port to a destination that
    /// connected after they were announced.
    fn resend_cached_outputs(&mut self, conn: &crate::message::Connection) -> Result<()> {
        let from = PortRef::new(conn.from_module, conn.from_port.clone());
        let cached = self
            .output_cache
            .get(&from)
            .map(|c| c.adds.clone())
            .unwrap_or_default();
        if cached.is_empty() && self.size == 1 {
            return Ok(());
        }
        let here = cached
            .iter()
            .filter(|a| self.store.get(&a.object).is_some())
            .count() as u32;
        let anywhere = self.transport.all_reduce_max(here)?;
        if anywhere == 0 {
            return Ok(());
        }
        for add in cached {
            let mut add = add;
            add.dest_module = conn.to_module;
            add.dest_port = conn.to_port.clone();
            let env = Envelope::new(
                add.sender_module,
                conn.to_module,
                Message::AddObject(add),
            )
            .with_rank(self.rank);
            self.handle_add_object(&env)?;
        }
        Ok(())
    }

    fn handle_disconnect(&mut self, env: &Envelope) -> Result<bool> {
        let Message::Disconnect(conn) = &env.payload else {
            return Ok(true);
        };
        let established = env.was_broadcast || env.dest == Id::BROADCAST || env.sender.is_hub();
        if !established {
            if self.is_local(env.sender) {
                self.send_hub(env.clone())?;
            }
            return Ok(true);
        }
        let conn = conn.clone();
        if !self.graph.remove_connection(&conn) {
            return Ok(false);
        }
        self.state.apply(env);
        self.recompute_heights();
        for endpoint in [conn.from_module, conn.to_module] {
            if self.is_local(endpoint) {
                self.send_message(endpoint, env.clone())?;
            }
        }
        Ok(true)
    }

    fn handle_module_exit(&mut self, env: &Envelope) -> Result<bool> {
        let Message::ModuleExit { crashed, forwarded } = env.payload else {
            return Ok(true);
        };
        let module = env.sender;

        if forwarded {
            self.send_all_others(module, env);
            self.state.apply(env);
            self.modules.remove(&module);
            self.handles.remove(&module);
            let removed = self.graph.remove_module(module);
            for conn in removed {
                let peer = if conn.from_module == module { conn.to_module } else { conn.from_module };
                if self.is_local(peer) {
                    let disc = Envelope::new(self.hub, peer, Message::Disconnect(conn))
                        .with_rank(self.rank);
                    self.send_message(peer, disc)?;
                }
            }
            self.reached.remove(&module);
            self.check_barrier()?;
            self.events.emit(
                env.uuid,
                CoordinationEventPayload::ModuleExited { module, crashed },
            );
            return Ok(true);
        }

        if self.is_local(module) {
            if !self.modules.contains_key(&module) && !self.state.has_crashed(module) {
                warn!(%module, "exit from module that is not running");
                return Ok(true);
            }
            self.output_cache.retain(|port, _| port.module != module);
            self.reached.remove(&module);
            self.check_barrier()?;
        }

        if self.rank == 0 {
            let mut fwd = env.clone();
            fwd.payload = Message::ModuleExit { crashed, forwarded: true };
            self.send_hub(fwd.clone())?;
            self.broadcast_and_handle(fwd)?;
        }
        Ok(true)
    }

    fn handle_quit(&mut self, env: &Envelope) -> Result<bool> {
        let Message::Quit { id } = env.payload else {
            return Ok(true);
        };
        if id == Id::BROADCAST || id == self.hub {
            let quit = env.clone();
            self.send_all_local(&quit);
            self.quit()?;
        }
        Ok(true)
    }

    fn handle_kill(&mut self, env: &Envelope) -> Result<bool> {
        let Message::Kill { id } = env.payload else {
            return Ok(true);
        };
        if id == Id::BROADCAST {
            self.send_all_local(env);
        } else if self.is_local(id) {
            self.send_message(id, env.clone())?;
        }
        Ok(true)
    }

    // ---- execution ---------------------------------------------------

    fn deliver_execute(&mut self, module: Id, env: Envelope) {
        if let Message::Execute { what, .. } = env.payload {
            telemetry::record_execute_issued(module.to_string(), format!("{what:?}"));
            self.events.emit(
                env.uuid,
                CoordinationEventPayload::ExecuteIssued { module, what },
            );
        }
        if let Some(record) = self.modules.get_mut(&module) {
            record.send(env);
        }
    }

    fn handle_execute(&mut self, env: &Envelope) -> Result<bool> {
        let Message::Execute { module, what, .. } = env.payload else {
            return Ok(true);
        };
        assert!(module.is_module());
        if !self.modules.contains_key(&module) {
            if self.is_local(module) {
                warn!(%module, "execute for unknown module");
            } else if !env.was_broadcast {
                self.send_hub(env.clone())?;
            }
            return Ok(true);
        }

        match what {
            ExecuteKind::Prepare => {
                {
                    let record = self.record_mut(module);
                    assert!(!record.prepared, "prepare while already prepared: {module}");
                    assert!(record.reduced, "prepare before previous reduce: {module}");
                    record.prepared = true;
                    record.reduced = false;
                }
                self.deliver_execute(module, env.clone());
                self.check_execute_object(module)?;
            }
            ExecuteKind::Reduce => {
                {
                    let record = self.record_mut(module);
                    assert!(record.prepared, "reduce without prepare: {module}");
                    assert!(!record.reduced, "duplicate reduce: {module}");
                    record.prepared = false;
                    record.reduced = true;
                }
                self.deliver_execute(module, env.clone());
            }
            ExecuteKind::ComputeExecute => {
                if env.was_broadcast {
                    self.deliver_execute(module, env.clone());
                    let record = self.record_mut(module);
                    record.prepared = false;
                    record.reduced = true;
                } else if self.rank == 0 {
                    let record = self.record_mut(module);
                    if record.ranks_started > 0 {
                        record.delayed.push_back(env.clone());
                    } else {
                        assert!(!record.prepared);
                        record.prepared = false;
                        record.reduced = true;
                        self.broadcast_and_handle(env.clone())?;
                    }
                } else {
                    self.transport.forward_to_master(env.clone())?;
                }
            }
            ExecuteKind::ComputeObject => {
                let (policy, reduce) = self
                    .state
                    .module(module)
                    .map(|m| (m.scheduling, m.reduce))
                    .unwrap_or_default();
                // Never-policy modules compute without a bracket.
                assert!(
                    reduce == ReducePolicy::Never || self.record_mut(module).prepared,
                    "compute outside the prepare bracket: {module}"
                );
                if env.was_broadcast || policy == SchedulingPolicy::Single {
                    self.record_mut(module).reduced = false;
                    self.deliver_execute(module, env.clone());
                } else if self.rank == 0 {
                    let threshold = self.config.lazy_gang_threshold;
                    let size = self.size;
                    let mut do_exec = policy == SchedulingPolicy::Gang;
                    if policy == SchedulingPolicy::LazyGang {
                        let record = self.record_mut(module);
                        record.object_count[env.rank] += 1;
                        let pending: u32 = record.object_count.iter().sum();
                        if pending > 0 && pending as f64 >= size as f64 * threshold {
                            do_exec = true;
                            for count in record.object_count.iter_mut() {
                                if *count > 0 {
                                    *count -= 1;
                                }
                            }
                        }
                    }
                    if do_exec {
                        self.broadcast_and_handle(env.clone())?;
                    }
                }
                // Ranks other than 0 wait for the broadcast.
            }
        }
        Ok(true)
    }

    fn record_mut(&mut self, module: Id) -> &mut ModuleRecord {
        self.modules
            .get_mut(&module)
            .unwrap_or_else(|| panic!("module record {module} vanished"))
    }

    fn is_ready_for_execute(&self, module: Id) -> bool {
        let Some(record) = self.modules.get(&module) else {
            return false;
        };
        let Some(state) = self.state.module(module) else {
            return false;
        };
        if state.reduce == ReducePolicy::Never {
            return true;
        }
        record.prepared && !record.reduced
    }

    /// Issues compute triggers while every connected input of the module
    /// holds an object.
    fn check_execute_object(&mut self, module: Id) -> Result<()> {
        loop {
            if !self.is_ready_for_execute(module) {
                return Ok(());
            }
            let inputs: Vec<PortRef> = self
                .graph
                .connected_input_ports(module)
                .into_iter()
                .filter(|p| !self.no_compute(p))
                .collect();
            if inputs.is_empty() {
                return Ok(());
            }
            if !inputs.iter().all(|p| self.graph.has_object(p)) {
                return Ok(());
            }
            for port in &inputs {
                self.graph.pop_object(port);
            }

            let policy = self
                .state
                .module(module)
                .map(|m| m.scheduling)
                .unwrap_or_default();
            let exec = Envelope::new(
                self.hub,
                module,
                Message::Execute { module, what: ExecuteKind::ComputeObject, dest_rank: None },
            )
            .with_rank(self.rank);
            match policy {
                SchedulingPolicy::Single => {
                    self.handle_execute(&exec)?;
                }
                SchedulingPolicy::Gang => {
                    self.broadcast_and_handle(exec)?;
                }
                SchedulingPolicy::LazyGang => {
                    if self.rank == 0 {
                        self.handle_execute(&exec)?;
                    } else {
                        let mut exec = exec;
                        exec.for_broadcast = false;
                        self.transport.forward_to_master(exec)?;
                    }
                }
            }
        }
    }

    fn no_compute(&self, port: &PortRef) -> bool {
        self.graph
            .port_spec(port)
            .map(|s| s.no_compute)
            .unwrap_or(false)
    }

    fn handle_execution_progress(&mut self, env: &Envelope) -> Result<bool> {
        let Message::ExecutionProgress { stage } = env.payload else {
            return Ok(true);
        };
        let module = env.sender;
        let local_sender = self.is_local(module);
        if !self.state.is_running(module) {
            warn!(%module, "execution progress from unknown module");
            return Ok(true);
        }

        // Step accounting lives on rank 0.
        if local_sender && self.rank != 0 {
            self.transport.forward_to_master(env.clone())?;
            return Ok(true);
        }

        let mut receiving_hubs: BTreeSet<Id> = BTreeSet::new();
        if local_sender {
            for input in self.graph.downstream_inputs(module) {
                if let Some(hub) = self.state.hub_of(input.module) {
                    if hub != self.hub {
                        receiving_hubs.insert(hub);
                    }
                }
            }
        }

        let mut ready_for_prepare = false;
        let mut ready_for_reduce = false;
        let mut exec_done = false;
        let mut unqueue_execute = false;
        if local_sender {
            let size = self.size;
            let record = self.record_mut(module);
            match stage {
                ProgressStage::Start => {
                    assert!(record.ranks_finished < size);
                    record.ranks_started += 1;
                    ready_for_prepare = record.ranks_started == size;
                }
                ProgressStage::Finish => {
                    record.ranks_finished += 1;
                    if record.ranks_finished == size {
                        assert!(record.ranks_started >= size);
                        record.ranks_started -= size;
                        record.ranks_finished = 0;
                        ready_for_reduce = true;
                        exec_done = true;
                        unqueue_execute = true;
                    }
                }
            }
        } else {
            match stage {
                ProgressStage::Start => ready_for_prepare = true,
                ProgressStage::Finish => ready_for_reduce = true,
            }
        }

        if ready_for_prepare || ready_for_reduce {
            assert!(!(ready_for_prepare && ready_for_reduce) || stage == ProgressStage::Finish);
            for hub in &receiving_hubs {
                let mut fwd = env.clone();
                fwd.dest = *hub;
                fwd.dest_rank = Some(0);
                fwd.for_broadcast = false;
                self.send_hub(fwd)?;
            }
        }

        let downstream = self.graph.downstream_inputs(module);
        for input in &downstream {
            if self.no_compute(input) {
                continue;
            }
            if ready_for_prepare {
                self.graph.reset_input(input);
            }
            if ready_for_reduce {
                self.graph.finish_input(input);
            }
        }

        for input in &downstream {
            if self.no_compute(input) {
                continue;
            }
            self.drive_downstream(input.module)?;
        }

        if unqueue_execute && self.process_delayed(module)? {
            exec_done = false;
        }

        if exec_done && self.rank == 0 {
            let done = Envelope::new(module, Id::MASTER_HUB, Message::ExecutionDone);
            self.send_hub(done)?;
        }
        Ok(true)
    }

    /// Opens or closes the bracket of one downstream module when all of
    /// its inputs agree.
    fn drive_downstream(&mut self, dest: Id) -> Result<()> {
        let inputs: Vec<PortRef> = self
            .graph
            .connected_input_ports(dest)
            .into_iter()
            .filter(|p| !self.no_compute(p))
            .collect();
        if inputs.is_empty() {
            return Ok(());
        }
        let all_prepare = inputs.iter().all(|p| self.graph.is_reset(p));
        let all_reduce = inputs.iter().all(|p| self.graph.is_finished(p));

        let Some(state) = self.state.module(dest) else {
            warn!(%dest, "downstream module without replicated state");
            return Ok(());
        };
        let scheduling = state.scheduling;
        let reduce = state.reduce;
        let gang = matches!(scheduling, SchedulingPolicy::Gang | SchedulingPolicy::LazyGang);
        if reduce == ReducePolicy::Never && !gang {
            return Ok(());
        }

        if all_prepare {
            for input in &inputs {
                self.graph.pop_reset(input);
            }
            if self.is_local(dest) && self.rank == 0 {
                let exec = Envelope::new(
                    self.hub,
                    dest,
                    Message::Execute { module: dest, what: ExecuteKind::Prepare, dest_rank: None },
                );
                self.broadcast_and_handle(exec)?;
            }
        }

        if all_reduce {
            if self.is_local(dest) && scheduling == SchedulingPolicy::LazyGang && self.rank == 0 {
                // Flush batched triggers so no input object is lost to the
                // closing bracket.
                let flush = {
                    let record = self.record_mut(dest);
                    assert!(record.prepared);
                    assert!(!record.reduced);
                    let max = record.object_count.iter().copied().max().unwrap_or(0);
                    for count in record.object_count.iter_mut() {
                        if *count > 0 {
                            debug!(module = %dest, pending = *count, "flushing batched triggers");
                        }
                        *count = 0;
                    }
                    max
                };
                for _ in 0..flush {
                    let exec = Envelope::new(
                        self.hub,
                        dest,
                        Message::Execute {
                            module: dest,
                            what: ExecuteKind::ComputeObject,
                            dest_rank: None,
                        },
                    );
                    self.broadcast_and_handle(exec)?;
                }
            }
            for input in &inputs {
                self.graph.pop_finish(input);
            }
            if self.is_local(dest) && self.rank == 0 {
                let exec = Envelope::new(
                    self.hub,
                    dest,
                    Message::Execute { module: dest, what: ExecuteKind::Reduce, dest_rank: None },
                );
                self.broadcast_and_handle(exec)?;
            }
        }
        Ok(())
    }

    /// Replays triggers parked behind a running step, one execute at a
    /// time. Returns whether an execute was replayed.
    fn process_delayed(&mut self, module: Id) -> Result<bool> {
        if self.rank != 0 {
            return Ok(false);
        }
        let mut have_execute = false;
        loop {
            let Some(record) = self.modules.get_mut(&module) else {
                break;
            };
            if record.ranks_started > 0 || !record.have_delayed() {
                break;
            }
            let env = record
                .delayed
                .pop_front()
                .unwrap_or_else(|| panic!("delayed queue emptied while non-empty"));
            let is_execute = env.kind() == MessageKind::Execute;
            self.broadcast_and_handle(env)?;
            if is_execute {
                have_execute = true;
                break;
            }
        }
        Ok(have_execute)
    }

    // ---- objects -----------------------------------------------------

    fn handle_add_object(&mut self, env: &Envelope) -> Result<bool> {
        let Message::AddObject(add) = &env.payload else {
            return Ok(true);
        };
        let add = add.clone();

        if env.was_broadcast {
            // Group-wide announcement: deliver, count, maybe trigger.
            assert!(add.dest_module.is_module());
            self.send_message(add.dest_module, env.clone())?;
            if add.unblocking {
                return Ok(true);
            }
            let port = PortRef::new(add.dest_module, add.dest_port.clone());
            self.graph.add_object(&port);
            self.check_execute_object(add.dest_module)?;
            return Ok(true);
        }

        if add.unblocking {
            // Fetched object landed; release the parked announcement.
            self.send_message(add.dest_module, env.clone())?;
            return Ok(true);
        }

        let resend = env.dest.is_module();
        let local_add = self.is_local(add.sender_module);
        if resend {
            assert!(local_add);
        }

        if local_add {
            self.add_object_source(&add, resend)?;
        }

        let available;
        if local_add {
            available = self.store.get(&add.object).is_some();
            if !available && self.store.same_group(add.sender_rank, self.rank) {
                warn!(object = %add.object, "announced local object not in store");
            }
        } else {
            let dest_rank = add.dest_rank;
            let on_this_rank = match dest_rank {
                Some(rank) => rank == self.rank,
                None => self.rank == 0,
            };
            if !on_this_rank {
                if let Some(rank) = dest_rank {
                    return self.transport.send_to_rank(rank, env.clone()).map(|_| true);
                }
                return Ok(true);
            }
            available = self.store.get(&add.object).is_some();
            if available {
                // Already here; the sender can unpin right away.
                self.transfer.notify_transfer_complete(&add);
            }
        }

        self.add_object_destination(env, &add, available, resend)?;
        Ok(true)
    }

    /// Producer side: cache the announcement for late connections and
    /// forward it once to every remote hub with a connected destination.
    fn add_object_source(&mut self, add: &AddObject, resend: bool) -> Result<()> {
        let from = PortRef::new(add.sender_module, add.sender_port.clone());
        if !self.graph.has_port(&from) {
            warn!(port = ?from, object = %add.object, "announcement from unknown port");
            return Ok(());
        }

        if !resend {
            let cache = self.output_cache.entry(from.clone()).or_default();
            if cache.generation != add.generation || cache.iteration != add.iteration {
                cache.adds.clear();
            }
            cache.generation = add.generation;
            cache.iteration = add.iteration;
            let mut cached = add.clone();
            cached.dest_module = Id::INVALID;
            cached.dest_port = String::new();
            cache.adds.push(cached);
        }

        let dests = if resend {
            vec![PortRef::new(add.dest_module, add.dest_port.clone())]
        } else {
            self.graph.connections_of(&from)
        };
        let mut receiving_hubs: BTreeSet<Id> = BTreeSet::new();
        for dest in dests {
            let Some(hub) = self.state.hub_of(dest.module) else {
                continue;
            };
            if hub == self.hub || !receiving_hubs.insert(hub) {
                continue;
            }
            let mut forwarded = add.clone();
            forwarded.dest_module = Id::INVALID;
            forwarded.dest_port = String::new();
            forwarded.dest_rank = Some(0);
            let key = crate::message::TransitKey { object: forwarded.object.clone(), dest_module: hub };
            let mut pin = forwarded.clone();
            pin.dest_module = hub;
            self.transfer.prepare_transfer(&pin)?;
            debug!(object = %add.object, %hub, ?key, "shipping announcement to remote hub");
            let mut env = Envelope::new(add.sender_module, hub, Message::AddObject(forwarded))
                .with_rank(self.rank);
            env.dest_rank = Some(0);
            self.send_hub(env)?;
        }
        Ok(())
    }

    /// Consumer side: hand the announcement to each connected local
    /// destination, fetching the object first when it is not here.
    fn add_object_destination(
        &mut self,
        env: &Envelope,
        add: &AddObject,
        available: bool,
        resend: bool,
    ) -> Result<()> {
        let from = PortRef::new(add.sender_module, add.sender_port.clone());
        let dests = if resend {
            vec![PortRef::new(add.dest_module, add.dest_port.clone())]
        } else {
            self.graph.connections_of(&from)
        };

        for dest_port in dests {
            let dest = dest_port.module;
            if !self.is_local(dest) {
                continue;
            }
            let Some(dest_state) = self.state.module(dest) else {
                if self.state.has_crashed(dest) {
                    debug!(%dest, "skipping announcement for crashed module");
                    continue;
                }
                warn!(%dest, "announcement for module that is not running");
                continue;
            };
            let broadcast = dest_state.receive.needs_broadcast();

            let mut add2 = add.clone();
            add2.dest_module = dest;
            add2.dest_port = dest_port.port.clone();
            add2.dest_rank = None;
            add2.blocker = !available;
            let mut env2 = env.clone();
            env2.dest = dest;
            env2.dest_rank = None;
            env2.for_broadcast = false;
            env2.was_broadcast = false;
            env2.payload = Message::AddObject(add2.clone());

            if broadcast {
                self.broadcast_and_handle(env2.clone())?;
            } else {
                self.send_message(dest, env2.clone())?;
                self.graph.add_object(&dest_port);
                self.check_execute_object(dest)?;
            }

            if !available {
                // Fetch, then re-inject the unblocking copy through the
                // mailbox so FIFO order is restored on this thread.
                let mailbox = self.mailbox.clone();
                let mut unblocked = env2;
                self.transfer.request_object_for(
                    add,
                    Box::new(move |_| {
                        if let Message::AddObject(a) = &mut unblocked.payload {
                            a.blocker = false;
                            a.unblocking = true;
                        }
                        unblocked.for_broadcast = broadcast;
                        mailbox.send(unblocked);
                    }),
                )?;
            }
        }
        Ok(())
    }

    // ---- barrier -----------------------------------------------------

    fn handle_barrier(&mut self, env: &Envelope) -> Result<bool> {
        let Message::Barrier { info } = &env.payload else {
            return Ok(true);
        };
        // One barrier at a time; a second start means the protocol layers
        // above lost track and the reached set would mix two barriers.
        assert!(!self.barrier_active, "barrier started while one is active");
        info!(uuid = %env.uuid, info = %info, "barrier started");
        self.barrier_active = true;
        self.barrier_uuid = Some(env.uuid);
        self.barrier_timing = Some(telemetry::start_timing());
        self.events.emit(
            env.uuid,
            CoordinationEventPayload::BarrierStarted { info: info.clone() },
        );
        self.send_all_local(env);
        // No local modules means the barrier completes right away.
        self.check_barrier()?;
        Ok(true)
    }

    fn handle_barrier_reached(&mut self, env: &Envelope) -> Result<bool> {
        assert!(self.barrier_active, "barrier progress without an active barrier");
        if env.sender.is_module() {
            if Some(env.uuid) != self.barrier_uuid {
                warn!(
                    uuid = %env.uuid,
                    expected = ?self.barrier_uuid,
                    "barrier reach with stale uuid, ignoring"
                );
                return Ok(true);
            }
            assert!(self.is_local(env.sender));
            self.reached.insert(env.sender);
            self.check_barrier()?;
        } else if env.sender == Id::MASTER_HUB {
            self.reached.clear();
            self.barrier_active = false;
            let uuid = self.barrier_uuid.take().unwrap_or(env.uuid);
            self.events.emit(uuid, CoordinationEventPayload::BarrierCompleted);
        } else {
            warn!(sender = %env.sender, "barrier reach from invalid sender");
        }
        Ok(true)
    }

    /// Local barrier completion: every running local module has reached
    /// the barrier. Module exits re-run this, so a barrier can complete
    /// because its last straggler exited.
    fn check_barrier(&mut self) -> Result<()> {
        if !self.barrier_active {
            return Ok(());
        }
        let Some(uuid) = self.barrier_uuid else {
            return Ok(());
        };
        if self.reached.len() < self.num_running() {
            return Ok(());
        }
        self.transport.barrier()?;
        if let Some(timing) = self.barrier_timing.take() {
            telemetry::record_barrier_completed(uuid.to_string(), timing.elapsed_secs());
        }
        self.events.emit(uuid, CoordinationEventPayload::BarrierReachedLocally);
        self.reached.clear();
        if self.rank == 0 {
            let notice = Envelope::new(self.hub, Id::MASTER_HUB, Message::BarrierReached)
                .with_uuid(uuid);
            self.send_hub(notice)?;
        }
        Ok(())
    }

    // ---- status ------------------------------------------------------

    fn handle_busy(&mut self, env: &Envelope) -> Result<bool> {
        if self.rank != 0 {
            self.transport.forward_to_master(env.clone())?;
            return Ok(true);
        }
        let module = env.sender;
        let Some(record) = self.modules.get_mut(&module) else {
            return Ok(true);
        };
        if record.busy_count == 0 {
            let mut fwd = env.clone();
            fwd.dest = Id::UI;
            self.send_hub(fwd)?;
        }
        self.record_mut(module).busy_count += 1;
        Ok(true)
    }

    fn handle_idle(&mut self, env: &Envelope) -> Result<bool> {
        if self.rank != 0 {
            self.transport.forward_to_master(env.clone())?;
            return Ok(true);
        }
        let module = env.sender;
        let Some(record) = self.modules.get_mut(&module) else {
            return Ok(true);
        };
        if record.busy_count == 0 {
            warn!(%module, "idle without matching busy");
            return Ok(true);
        }
        record.busy_count -= 1;
        if record.busy_count == 0 {
            let mut fwd = env.clone();
            fwd.dest = Id::UI;
            self.send_hub(fwd)?;
        }
        Ok(true)
    }

    fn handle_set_parameter(&mut self, env: &Envelope) -> Result<bool> {
        let Message::SetParameter { module, .. } = &env.payload else {
            return Ok(true);
        };
        let module = *module;
        if env.dest.is_module() && !env.was_broadcast {
            // Parameter requests route through the master hub, which
            // broadcasts the authoritative change.
            self.send_hub(env.clone())?;
        } else if env.sender.is_module() && env.sender == module && !self.transport.is_master() {
            // Parameter change on a satellite hub: everyone else learns
            // about it through the local fan-out.
            self.send_all_others(env.sender, env);
        }
        Ok(true)
    }

    fn handle_set_parameter_choices(&mut self, env: &Envelope) -> Result<bool> {
        let Message::SetParameterChoices { module, .. } = &env.payload else {
            return Ok(true);
        };
        let module = *module;
        // Choice lists route exactly like parameter values.
        if env.dest.is_module() && !env.was_broadcast {
            self.send_hub(env.clone())?;
        } else if env.sender.is_module() && env.sender == module && !self.transport.is_master() {
            self.send_all_others(env.sender, env);
        }
        Ok(true)
    }

    fn handle_identify(&mut self, env: &Envelope) -> Result<bool> {
        let Message::Identify { identity } = env.payload else {
            return Ok(true);
        };
        if identity == Identity::Request && self.rank == 0 {
            // The reply carries the request's uuid so the peer can match it.
            let reply = Envelope::new(
                self.hub,
                env.sender,
                Message::Identify { identity: Identity::Manager },
            )
            .with_uuid(env.uuid);
            self.send_hub(reply)?;
        }
        Ok(true)
    }

    fn handle_ping(&mut self, env: &Envelope) -> Result<bool> {
        let Message::Ping { payload } = env.payload else {
            return Ok(true);
        };
        debug!(sender = %env.sender, payload = %payload, "ping");
        if self.rank == 0 {
            let pong = Envelope::new(
                self.hub,
                env.sender,
                Message::Pong { payload, module: self.hub },
            )
            .with_rank(self.rank);
            self.send_hub(pong)?;
        }
        Ok(true)
    }

    fn handle_request_tunnel(&mut self, env: &Envelope) -> Result<bool> {
        // Tunnels are the hub's business; the engine only relays.
        self.send_hub(env.clone())?;
        Ok(true)
    }

    fn handle_send_text(&mut self, mut env: Envelope) -> Result<bool> {
        if let Message::SendText { kind, text } = &env.payload {
            match kind {
                TextKind::Error => warn!(%text, sender = %env.sender, "module error"),
                _ => debug!(%text, sender = %env.sender, "module text"),
            }
        }
        if self.transport.is_master() {
            env.dest = Id::MASTER_HUB;
        }
        self.send_hub(env)?;
        Ok(true)
    }

    fn handle_trace(&mut self, env: &Envelope) -> Result<bool> {
        let Message::Trace { module, kind, on } = env.payload else {
            return Ok(true);
        };
        if module.is_module() {
            if self.is_local(module) {
                self.send_message(module, env.clone())?;
            }
        } else if module == Id::BROADCAST {
            self.send_all_local(env);
        }
        if module == self.hub || module == Id::BROADCAST {
            self.trace = if on {
                kind.map(TraceFilter::Kind).unwrap_or(TraceFilter::All)
            } else {
                TraceFilter::Off
            };
            self.transfer.set_trace(on);
            info!(?kind, on, "message tracing updated");
        }
        Ok(true)
    }

    // ---- graph helpers ----------------------------------------------

    /// Longest path to a sink, per module. Work nearer the sink is
    /// preferred by embedders that order module servicing.
    fn recompute_heights(&mut self) {
        let ids = self.state.running_ids();
        let mut heights: HashMap<Id, u32> = ids.iter().map(|id| (*id, 0)).collect();
        // Relax until fixed; path lengths are bounded by the module count.
        for _ in 0..ids.len() {
            let mut changed = false;
            for id in &ids {
                let below = self
                    .graph
                    .downstream_modules(*id)
                    .into_iter()
                    .filter_map(|m| heights.get(&m).copied())
                    .max();
                let want = below.map(|h| h + 1).unwrap_or(0);
                if heights.get(id) != Some(&want) {
                    heights.insert(*id, want);
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
        for (id, height) in heights {
            self.state.set_height(id, height);
        }
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("hub", &self.hub)
            .field("rank", &self.rank)
            .field("size", &self.size)
            .field("running", &self.modules.len())
            .field("barrier_active", &self.barrier_active)
            .field("quit", &self.quit_flag)
            .finish()
    }
}
