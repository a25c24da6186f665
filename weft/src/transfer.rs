//! Bulk-object transfers.
//!
//! The transfer manager moves payload objects between hubs and ranks over
//! the data plane. The control plane only ever carries object names; when
//! an announced object is not available locally, the coordinator asks this
//! manager to fetch it and continues, and the registered completion
//! handler fires once the object has been registered in the local store.
//!
//! Concurrency shape: a background task polls the data lane and pushes
//! received envelopes into a mutex-guarded queue; everything else happens
//! on the orchestrator thread when it calls [`TransferManager::dispatch`].
//! Messages for the coordinator (completion notices, status lines) go
//! through a mailbox channel instead of a back-reference, so ownership
//! stays a tree.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::events::{CoordinationEventPayload, InProcCoordinationBus};
use crate::id::{Id, Rank};
use crate::message::{AddObject, ArrayType, Envelope, Message, TextKind, TransitKey};
use crate::runtime::ShutdownToken;
use crate::store::{MissingRef, ObjectHandle, ObjectStore};
use crate::telemetry;
use crate::transport::Transport;

/// Runs when a requested object (or array) is usable in the local store.
pub type CompletionHandler = Box<dyn FnOnce(ObjectHandle) + Send>;

/// Sending half of the coordinator's back-channel.
///
/// The transfer manager and background tasks push envelopes here; the
/// orchestrator drains them into the coordinator on its own thread.
#[derive(Clone, Debug)]
pub struct CoordinatorMailbox {
    tx: mpsc::UnboundedSender<Envelope>,
}

impl CoordinatorMailbox {
    pub fn send(&self, env: Envelope) {
        // Failure means the coordinator is gone; nothing left to route to.
        let _ = self.tx.send(env);
    }
}

pub fn mailbox_channel() -> (CoordinatorMailbox, mpsc::UnboundedReceiver<Envelope>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (CoordinatorMailbox { tx }, rx)
}

struct PendingObject {
    handlers: Vec<CompletionHandler>,
    started: Instant,
}

struct PendingArray {
    array_type: ArrayType,
    handlers: Vec<CompletionHandler>,
}

struct InTransit {
    add: AddObject,
}

#[derive(Default)]
struct Inner {
    /// Object name -> handlers waiting for it. Presence means a wire
    /// request is already underway; later requesters piggyback.
    requested_objects: HashMap<String, PendingObject>,
    requested_arrays: HashMap<String, PendingArray>,
    /// Announcements whose completion notice is owed once the named
    /// object arrives.
    outstanding_adds: HashMap<String, Vec<AddObject>>,
    /// Outbound objects pinned until the receiver confirms.
    in_transit: HashMap<TransitKey, InTransit>,
    /// Rank 0 only: last reported outbound count per rank.
    per_rank: HashMap<Rank, usize>,
    last_status: Option<Instant>,
    last_reported: usize,
    trace: bool,
}

pub struct TransferManager {
    transport: Arc<dyn Transport>,
    store: Arc<dyn ObjectStore>,
    mailbox: CoordinatorMailbox,
    events: Arc<InProcCoordinationBus>,
    status_interval: Duration,
    inner: Mutex<Inner>,
    recv_queue: Mutex<VecDeque<Envelope>>,
}

impl TransferManager {
    pub fn new(
        transport: Arc<dyn Transport>,
        store: Arc<dyn ObjectStore>,
        mailbox: CoordinatorMailbox,
        events: Arc<InProcCoordinationBus>,
        config: &EngineConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            transport,
            store,
            mailbox,
            events,
            status_interval: config.transfer_status_interval(),
            inner: Mutex::new(Inner::default()),
            recv_queue: Mutex::new(VecDeque::new()),
        })
    }

    /// Spawns the data-lane receive loop. Received envelopes are parked in
    /// the receive queue until the orchestrator calls [`dispatch`].
    ///
    /// [`dispatch`]: TransferManager::dispatch
    pub fn start(self: &Arc<Self>, shutdown: ShutdownToken) -> tokio::task::JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                if shutdown.is_cancelled() {
                    break;
                }
                match this.transport.try_recv_data() {
                    Ok(Some(env)) => {
                        this.recv_queue.lock().push_back(env);
                    }
                    Ok(None) => {
                        tokio::time::sleep(Duration::from_millis(1)).await;
                    }
                    Err(err) => {
                        warn!(error = %err, "data lane receive failed, stopping");
                        break;
                    }
                }
            }
        })
    }

    /// Drains the receive queue. Returns whether anything was handled.
    pub fn dispatch(self: &Arc<Self>) -> Result<bool> {
        let mut work = false;
        loop {
            let Some(env) = self.recv_queue.lock().pop_front() else {
                break;
            };
            work = true;
            self.handle(env)?;
        }
        Ok(work)
    }

    /// Synchronously drains the data lane and the receive queue, for
    /// embedders that poll instead of running the receive task.
    pub fn poll(self: &Arc<Self>) -> Result<bool> {
        let mut work = false;
        while let Some(env) = self.transport.try_recv_data()? {
            work = true;
            self.handle(env)?;
        }
        work |= self.dispatch()?;
        Ok(work)
    }

    pub fn set_trace(&self, on: bool) {
        self.inner.lock().trace = on;
    }

    /// Requests the object named by an announcement and owes the sender a
    /// completion notice. Returns whether a wire request was issued (false
    /// when the object was already local or a fetch was underway).
    pub fn request_object_for(
        self: &Arc<Self>,
        add: &AddObject,
        handler: CompletionHandler,
    ) -> Result<bool> {
        {
            let mut inner = self.inner.lock();
            inner
                .outstanding_adds
                .entry(add.object.clone())
                .or_default()
                .push(add.clone());
        }
        self.request_object(
            &add.object,
            add.sender_hub,
            add.sender_rank,
            &add.object,
            handler,
        )
    }

    /// Requests an object by name from a (hub, rank) holder. Concurrent
    /// requests for the same name coalesce into one wire request; every
    /// handler fires on arrival.
    pub fn request_object(
        self: &Arc<Self>,
        object: &str,
        hub: Id,
        rank: Rank,
        referrer: &str,
        handler: CompletionHandler,
    ) -> Result<bool> {
        if let Some(handle) = self.store.get(object) {
            handler(handle);
            return Ok(false);
        }
        {
            let mut inner = self.inner.lock();
            // The store may have caught up while we waited for the lock.
            if let Some(pending) = inner.requested_objects.get_mut(object) {
                pending.handlers.push(handler);
                trace!(object, "object fetch already underway, piggybacking");
                return Ok(false);
            }
            inner.requested_objects.insert(
                object.to_string(),
                PendingObject { handlers: vec![handler], started: Instant::now() },
            );
        }
        self.events.emit(
            Uuid::now_v7(),
            CoordinationEventPayload::TransferStarted { object: object.to_string() },
        );
        self.send_request(object, hub, rank, None, referrer)
            .with_context(|| format!("requesting object {object}"))?;
        Ok(true)
    }

    /// Requests a typed array referenced by an object under construction.
    pub fn request_array(
        self: &Arc<Self>,
        name: &str,
        array_type: ArrayType,
        hub: Id,
        rank: Rank,
        referrer: &str,
        handler: CompletionHandler,
    ) -> Result<bool> {
        {
            let mut inner = self.inner.lock();
            if let Some(pending) = inner.requested_arrays.get_mut(name) {
                if pending.array_type != array_type {
                    bail!(
                        "array {name} requested as {:?} but already pending as {:?}",
                        array_type,
                        pending.array_type
                    );
                }
                pending.handlers.push(handler);
                return Ok(false);
            }
            inner.requested_arrays.insert(
                name.to_string(),
                PendingArray { array_type, handlers: vec![handler] },
            );
        }
        self.send_request(name, hub, rank, Some(array_type), referrer)
            .with_context(|| format!("requesting array {name}"))?;
        Ok(true)
    }

    /// Pins an outbound object until its receiver confirms the transfer.
    pub fn prepare_transfer(&self, add: &AddObject) -> Result<()> {
        let key = add.key();
        let mut inner = self.inner.lock();
        if inner.in_transit.contains_key(&key) {
            debug!(?key, "transfer already prepared");
            return Ok(());
        }
        self.store
            .ref_object(&add.object)
            .with_context(|| format!("pinning {} for transfer", add.object))?;
        inner.in_transit.insert(key, InTransit { add: add.clone() });
        let count = inner.in_transit.len();
        drop(inner);
        telemetry::set_in_transit(count);
        self.report_status()?;
        Ok(())
    }

    /// Releases the pin taken by [`prepare_transfer`]. Unknown keys are
    /// logged and ignored; the confirming side may retire a transfer twice
    /// when a module exits mid-handshake.
    ///
    /// [`prepare_transfer`]: TransferManager::prepare_transfer
    pub fn complete_transfer(&self, key: &TransitKey) -> Result<()> {
        let mut inner = self.inner.lock();
        let Some(transit) = inner.in_transit.remove(key) else {
            warn!(?key, "completion for unknown transfer");
            return Ok(());
        };
        let count = inner.in_transit.len();
        drop(inner);
        self.store
            .release(&transit.add.object)
            .with_context(|| format!("unpinning {}", transit.add.object))?;
        telemetry::set_in_transit(count);
        self.report_status()?;
        Ok(())
    }

    /// Number of outbound objects still pinned.
    pub fn num_in_transit(&self) -> usize {
        self.inner.lock().in_transit.len()
    }

    /// Rank 0: folds a rank's outbound count into the aggregate and, when
    /// due, pushes a status line to the coordinator. Zero everywhere
    /// clears the line immediately.
    pub fn handle_transfer_state(&self, rank: Rank, num_transferring: usize) {
        let mut inner = self.inner.lock();
        inner.per_rank.insert(rank, num_transferring);
        let total: usize = inner.per_rank.values().sum();
        let due = match inner.last_status {
            Some(at) => at.elapsed() >= self.status_interval,
            None => true,
        };
        if total == inner.last_reported || (total != 0 && !due) {
            return;
        }
        inner.last_status = Some(Instant::now());
        inner.last_reported = total;
        drop(inner);
        let text = if total == 0 {
            String::new()
        } else {
            format!("transferring {total} objects")
        };
        self.mailbox.send(Envelope::new(
            self.transport.hub_id(),
            Id::FOR_BROADCAST,
            Message::SendText { kind: TextKind::Status, text },
        ));
    }

    fn handle(self: &Arc<Self>, env: Envelope) -> Result<()> {
        if self.inner.lock().trace {
            debug!(kind = ?env.kind(), sender = %env.sender, "data lane message");
        }
        match env.payload {
            Message::RequestObject { hub, rank, object, array_type, referrer } => {
                self.handle_request(hub, rank, &object, array_type, &referrer)
            }
            Message::SendObject { object, referrer, array_type, payload } => {
                self.handle_send(&object, &referrer, array_type, &payload)
            }
            other => {
                warn!(kind = ?other.kind(), "unexpected message on data lane");
                Ok(())
            }
        }
    }

    fn handle_request(
        &self,
        requester_hub: Id,
        requester_rank: Rank,
        object: &str,
        array_type: Option<ArrayType>,
        referrer: &str,
    ) -> Result<()> {
        let payload = match array_type {
            Some(ty) => self
                .store
                .serialize_array(object, ty)
                .with_context(|| format!("serializing array {object}"))?,
            None => self
                .store
                .serialize(object)
                .with_context(|| format!("serializing object {object}"))?,
        };
        let reply = Envelope::new(
            self.transport.hub_id(),
            requester_hub,
            Message::SendObject {
                object: object.to_string(),
                referrer: referrer.to_string(),
                array_type,
                payload,
            },
        )
        .with_rank(self.transport.rank());
        self.transport.send_data(requester_hub, requester_rank, reply)
    }

    fn handle_send(
        self: &Arc<Self>,
        object: &str,
        referrer: &str,
        array_type: Option<ArrayType>,
        payload: &[u8],
    ) -> Result<()> {
        match array_type {
            Some(ty) => {
                self.store
                    .deserialize_array(object, ty, payload)
                    .with_context(|| format!("registering array {object}"))?;
                self.complete_array(object);
                Ok(())
            }
            None => {
                let result = self
                    .store
                    .deserialize(object, payload)
                    .with_context(|| format!("registering object {object}"))?;
                if result.missing.is_empty() {
                    self.complete_object(object, result.handle);
                    return Ok(());
                }
                self.fetch_missing(object, referrer, result)
            }
        }
    }

    /// A shipped object arrived with unresolved sub-references; fetch each
    /// through the same coalescing interface and complete the parent once
    /// the last one lands.
    fn fetch_missing(
        self: &Arc<Self>,
        object: &str,
        referrer: &str,
        result: crate::store::Deserialized,
    ) -> Result<()> {
        let origin = self.origin_of(referrer, object);
        let remaining = Arc::new(Mutex::new(result.missing.len()));
        let parent: Arc<Mutex<Option<(String, ObjectHandle)>>> =
            Arc::new(Mutex::new(Some((object.to_string(), result.handle))));
        for missing in result.missing {
            let this = Arc::clone(self);
            let remaining = Arc::clone(&remaining);
            let parent = Arc::clone(&parent);
            let done: CompletionHandler = Box::new(move |_| {
                let mut left = remaining.lock();
                *left -= 1;
                if *left == 0 {
                    if let Some((name, handle)) = parent.lock().take() {
                        this.complete_object(&name, handle);
                    }
                }
            });
            let (hub, rank) = origin;
            let sent = match missing {
                MissingRef::Object { name } => {
                    self.request_object(&name, hub, rank, object, done)?
                }
                MissingRef::Array { name, array_type } => {
                    self.request_array(&name, array_type, hub, rank, object, done)?
                }
            };
            if sent {
                trace!(parent = object, "sub-reference fetch issued");
            }
        }
        Ok(())
    }

    fn complete_object(self: &Arc<Self>, object: &str, handle: ObjectHandle) {
        let (adds, handlers, started) = {
            let mut inner = self.inner.lock();
            let adds = inner.outstanding_adds.remove(object).unwrap_or_default();
            let pending = inner.requested_objects.remove(object);
            let started = pending.as_ref().map(|p| p.started);
            (adds, pending.map(|p| p.handlers).unwrap_or_default(), started)
        };
        for add in adds {
            self.notify_transfer_complete(&add);
        }
        for handler in handlers {
            handler(handle.clone());
        }
        if let Some(started) = started {
            telemetry::record_transfer_completed(object, started.elapsed().as_secs_f64());
        }
        self.events.emit(
            Uuid::now_v7(),
            CoordinationEventPayload::TransferCompleted { object: object.to_string() },
        );
    }

    fn complete_array(&self, name: &str) {
        let handlers = {
            let mut inner = self.inner.lock();
            inner
                .requested_arrays
                .remove(name)
                .map(|p| p.handlers)
                .unwrap_or_default()
        };
        let handle = ObjectHandle::new(name);
        for handler in handlers {
            handler(handle.clone());
        }
    }

    /// Tells the announcement's sender that the object landed, so the
    /// sending side can unpin it. The sender pinned under the receiving
    /// hub's id, which is this hub.
    pub fn notify_transfer_complete(&self, add: &AddObject) {
        let key = TransitKey {
            object: add.object.clone(),
            dest_module: self.transport.hub_id(),
        };
        let env = Envelope::new(
            self.transport.hub_id(),
            add.sender_hub,
            Message::AddObjectCompleted { key, dest_rank: add.sender_rank },
        )
        .with_dest_rank(add.sender_rank)
        .with_rank(self.transport.rank());
        self.mailbox.send(env);
    }

    /// Reports the local outbound count toward rank 0.
    fn report_status(&self) -> Result<()> {
        let count = self.num_in_transit();
        let env = Envelope::new(
            self.transport.hub_id(),
            self.transport.hub_id(),
            Message::DataTransferState { num_transferring: count },
        )
        .with_rank(self.transport.rank());
        if self.transport.rank() == 0 {
            self.handle_transfer_state(0, count);
            Ok(())
        } else {
            self.transport.forward_to_master(env)
        }
    }

    fn send_request(
        &self,
        object: &str,
        hub: Id,
        rank: Rank,
        array_type: Option<ArrayType>,
        referrer: &str,
    ) -> Result<()> {
        let env = Envelope::new(
            self.transport.hub_id(),
            hub,
            Message::RequestObject {
                hub: self.transport.hub_id(),
                rank: self.transport.rank(),
                object: object.to_string(),
                array_type,
                referrer: referrer.to_string(),
            },
        )
        .with_rank(self.transport.rank());
        self.transport.send_data(hub, rank, env)
    }

    /// Where sub-references of `object` live: the endpoint the parent was
    /// requested from, falling back to the announcement that started the
    /// fetch.
    fn origin_of(&self, _referrer: &str, object: &str) -> (Id, Rank) {
        let inner = self.inner.lock();
        if let Some(adds) = inner.outstanding_adds.get(object) {
            if let Some(add) = adds.first() {
                return (add.sender_hub, add.sender_rank);
            }
        }
        for transit in inner.in_transit.values() {
            if transit.add.object == object {
                return (transit.add.sender_hub, transit.add.sender_rank);
            }
        }
        (Id::MASTER_HUB, 0)
    }
}

impl std::fmt::Debug for TransferManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("TransferManager")
            .field("requested_objects", &inner.requested_objects.len())
            .field("requested_arrays", &inner.requested_arrays.len())
            .field("in_transit", &inner.in_transit.len())
            .finish()
    }
}
