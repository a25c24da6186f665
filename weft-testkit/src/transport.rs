use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};

use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use weft::{Envelope, Id, Rank, Transport};

/// In-process messaging fabric for one hub's rank group.
///
/// All lanes are queues drained by explicit pumping, so tests drive every
/// rank in lockstep from one thread. The hub control stream is scripted:
/// push inbound hub messages with [`push_hub`], inspect what rank 0 sent
/// upward with [`take_hub_messages`]. Collectives complete immediately.
///
/// [`push_hub`]: LoopbackFabric::push_hub
/// [`take_hub_messages`]: LoopbackFabric::take_hub_messages
pub struct LoopbackFabric {
    hub: Id,
    master: bool,
    inner: Arc<Mutex<FabricInner>>,
    peers: Arc<Mutex<HashMap<Id, Weak<Mutex<FabricInner>>>>>,
}

struct FabricInner {
    size: usize,
    rank_queues: Vec<VecDeque<Envelope>>,
    broadcast_queues: Vec<VecDeque<Envelope>>,
    data_queues: Vec<VecDeque<Envelope>>,
    hub_inbox: VecDeque<Envelope>,
    hub_sent: Vec<Envelope>,
    hub_closed: bool,
    barriers: usize,
    reduce_hint: u32,
}

impl LoopbackFabric {
    pub fn new(hub: Id, size: usize, master: bool) -> Self {
        assert!(size > 0);
        Self {
            hub,
            master,
            inner: Arc::new(Mutex::new(FabricInner {
                size,
                rank_queues: vec![VecDeque::new(); size],
                broadcast_queues: vec![VecDeque::new(); size],
                data_queues: vec![VecDeque::new(); size],
                hub_inbox: VecDeque::new(),
                hub_sent: Vec::new(),
                hub_closed: false,
                barriers: 0,
                reduce_hint: 0,
            })),
            peers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn endpoint(&self, rank: Rank) -> Arc<LoopbackTransport> {
        assert!(rank < self.inner.lock().size);
        Arc::new(LoopbackTransport {
            rank,
            hub: self.hub,
            master: self.master,
            inner: Arc::clone(&self.inner),
            peers: Arc::clone(&self.peers),
        })
    }

    /// Connects two fabrics' data planes in both directions.
    pub fn bridge(a: &LoopbackFabric, b: &LoopbackFabric) {
        a.peers.lock().insert(b.hub, Arc::downgrade(&b.inner));
        b.peers.lock().insert(a.hub, Arc::downgrade(&a.inner));
    }

    /// Scripts a message arriving on the hub control stream of rank 0.
    pub fn push_hub(&self, env: Envelope) {
        self.inner.lock().hub_inbox.push_back(env);
    }

    /// Simulates losing the hub connection.
    pub fn close_hub(&self) {
        self.inner.lock().hub_closed = true;
    }

    /// Everything rank 0 sent up the hub stream since the last take.
    pub fn take_hub_messages(&self) -> Vec<Envelope> {
        std::mem::take(&mut self.inner.lock().hub_sent)
    }

    pub fn hub_messages(&self) -> Vec<Envelope> {
        self.inner.lock().hub_sent.clone()
    }

    pub fn barrier_count(&self) -> usize {
        self.inner.lock().barriers
    }

    /// Undelivered data-lane envelopes headed for a rank.
    pub fn data_queue_len(&self, rank: Rank) -> usize {
        self.inner.lock().data_queues[rank].len()
    }

    /// Floor for `all_reduce_max`, standing in for contributions of ranks
    /// the test does not model.
    pub fn set_reduce_hint(&self, value: u32) {
        self.inner.lock().reduce_hint = value;
    }
}

pub struct LoopbackTransport {
    rank: Rank,
    hub: Id,
    master: bool,
    inner: Arc<Mutex<FabricInner>>,
    peers: Arc<Mutex<HashMap<Id, Weak<Mutex<FabricInner>>>>>,
}

impl Transport for LoopbackTransport {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn size(&self) -> usize {
        self.inner.lock().size
    }

    fn hub_id(&self) -> Id {
        self.hub
    }

    fn is_master(&self) -> bool {
        self.master
    }

    fn send_to_rank(&self, rank: Rank, env: Envelope) -> Result<()> {
        let mut inner = self.inner.lock();
        let queue = inner
            .rank_queues
            .get_mut(rank)
            .ok_or_else(|| anyhow!("no rank {rank}"))?;
        queue.push_back(env);
        Ok(())
    }

    fn broadcast(&self, env: Envelope) -> Result<()> {
        let mut inner = self.inner.lock();
        let size = inner.size;
        for rank in 0..size {
            if rank != self.rank {
                inner.broadcast_queues[rank].push_back(env.clone());
            }
        }
        Ok(())
    }

    fn send_hub(&self, env: Envelope) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.hub_closed {
            return Err(anyhow!("hub stream closed"));
        }
        inner.hub_sent.push(env);
        Ok(())
    }

    fn send_data(&self, hub: Id, rank: Rank, env: Envelope) -> Result<()> {
        if hub == self.hub {
            let mut inner = self.inner.lock();
            let queue = inner
                .data_queues
                .get_mut(rank)
                .ok_or_else(|| anyhow!("no rank {rank}"))?;
            queue.push_back(env);
            return Ok(());
        }
        let peer = self
            .peers
            .lock()
            .get(&hub)
            .and_then(Weak::upgrade)
            .ok_or_else(|| anyhow!("no data bridge to hub {hub}"))?;
        let mut inner = peer.lock();
        let queue = inner
            .data_queues
            .get_mut(rank)
            .ok_or_else(|| anyhow!("no rank {rank} on hub {hub}"))?;
        queue.push_back(env);
        Ok(())
    }

    fn try_recv_rank(&self) -> Result<Option<Envelope>> {
        Ok(self.inner.lock().rank_queues[self.rank].pop_front())
    }

    fn try_recv_broadcast(&self) -> Result<Option<Envelope>> {
        Ok(self.inner.lock().broadcast_queues[self.rank].pop_front())
    }

    fn try_recv_hub(&self) -> Result<Option<Envelope>> {
        if self.rank != 0 {
            return Ok(None);
        }
        let mut inner = self.inner.lock();
        if let Some(env) = inner.hub_inbox.pop_front() {
            return Ok(Some(env));
        }
        if inner.hub_closed {
            return Err(anyhow!("hub stream closed"));
        }
        Ok(None)
    }

    fn try_recv_data(&self) -> Result<Option<Envelope>> {
        Ok(self.inner.lock().data_queues[self.rank].pop_front())
    }

    fn barrier(&self) -> Result<()> {
        // Lockstep pumping stands in for real synchronization.
        self.inner.lock().barriers += 1;
        Ok(())
    }

    fn all_reduce_max(&self, value: u32) -> Result<u32> {
        Ok(value.max(self.inner.lock().reduce_hint))
    }
}
