use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;
use weft::{
    mailbox_channel, Coordinator, EngineConfig, Envelope, Id, InProcCoordinationBus, Message,
    ModuleHandle, TransferManager, Transport,
};

use crate::store::MemoryStore;
use crate::transport::{LoopbackFabric, LoopbackTransport};

/// One rank's engine wired over the loopback fabric, pumped manually.
pub struct TestRank {
    pub coordinator: Coordinator,
    pub transfer: Arc<TransferManager>,
    pub transport: Arc<LoopbackTransport>,
    pub events: Arc<InProcCoordinationBus>,
    mailbox_rx: mpsc::UnboundedReceiver<Envelope>,
}

impl TestRank {
    pub fn new(
        transport: Arc<LoopbackTransport>,
        store: Arc<MemoryStore>,
        config: EngineConfig,
    ) -> Self {
        let events = Arc::new(InProcCoordinationBus::new(config.event_capacity));
        let (mailbox, mailbox_rx) = mailbox_channel();
        let store: Arc<dyn weft::ObjectStore> = store;
        let transfer = TransferManager::new(
            transport.clone() as Arc<dyn Transport>,
            Arc::clone(&store),
            mailbox.clone(),
            Arc::clone(&events),
            &config,
        );
        let coordinator = Coordinator::new(
            transport.clone() as Arc<dyn Transport>,
            store,
            Arc::clone(&transfer),
            Arc::clone(&events),
            mailbox,
            config,
        );
        Self { coordinator, transfer, transport, events, mailbox_rx }
    }

    /// One pass over every lane, like the engine loop does. Returns
    /// whether anything was handled.
    pub fn pump(&mut self) -> Result<bool> {
        let mut worked = false;
        while let Some(env) = self.transport.try_recv_rank()? {
            worked = true;
            if env.for_broadcast {
                self.coordinator.broadcast_and_handle(env)?;
            } else {
                self.coordinator.handle(env)?;
            }
        }
        while let Some(env) = self.transport.try_recv_broadcast()? {
            worked = true;
            self.coordinator.handle(env)?;
        }
        if self.transport.rank() == 0 {
            while let Ok(Some(env)) = self.transport.try_recv_hub() {
                worked = true;
                match env.dest_rank {
                    None => self.coordinator.broadcast_and_handle(env)?,
                    Some(0) => self.coordinator.handle(env)?,
                    Some(rank) => self.transport.send_to_rank(rank, env)?,
                }
            }
        }
        worked |= self.transfer.poll()?;
        worked |= self.coordinator.drain_mailbox(&mut self.mailbox_rx)?;
        worked |= self.coordinator.dispatch()?.received;
        Ok(worked)
    }
}

/// A whole rank group sharing one fabric and one object store.
pub struct TestCluster {
    pub fabric: LoopbackFabric,
    pub store: Arc<MemoryStore>,
    pub ranks: Vec<TestRank>,
    hub: Id,
}

impl TestCluster {
    pub fn new(hub: Id, size: usize) -> Self {
        Self::with_config(hub, size, EngineConfig::default())
    }

    pub fn with_config(hub: Id, size: usize, config: EngineConfig) -> Self {
        let fabric = LoopbackFabric::new(hub, size, true);
        // All ranks of a group share objects, as with one shared segment.
        let store = Arc::new(MemoryStore::with_groups(vec![0; size]));
        let ranks = (0..size)
            .map(|rank| TestRank::new(fabric.endpoint(rank), Arc::clone(&store), config.clone()))
            .collect();
        Self { fabric, store, ranks, hub }
    }

    pub fn hub(&self) -> Id {
        self.hub
    }

    /// Pumps every rank until the whole group is quiescent.
    pub fn pump_all(&mut self) -> Result<()> {
        for _ in 0..256 {
            let mut worked = false;
            for rank in &mut self.ranks {
                worked |= rank.pump()?;
            }
            if !worked {
                return Ok(());
            }
        }
        panic!("cluster did not quiesce");
    }

    /// Scripts a hub message to rank 0 and pumps to a fixed point.
    pub fn inject_hub(&mut self, env: Envelope) -> Result<()> {
        self.fabric.push_hub(env);
        self.pump_all()
    }

    /// Spawns a module on every rank and returns the per-rank handles.
    pub fn spawn(&mut self, module: Id, name: &str) -> Result<Vec<ModuleHandle>> {
        let env = Envelope::new(
            Id::MASTER_HUB,
            self.hub,
            Message::Spawn { module, hub: self.hub, name: name.to_owned() },
        );
        self.inject_hub(env)?;
        let handles = self
            .ranks
            .iter_mut()
            .map(|rank| {
                rank.coordinator
                    .take_handle(module)
                    .unwrap_or_else(|| panic!("no handle for {module}"))
            })
            .collect();
        Ok(handles)
    }

    pub fn add_port(&mut self, module: Id, port: weft::PortSpec) -> Result<()> {
        let env = Envelope::new(Id::MASTER_HUB, self.hub, Message::AddPort { module, port });
        self.inject_hub(env)
    }

    pub fn connect(&mut self, conn: weft::Connection) -> Result<()> {
        let env = Envelope::new(Id::MASTER_HUB, self.hub, Message::Connect(conn));
        self.inject_hub(env)
    }
}
