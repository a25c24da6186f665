//! The per-rank engine loop.
//!
//! One [`Orchestrator`] owns a rank's coordinator and transfer manager
//! and pumps every message lane from a single task: rank-to-rank
//! traffic, the group broadcast lane, the hub control stream on rank 0,
//! the bulk data plane and the in-process mailbox. Polling backs off
//! exponentially while idle and snaps back on any activity.

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::coordinator::{Coordinator, ModuleHandle};
use crate::events::InProcCoordinationBus;
use crate::id::Id;
use crate::message::Envelope;
use crate::runtime::ShutdownToken;
use crate::store::ObjectStore;
use crate::transfer::{mailbox_channel, TransferManager};
use crate::transport::Transport;

pub struct Orchestrator {
    coordinator: Coordinator,
    transfer: Arc<TransferManager>,
    transport: Arc<dyn Transport>,
    events: Arc<InProcCoordinationBus>,
    config: EngineConfig,
    shutdown: ShutdownToken,
    mailbox_rx: mpsc::UnboundedReceiver<Envelope>,
    /// Set once quit has been initiated, for the grace deadline.
    quit_started: Option<Instant>,
}

impl Orchestrator {
    pub fn new(
        transport: Arc<dyn Transport>,
        store: Arc<dyn ObjectStore>,
        config: EngineConfig,
    ) -> Self {
        let events = Arc::new(InProcCoordinationBus::new(config.event_capacity));
        let (mailbox, mailbox_rx) = mailbox_channel();
        let transfer = TransferManager::new(
            Arc::clone(&transport),
            Arc::clone(&store),
            mailbox.clone(),
            Arc::clone(&events),
            &config,
        );
        let coordinator = Coordinator::new(
            Arc::clone(&transport),
            store,
            Arc::clone(&transfer),
            Arc::clone(&events),
            mailbox,
            config.clone(),
        );
        Self {
            coordinator,
            transfer,
            transport,
            events,
            config,
            shutdown: ShutdownToken::new(),
            mailbox_rx,
            quit_started: None,
        }
    }

    pub fn shutdown_token(&self) -> ShutdownToken {
        self.shutdown.clone()
    }

    pub fn events(&self) -> &Arc<InProcCoordinationBus> {
        &self.events
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    pub fn coordinator_mut(&mut self) -> &mut Coordinator {
        &mut self.coordinator
    }

    /// Handle for a module spawned on this rank; see
    /// [`Coordinator::take_handle`].
    pub fn take_handle(&mut self, module: Id) -> Option<ModuleHandle> {
        self.coordinator.take_handle(module)
    }

    /// Runs until quit completes, the hub stream drops, or shutdown is
    /// requested and the grace period passes.
    pub async fn run(mut self) -> Result<()> {
        let receiver = self.transfer.start(self.shutdown.clone());
        let mut idle_wait = self.config.idle_wait_min();
        info!(
            rank = self.transport.rank(),
            size = self.transport.size(),
            hub = %self.transport.hub_id(),
            "orchestrator running"
        );

        loop {
            let worked = self.pump()?;

            if self.coordinator.quit_ok() {
                info!("all modules drained, quitting");
                break;
            }
            if self.shutdown.is_cancelled() && self.quit_started.is_none() {
                info!("shutdown requested");
                self.initiate_quit()?;
            }
            if let Some(started) = self.quit_started {
                if started.elapsed() > self.config.shutdown_grace() {
                    warn!(
                        running = self.coordinator.num_running(),
                        "grace period elapsed, abandoning stragglers"
                    );
                    break;
                }
            }

            if worked {
                idle_wait = self.config.idle_wait_min();
            } else {
                tokio::time::sleep(idle_wait).await;
                idle_wait = (idle_wait * 2).min(self.config.idle_wait_max());
            }
        }

        self.shutdown.cancel();
        receiver.abort();
        Ok(())
    }

    /// One pass over every lane. Returns whether anything was handled.
    fn pump(&mut self) -> Result<bool> {
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
            loop {
                match self.transport.try_recv_hub() {
                    Ok(Some(env)) => {
                        worked = true;
                        self.route_hub_message(env)?;
                    }
                    Ok(None) => break,
                    Err(err) => {
                        if self.quit_started.is_none() {
                            warn!(error = %err, "hub stream gone, shutting down");
                            self.initiate_quit()?;
                        }
                        break;
                    }
                }
            }
        }

        worked |= self.transfer.dispatch()?;
        worked |= self.coordinator.drain_mailbox(&mut self.mailbox_rx)?;
        let outcome = self.coordinator.dispatch()?;
        worked |= outcome.received;
        Ok(worked)
    }

    /// Hub messages address either the whole group, rank 0, or one rank.
    fn route_hub_message(&mut self, env: Envelope) -> Result<()> {
        debug!(kind = ?env.kind(), dest = %env.dest, "hub message");
        match env.dest_rank {
            None => self.coordinator.broadcast_and_handle(env),
            Some(0) => self.coordinator.handle(env),
            Some(rank) => self.transport.send_to_rank(rank, env),
        }
    }

    fn initiate_quit(&mut self) -> Result<()> {
        self.quit_started = Some(Instant::now());
        self.coordinator.quit()?;
        Ok(())
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("rank", &self.transport.rank())
            .field("quit_started", &self.quit_started)
            .finish()
    }
}
