//! Replicated module-graph state.
//!
//! Every rank and hub applies the same control messages to this table, so
//! lookups like "which hub owns module 5" or "what is its reduce policy"
//! agree everywhere without extra synchronization.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::id::Id;
use crate::message::{Envelope, Message, MessageKind};
use crate::policy::{ObjectReceivePolicy, ReducePolicy, SchedulingPolicy};

/// The replicated record for one running module.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModuleState {
    pub id: Id,
    pub hub: Id,
    pub name: String,
    pub scheduling: SchedulingPolicy,
    pub reduce: ReducePolicy,
    pub receive: ObjectReceivePolicy,
    /// Longest path to a sink, used to order work closest-to-sink first.
    pub height: u32,
    pub initialized: bool,
}

impl ModuleState {
    fn new(id: Id, hub: Id, name: String) -> Self {
        Self {
            id,
            hub,
            name,
            scheduling: SchedulingPolicy::default(),
            reduce: ReducePolicy::default(),
            receive: ObjectReceivePolicy::default(),
            height: 0,
            initialized: false,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct GraphState {
    running: HashMap<Id, ModuleState>,
    crashed: HashSet<Id>,
    /// Parameter and policy traffic replayed to late-spawned modules so
    /// their view catches up with everyone else's.
    catchup: Vec<Envelope>,
}

impl GraphState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies a control message. Must be called with the same messages in
    /// the same order on every node that holds a copy.
    pub fn apply(&mut self, env: &Envelope) {
        match &env.payload {
            Message::Spawn { module, hub, name } => {
                if self.running.contains_key(module) {
                    warn!(%module, "spawn for already-running module ignored");
                    return;
                }
                self.running.insert(*module, ModuleState::new(*module, *hub, name.clone()));
                self.crashed.remove(module);
            }
            Message::SpawnPrepared { module, .. } => {
                if let Some(state) = self.running.get_mut(module) {
                    state.initialized = true;
                }
            }
            Message::ModuleExit { crashed, .. } => {
                let module = env.sender;
                if self.running.remove(&module).is_none() {
                    debug!(%module, "exit for unknown module");
                    return;
                }
                if *crashed {
                    self.crashed.insert(module);
                }
            }
            Message::SetSchedulingPolicy { module, policy } => {
                if let Some(state) = self.running.get_mut(module) {
                    state.scheduling = *policy;
                }
                self.record_catchup(env);
            }
            Message::SetReducePolicy { module, policy } => {
                if let Some(state) = self.running.get_mut(module) {
                    state.reduce = *policy;
                }
                self.record_catchup(env);
            }
            Message::SetReceivePolicy { module, policy } => {
                if let Some(state) = self.running.get_mut(module) {
                    state.receive = *policy;
                }
                self.record_catchup(env);
            }
            Message::SetParameter { .. } | Message::SetParameterChoices { .. } => {
                self.record_catchup(env);
            }
            _ => {}
        }
    }

    pub fn module(&self, id: Id) -> Option<&ModuleState> {
        self.running.get(&id)
    }

    pub fn hub_of(&self, id: Id) -> Option<Id> {
        if id.is_hub() {
            return Some(id);
        }
        self.running.get(&id).map(|s| s.hub)
    }

    pub fn is_running(&self, id: Id) -> bool {
        self.running.contains_key(&id)
    }

    pub fn has_crashed(&self, id: Id) -> bool {
        self.crashed.contains(&id)
    }

    pub fn running_ids(&self) -> Vec<Id> {
        let mut ids: Vec<Id> = self.running.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn num_running(&self) -> usize {
        self.running.len()
    }

    pub fn set_height(&mut self, id: Id, height: u32) {
        if let Some(state) = self.running.get_mut(&id) {
            state.height = height;
        }
    }

    /// Messages a freshly spawned module needs to see to match the
    /// replicated view.
    pub fn catchup_messages(&self) -> &[Envelope] {
        &self.catchup
    }

    fn record_catchup(&mut self, env: &Envelope) {
        // Keep only the newest setting per (module, kind, name) so the
        // replay stays proportional to the graph, not to its history.
        let key = catchup_key(env);
        self.catchup.retain(|e| catchup_key(e) != key);
        self.catchup.push(env.clone());
    }
}

fn catchup_key(env: &Envelope) -> (MessageKind, Id, String) {
    match &env.payload {
        Message::SetParameter { module, name, .. } => {
            (MessageKind::SetParameter, *module, name.clone())
        }
        Message::SetParameterChoices { module, name, .. } => {
            (MessageKind::SetParameterChoices, *module, name.clone())
        }
        Message::SetSchedulingPolicy { module, .. } => {
            (MessageKind::SetSchedulingPolicy, *module, String::new())
        }
        Message::SetReducePolicy { module, .. } => {
            (MessageKind::SetReducePolicy, *module, String::new())
        }
        Message::SetReceivePolicy { module, .. } => {
            (MessageKind::SetReceivePolicy, *module, String::new())
        }
        _ => (env.kind(), env.sender, String::new()),
    }
}
