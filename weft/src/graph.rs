//! Port-graph bookkeeping.
//!
//! Tracks which ports each module declared, which output ports feed which
//! input ports, and the per-input counters the coordinator consults when
//! deciding whether a module can compute (objects pending) or change phase
//! (resets and finishes seen from upstream).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::id::Id;
use crate::message::{Connection, PortKind, PortSpec};

/// Address of one port, usable as a map key.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct PortRef {
    pub module: Id,
    pub port: String,
}

impl PortRef {
    pub fn new(module: Id, port: impl Into<String>) -> Self {
        Self { module, port: port.into() }
    }
}

#[derive(Clone, Debug)]
struct PortState {
    spec: PortSpec,
    connections: Vec<PortRef>,
    /// Objects announced but not yet consumed by a compute.
    objects: u32,
    /// Upstream prepare announcements not yet consumed.
    resets: u32,
    /// Upstream reduce announcements not yet consumed.
    finishes: u32,
}

impl PortState {
    fn new(spec: PortSpec) -> Self {
        Self { spec, connections: Vec::new(), objects: 0, resets: 0, finishes: 0 }
    }
}

#[derive(Clone, Debug, Default)]
struct ModulePorts {
    ports: HashMap<String, PortState>,
    /// Declaration order, kept for deterministic iteration.
    order: Vec<String>,
}

/// The connection graph shared by coordinator and tests.
#[derive(Clone, Debug, Default)]
pub struct PortTracker {
    modules: HashMap<Id, ModulePorts>,
}

impl PortTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a port. Redeclaring an existing port keeps the first
    /// declaration. A combine input must be the module's only input.
    pub fn add_port(&mut self, module: Id, spec: PortSpec) -> bool {
        let entry = self.modules.entry(module).or_default();
        if entry.ports.contains_key(&spec.name) {
            warn!(%module, port = %spec.name, "port redeclared, keeping first declaration");
            return false;
        }
        if spec.kind == PortKind::Input {
            let has_input = entry
                .ports
                .values()
                .any(|p| p.spec.kind == PortKind::Input);
            let has_combine = entry
                .ports
                .values()
                .any(|p| p.spec.kind == PortKind::Input && p.spec.combine);
            if spec.combine && has_input || has_combine {
                warn!(%module, port = %spec.name, "combine input must be the only input, rejecting");
                return false;
            }
        }
        entry.order.push(spec.name.clone());
        entry.ports.insert(spec.name.clone(), PortState::new(spec));
        true
    }

    pub fn has_port(&self, port: &PortRef) -> bool {
        self.port(port).is_some()
    }

    pub fn port_spec(&self, port: &PortRef) -> Option<&PortSpec> {
        self.port(port).map(|p| &p.spec)
    }

    /// Adds an edge. Returns false when either endpoint is not declared
    /// yet, so the caller can park the message for replay.
    pub fn add_connection(&mut self, conn: &Connection) -> bool {
        let from = PortRef::new(conn.from_module, conn.from_port.clone());
        let to = PortRef::new(conn.to_module, conn.to_port.clone());
        let (Some(from_state), Some(to_state)) = (self.port(&from), self.port(&to)) else {
            return false;
        };
        if from_state.spec.kind != PortKind::Output || to_state.spec.kind != PortKind::Input {
            warn!(?conn, "connection endpoints have wrong directions, dropping");
            return true;
        }
        if from_state.connections.contains(&to) {
            warn!(?conn, "duplicate connection ignored");
            return true;
        }
        self.port_mut(&from).connections.push(to);
        self.port_mut(&to_ref(conn)).connections.push(from);
        true
    }

    /// Removes an edge. Returns false when the edge is unknown so the
    /// caller can park the message for replay.
    pub fn remove_connection(&mut self, conn: &Connection) -> bool {
        let from = PortRef::new(conn.from_module, conn.from_port.clone());
        let to = to_ref(conn);
        let known = self
            .port(&from)
            .map(|p| p.connections.contains(&to))
            .unwrap_or(false);
        if !known {
            return false;
        }
        self.port_mut(&from).connections.retain(|p| *p != to);
        if self.port(&to).is_some() {
            self.port_mut(&to).connections.retain(|p| *p != from);
        }
        true
    }

    /// Ports connected to `port`, in connection order.
    pub fn connections_of(&self, port: &PortRef) -> Vec<PortRef> {
        self.port(port).map(|p| p.connections.clone()).unwrap_or_default()
    }

    pub fn is_connected(&self, port: &PortRef) -> bool {
        self.port(port).map(|p| !p.connections.is_empty()).unwrap_or(false)
    }

    /// The module's input ports with at least one connection, in
    /// declaration order.
    pub fn connected_input_ports(&self, module: Id) -> Vec<PortRef> {
        self.ports_of_kind(module, PortKind::Input, true)
    }

    pub fn connected_output_ports(&self, module: Id) -> Vec<PortRef> {
        self.ports_of_kind(module, PortKind::Output, true)
    }

    pub fn output_ports(&self, module: Id) -> Vec<PortRef> {
        self.ports_of_kind(module, PortKind::Output, false)
    }

    /// Input ports downstream of any of the module's outputs.
    pub fn downstream_inputs(&self, module: Id) -> Vec<PortRef> {
        let mut out = Vec::new();
        for port in self.connected_output_ports(module) {
            for dest in self.connections_of(&port) {
                if !out.contains(&dest) {
                    out.push(dest);
                }
            }
        }
        out
    }

    /// Modules directly downstream of `module`.
    pub fn downstream_modules(&self, module: Id) -> Vec<Id> {
        let mut out = Vec::new();
        for input in self.downstream_inputs(module) {
            if !out.contains(&input.module) {
                out.push(input.module);
            }
        }
        out
    }

    /// Drops the module and every edge touching it, returning the removed
    /// edges so the caller can propagate synthesized disconnects.
    pub fn remove_module(&mut self, module: Id) -> Vec<Connection> {
        let Some(ports) = self.modules.remove(&module) else {
            return Vec::new();
        };
        let mut removed = Vec::new();
        for name in &ports.order {
            let state = &ports.ports[name];
            let here = PortRef::new(module, name.clone());
            for peer in &state.connections {
                if let Some(peer_state) = self.port_mut_opt(peer) {
                    peer_state.connections.retain(|p| *p != here);
                }
                let conn = match state.spec.kind {
                    PortKind::Output => Connection::new(
                        module,
                        name.clone(),
                        peer.module,
                        peer.port.clone(),
                    ),
                    PortKind::Input => Connection::new(
                        peer.module,
                        peer.port.clone(),
                        module,
                        name.clone(),
                    ),
                };
                removed.push(conn);
            }
        }
        removed
    }

    pub fn add_object(&mut self, port: &PortRef) {
        if let Some(state) = self.port_mut_opt(port) {
            state.objects += 1;
        } else {
            warn!(?port, "object announced for unknown port");
        }
    }

    pub fn has_object(&self, port: &PortRef) -> bool {
        self.port(port).map(|p| p.objects > 0).unwrap_or(false)
    }

    pub fn pop_object(&mut self, port: &PortRef) {
        self.decrement(port, Counter::Objects);
    }

    pub fn reset_input(&mut self, port: &PortRef) {
        if let Some(state) = self.port_mut_opt(port) {
            state.resets += 1;
        }
    }

    pub fn is_reset(&self, port: &PortRef) -> bool {
        self.port(port).map(|p| p.resets > 0).unwrap_or(false)
    }

    pub fn pop_reset(&mut self, port: &PortRef) {
        self.decrement(port, Counter::Resets);
    }

    pub fn finish_input(&mut self, port: &PortRef) {
        if let Some(state) = self.port_mut_opt(port) {
            state.finishes += 1;
        }
    }

    pub fn is_finished(&self, port: &PortRef) -> bool {
        self.port(port).map(|p| p.finishes > 0).unwrap_or(false)
    }

    pub fn pop_finish(&mut self, port: &PortRef) {
        self.decrement(port, Counter::Finishes);
    }

    /// Validates that every edge is mirrored on both endpoints.
    pub fn check(&self) -> bool {
        for (module, ports) in &self.modules {
            for (name, state) in &ports.ports {
                let here = PortRef::new(*module, name.clone());
                for peer in &state.connections {
                    let mirrored = self
                        .port(peer)
                        .map(|p| p.connections.contains(&here))
                        .unwrap_or(false);
                    if !mirrored {
                        warn!(?here, ?peer, "half-connected edge");
                        return false;
                    }
                }
            }
        }
        true
    }

    fn ports_of_kind(&self, module: Id, kind: PortKind, connected_only: bool) -> Vec<PortRef> {
        let Some(ports) = self.modules.get(&module) else {
            return Vec::new();
        };
        ports
            .order
            .iter()
            .filter(|name| {
                let state = &ports.ports[*name];
                state.spec.kind == kind && (!connected_only || !state.connections.is_empty())
            })
            .map(|name| PortRef::new(module, name.clone()))
            .collect()
    }

    fn decrement(&mut self, port: &PortRef, counter: Counter) {
        let Some(state) = self.port_mut_opt(port) else {
            warn!(?port, ?counter, "counter pop on unknown port");
            return;
        };
        let slot = match counter {
            Counter::Objects => &mut state.objects,
            Counter::Resets => &mut state.resets,
            Counter::Finishes => &mut state.finishes,
        };
        if *slot == 0 {
            warn!(?port, ?counter, "counter underflow");
        } else {
            *slot -= 1;
        }
    }

    fn port(&self, port: &PortRef) -> Option<&PortState> {
        self.modules.get(&port.module)?.ports.get(&port.port)
    }

    fn port_mut_opt(&mut self, port: &PortRef) -> Option<&mut PortState> {
        self.modules.get_mut(&port.module)?.ports.get_mut(&port.port)
    }

    fn port_mut(&mut self, port: &PortRef) -> &mut PortState {
        self.modules
            .get_mut(&port.module)
            .and_then(|m| m.ports.get_mut(&port.port))
            .unwrap_or_else(|| panic!("port {port:?} vanished while held"))
    }
}

#[derive(Clone, Copy, Debug)]
enum Counter {
    Objects,
    Resets,
    Finishes,
}

fn to_ref(conn: &Connection) -> PortRef {
    PortRef::new(conn.to_module, conn.to_port.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn m(n: i32) -> Id {
        Id::module(n)
    }

    fn simple_graph() -> PortTracker {
        let mut g = PortTracker::new();
        assert!(g.add_port(m(1), PortSpec::output("out")));
        assert!(g.add_port(m(2), PortSpec::input("in")));
        assert!(g.add_port(m(2), PortSpec::output("out")));
        assert!(g.add_port(m(3), PortSpec::input("in")));
        g
    }

    #[test]
    fn connection_requires_declared_ports() {
        let mut g = simple_graph();
        let early = Connection::new(m(1), "out", m(9), "in");
        assert!(!g.add_connection(&early));

        let conn = Connection::new(m(1), "out", m(2), "in");
        assert!(g.add_connection(&conn));
        assert!(g.check());
        assert!(g.is_connected(&PortRef::new(m(1), "out")));
        assert_eq!(
            g.connections_of(&PortRef::new(m(1), "out")),
            vec![PortRef::new(m(2), "in")]
        );
    }

    #[test]
    fn duplicate_connection_is_ignored() {
        let mut g = simple_graph();
        let conn = Connection::new(m(1), "out", m(2), "in");
        assert!(g.add_connection(&conn));
        assert!(g.add_connection(&conn));
        assert_eq!(g.connections_of(&PortRef::new(m(1), "out")).len(), 1);
    }

    #[test]
    fn remove_connection_unknown_edge_parks() {
        let mut g = simple_graph();
        let conn = Connection::new(m(1), "out", m(2), "in");
        assert!(!g.remove_connection(&conn));
        assert!(g.add_connection(&conn));
        assert!(g.remove_connection(&conn));
        assert!(!g.is_connected(&PortRef::new(m(1), "out")));
    }

    #[test]
    fn combine_input_must_be_alone() {
        let mut g = PortTracker::new();
        assert!(g.add_port(m(1), PortSpec::input("a")));
        assert!(!g.add_port(m(1), PortSpec::input("b").combine()));

        let mut g = PortTracker::new();
        assert!(g.add_port(m(2), PortSpec::input("all").combine()));
        assert!(!g.add_port(m(2), PortSpec::input("extra")));
        assert!(g.add_port(m(2), PortSpec::output("out")));
    }

    #[test]
    fn remove_module_synthesizes_disconnects() {
        let mut g = simple_graph();
        let a = Connection::new(m(1), "out", m(2), "in");
        let b = Connection::new(m(2), "out", m(3), "in");
        assert!(g.add_connection(&a));
        assert!(g.add_connection(&b));

        let removed = g.remove_module(m(2));
        assert_eq!(removed.len(), 2);
        assert!(removed.contains(&a));
        assert!(removed.contains(&b));
        assert!(!g.is_connected(&PortRef::new(m(1), "out")));
        assert!(!g.is_connected(&PortRef::new(m(3), "in")));
        assert!(g.check());
    }

    #[test]
    fn counters_track_pending_work() {
        let mut g = simple_graph();
        let port = PortRef::new(m(2), "in");
        assert!(!g.has_object(&port));
        g.add_object(&port);
        g.add_object(&port);
        assert!(g.has_object(&port));
        g.pop_object(&port);
        assert!(g.has_object(&port));
        g.pop_object(&port);
        assert!(!g.has_object(&port));
        // Underflow is logged, not fatal.
        g.pop_object(&port);
        assert!(!g.has_object(&port));

        g.reset_input(&port);
        assert!(g.is_reset(&port));
        g.pop_reset(&port);
        assert!(!g.is_reset(&port));

        g.finish_input(&port);
        assert!(g.is_finished(&port));
        g.pop_finish(&port);
        assert!(!g.is_finished(&port));
    }

    #[test]
    fn downstream_queries() {
        let mut g = simple_graph();
        assert!(g.add_connection(&Connection::new(m(1), "out", m(2), "in")));
        assert!(g.add_connection(&Connection::new(m(2), "out", m(3), "in")));
        assert_eq!(g.downstream_modules(m(1)), vec![m(2)]);
        assert_eq!(g.downstream_inputs(m(2)), vec![PortRef::new(m(3), "in")]);
        assert!(g.downstream_modules(m(3)).is_empty());
    }
}
