//! Integration tests for the coordination engine.
//!
//! Drives whole rank groups over the loopback fabric: the execution
//! bracket, scheduling policies, barriers, blocked announcement replay,
//! and cross-hub object transfer.

use std::sync::Arc;

use parking_lot::Mutex;
use weft::{
    AddObject, ArrayType, Connection, EngineConfig, Envelope, ExecuteKind, Id, Identity, Message,
    MessageKind, MissingRef, ObjectStore, PortRef, PortSpec, ProgressStage, TransitKey,
};
use weft_testkit::{LoopbackFabric, TestCluster};

const GEN: Id = Id(1);
const SINK: Id = Id(2);

fn announce(sender: Id, hub: Id, object: &str) -> Message {
    Message::AddObject(AddObject {
        sender_module: sender,
        sender_port: "out".into(),
        sender_hub: hub,
        sender_rank: 0,
        dest_module: Id::INVALID,
        dest_port: String::new(),
        dest_rank: None,
        object: object.into(),
        blocker: false,
        unblocking: false,
        generation: 1,
        iteration: 0,
    })
}

fn exec(module: Id, what: ExecuteKind) -> Message {
    Message::Execute { module, what, dest_rank: None }
}

/// Spawns a two-module pipeline and wires gen.out to sink.in.
fn pipeline(cluster: &mut TestCluster) -> (Vec<weft::ModuleHandle>, Vec<weft::ModuleHandle>) {
    let gen = cluster.spawn(GEN, "gen").unwrap();
    let sink = cluster.spawn(SINK, "sink").unwrap();
    cluster.add_port(GEN, PortSpec::output("out")).unwrap();
    cluster.add_port(SINK, PortSpec::input("in")).unwrap();
    cluster
        .connect(Connection::new(GEN, "out", SINK, "in"))
        .unwrap();
    (gen, sink)
}

fn spawn_remote(cluster: &mut TestCluster, module: Id, hub: Id, name: &str) {
    cluster
        .inject_hub(Envelope::new(
            Id::MASTER_HUB,
            Id::BROADCAST,
            Message::Spawn { module, hub, name: name.to_owned() },
        ))
        .unwrap();
}

#[test]
fn single_rank_bracket_runs_prepare_compute_reduce() {
    let mut cluster = TestCluster::new(Id::MASTER_HUB, 1);
    let (mut gen, mut sink) = pipeline(&mut cluster);
    cluster.fabric.take_hub_messages();

    cluster
        .inject_hub(Envelope::new(Id::MASTER_HUB, GEN, exec(GEN, ExecuteKind::ComputeExecute)))
        .unwrap();
    let delivered = gen[0].drain();
    assert!(delivered
        .iter()
        .any(|e| matches!(e.payload, Message::Execute { what: ExecuteKind::ComputeExecute, .. })));

    gen[0].submit(cluster.hub(), Message::ExecutionProgress { stage: ProgressStage::Start });
    cluster.pump_all().unwrap();
    assert_eq!(cluster.ranks[0].coordinator.is_prepared(SINK), Some(true));

    cluster.store.insert("grid-0");
    gen[0].submit(cluster.hub(), announce(GEN, cluster.hub(), "grid-0"));
    cluster.pump_all().unwrap();

    gen[0].submit(cluster.hub(), Message::ExecutionProgress { stage: ProgressStage::Finish });
    cluster.pump_all().unwrap();

    let delivered = sink[0].drain();
    let execs: Vec<ExecuteKind> = delivered
        .iter()
        .filter_map(|e| match e.payload {
            Message::Execute { what, .. } => Some(what),
            _ => None,
        })
        .collect();
    assert_eq!(
        execs,
        vec![ExecuteKind::Prepare, ExecuteKind::ComputeObject, ExecuteKind::Reduce]
    );
    assert!(delivered
        .iter()
        .any(|e| matches!(&e.payload, Message::AddObject(a) if a.object == "grid-0")));

    assert_eq!(cluster.ranks[0].coordinator.is_prepared(SINK), Some(false));
    assert_eq!(cluster.ranks[0].coordinator.is_reduced(SINK), Some(true));

    let upward = cluster.fabric.take_hub_messages();
    assert!(upward.iter().any(|e| e.kind() == MessageKind::ExecutionDone));
}

#[test]
fn prepare_waits_for_every_rank_to_start() {
    let mut cluster = TestCluster::new(Id::MASTER_HUB, 2);
    let (mut gen, mut sink) = pipeline(&mut cluster);

    cluster
        .inject_hub(Envelope::new(Id::MASTER_HUB, GEN, exec(GEN, ExecuteKind::ComputeExecute)))
        .unwrap();
    for handle in &mut gen {
        assert!(handle
            .drain()
            .iter()
            .any(|e| matches!(e.payload, Message::Execute { what: ExecuteKind::ComputeExecute, .. })));
    }

    gen[0].submit(cluster.hub(), Message::ExecutionProgress { stage: ProgressStage::Start });
    cluster.pump_all().unwrap();
    assert_eq!(cluster.ranks[0].coordinator.is_prepared(SINK), Some(false));

    gen[1].submit(cluster.hub(), Message::ExecutionProgress { stage: ProgressStage::Start });
    cluster.pump_all().unwrap();
    for rank in &cluster.ranks {
        assert_eq!(rank.coordinator.is_prepared(SINK), Some(true));
    }

    // Exactly one prepare per rank.
    for handle in &mut sink {
        let prepares = handle
            .drain()
            .iter()
            .filter(|e| matches!(e.payload, Message::Execute { what: ExecuteKind::Prepare, .. }))
            .count();
        assert_eq!(prepares, 1);
    }
}

#[test]
fn lazy_gang_batches_triggers_and_flushes_on_reduce() {
    let config = EngineConfig { lazy_gang_threshold: 0.6, ..Default::default() };
    let mut cluster = TestCluster::with_config(Id::MASTER_HUB, 2, config);
    let (mut gen, mut sink) = pipeline(&mut cluster);
    cluster
        .inject_hub(Envelope::new(
            Id::MASTER_HUB,
            Id::BROADCAST,
            Message::SetSchedulingPolicy { module: SINK, policy: weft::SchedulingPolicy::LazyGang },
        ))
        .unwrap();

    cluster
        .inject_hub(Envelope::new(Id::MASTER_HUB, GEN, exec(GEN, ExecuteKind::ComputeExecute)))
        .unwrap();
    for handle in &mut gen {
        handle.submit(cluster.hub(), Message::ExecutionProgress { stage: ProgressStage::Start });
    }
    cluster.pump_all().unwrap();
    assert_eq!(cluster.ranks[0].coordinator.is_prepared(SINK), Some(true));
    for handle in &mut sink {
        handle.drain();
    }

    // One pending trigger stays below 2 * 0.6; the compute is batched.
    cluster.store.insert("grid-0");
    gen[0].submit(cluster.hub(), announce(GEN, cluster.hub(), "grid-0"));
    cluster.pump_all().unwrap();
    assert!(!sink[0]
        .drain()
        .iter()
        .any(|e| matches!(e.payload, Message::Execute { .. })));

    // Closing the bracket flushes the batch before the reduce.
    for handle in &mut gen {
        handle.submit(cluster.hub(), Message::ExecutionProgress { stage: ProgressStage::Finish });
    }
    cluster.pump_all().unwrap();

    for handle in &mut sink {
        let execs: Vec<ExecuteKind> = handle
            .drain()
            .iter()
            .filter_map(|e| match e.payload {
                Message::Execute { what, .. } => Some(what),
                _ => None,
            })
            .collect();
        assert_eq!(execs, vec![ExecuteKind::ComputeObject, ExecuteKind::Reduce]);
    }
    assert_eq!(cluster.ranks[0].coordinator.is_reduced(SINK), Some(true));
}

#[test]
fn reduce_never_computes_without_a_bracket() {
    let mut cluster = TestCluster::new(Id::MASTER_HUB, 1);
    let (gen, mut sink) = pipeline(&mut cluster);
    cluster
        .inject_hub(Envelope::new(
            Id::MASTER_HUB,
            Id::BROADCAST,
            Message::SetReducePolicy { module: SINK, policy: weft::ReducePolicy::Never },
        ))
        .unwrap();
    sink[0].drain();

    cluster.store.insert("grid-0");
    gen[0].submit(cluster.hub(), announce(GEN, cluster.hub(), "grid-0"));
    cluster.pump_all().unwrap();

    let delivered = sink[0].drain();
    let execs: Vec<ExecuteKind> = delivered
        .iter()
        .filter_map(|e| match e.payload {
            Message::Execute { what, .. } => Some(what),
            _ => None,
        })
        .collect();
    assert_eq!(execs, vec![ExecuteKind::ComputeObject]);
}

#[test]
fn barrier_completes_locally_then_clears_on_master_notice() {
    let mut cluster = TestCluster::new(Id::MASTER_HUB, 1);
    let mut m1 = cluster.spawn(Id(1), "one").unwrap();
    let m2 = cluster.spawn(Id(2), "two").unwrap();
    cluster.fabric.take_hub_messages();

    let barrier = Envelope::new(Id::MASTER_HUB, cluster.hub(), Message::Barrier {
        info: "sync".into(),
    });
    let uuid = barrier.uuid;
    cluster.inject_hub(barrier).unwrap();
    assert!(m1[0].drain().iter().any(|e| e.kind() == MessageKind::Barrier));
    assert!(cluster.ranks[0].coordinator.barrier_active());

    m1[0].submit_envelope(
        Envelope::new(Id(1), cluster.hub(), Message::BarrierReached).with_uuid(uuid),
    );
    cluster.pump_all().unwrap();
    assert!(cluster.ranks[0].coordinator.barrier_active());
    assert!(cluster.fabric.hub_messages().is_empty());

    // Traffic from a module inside the barrier is held back.
    m1[0].submit(cluster.hub(), Message::Busy);
    cluster.pump_all().unwrap();
    assert!(cluster.fabric.hub_messages().is_empty());

    // Stale uuid, ignored.
    m2[0].submit(cluster.hub(), Message::BarrierReached);
    cluster.pump_all().unwrap();
    assert!(cluster.ranks[0].coordinator.barrier_active());

    m2[0].submit_envelope(
        Envelope::new(Id(2), cluster.hub(), Message::BarrierReached).with_uuid(uuid),
    );
    cluster.pump_all().unwrap();
    let upward = cluster.fabric.take_hub_messages();
    assert!(upward
        .iter()
        .any(|e| e.kind() == MessageKind::BarrierReached && e.uuid == uuid));
    // Held traffic resumes after local completion.
    assert!(upward.iter().any(|e| e.kind() == MessageKind::Busy));
    assert!(cluster.ranks[0].coordinator.barrier_active());

    cluster
        .inject_hub(Envelope::new(Id::MASTER_HUB, cluster.hub(), Message::BarrierReached).with_uuid(uuid))
        .unwrap();
    assert!(!cluster.ranks[0].coordinator.barrier_active());
}

#[test]
#[should_panic(expected = "barrier started while one is active")]
fn a_second_barrier_while_one_is_active_is_fatal() {
    let mut cluster = TestCluster::new(Id::MASTER_HUB, 1);
    let mut m1 = cluster.spawn(Id(1), "one").unwrap();
    cluster.spawn(Id(2), "two").unwrap();

    let barrier = Envelope::new(Id::MASTER_HUB, cluster.hub(), Message::Barrier {
        info: "first".into(),
    });
    let uuid = barrier.uuid;
    cluster.inject_hub(barrier).unwrap();
    m1[0].submit_envelope(
        Envelope::new(Id(1), cluster.hub(), Message::BarrierReached).with_uuid(uuid),
    );
    cluster.pump_all().unwrap();
    assert!(cluster.ranks[0].coordinator.barrier_active());

    // Were a second barrier allowed to start here, module 1's reach would
    // count toward it and a single straggler could complete both.
    cluster
        .inject_hub(Envelope::new(Id::MASTER_HUB, cluster.hub(), Message::Barrier {
            info: "second".into(),
        }))
        .unwrap();
}

#[test]
fn module_exit_completes_a_pending_barrier() {
    let mut cluster = TestCluster::new(Id::MASTER_HUB, 1);
    let m1 = cluster.spawn(Id(1), "one").unwrap();
    let m2 = cluster.spawn(Id(2), "two").unwrap();
    cluster.fabric.take_hub_messages();

    let barrier = Envelope::new(Id::MASTER_HUB, cluster.hub(), Message::Barrier {
        info: "sync".into(),
    });
    let uuid = barrier.uuid;
    cluster.inject_hub(barrier).unwrap();
    m1[0].submit_envelope(
        Envelope::new(Id(1), cluster.hub(), Message::BarrierReached).with_uuid(uuid),
    );
    cluster.pump_all().unwrap();
    assert!(cluster.ranks[0].coordinator.barrier_active());

    m2[0].submit(cluster.hub(), Message::ModuleExit { crashed: false, forwarded: false });
    cluster.pump_all().unwrap();

    assert_eq!(cluster.ranks[0].coordinator.num_running(), 1);
    let upward = cluster.fabric.take_hub_messages();
    assert!(upward
        .iter()
        .any(|e| e.kind() == MessageKind::BarrierReached && e.uuid == uuid));
}

#[test]
fn connect_before_ports_is_parked_and_replayed() {
    let mut cluster = TestCluster::new(Id::MASTER_HUB, 1);
    cluster.spawn(GEN, "gen").unwrap();
    cluster.spawn(SINK, "sink").unwrap();

    cluster
        .connect(Connection::new(GEN, "out", SINK, "in"))
        .unwrap();
    assert!(!cluster.ranks[0]
        .coordinator
        .graph()
        .is_connected(&PortRef::new(GEN, "out")));

    cluster.add_port(GEN, PortSpec::output("out")).unwrap();
    cluster.add_port(SINK, PortSpec::input("in")).unwrap();
    assert!(cluster.ranks[0]
        .coordinator
        .graph()
        .is_connected(&PortRef::new(GEN, "out")));
}

#[test]
fn concurrent_object_requests_coalesce_into_one_wire_request() {
    let mut serving = TestCluster::new(Id::MASTER_HUB, 1);
    let mut fetching = TestCluster::new(Id(-6), 1);
    LoopbackFabric::bridge(&serving.fabric, &fetching.fabric);
    serving.store.insert_with_payload("grid-0", b"bytes".to_vec());

    let fired = Arc::new(Mutex::new(0usize));
    let mut issued = Vec::new();
    for _ in 0..3 {
        let fired = Arc::clone(&fired);
        issued.push(
            fetching.ranks[0]
                .transfer
                .request_object(
                    "grid-0",
                    Id::MASTER_HUB,
                    0,
                    "grid-0",
                    Box::new(move |handle| {
                        assert_eq!(handle.name, "grid-0");
                        *fired.lock() += 1;
                    }),
                )
                .unwrap(),
        );
    }
    assert_eq!(issued, vec![true, false, false]);
    assert_eq!(serving.fabric.data_queue_len(0), 1);

    serving.pump_all().unwrap();
    fetching.pump_all().unwrap();
    assert_eq!(*fired.lock(), 3);
    assert!(fetching.store.get("grid-0").is_some());
}

#[test]
fn missing_sub_references_are_fetched_before_completion() {
    let mut serving = TestCluster::new(Id::MASTER_HUB, 1);
    let mut fetching = TestCluster::new(Id(-6), 1);
    LoopbackFabric::bridge(&serving.fabric, &fetching.fabric);
    serving.store.insert_with_payload("parent", b"p".to_vec());
    serving.store.insert_with_payload("child", b"c".to_vec());
    serving.store.insert_array("coords", ArrayType(3), b"xyz".to_vec());
    fetching.store.script_missing(
        "parent",
        vec![
            MissingRef::Object { name: "child".into() },
            MissingRef::Array { name: "coords".into(), array_type: ArrayType(3) },
        ],
    );

    let fired = Arc::new(Mutex::new(0usize));
    {
        let fired = Arc::clone(&fired);
        fetching.ranks[0]
            .transfer
            .request_object(
                "parent",
                Id::MASTER_HUB,
                0,
                "parent",
                Box::new(move |_| *fired.lock() += 1),
            )
            .unwrap();
    }

    serving.pump_all().unwrap();
    fetching.pump_all().unwrap();
    // Parent arrived but is incomplete until both sub-fetches land.
    assert_eq!(*fired.lock(), 0);
    serving.pump_all().unwrap();
    fetching.pump_all().unwrap();

    assert_eq!(*fired.lock(), 1);
    assert!(fetching.store.get("child").is_some());
    assert!(fetching.store.has_array("coords", ArrayType(3)));
}

#[test]
fn blocked_announcements_release_in_fifo_order() {
    let hub_b = Id(-6);
    let mut serving = TestCluster::new(Id::MASTER_HUB, 1);
    let mut cluster = TestCluster::new(hub_b, 1);
    LoopbackFabric::bridge(&serving.fabric, &cluster.fabric);
    serving.store.insert_with_payload("obj-1", b"1".to_vec());

    spawn_remote(&mut cluster, GEN, Id::MASTER_HUB, "gen");
    let mut sink = cluster.spawn(SINK, "sink").unwrap();
    cluster.add_port(GEN, PortSpec::output("out")).unwrap();
    cluster.add_port(SINK, PortSpec::input("in")).unwrap();
    cluster
        .connect(Connection::new(GEN, "out", SINK, "in"))
        .unwrap();
    sink[0].drain();

    // obj-1 has to be fetched; obj-2 is already here and queues behind it.
    cluster.store.insert("obj-2");
    for object in ["obj-1", "obj-2"] {
        let Message::AddObject(mut add) = announce(GEN, Id::MASTER_HUB, object) else {
            unreachable!()
        };
        add.dest_rank = Some(0);
        cluster
            .inject_hub(
                Envelope::new(GEN, hub_b, Message::AddObject(add)).with_dest_rank(0),
            )
            .unwrap();
    }
    assert!(sink[0].drain().is_empty());

    serving.pump_all().unwrap();
    cluster.pump_all().unwrap();

    let delivered = sink[0].drain();
    let objects: Vec<&str> = delivered
        .iter()
        .filter_map(|e| match &e.payload {
            Message::AddObject(a) => Some(a.object.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(objects, vec!["obj-1", "obj-2"]);
}

#[test]
fn announcements_are_forwarded_once_per_receiving_hub() {
    let hub_b = Id(-6);
    let mut cluster = TestCluster::new(Id::MASTER_HUB, 1);
    let gen = cluster.spawn(GEN, "gen").unwrap();
    spawn_remote(&mut cluster, Id(2), hub_b, "s1");
    spawn_remote(&mut cluster, Id(3), hub_b, "s2");
    cluster.add_port(GEN, PortSpec::output("out")).unwrap();
    cluster.add_port(Id(2), PortSpec::input("in")).unwrap();
    cluster.add_port(Id(3), PortSpec::input("in")).unwrap();
    cluster.connect(Connection::new(GEN, "out", Id(2), "in")).unwrap();
    cluster.connect(Connection::new(GEN, "out", Id(3), "in")).unwrap();
    cluster.fabric.take_hub_messages();

    cluster.store.insert("grid-0");
    gen[0].submit(cluster.hub(), announce(GEN, cluster.hub(), "grid-0"));
    cluster.pump_all().unwrap();

    let upward = cluster.fabric.take_hub_messages();
    let announcements: Vec<&Envelope> = upward
        .iter()
        .filter(|e| e.kind() == MessageKind::AddObject)
        .collect();
    assert_eq!(announcements.len(), 1);
    assert_eq!(announcements[0].dest, hub_b);
    assert_eq!(cluster.ranks[0].transfer.num_in_transit(), 1);
    assert_eq!(cluster.store.ref_count("grid-0"), 1);

    cluster
        .inject_hub(
            Envelope::new(
                hub_b,
                cluster.hub(),
                Message::AddObjectCompleted {
                    key: TransitKey { object: "grid-0".into(), dest_module: hub_b },
                    dest_rank: 0,
                },
            )
            .with_dest_rank(0),
        )
        .unwrap();
    assert_eq!(cluster.ranks[0].transfer.num_in_transit(), 0);
    assert_eq!(cluster.store.ref_count("grid-0"), 0);
}

#[test]
fn control_plane_answers_identify_ping_and_tunnel_requests() {
    let mut cluster = TestCluster::new(Id::MASTER_HUB, 1);
    let mut m1 = cluster.spawn(Id(1), "one").unwrap();
    cluster.fabric.take_hub_messages();

    let request = Envelope::new(
        Id::MASTER_HUB,
        cluster.hub(),
        Message::Identify { identity: Identity::Request },
    );
    let uuid = request.uuid;
    cluster.inject_hub(request).unwrap();
    let upward = cluster.fabric.take_hub_messages();
    assert!(upward.iter().any(|e| {
        e.uuid == uuid && matches!(e.payload, Message::Identify { identity: Identity::Manager })
    }));

    cluster
        .inject_hub(Envelope::new(Id::MASTER_HUB, Id::BROADCAST, Message::Ping { payload: '.' }))
        .unwrap();
    let upward = cluster.fabric.take_hub_messages();
    assert!(upward
        .iter()
        .any(|e| matches!(e.payload, Message::Pong { payload: '.', .. })));

    m1[0].submit(
        cluster.hub(),
        Message::RequestTunnel { src_port: 31590, dest_host: "viz-node".into(), dest_port: 31590 },
    );
    cluster.pump_all().unwrap();
    let upward = cluster.fabric.take_hub_messages();
    assert!(upward.iter().any(|e| e.kind() == MessageKind::RequestTunnel));

    cluster
        .inject_hub(Envelope::new(
            Id::MASTER_HUB,
            Id::BROADCAST,
            Message::SetParameterChoices {
                module: Id(1),
                name: "mode".into(),
                choices: vec!["fast".into(), "exact".into()],
            },
        ))
        .unwrap();
    assert!(m1[0]
        .drain()
        .iter()
        .any(|e| e.kind() == MessageKind::SetParameterChoices));
}

#[test]
fn compute_execute_during_a_step_is_parked_until_it_finishes() {
    let mut cluster = TestCluster::new(Id::MASTER_HUB, 1);
    let (mut gen, _sink) = pipeline(&mut cluster);
    cluster.fabric.take_hub_messages();

    cluster
        .inject_hub(Envelope::new(Id::MASTER_HUB, GEN, exec(GEN, ExecuteKind::ComputeExecute)))
        .unwrap();
    gen[0].drain();
    gen[0].submit(cluster.hub(), Message::ExecutionProgress { stage: ProgressStage::Start });
    cluster.pump_all().unwrap();

    // A trigger arriving mid-step is parked, not delivered.
    cluster
        .inject_hub(Envelope::new(Id::MASTER_HUB, GEN, exec(GEN, ExecuteKind::ComputeExecute)))
        .unwrap();
    assert!(gen[0].drain().is_empty());

    gen[0].submit(cluster.hub(), Message::ExecutionProgress { stage: ProgressStage::Finish });
    cluster.pump_all().unwrap();

    // Finishing the step replays the parked trigger and withholds the
    // done notice while the replayed step is pending.
    assert!(gen[0].drain().iter().any(|e| matches!(
        e.payload,
        Message::Execute { what: ExecuteKind::ComputeExecute, .. }
    )));
    let upward = cluster.fabric.take_hub_messages();
    assert!(!upward.iter().any(|e| e.kind() == MessageKind::ExecutionDone));

    gen[0].submit(cluster.hub(), Message::ExecutionProgress { stage: ProgressStage::Start });
    cluster.pump_all().unwrap();
    gen[0].submit(cluster.hub(), Message::ExecutionProgress { stage: ProgressStage::Finish });
    cluster.pump_all().unwrap();
    let upward = cluster.fabric.take_hub_messages();
    assert!(upward.iter().any(|e| e.kind() == MessageKind::ExecutionDone));
}

#[test]
fn cached_outputs_replay_to_late_connections() {
    let mut cluster = TestCluster::new(Id::MASTER_HUB, 1);
    let gen = cluster.spawn(GEN, "gen").unwrap();
    let mut sink = cluster.spawn(SINK, "sink").unwrap();
    cluster.add_port(GEN, PortSpec::output("out")).unwrap();
    cluster.add_port(SINK, PortSpec::input("in")).unwrap();

    // Announced with nothing connected: the object is only cached.
    cluster.store.insert("grid-0");
    gen[0].submit(cluster.hub(), announce(GEN, cluster.hub(), "grid-0"));
    cluster.pump_all().unwrap();
    assert!(sink[0].drain().is_empty());

    cluster
        .connect(Connection::new(GEN, "out", SINK, "in"))
        .unwrap();
    cluster.pump_all().unwrap();

    let delivered = sink[0].drain();
    assert!(delivered.iter().any(|e| matches!(
        &e.payload,
        Message::AddObject(a) if a.object == "grid-0" && a.dest_module == SINK
    )));
}

#[test]
fn quit_drains_modules_before_completing() {
    let mut cluster = TestCluster::new(Id::MASTER_HUB, 1);
    let mut m1 = cluster.spawn(Id(1), "one").unwrap();

    cluster
        .inject_hub(Envelope::new(Id::MASTER_HUB, cluster.hub(), Message::Quit {
            id: Id::BROADCAST,
        }))
        .unwrap();
    assert!(m1[0].drain().iter().any(|e| e.kind() == MessageKind::Kill));
    assert!(!cluster.ranks[0].coordinator.quit_ok());

    m1[0].submit(cluster.hub(), Message::ModuleExit { crashed: false, forwarded: false });
    cluster.pump_all().unwrap();
    assert!(cluster.ranks[0].coordinator.quit_ok());
}
