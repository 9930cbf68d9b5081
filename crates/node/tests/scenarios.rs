// Path: crates/node/tests/scenarios.rs
//! End-to-end scenarios driven over the in-memory bus: solo bootstrap,
//! a two-node join, event replication and a majority kick.

use std::any::Any;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use synod_node::{Application, SimNetwork, System};
use synod_timeline::{Context, SimEvent, SimObject};
use synod_types::config::Profile;
use synod_types::id::{BOOTSTRAP_NODE_ID, NEVER};
use synod_types::status::SystemStatus;
use synod_types::wire::{IpAddress, NetworkIdentifier, NetworkIdentifierPair};
use synod_types::{EventKey, EventSerial, Instant, ObjectId};

/// Mutation log shared between a node's objects and the test body.
#[derive(Default, Clone)]
struct Shared {
    applied: Rc<RefCell<BTreeMap<ObjectId, Vec<(Instant, u8)>>>>,
}

impl Shared {
    fn applied_to(&self, id: ObjectId) -> Vec<(Instant, u8)> {
        self.applied
            .borrow()
            .get(&id)
            .cloned()
            .unwrap_or_default()
    }
}

struct NodeObject {
    id: ObjectId,
    now: Instant,
    shared: Shared,
}

impl SimObject for NodeObject {
    fn id(&self) -> ObjectId {
        self.id
    }
    fn step(&mut self) {
        self.now += 1;
    }
    fn rewind(&mut self, instant: Instant) {
        self.now = instant;
        if let Some(log) = self.shared.applied.borrow_mut().get_mut(&self.id) {
            log.retain(|(at, _)| *at < instant);
        }
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

struct Mark {
    key: EventKey,
    value: u8,
}

impl SimEvent for Mark {
    fn key(&self) -> EventKey {
        self.key
    }
    fn apply(&self, object: &mut dyn SimObject) {
        let object = object.as_any_mut().downcast_mut::<NodeObject>().unwrap();
        object
            .shared
            .applied
            .borrow_mut()
            .entry(self.key.object)
            .or_default()
            .push((self.key.instant, self.value));
    }
}

#[derive(Default)]
struct TestApp {
    shared: Shared,
}

impl Application for TestApp {
    fn create_node_object(&mut self, ctx: &mut Context, id: ObjectId) {
        ctx.add_object(Box::new(NodeObject {
            id,
            now: 0,
            shared: self.shared.clone(),
        }));
    }

    fn decode_event(
        &mut self,
        instant: Instant,
        object: ObjectId,
        serial: EventSerial,
        data: &[u8],
    ) -> Option<Box<dyn SimEvent>> {
        Some(Box::new(Mark {
            key: EventKey::new(instant, object, serial),
            value: *data.first()?,
        }))
    }
}

fn addr(port: u16) -> NetworkIdentifierPair {
    NetworkIdentifierPair {
        intranet: NetworkIdentifier {
            port,
            address: IpAddress::V4([127, 0, 0, 1]),
        },
        internet: None,
    }
}

fn new_system(net: &SimNetwork, port: u16) -> System<TestApp> {
    let bus = Box::new(net.attach(addr(port)));
    System::new(TestApp::default(), bus, addr(port), 8, Profile::Lax, 512).unwrap()
}

#[test]
fn solo_bootstrap_reaches_ok_and_commits() {
    let net = SimNetwork::new();
    let mut system = new_system(&net, 1000);

    system.bootstrap();
    let mut status = system.status();
    for _ in 0..10 {
        status = system.advance(1);
    }

    assert_eq!(status, SystemStatus::Ok);
    assert_eq!(system.local_id(), BOOTSTRAP_NODE_ID);
    assert_eq!(system.node_ids(), vec![BOOTSTRAP_NODE_ID]);
    assert!(
        !system.hash_tree().is_empty(),
        "the node's own commit messages must be on record"
    );
}

#[test]
fn two_nodes_join_and_count_each_other() {
    let net = SimNetwork::new();
    let mut s1 = new_system(&net, 1001);
    let mut s2 = new_system(&net, 1002);

    s1.bootstrap();
    let mut status1 = s1.status();
    let mut status2 = s2.status();
    for tick in 0..160 {
        if tick == 5 {
            s2.connect(addr(1001));
        }
        status1 = s1.advance(1);
        status2 = s2.advance(1);
    }

    assert_eq!(status1, SystemStatus::Ok);
    assert_eq!(status2, SystemStatus::Ok);

    let s2_id = s2.local_id();
    assert!(s2_id > 1, "join-derived ids avoid the reserved range");
    assert!(s1.node_ids().contains(&s2_id));
    assert!(s2.node_ids().contains(&BOOTSTRAP_NODE_ID));

    // Both nodes agree the second node holds GRANT, and both count two
    // live nodes at the present instant.
    for system in [&s1, &s2] {
        assert_ne!(system.stack().meta().grant_instant(s2_id), NEVER);
        let now = system.stack().now();
        assert_eq!(system.stack().transactor().node_count_at(now), 2);
    }
}

#[test]
fn events_replicate_identically_across_nodes() {
    let net = SimNetwork::new();
    let mut s1 = new_system(&net, 1011);
    let mut s2 = new_system(&net, 1012);

    s1.bootstrap();
    for tick in 0..160 {
        if tick == 5 {
            s2.connect(addr(1011));
        }
        s1.advance(1);
        s2.advance(1);
    }
    assert_eq!(s1.status(), SystemStatus::Ok);
    assert_eq!(s2.status(), SystemStatus::Ok);
    let s2_id = s2.local_id();

    // Both sides produce events; everything must converge.
    assert!(s1.add_event(vec![10]));
    assert!(s2.add_event(vec![20]));
    for _ in 0..80 {
        s1.advance(1);
        s2.advance(1);
    }
    assert!(s1.add_event(vec![11]));
    for _ in 0..80 {
        s1.advance(1);
        s2.advance(1);
    }

    for id in [BOOTSTRAP_NODE_ID, s2_id] {
        let on_s1 = s1.app().shared.applied_to(id);
        let on_s2 = s2.app().shared.applied_to(id);
        assert_eq!(on_s1, on_s2, "object {id} diverged between nodes");
    }
    assert_eq!(
        s1.app()
            .shared
            .applied_to(BOOTSTRAP_NODE_ID)
            .iter()
            .map(|(_, v)| *v)
            .collect::<Vec<_>>(),
        vec![10, 11]
    );
    assert_eq!(
        s1.app()
            .shared
            .applied_to(s2_id)
            .iter()
            .map(|(_, v)| *v)
            .collect::<Vec<_>>(),
        vec![20]
    );
}

#[test]
fn silent_node_is_denied_by_the_majority() {
    let net = SimNetwork::new();
    let mut s1 = new_system(&net, 1021);
    let mut s2 = new_system(&net, 1022);
    let mut s3 = new_system(&net, 1023);

    s1.bootstrap();
    for tick in 0..400 {
        if tick == 5 {
            s2.connect(addr(1021));
        }
        if tick == 150 {
            s3.connect(addr(1021));
        }
        s1.advance(1);
        s2.advance(1);
        s3.advance(1);
    }
    let s3_id = s3.local_id();
    assert_eq!(s1.status(), SystemStatus::Ok);
    assert_eq!(s3.status(), SystemStatus::Ok);
    assert!(s3_id > 1);
    assert_ne!(s1.stack().meta().grant_instant(s3_id), NEVER);

    // Node 3 falls silent; its commits stop, the survivors notice the
    // lag, vote DENY, and the vote carries on both of them.
    for _ in 0..700 {
        s1.advance(1);
        s2.advance(1);
    }

    for system in [&s1, &s2] {
        let deny = system.stack().meta().deny_instant(s3_id);
        assert_ne!(deny, NEVER, "the silent node must be denied");

        // The node count drops by one at the deny instant.
        let before = system.stack().transactor().node_count_at(deny - 1);
        let after = system.stack().transactor().node_count_at(deny);
        assert_eq!(after, before - 1);
    }
}
