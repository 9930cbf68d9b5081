// Path: crates/node/src/simbus.rs
//! An in-memory message bus for tests and single-process demos.
//!
//! A [`SimNetwork`] is a hub of per-address datagram queues; each
//! [`SimBus`] attaches one address to the hub. Triangular unicast behaves
//! as plain unicast (there is no NAT to punch in memory).

use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::rc::Rc;
use synod_net::MessageBus;
use synod_types::wire::NetworkIdentifierPair;

#[derive(Default)]
struct Hub {
    queues: HashMap<NetworkIdentifierPair, VecDeque<Vec<u8>>>,
}

/// A shared in-memory network.
#[derive(Clone, Default)]
pub struct SimNetwork {
    hub: Rc<RefCell<Hub>>,
}

impl SimNetwork {
    /// Creates an empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches a bus at the given address.
    pub fn attach(&self, addr: NetworkIdentifierPair) -> SimBus {
        self.hub
            .borrow_mut()
            .queues
            .entry(addr.clone())
            .or_default();
        SimBus {
            hub: self.hub.clone(),
            addr,
            routes: HashSet::new(),
        }
    }
}

/// One endpoint on a [`SimNetwork`].
pub struct SimBus {
    hub: Rc<RefCell<Hub>>,
    addr: NetworkIdentifierPair,
    routes: HashSet<NetworkIdentifierPair>,
}

impl SimBus {
    fn deliver(&self, to: &NetworkIdentifierPair, data: &[u8]) {
        if let Some(queue) = self.hub.borrow_mut().queues.get_mut(to) {
            queue.push_back(data.to_vec());
        }
    }
}

impl MessageBus for SimBus {
    fn create_route(&mut self, netid: &NetworkIdentifierPair) -> bool {
        self.routes.insert(netid.clone());
        true
    }

    fn delete_route(&mut self, netid: &NetworkIdentifierPair) -> bool {
        self.routes.remove(netid)
    }

    fn unicast(&mut self, netid: &NetworkIdentifierPair, data: &[u8]) {
        self.deliver(netid, data);
    }

    fn triangular_unicast(&mut self, netid: &NetworkIdentifierPair, data: &[u8]) {
        self.deliver(netid, data);
    }

    fn broadcast(&mut self, data: &[u8]) {
        let routes: Vec<_> = self.routes.iter().cloned().collect();
        for route in routes {
            self.deliver(&route, data);
        }
    }

    fn recv(&mut self, buf: &mut [u8]) -> usize {
        let mut hub = self.hub.borrow_mut();
        let Some(queue) = hub.queues.get_mut(&self.addr) else {
            return 0;
        };
        let Some(datagram) = queue.pop_front() else {
            return 0;
        };
        let n = datagram.len().min(buf.len());
        buf[..n].copy_from_slice(&datagram[..n]);
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use synod_types::wire::{IpAddress, NetworkIdentifier};

    fn addr(port: u16) -> NetworkIdentifierPair {
        NetworkIdentifierPair {
            intranet: NetworkIdentifier {
                port,
                address: IpAddress::V4([127, 0, 0, 1]),
            },
            internet: None,
        }
    }

    #[test]
    fn unicast_and_broadcast_reach_attached_peers() {
        let net = SimNetwork::new();
        let mut a = net.attach(addr(1));
        let mut b = net.attach(addr(2));

        a.create_route(&addr(2));
        a.unicast(&addr(2), b"one");
        a.broadcast(b"two");

        let mut buf = [0u8; 16];
        assert_eq!(b.recv(&mut buf), 3);
        assert_eq!(&buf[..3], b"one");
        assert_eq!(b.recv(&mut buf), 3);
        assert_eq!(&buf[..3], b"two");
        assert_eq!(b.recv(&mut buf), 0);
    }
}
