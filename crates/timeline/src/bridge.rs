// Path: crates/timeline/src/bridge.rs
//! The bridge from the meta-transactor's downstream contract to the
//! equivalent primitives on a transactor.

use crate::meta::Downstream;
use crate::transactor::{Transactor, TxEvent};
use synod_types::{EventKey, Instant};

/// Forwards meta-transactor traffic into a transactor's master timeline.
pub struct TxBridge {
    tx: Transactor,
}

impl TxBridge {
    /// Wraps a transactor.
    pub fn new(tx: Transactor) -> Self {
        Self { tx }
    }

    /// The bridged transactor.
    pub fn transactor(&self) -> &Transactor {
        &self.tx
    }

    /// The bridged transactor, mutably.
    pub fn transactor_mut(&mut self) -> &mut Transactor {
        &mut self.tx
    }
}

impl Downstream for TxBridge {
    fn accept(&mut self, event: TxEvent) {
        self.tx.add_master_event(event);
    }

    fn redact(&mut self, key: EventKey) {
        self.tx.redact_master_event(key);
    }

    fn node_count_delta(&mut self, delta: i32, when: Instant) -> TxEvent {
        self.tx.node_count_delta(delta, when)
    }
}
