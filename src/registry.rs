//! The client registry.
//!
//! A fixed-size array of session slots plus a count, all behind one
//! mutex. Admission scans for a free slot and claims it; release puts
//! it back. Nothing else in the process is shared mutable state: each
//! slot's session is owned exclusively by its worker thread from
//! admission to release.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

/// What the registry remembers about an admitted session. The session
/// itself (channel, RDMA resources, PSNs) lives on the worker's stack.
#[derive(Debug, Clone)]
pub struct SlotInfo {
    pub peer: SocketAddr,
}

struct Slots {
    entries: Vec<Option<SlotInfo>>,
    count: usize,
}

pub struct Registry {
    slots: Mutex<Slots>,
    capacity: usize,
    running: AtomicBool,
}

impl Registry {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            slots: Mutex::new(Slots {
                entries: vec![None; capacity],
                count: 0,
            }),
            capacity,
            running: AtomicBool::new(true),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Claims the first free slot for `peer`. `None` means the registry
    /// is full and the connection must be closed without a session.
    pub fn admit(&self, peer: SocketAddr) -> Option<usize> {
        let mut slots = self.slots.lock();

        let id = slots.entries.iter().position(Option::is_none)?;
        slots.entries[id] = Some(SlotInfo { peer });
        slots.count += 1;

        Some(id)
    }

    /// Returns a slot. Idempotent: releasing an already-free slot is a
    /// no-op, which keeps teardown safe to run from any state.
    pub fn release(&self, id: usize) {
        let mut slots = self.slots.lock();

        if slots.entries[id].take().is_some() {
            slots.count -= 1;
        }
    }

    pub fn num_clients(&self) -> usize {
        self.slots.lock().count
    }

    pub fn is_idle(&self) -> bool {
        self.num_clients() == 0
    }

    /// Stops admissions; running workers observe this between poll
    /// iterations and begin their own teardown.
    pub fn begin_shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}
