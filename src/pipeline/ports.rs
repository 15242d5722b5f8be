#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::net::TcpListener;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::error::TaskqError;

/// Host ports handed to task containers, shared by every pipeline in the process.
#[derive(Debug)]
pub struct PortAllocator {
    start: u16,
    end: u16,
    host: String,
    bind_check: bool,
    slots: Mutex<Slots>,
}

#[derive(Debug, Default)]
struct Slots {
    reserved: BTreeSet<u16>,
    // Where the next search starts; a released port is handed out again
    // only after the rest of the range has been tried.
    next: Option<u16>,
}

impl PortAllocator {
    #[must_use]
    pub fn new(start: u16, end: u16, host: impl Into<String>) -> Self {
        Self {
            start,
            end,
            host: host.into(),
            bind_check: true,
            slots: Mutex::new(Slots::default()),
        }
    }

    /// Skip the host bind check; only the in-process reservations and `exclude` are consulted.
    #[must_use]
    pub fn without_bind_check(mut self) -> Self {
        self.bind_check = false;
        self
    }

    /// Next free port after the last one handed out, wrapping around the range.
    /// Skips `exclude`, ports reserved here, and ports not bindable on the host.
    pub fn reserve(&self, exclude: &BTreeSet<u16>) -> Result<u16, TaskqError> {
        let mut slots = self.lock();
        let from = slots
            .next
            .filter(|p| (self.start..=self.end).contains(p))
            .unwrap_or(self.start);
        let candidates = (from..=self.end).chain(self.start..from);
        for port in candidates {
            if slots.reserved.contains(&port) || exclude.contains(&port) {
                continue;
            }
            if self.bind_check && !self.bindable(port) {
                continue;
            }
            slots.reserved.insert(port);
            slots.next = port.checked_add(1);
            return Ok(port);
        }
        Err(TaskqError::PortsExhausted {
            start: self.start,
            end: self.end,
        })
    }

    /// Returns whether the port was held. Releasing an unknown port is a no-op.
    pub fn release(&self, port: u16) -> bool {
        self.lock().reserved.remove(&port)
    }

    #[must_use]
    pub fn reserved(&self) -> Vec<u16> {
        self.lock().reserved.iter().copied().collect()
    }

    fn bindable(&self, port: u16) -> bool {
        TcpListener::bind((self.host.as_str(), port)).is_ok()
    }

    fn lock(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
