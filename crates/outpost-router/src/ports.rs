//! TCP port allocation for raw tunnels
//!
//! Ports are taken from a configured range when the client does not ask for
//! a specific one (`RemotePort: 0`). Released ports return to the pool.

use std::collections::HashSet;
use std::sync::Mutex;
use thiserror::Error;

/// Port allocation errors; always per-request bind failures
#[derive(Debug, Error)]
pub enum PortError {
    #[error("remote port {0} is already in use")]
    PortInUse(u16),

    #[error("no free ports available in {start}..={end}")]
    Exhausted { start: u16, end: u16 },
}

struct PortState {
    in_use: HashSet<u16>,
    cursor: u16,
}

/// Range-bounded allocator with release
pub struct PortAllocator {
    start: u16,
    end: u16,
    state: Mutex<PortState>,
}

impl PortAllocator {
    /// `start..=end`, inclusive on both ends
    pub fn new(start: u16, end: u16) -> Self {
        Self {
            start,
            end,
            state: Mutex::new(PortState {
                in_use: HashSet::new(),
                cursor: start,
            }),
        }
    }

    /// Allocate a port. `Some(p)` honors the request when free (requested
    /// ports may fall outside the range); `None` scans the range for a free
    /// port starting after the last handout.
    pub fn allocate(&self, requested: Option<u16>) -> Result<u16, PortError> {
        let mut state = self.state.lock().unwrap();

        if let Some(port) = requested {
            if state.in_use.contains(&port) {
                return Err(PortError::PortInUse(port));
            }
            state.in_use.insert(port);
            return Ok(port);
        }

        let span = (self.end - self.start) as u32 + 1;
        let mut candidate = state.cursor;
        for _ in 0..span {
            if !state.in_use.contains(&candidate) {
                state.in_use.insert(candidate);
                state.cursor = if candidate == self.end {
                    self.start
                } else {
                    candidate + 1
                };
                return Ok(candidate);
            }
            candidate = if candidate == self.end {
                self.start
            } else {
                candidate + 1
            };
        }

        Err(PortError::Exhausted {
            start: self.start,
            end: self.end,
        })
    }

    /// Return a port to the pool. Unknown ports are ignored.
    pub fn release(&self, port: u16) {
        self.state.lock().unwrap().in_use.remove(&port);
    }

    pub fn allocated_count(&self) -> usize {
        self.state.lock().unwrap().in_use.len()
    }
}
