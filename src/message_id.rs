//! Process-unique message identifiers.

use crate::error::Error;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// Identifier timebase starts at 2026-01-01T00:00:00Z.
const ID_EPOCH_MILLIS: u64 = 1_767_225_600_000;
/// One tick of the timebase.
const TICK_MILLIS: u64 = 10;

const TIME_BITS: u32 = 39;
const SEQUENCE_BITS: u32 = 8;
const MACHINE_BITS: u32 = 16;

/// Allocates 64-bit message ids laid out as 39 bits of 10 ms ticks, 8 bits
/// of per-tick sequence and 16 bits of machine id. Ids grow monotonically
/// within a process; the machine id keeps cooperating processes apart.
pub struct IdGenerator {
    machine_id: u16,
    state: Mutex<IdState>,
}

struct IdState {
    tick: u64,
    sequence: u64,
}

impl IdGenerator {
    pub fn new(machine_id: u16) -> Self {
        Self {
            machine_id,
            state: Mutex::new(IdState {
                tick: 0,
                sequence: 0,
            }),
        }
    }

    /// Uses the low bits of the process id when no machine id is
    /// configured.
    pub fn from_process() -> Self {
        Self::new((std::process::id() & 0xffff) as u16)
    }

    pub fn next(&self) -> Result<u64, Error> {
        let mut state = self.state.lock().unwrap();
        let now = current_tick();
        if now > state.tick {
            state.tick = now;
            state.sequence = 0;
        } else {
            state.sequence += 1;
            if state.sequence >= 1u64 << SEQUENCE_BITS {
                // sequence exhausted; borrow the next tick
                state.tick += 1;
                state.sequence = 0;
            }
        }
        if state.tick >= 1u64 << TIME_BITS {
            return Err(Error::IdExhausted);
        }
        Ok(state.tick << (SEQUENCE_BITS + MACHINE_BITS)
            | state.sequence << MACHINE_BITS
            | u64::from(self.machine_id))
    }
}

fn current_tick() -> u64 {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;
    millis.saturating_sub(ID_EPOCH_MILLIS) / TICK_MILLIS
}
