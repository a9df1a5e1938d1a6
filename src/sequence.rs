//! Sequence number generation.
//!
//! Every DATA frame carries a sequence number that the peer echoes in its
//! ACK. Numbers only need to be unique among the frames in flight on one
//! connection, but the default [`Snowflake`] generator keeps them unique and
//! increasing for the whole process.
//!
//! ```text
//! ┌───────────────────────────┬──────────┬───────────┐
//! │ milliseconds since epoch  │ node id  │ counter   │
//! │ 42 bits                   │ 10 bits  │ 12 bits   │
//! └───────────────────────────┴──────────┴───────────┘
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

const NODE_BITS: u32 = 10;
const COUNTER_BITS: u32 = 12;
const MAX_NODE: u16 = (1 << NODE_BITS) - 1;
const MAX_COUNTER: u64 = (1 << COUNTER_BITS) - 1;

/// Source of sequence numbers for outgoing frames.
pub trait SequenceGenerator: Send + Sync {
    /// Next sequence number. Never repeats for the generator's lifetime.
    fn next_seq(&self) -> u64;
}

#[derive(Debug, Default)]
struct SnowflakeState {
    last_ms: u64,
    counter: u64,
}

/// Time-ordered generator: millisecond timestamp, node id, per-ms counter.
///
/// Output is strictly increasing even if the wall clock steps backwards:
/// the generator keeps using the last timestamp it issued, and borrows the
/// next millisecond once a millisecond's counter is exhausted.
#[derive(Debug)]
pub struct Snowflake {
    node: u64,
    state: Mutex<SnowflakeState>,
}

impl Snowflake {
    /// Generator for node 0.
    pub fn new() -> Self {
        Self::with_node(0)
    }

    /// Generator for a node id; ids above 1023 are masked to 10 bits.
    pub fn with_node(node: u16) -> Self {
        Self {
            node: u64::from(node & MAX_NODE),
            state: Mutex::new(SnowflakeState::default()),
        }
    }

    fn now_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

impl Default for Snowflake {
    fn default() -> Self {
        Self::new()
    }
}

impl SequenceGenerator for Snowflake {
    fn next_seq(&self) -> u64 {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Self::now_ms();

        if now > state.last_ms {
            state.last_ms = now;
            state.counter = 0;
        } else if state.counter < MAX_COUNTER {
            state.counter += 1;
        } else {
            state.last_ms += 1;
            state.counter = 0;
        }

        (state.last_ms << (NODE_BITS + COUNTER_BITS)) | (self.node << COUNTER_BITS) | state.counter
    }
}

/// Plain counter, for deterministic numbering in tests and tooling.
#[derive(Debug)]
pub struct Sequential {
    next: AtomicU64,
}

impl Sequential {
    /// Counter whose first value is `start`.
    pub fn starting_at(start: u64) -> Self {
        Self {
            next: AtomicU64::new(start),
        }
    }
}

impl Default for Sequential {
    fn default() -> Self {
        Self::starting_at(1)
    }
}

impl SequenceGenerator for Sequential {
    fn next_seq(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}
