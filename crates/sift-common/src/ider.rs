//! Time-ordered identifier generation
//!
//! Identifiers are 64-bit snowflakes rendered as fixed-width base62:
//!
//! ```text
//! +----------------------+-----------+-----------+
//! | ms since epoch (41b) | node (10b)| step (12b)|
//! +----------------------+-----------+-----------+
//! ```
//!
//! The alphabet is in ASCII order and every ID is padded to the same width,
//! so comparing two IDs as strings gives the same answer as comparing them
//! as numbers.

use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::sync::{Arc, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;

/// Highest node number that fits in the node field
pub const MAX_NODE_NUMBER: u16 = 1023;

/// Custom epoch (2010-11-04T01:42:54.657Z) in unix milliseconds
pub const EPOCH_MS: u64 = 1_288_834_974_657;

/// Length of an encoded identifier
pub const ID_LEN: usize = 11;

const NODE_BITS: u32 = 10;
const STEP_BITS: u32 = 12;
const STEP_MASK: u64 = (1 << STEP_BITS) - 1;
const NODE_SHIFT: u32 = STEP_BITS;
const TIME_SHIFT: u32 = STEP_BITS + NODE_BITS;

/// Backward clock jumps up to this size are absorbed silently
const CLOCK_TOLERANCE_MS: u64 = 10;

const ALPHABET: &[u8; 62] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// Identity that mints identifiers
pub struct Node {
    number: u16,
    state: Mutex<GenState>,
}

#[derive(Default)]
struct GenState {
    last_ms: u64,
    step: u64,
}

impl Node {
    /// Create a node with an explicit number.
    ///
    /// Fails with a configuration error when the number does not fit in the
    /// node field or the wall clock reads earlier than the epoch.
    pub fn new(number: u16) -> Result<Self> {
        if number > MAX_NODE_NUMBER {
            return Err(Error::configuration(format!(
                "node number {number} out of range [0, {MAX_NODE_NUMBER}]"
            )));
        }
        let now = unix_ms()?;
        if now < EPOCH_MS {
            return Err(Error::configuration(format!(
                "system clock {now}ms is before the id epoch"
            )));
        }
        Ok(Self {
            number,
            state: Mutex::new(GenState::default()),
        })
    }

    /// Node number embedded in every ID from this node
    #[must_use]
    pub const fn number(&self) -> u16 {
        self.number
    }

    /// Generate the next identifier
    #[must_use]
    pub fn generate(&self) -> String {
        encode(self.next_raw())
    }

    /// Generate the next identifier as its raw 64-bit value
    pub fn next_raw(&self) -> u64 {
        let mut state = self.state.lock();
        let mut now = unix_ms().unwrap_or(state.last_ms).max(EPOCH_MS);

        if now < state.last_ms {
            let drift = state.last_ms - now;
            if drift > CLOCK_TOLERANCE_MS {
                warn!(
                    "clock moved backwards by {}ms on node {}; continuing from last timestamp",
                    drift, self.number
                );
            }
            now = state.last_ms;
        }

        if now == state.last_ms {
            state.step = (state.step + 1) & STEP_MASK;
            if state.step == 0 {
                // Sequence space for this millisecond is used up; borrow the next one
                now = state.last_ms + 1;
            }
        } else {
            state.step = 0;
        }
        state.last_ms = now;

        ((now - EPOCH_MS) << TIME_SHIFT) | (u64::from(self.number) << NODE_SHIFT) | state.step
    }

    /// Unix millisecond timestamp embedded in an encoded identifier
    #[must_use]
    pub fn timestamp_of(id: &str) -> Option<u64> {
        decode(id).map(|raw| (raw >> TIME_SHIFT) + EPOCH_MS)
    }

    /// Node number embedded in an encoded identifier
    #[must_use]
    pub fn node_of(id: &str) -> Option<u16> {
        decode(id).and_then(|raw| u16::try_from((raw >> NODE_SHIFT) & u64::from(MAX_NODE_NUMBER)).ok())
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node").field("number", &self.number).finish()
    }
}

static PROCESS_NODE: OnceLock<Arc<Node>> = OnceLock::new();

/// Install the process-wide node.
///
/// A process carries exactly one identity. Asking again with the same number
/// returns the installed node; asking for a different number is rejected.
pub fn install(number: u16) -> Result<Arc<Node>> {
    let node = Node::new(number)?;
    let installed = PROCESS_NODE.get_or_init(|| Arc::new(node));
    if installed.number() == number {
        Ok(Arc::clone(installed))
    } else {
        Err(Error::configuration(format!(
            "process identity already assigned to node {}, refusing node {number}",
            installed.number()
        )))
    }
}

/// The process-wide node, if one has been installed
#[must_use]
pub fn process_node() -> Option<Arc<Node>> {
    PROCESS_NODE.get().cloned()
}

/// Encode a raw ID as fixed-width base62
#[must_use]
pub fn encode(mut value: u64) -> String {
    let mut buf = [b'0'; ID_LEN];
    for slot in buf.iter_mut().rev() {
        *slot = ALPHABET[(value % 62) as usize];
        value /= 62;
    }
    buf.iter().map(|&b| b as char).collect()
}

/// Decode a fixed-width base62 ID
#[must_use]
pub fn decode(id: &str) -> Option<u64> {
    if id.len() != ID_LEN {
        return None;
    }
    let mut value: u64 = 0;
    for b in id.bytes() {
        let digit = match b {
            b'0'..=b'9' => b - b'0',
            b'A'..=b'Z' => b - b'A' + 10,
            b'a'..=b'z' => b - b'a' + 36,
            _ => return None,
        };
        value = value.checked_mul(62)?.checked_add(u64::from(digit))?;
    }
    Some(value)
}

fn unix_ms() -> Result<u64> {
    let elapsed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| Error::configuration(format!("system clock before unix epoch: {e}")))?;
    u64::try_from(elapsed.as_millis()).map_err(|_| Error::internal("clock overflow"))
}
