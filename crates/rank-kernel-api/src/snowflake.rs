use std::sync::Mutex;

use anyhow::{anyhow, Result};
use time::OffsetDateTime;

// 2020-01-01T00:00:00Z, milliseconds.
const EPOCH_MS: i64 = 1_577_836_800_000;
const MACHINE_BITS: u8 = 10;
const SEQUENCE_BITS: u8 = 12;
const MAX_MACHINE_ID: u64 = (1 << MACHINE_BITS) - 1;
const SEQUENCE_MASK: u64 = (1 << SEQUENCE_BITS) - 1;

/// Snowflake-style post id generator: 41 bits of millisecond timestamp,
/// 10 bits of machine id, 12 bits of per-millisecond sequence. Ids are
/// unique per node and ordered by allocation time.
pub struct SnowflakeNode {
    machine_id: u64,
    state: Mutex<State>,
}

#[derive(Debug, Default)]
struct State {
    last_ms: i64,
    sequence: u64,
}

impl SnowflakeNode {
    /// # Errors
    /// Returns an error when `machine_id` does not fit in 10 bits.
    pub fn new(machine_id: u64) -> Result<Self> {
        if machine_id > MAX_MACHINE_ID {
            return Err(anyhow!("machine id {machine_id} exceeds the maximum {MAX_MACHINE_ID}"));
        }
        Ok(Self { machine_id, state: Mutex::new(State::default()) })
    }

    /// Allocate the next id.
    ///
    /// # Errors
    /// Returns an error when the generator mutex is poisoned or the system
    /// clock reads before the id epoch.
    pub fn next_id(&self) -> Result<u64> {
        let mut state =
            self.state.lock().map_err(|_| anyhow!("snowflake generator mutex poisoned"))?;

        let mut now = current_ms();
        // Tolerate small backwards clock steps by reusing the last timestamp.
        if now < state.last_ms {
            now = state.last_ms;
        }

        if now == state.last_ms {
            state.sequence = (state.sequence + 1) & SEQUENCE_MASK;
            if state.sequence == 0 {
                // Sequence exhausted for this millisecond; wait out the tick.
                while now <= state.last_ms {
                    std::hint::spin_loop();
                    now = current_ms();
                }
            }
        } else {
            state.sequence = 0;
        }
        state.last_ms = now;

        let elapsed = u64::try_from(now - EPOCH_MS)
            .map_err(|_| anyhow!("system clock reads before the id epoch"))?;
        Ok((elapsed << (MACHINE_BITS + SEQUENCE_BITS))
            | (self.machine_id << SEQUENCE_BITS)
            | state.sequence)
    }
}

fn current_ms() -> i64 {
    i64::try_from(OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;

    #[test]
    fn machine_id_must_fit_in_ten_bits() {
        assert!(SnowflakeNode::new(MAX_MACHINE_ID).is_ok());
        assert!(SnowflakeNode::new(MAX_MACHINE_ID + 1).is_err());
    }

    #[test]
    fn ids_are_unique_and_monotonic() -> Result<()> {
        let node = SnowflakeNode::new(1)?;
        let mut seen = BTreeSet::new();
        let mut previous = 0_u64;
        for _ in 0..10_000 {
            let id = node.next_id()?;
            assert!(id > previous, "ids must be strictly increasing");
            assert!(seen.insert(id), "ids must be unique");
            previous = id;
        }
        Ok(())
    }

    #[test]
    fn machine_id_is_embedded_in_the_id() -> Result<()> {
        let node = SnowflakeNode::new(42)?;
        let id = node.next_id()?;
        assert_eq!((id >> SEQUENCE_BITS) & MAX_MACHINE_ID, 42);
        Ok(())
    }
}
