//! Per-topic monotonic cursor allocation.
//!
//! A cursor is `{unix_millis:016x}-{seq:04x}`: fixed-width hex, so
//! lexicographic order equals allocation order. `seq` disambiguates
//! appends within the same millisecond; a clock that stands still (or
//! steps backwards) is clamped to the last issued value.

use std::collections::HashMap;

use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Slot {
    millis: i64,
    seq: u32,
}

const MAX_SEQ: u32 = 0xffff;

#[derive(Default)]
pub struct CursorAllocator {
    last: Mutex<HashMap<String, Slot>>,
}

impl CursorAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next cursor for `topic`, strictly greater than every
    /// cursor issued before. `seed` supplies the highest persisted
    /// cursor the first time a topic is seen (restart recovery).
    pub fn next(
        &self,
        topic: &str,
        now_millis: i64,
        seed: impl FnOnce() -> Option<String>,
    ) -> String {
        let mut last = self.last.lock();
        let slot = match last.get(topic) {
            Some(slot) => *slot,
            None => seed()
                .and_then(|cursor| parse(&cursor))
                .unwrap_or(Slot { millis: 0, seq: 0 }),
        };

        let next = if now_millis > slot.millis {
            Slot {
                millis: now_millis,
                seq: 0,
            }
        } else if slot.seq < MAX_SEQ {
            Slot {
                millis: slot.millis,
                seq: slot.seq + 1,
            }
        } else {
            // Sequence space exhausted within one millisecond; borrow
            // from the next one to stay strictly monotonic.
            Slot {
                millis: slot.millis + 1,
                seq: 0,
            }
        };

        last.insert(topic.to_owned(), next);
        format!("{:016x}-{:04x}", next.millis, next.seq)
    }
}

fn parse(cursor: &str) -> Option<Slot> {
    let (millis, seq) = cursor.split_once('-')?;
    Some(Slot {
        millis: i64::from_str_radix(millis, 16).ok()?,
        seq: u32::from_str_radix(seq, 16).ok()?,
    })
}
