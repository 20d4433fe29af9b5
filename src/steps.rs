use std::fmt;

use crate::error::SteplockError;
use crate::WINDOW_SIZE;

/// A 32-bit wrapping tick identifier. `StepId`s survive the u32 rollover (about 49 days at
/// 1 kHz), so they deliberately do not implement `Ord`: every comparison goes through the
/// signed-delta helpers below.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
pub struct StepId(
    /// The raw tick value.
    pub u32,
);

impl StepId {
    /// Signed distance from `other` to `self`. Negative means `self` is older.
    pub fn delta(self, other: StepId) -> i32 {
        self.0.wrapping_sub(other.0) as i32
    }

    /// `self` comes strictly before `other` in wrapping order.
    pub fn is_before(self, other: StepId) -> bool {
        self.delta(other) < 0
    }

    /// `self` comes at or after `other` in wrapping order.
    pub fn is_at_or_after(self, other: StepId) -> bool {
        self.delta(other) >= 0
    }

    /// The following tick.
    pub fn next(self) -> StepId {
        StepId(self.0.wrapping_add(1))
    }

    /// The tick `count` ticks later.
    pub fn add(self, count: u32) -> StepId {
        StepId(self.0.wrapping_add(count))
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08X}", self.0)
    }
}

/// A fixed-capacity dense ring of opaque step payloads keyed by monotonically increasing
/// [`StepId`]. The ring never holds gaps: writes land exactly at `expected_write_id`, reads
/// serve anything between `expected_read_id` and the write frontier.
#[derive(Debug, Clone)]
pub(crate) struct StepStore {
    /// Cyclic payload slots; slot index is `step_id % WINDOW_SIZE`.
    entries: Vec<Vec<u8>>,
    /// The oldest stored step.
    expected_read_id: StepId,
    /// The next id that may be written.
    expected_write_id: StepId,
    count: usize,
    max_step_octet_count: usize,
}

impl StepStore {
    pub(crate) fn new(start_id: StepId, max_step_octet_count: usize) -> Self {
        Self {
            entries: vec![Vec::new(); WINDOW_SIZE],
            expected_read_id: start_id,
            expected_write_id: start_id,
            count: 0,
            max_step_octet_count,
        }
    }

    /// Empties the ring and restarts it at `start_id`.
    pub(crate) fn reinit(&mut self, start_id: StepId) {
        for entry in &mut self.entries {
            entry.clear();
        }
        self.expected_read_id = start_id;
        self.expected_write_id = start_id;
        self.count = 0;
    }

    pub(crate) fn expected_read_id(&self) -> StepId {
        self.expected_read_id
    }

    pub(crate) fn expected_write_id(&self) -> StepId {
        self.expected_write_id
    }

    pub(crate) fn len(&self) -> usize {
        self.count
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.count == 0
    }

    fn slot(step_id: StepId) -> usize {
        step_id.0 as usize % WINDOW_SIZE
    }

    /// Appends the payload for the next step. The ring is dense: `step_id` must equal
    /// `expected_write_id` exactly.
    pub(crate) fn write(&mut self, step_id: StepId, payload: &[u8]) -> Result<(), SteplockError> {
        if step_id != self.expected_write_id {
            return Err(SteplockError::UnexpectedWriteStepId {
                expected: self.expected_write_id,
                encountered: step_id,
            });
        }
        if payload.len() > self.max_step_octet_count {
            return Err(SteplockError::StepPayloadTooLarge {
                octet_count: payload.len(),
                max_octet_count: self.max_step_octet_count,
            });
        }
        if self.count == WINDOW_SIZE {
            return Err(SteplockError::WindowFull);
        }

        let slot = Self::slot(step_id);
        self.entries[slot].clear();
        self.entries[slot].extend_from_slice(payload);
        self.expected_write_id = self.expected_write_id.next();
        self.count += 1;
        Ok(())
    }

    /// Returns the payload stored for `step_id`, which must lie inside the current window.
    pub(crate) fn read(&self, step_id: StepId) -> Result<&[u8], SteplockError> {
        if step_id.is_before(self.expected_read_id)
            || step_id.is_at_or_after(self.expected_write_id)
        {
            return Err(SteplockError::ReadOutsideWindow { requested: step_id });
        }
        Ok(&self.entries[Self::slot(step_id)])
    }

    /// The oldest stored step, if any.
    pub(crate) fn head(&self) -> Option<(StepId, &[u8])> {
        if self.count == 0 {
            return None;
        }
        Some((
            self.expected_read_id,
            self.entries[Self::slot(self.expected_read_id)].as_slice(),
        ))
    }

    /// Drops the `n` oldest steps.
    pub(crate) fn discard_count(&mut self, n: usize) -> Result<(), SteplockError> {
        if n > self.count {
            return Err(SteplockError::ReadOutsideWindow {
                requested: self.expected_read_id.add(n as u32),
            });
        }
        for _ in 0..n {
            self.entries[Self::slot(self.expected_read_id)].clear();
            self.expected_read_id = self.expected_read_id.next();
        }
        self.count -= n;
        Ok(())
    }

    /// Drops every step older than `step_id`. Ids outside the window are clamped, so this
    /// never fails.
    pub(crate) fn discard_up_to(&mut self, step_id: StepId) {
        let wanted = step_id.delta(self.expected_read_id);
        if wanted <= 0 {
            return;
        }
        let n = (wanted as usize).min(self.count);
        self.discard_count(n)
            .expect("discard clamped to stored count");
    }

    /// Iterates over up to `max_count` stored steps starting at `from_id`. An id outside the
    /// window yields an empty iterator.
    pub(crate) fn read_range(
        &self,
        from_id: StepId,
        max_count: usize,
    ) -> impl Iterator<Item = (StepId, &[u8])> + '_ {
        let available = if from_id.is_at_or_after(self.expected_read_id)
            && from_id.is_before(self.expected_write_id)
        {
            self.expected_write_id.delta(from_id) as usize
        } else {
            0
        };
        let count = available.min(max_count);
        (0..count as u32).map(move |offset| {
            let id = from_id.add(offset);
            (id, self.entries[Self::slot(id)].as_slice())
        })
    }
}

// #########
// # TESTS #
// #########

#[cfg(test)]
mod steps_tests {
    use super::*;

    #[test]
    fn test_step_id_signed_delta() {
        let a = StepId(5);
        let b = StepId(10);
        assert!(a.is_before(b));
        assert!(b.is_at_or_after(a));
        assert_eq!(b.delta(a), 5);
        assert_eq!(a.delta(b), -5);
    }

    #[test]
    fn test_step_id_survives_rollover() {
        let before = StepId(u32::MAX);
        let after = before.next();
        assert_eq!(after, StepId(0));
        assert!(before.is_before(after));
        assert_eq!(after.delta(before), 1);
    }

    #[test]
    fn test_write_then_read() {
        let mut store = StepStore::new(StepId(100), 8);
        store.write(StepId(100), &[1, 2, 3]).unwrap();
        store.write(StepId(101), &[4]).unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(store.read(StepId(100)).unwrap(), &[1, 2, 3]);
        assert_eq!(store.read(StepId(101)).unwrap(), &[4]);
        assert_eq!(store.expected_write_id(), StepId(102));
    }

    #[test]
    fn test_write_at_wrong_id_fails() {
        let mut store = StepStore::new(StepId(100), 8);
        let result = store.write(StepId(101), &[1]);
        assert_eq!(
            result,
            Err(SteplockError::UnexpectedWriteStepId {
                expected: StepId(100),
                encountered: StepId(101),
            })
        );
        // and nothing was stored
        assert!(store.is_empty());
    }

    #[test]
    fn test_oversized_payload_fails() {
        let mut store = StepStore::new(StepId(0), 2);
        let result = store.write(StepId(0), &[1, 2, 3]);
        assert_eq!(
            result,
            Err(SteplockError::StepPayloadTooLarge {
                octet_count: 3,
                max_octet_count: 2,
            })
        );
    }

    #[test]
    fn test_window_full() {
        let mut store = StepStore::new(StepId(0), 8);
        for i in 0..WINDOW_SIZE as u32 {
            store.write(StepId(i), &[i as u8]).unwrap();
        }
        assert_eq!(
            store.write(StepId(WINDOW_SIZE as u32), &[0]),
            Err(SteplockError::WindowFull)
        );
    }

    #[test]
    fn test_discard_advances_read_id() {
        let mut store = StepStore::new(StepId(10), 8);
        for i in 10..20u32 {
            store.write(StepId(i), &[i as u8]).unwrap();
        }
        store.discard_count(4).unwrap();
        assert_eq!(store.expected_read_id(), StepId(14));
        assert_eq!(store.len(), 6);
        assert!(store.read(StepId(13)).is_err());
        assert_eq!(store.read(StepId(14)).unwrap(), &[14]);
    }

    #[test]
    fn test_discard_up_to_clamps() {
        let mut store = StepStore::new(StepId(0), 8);
        for i in 0..5u32 {
            store.write(StepId(i), &[i as u8]).unwrap();
        }
        store.discard_up_to(StepId(1000));
        assert!(store.is_empty());
        assert_eq!(store.expected_read_id(), StepId(5));
    }

    #[test]
    fn test_read_range_truncates() {
        let mut store = StepStore::new(StepId(0), 8);
        for i in 0..6u32 {
            store.write(StepId(i), &[i as u8]).unwrap();
        }
        let collected: Vec<_> = store.read_range(StepId(2), 3).collect();
        assert_eq!(collected.len(), 3);
        assert_eq!(collected[0], (StepId(2), &[2u8][..]));
        assert_eq!(collected[2], (StepId(4), &[4u8][..]));

        // outside the window
        assert_eq!(store.read_range(StepId(100), 3).count(), 0);
        // at the write frontier
        assert_eq!(store.read_range(StepId(6), 3).count(), 0);
    }

    #[test]
    fn test_ring_wraps_across_rollover() {
        let start = StepId(u32::MAX - 2);
        let mut store = StepStore::new(start, 8);
        for i in 0..6u32 {
            store.write(start.add(i), &[i as u8]).unwrap();
        }
        assert_eq!(store.read(StepId(1)).unwrap(), &[4]);
        store.discard_count(5).unwrap();
        assert_eq!(store.head().unwrap().0, StepId(2));
    }
}
