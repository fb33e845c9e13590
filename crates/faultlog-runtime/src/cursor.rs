//! Id-window cursor: keyset pagination from the newest row backwards.
//!
//! Offset paging gets slower the deeper it goes. Anchoring every query on a
//! fixed-width primary-key window keeps each round trip the same cost no
//! matter how far the scan has progressed.

use faultlog_kernel::IdRange;

/// Why the cursor stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DoneReason {
    /// As many rows were produced as were counted at run start.
    ReachedExpected,
    /// An empty window at or below the id floor, or the bottom of the id
    /// type, was reached before the snapshot count.
    ExhaustedIds,
}

/// Result of [IdRangeCursor::advance].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CursorStep {
    Next(IdRange),
    Done(DoneReason),
}

/// Strictly decreasing sequence of id windows.
///
/// The first window is `[max_id - W, max_id]`; each following window ends one
/// below the previous start. `end_id` of window `n + 1` is therefore always
/// below `start_id` of window `n`, so no id is queried twice.
///
/// The floor ends the scan only at an empty window. Ids below the floor are
/// still reached while consecutive windows keep returning rows; past the
/// first empty window they are out of reach, so sources holding such ids
/// should lower the floor.
#[derive(Clone, Debug)]
pub struct IdRangeCursor {
    current: IdRange,
    window: i64,
    floor: i64,
    expected: u64,
    produced: u64,
}

impl IdRangeCursor {
    /// Anchors the cursor on the max matching id captured at run start.
    pub fn anchored(max_id: i64, expected: u64, window: i64, floor: i64) -> Self {
        let window = window.max(0);
        Self {
            current: IdRange {
                start_id: max_id.saturating_sub(window),
                end_id: max_id,
            },
            window,
            floor,
            expected,
            produced: 0,
        }
    }

    /// Window to query next.
    pub fn current(&self) -> IdRange {
        self.current
    }

    pub fn expected(&self) -> u64 {
        self.expected
    }

    pub fn produced(&self) -> u64 {
        self.produced
    }

    /// Rows that may still be produced without exceeding the snapshot count.
    pub fn remaining(&self) -> u64 {
        self.expected.saturating_sub(self.produced)
    }

    /// Records that the current window yielded `rows` rows and moves on.
    pub fn advance(&mut self, rows: u64) -> CursorStep {
        self.produced = self.produced.saturating_add(rows);
        if self.produced >= self.expected {
            return CursorStep::Done(DoneReason::ReachedExpected);
        }
        if self.current.start_id <= self.floor && rows == 0 {
            return CursorStep::Done(DoneReason::ExhaustedIds);
        }
        let Some(end_id) = self.current.start_id.checked_sub(1) else {
            return CursorStep::Done(DoneReason::ExhaustedIds);
        };
        self.current = IdRange {
            start_id: end_id.saturating_sub(self.window),
            end_id,
        };
        CursorStep::Next(self.current)
    }
}
