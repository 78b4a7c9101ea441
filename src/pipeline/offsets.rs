use std::collections::BTreeMap;

/// Highest consumed offset per partition since the last commit.
///
/// Offsets only move forward: recording or merging a lower offset for a
/// partition keeps the existing mark.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct OffsetTracker {
    marks: BTreeMap<i32, i64>,
}

impl OffsetTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, partition: i32, offset: i64) {
        self.marks
            .entry(partition)
            .and_modify(|mark| *mark = (*mark).max(offset))
            .or_insert(offset);
    }

    pub fn has_pending(&self) -> bool {
        !self.marks.is_empty()
    }

    /// Hand over every mark, leaving the tracker empty.
    pub fn take(&mut self) -> Vec<(i32, i64)> {
        std::mem::take(&mut self.marks).into_iter().collect()
    }

    /// Put back marks whose commit failed so the next commit covers them.
    pub fn merge(&mut self, marks: &[(i32, i64)]) {
        for &(partition, offset) in marks {
            self.record(partition, offset);
        }
    }
}

/// Merge two mark lists, keeping the higher offset per partition.
pub fn merge_marks(a: Vec<(i32, i64)>, b: Vec<(i32, i64)>) -> Vec<(i32, i64)> {
    let mut tracker = OffsetTracker::new();
    tracker.merge(&a);
    tracker.merge(&b);
    tracker.take()
}
