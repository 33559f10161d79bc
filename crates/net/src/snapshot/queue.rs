use std::collections::VecDeque;

use super::delta::{self, DeltaError};

pub const DEFAULT_CAPACITY: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    frame: u32,
    payload: Vec<u8>,
}

impl Snapshot {
    pub fn new(frame: u32, payload: Vec<u8>) -> Self {
        Self { frame, payload }
    }

    pub fn frame(&self) -> u32 {
        self.frame
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

/// Result of [`SnapshotQueue::compress`]. A `base_frame` of 0 means `payload`
/// is the full snapshot rather than a patch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Compressed {
    pub target_frame: u32,
    pub base_frame: u32,
    pub payload: Vec<u8>,
    pub full_size: usize,
}

impl Compressed {
    pub fn is_delta(&self) -> bool {
        self.base_frame != 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("snapshot frame {frame} does not follow last frame {last}")]
    NonIncreasingFrame { frame: u32, last: u32 },
    #[error("snapshot queue is empty")]
    Empty,
    #[error("base frame {0} is not in the snapshot queue")]
    MissingBase(u32),
    #[error("failed to apply snapshot patch: {0}")]
    Delta(#[from] DeltaError),
}

/// Bounded history of full snapshots ordered by strictly increasing frame.
#[derive(Debug)]
pub struct SnapshotQueue {
    snapshots: VecDeque<Snapshot>,
    capacity: usize,
}

impl Default for SnapshotQueue {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl SnapshotQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            snapshots: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Frame of the most recently pushed snapshot, or 0 when empty.
    pub fn last_frame(&self) -> u32 {
        self.snapshots.back().map_or(0, Snapshot::frame)
    }

    pub fn push(&mut self, snapshot: Snapshot) -> Result<(), QueueError> {
        let last = self.last_frame();
        if snapshot.frame <= last {
            return Err(QueueError::NonIncreasingFrame {
                frame: snapshot.frame,
                last,
            });
        }

        while self.snapshots.len() >= self.capacity {
            self.snapshots.pop_front();
        }
        self.snapshots.push_back(snapshot);
        Ok(())
    }

    pub fn get(&self, frame: u32) -> Option<&Snapshot> {
        if frame == 0 {
            return None;
        }
        self.snapshots
            .binary_search_by_key(&frame, Snapshot::frame)
            .ok()
            .and_then(|index| self.snapshots.get(index))
    }

    pub fn contains(&self, frame: u32) -> bool {
        self.get(frame).is_some()
    }

    pub fn latest(&self) -> Option<&Snapshot> {
        self.snapshots.back()
    }

    /// Encodes the latest snapshot against `ref_frame`. Falls back to the full
    /// snapshot with `base_frame == 0` when `ref_frame` is 0 or no longer held.
    pub fn compress(&self, ref_frame: u32) -> Result<Compressed, QueueError> {
        let latest = self.latest().ok_or(QueueError::Empty)?;

        let (base_frame, payload) = match self.get(ref_frame) {
            Some(base) => (base.frame, delta::diff(&base.payload, &latest.payload)),
            None => (0, latest.payload.clone()),
        };

        Ok(Compressed {
            target_frame: latest.frame,
            base_frame,
            payload,
            full_size: latest.payload.len(),
        })
    }

    /// Rebuilds `frame` from `payload` (a patch against `base_frame`, or the
    /// full snapshot when `base_frame` is 0) and pushes it.
    pub fn decompress(
        &mut self,
        frame: u32,
        base_frame: u32,
        payload: &[u8],
    ) -> Result<&Snapshot, QueueError> {
        let last = self.last_frame();
        if frame <= last {
            return Err(QueueError::NonIncreasingFrame { frame, last });
        }

        let full = if base_frame == 0 {
            payload.to_vec()
        } else {
            let base = self
                .get(base_frame)
                .ok_or(QueueError::MissingBase(base_frame))?;
            delta::apply(&base.payload, payload)?
        };

        self.push(Snapshot::new(frame, full))?;
        self.latest().ok_or(QueueError::Empty)
    }

    pub fn clear(&mut self) {
        self.snapshots.clear();
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}
