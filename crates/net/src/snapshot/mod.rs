mod delta;
mod queue;

pub use delta::{DeltaError, apply, diff};
pub use queue::{Compressed, DEFAULT_CAPACITY, QueueError, Snapshot, SnapshotQueue};
