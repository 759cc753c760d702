use std::path::Path;

use crate::output::FetchedOutput;

/// External collaborator that consumes committed outputs and produces the
/// task's input stream. Implementations live with the scheduler, not here.
pub trait ShuffleMerger: Send + Sync {
    /// Take ownership of a committed in-memory segment.
    fn close_in_memory_file(&self, output: FetchedOutput);

    /// Record a segment published at its canonical on-disk path.
    fn close_on_disk_file(&self, path: &Path);

    /// Release shuffle memory previously transferred by an in-memory commit.
    fn unreserve(&self, n_bytes: u64);
}
