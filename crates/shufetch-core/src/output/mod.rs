//! Fetched-output destination model: a reserved landing spot for one
//! attempt's bytes, in memory or on local disk, with a commit/abort
//! lifecycle. Committing publishes to the merger; aborting returns the
//! reservation.

mod allocator;

pub use allocator::{LocalDirTaskOutput, OutputAllocator, TaskOutput};

use self::allocator::MemoryBudget;
use crate::attempt::InputAttemptId;
use crate::merger::ShuffleMerger;
use std::cmp::Ordering;
use std::fmt;
use std::fs::{self, File};
use std::hash::{Hash, Hasher};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

/// Identities are process-wide and monotone so the size-then-id order is
/// stable across a run.
static NEXT_OUTPUT_ID: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    /// Allocator back-pressure placeholder: no destination yet, retry later.
    Wait,
    Memory,
    Disk,
}

impl fmt::Display for OutputKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputKind::Wait => f.write_str("wait"),
            OutputKind::Memory => f.write_str("memory"),
            OutputKind::Disk => f.write_str("disk"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Reserved,
    Committed,
    Aborted,
}

/// Why a commit or abort could not complete.
#[derive(Debug)]
pub enum OutputError {
    /// A WAIT placeholder has no destination to commit or abort.
    Wait,
    Io(io::Error),
}

impl fmt::Display for OutputError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputError::Wait => f.write_str("output is a wait placeholder"),
            OutputError::Io(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for OutputError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            OutputError::Io(e) => Some(e),
            OutputError::Wait => None,
        }
    }
}

enum Destination {
    Wait,
    Memory {
        buf: Vec<u8>,
        budget: Arc<MemoryBudget>,
    },
    Disk {
        file: Option<File>,
        temp_path: PathBuf,
        final_path: PathBuf,
    },
}

/// A reserved destination for one attempt's bytes.
///
/// Terminal transitions consume the value, so a committed or aborted output
/// cannot be touched again. Equality is by identity; ordering is size
/// ascending, then identity ascending.
pub struct FetchedOutput {
    id: u64,
    attempt: InputAttemptId,
    size: u64,
    primary: bool,
    state: Lifecycle,
    merger: Arc<dyn ShuffleMerger>,
    dest: Destination,
}

impl FetchedOutput {
    fn next_id() -> u64 {
        NEXT_OUTPUT_ID.fetch_add(1, AtomicOrdering::Relaxed)
    }

    pub(crate) fn new_memory(
        attempt: InputAttemptId,
        size: u64,
        primary: bool,
        buf: Vec<u8>,
        budget: Arc<MemoryBudget>,
        merger: Arc<dyn ShuffleMerger>,
    ) -> Self {
        Self {
            id: Self::next_id(),
            attempt,
            size,
            primary,
            state: Lifecycle::Reserved,
            merger,
            dest: Destination::Memory { buf, budget },
        }
    }

    pub(crate) fn new_disk(
        attempt: InputAttemptId,
        size: u64,
        primary: bool,
        file: File,
        temp_path: PathBuf,
        final_path: PathBuf,
        merger: Arc<dyn ShuffleMerger>,
    ) -> Self {
        Self {
            id: Self::next_id(),
            attempt,
            size,
            primary,
            state: Lifecycle::Reserved,
            merger,
            dest: Destination::Disk {
                file: Some(file),
                temp_path,
                final_path,
            },
        }
    }

    /// Back-pressure placeholder. The present allocator never returns one;
    /// the variant exists so a blocking allocator can without touching the
    /// fetcher.
    pub fn new_wait(attempt: InputAttemptId, merger: Arc<dyn ShuffleMerger>) -> Self {
        Self {
            id: Self::next_id(),
            attempt,
            size: 0,
            primary: false,
            state: Lifecycle::Reserved,
            merger,
            dest: Destination::Wait,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn attempt(&self) -> &InputAttemptId {
        &self.attempt
    }

    /// Declared uncompressed length the header promised.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_primary(&self) -> bool {
        self.primary
    }

    pub fn kind(&self) -> OutputKind {
        match self.dest {
            Destination::Wait => OutputKind::Wait,
            Destination::Memory { .. } => OutputKind::Memory,
            Destination::Disk { .. } => OutputKind::Disk,
        }
    }

    pub fn memory(&self) -> Option<&[u8]> {
        match &self.dest {
            Destination::Memory { buf, .. } => Some(buf),
            _ => None,
        }
    }

    pub(crate) fn memory_mut(&mut self) -> Option<&mut [u8]> {
        match &mut self.dest {
            Destination::Memory { buf, .. } => Some(buf),
            _ => None,
        }
    }

    /// Move the filled buffer out of a committed segment.
    pub fn into_memory(mut self) -> Option<Vec<u8>> {
        match &mut self.dest {
            Destination::Memory { buf, .. } => Some(std::mem::take(buf)),
            _ => None,
        }
    }

    pub(crate) fn disk_writer(&mut self) -> Option<&mut File> {
        match &mut self.dest {
            Destination::Disk { file, .. } => file.as_mut(),
            _ => None,
        }
    }

    /// Per-fetcher temp path a DISK output fills before publication.
    pub fn temp_path(&self) -> Option<&Path> {
        match &self.dest {
            Destination::Disk { temp_path, .. } => Some(temp_path),
            _ => None,
        }
    }

    /// Canonical path a DISK output is renamed to on commit.
    pub fn final_path(&self) -> Option<&Path> {
        match &self.dest {
            Destination::Disk { final_path, .. } => Some(final_path),
            _ => None,
        }
    }

    /// Publish the output to the merger. A MEMORY segment is handed over as
    /// is; a DISK segment is closed and atomically renamed to its canonical
    /// path before the merger is told about it.
    pub fn commit(mut self) -> Result<(), OutputError> {
        match self.kind() {
            OutputKind::Wait => {
                self.state = Lifecycle::Aborted;
                Err(OutputError::Wait)
            }
            OutputKind::Memory => {
                self.state = Lifecycle::Committed;
                let merger = Arc::clone(&self.merger);
                merger.close_in_memory_file(self);
                Ok(())
            }
            OutputKind::Disk => {
                let dest = std::mem::replace(&mut self.dest, Destination::Wait);
                let Destination::Disk {
                    file,
                    temp_path,
                    final_path,
                } = dest
                else {
                    return Err(OutputError::Wait);
                };
                // close before rename so the published file is complete
                drop(file);
                fs::rename(&temp_path, &final_path).map_err(OutputError::Io)?;
                self.state = Lifecycle::Committed;
                self.merger.close_on_disk_file(&final_path);
                Ok(())
            }
        }
    }

    /// Give the reservation back: a MEMORY segment returns its bytes to the
    /// allocator budget, a DISK segment deletes its temp file (best-effort).
    pub fn abort(mut self) -> Result<(), OutputError> {
        match self.kind() {
            OutputKind::Wait => {
                self.state = Lifecycle::Aborted;
                Err(OutputError::Wait)
            }
            OutputKind::Memory => {
                if let Destination::Memory { budget, .. } = &self.dest {
                    budget.release(self.size);
                }
                self.state = Lifecycle::Aborted;
                Ok(())
            }
            OutputKind::Disk => {
                let dest = std::mem::replace(&mut self.dest, Destination::Wait);
                let Destination::Disk {
                    file, temp_path, ..
                } = dest
                else {
                    return Err(OutputError::Wait);
                };
                drop(file);
                self.state = Lifecycle::Aborted;
                if let Err(e) = fs::remove_file(&temp_path) {
                    tracing::info!(
                        "failed to clean up temp output {}: {}",
                        temp_path.display(),
                        e
                    );
                }
                Ok(())
            }
        }
    }
}

impl Drop for FetchedOutput {
    fn drop(&mut self) {
        if self.state != Lifecycle::Reserved {
            return;
        }
        // Backstop so a dropped-but-never-settled segment cannot leak budget.
        if let Destination::Memory { budget, .. } = &self.dest {
            tracing::warn!(
                "memory output {} for {} dropped while reserved; returning {} bytes",
                self.id,
                self.attempt,
                self.size
            );
            budget.release(self.size);
        }
    }
}

impl PartialEq for FetchedOutput {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for FetchedOutput {}

impl Hash for FetchedOutput {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl PartialOrd for FetchedOutput {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FetchedOutput {
    fn cmp(&self, other: &Self) -> Ordering {
        self.size
            .cmp(&other.size)
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl fmt::Debug for FetchedOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchedOutput")
            .field("id", &self.id)
            .field("attempt", &self.attempt)
            .field("kind", &self.kind())
            .field("size", &self.size)
            .field("primary", &self.primary)
            .finish()
    }
}
