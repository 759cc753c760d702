//! Placement of incoming attempts: memory while the budget holds, disk
//! otherwise. Temp files carry the fetcher id as a suffix so two fetchers
//! racing on the same attempt never share a write path.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::attempt::InputAttemptId;
use crate::config::MemoryLimits;
use crate::merger::ShuffleMerger;
use crate::output::FetchedOutput;

/// Running reservation counter for the in-memory shuffle budget. Shared
/// between the allocator and the memory outputs it hands out.
pub(crate) struct MemoryBudget {
    capacity: u64,
    used: Mutex<u64>,
}

impl MemoryBudget {
    pub(crate) fn new(capacity: u64) -> Self {
        Self {
            capacity,
            used: Mutex::new(0),
        }
    }

    pub(crate) fn try_reserve(&self, n: u64) -> bool {
        let mut used = self.used.lock().unwrap();
        match used.checked_add(n) {
            Some(total) if total <= self.capacity => {
                *used = total;
                true
            }
            _ => false,
        }
    }

    pub(crate) fn release(&self, n: u64) {
        let mut used = self.used.lock().unwrap();
        if n > *used {
            tracing::warn!("releasing {} bytes with only {} reserved", n, *used);
            *used = 0;
        } else {
            *used -= n;
        }
    }

    pub(crate) fn in_use(&self) -> u64 {
        *self.used.lock().unwrap()
    }
}

/// Task-output collaborator: yields the canonical local path for an
/// attempt's fetched bytes.
pub trait TaskOutput: Send + Sync {
    fn input_file_for_write(&self, input_index: u32, size: u64) -> io::Result<PathBuf>;
}

/// Publishes fetched inputs as `input_{index}.shuffle` under one directory.
pub struct LocalDirTaskOutput {
    base: PathBuf,
}

impl LocalDirTaskOutput {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }
}

impl TaskOutput for LocalDirTaskOutput {
    fn input_file_for_write(&self, input_index: u32, _size: u64) -> io::Result<PathBuf> {
        std::fs::create_dir_all(&self.base)?;
        Ok(self.base.join(format!("input_{}.shuffle", input_index)))
    }
}

/// Decides where each incoming attempt lands and tracks the memory budget.
/// Safe for concurrent allocate/abort calls from many fetchers; the
/// accounting is one mutex-guarded counter.
pub struct OutputAllocator {
    budget: Arc<MemoryBudget>,
    max_single_bytes: u64,
    merger: Arc<dyn ShuffleMerger>,
    task_output: Arc<dyn TaskOutput>,
}

impl OutputAllocator {
    pub fn new(
        limits: MemoryLimits,
        merger: Arc<dyn ShuffleMerger>,
        task_output: Arc<dyn TaskOutput>,
    ) -> Self {
        Self {
            budget: Arc::new(MemoryBudget::new(limits.buffer_bytes)),
            max_single_bytes: limits.max_single_bytes,
            merger,
            task_output,
        }
    }

    /// Reserve a destination for one attempt. Lengths were already checked
    /// non-negative by the caller. A disk creation failure surfaces as an
    /// I/O error and fails only the attempt being placed.
    pub fn allocate(
        &self,
        uncompressed_len: i64,
        compressed_len: i64,
        attempt: &InputAttemptId,
        fetcher_id: u32,
    ) -> io::Result<FetchedOutput> {
        let size = uncompressed_len as u64;
        if size > self.max_single_bytes {
            tracing::debug!(
                "{} is {} bytes, over the {} byte single-segment cap",
                attempt,
                size,
                self.max_single_bytes
            );
            return self.allocate_disk(size, compressed_len as u64, attempt, fetcher_id);
        }
        if self.budget.try_reserve(size) {
            return Ok(FetchedOutput::new_memory(
                attempt.clone(),
                size,
                true,
                vec![0u8; size as usize],
                Arc::clone(&self.budget),
                Arc::clone(&self.merger),
            ));
        }
        tracing::debug!("shuffle buffer full, spilling {} to disk", attempt);
        self.allocate_disk(size, compressed_len as u64, attempt, fetcher_id)
    }

    fn allocate_disk(
        &self,
        size: u64,
        compressed_len: u64,
        attempt: &InputAttemptId,
        fetcher_id: u32,
    ) -> io::Result<FetchedOutput> {
        let final_path = self
            .task_output
            .input_file_for_write(attempt.input_index(), size)?;
        let temp_path = suffixed(&final_path, fetcher_id);
        let file = File::options()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)?;
        preallocate(&file, compressed_len)?;
        Ok(FetchedOutput::new_disk(
            attempt.clone(),
            size,
            true,
            file,
            temp_path,
            final_path,
            Arc::clone(&self.merger),
        ))
    }

    /// Release bytes a commit transferred to the merger. This is the
    /// merger's half of the accounting; aborts return their reservation
    /// without going through here.
    pub fn unreserve(&self, n_bytes: u64) {
        self.budget.release(n_bytes);
    }

    pub fn memory_in_use(&self) -> u64 {
        self.budget.in_use()
    }
}

/// `{path}.{fetcher_id}`; the canonical path has no suffix.
fn suffixed(path: &Path, fetcher_id: u32) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(format!(".{}", fetcher_id));
    PathBuf::from(os)
}

/// Preallocate the temp file to its payload length. On Unix tries
/// `posix_fallocate` for real block allocation; falls back to `set_len`.
fn preallocate(file: &File, size: u64) -> io::Result<()> {
    if size == 0 {
        return Ok(());
    }
    #[cfg(unix)]
    {
        use std::os::unix::io::AsRawFd;
        let r = unsafe { libc::posix_fallocate(file.as_raw_fd(), 0, size as libc::off_t) };
        if r == 0 {
            return Ok(());
        }
        tracing::debug!(errno = r, "posix_fallocate failed, falling back to set_len");
    }
    file.set_len(size)
}
