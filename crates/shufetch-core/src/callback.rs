use anyhow::Result;
use std::time::Duration;

use crate::attempt::InputAttemptId;
use crate::output::FetchedOutput;

/// Scheduler-facing reporting surface. For every attempt a fetcher accepted
/// responsibility for, exactly one of these fires; attempts handed back in
/// the fetch result see neither.
pub trait FetcherCallback: Send + Sync {
    /// One attempt fully streamed. The callback takes ownership of the
    /// output and is expected to commit it; the fetcher never touches it
    /// again. Returning an error fails the attempt.
    fn fetch_succeeded(
        &self,
        host: &str,
        attempt: &InputAttemptId,
        output: FetchedOutput,
        compressed_len: u64,
        uncompressed_len: u64,
        elapsed: Duration,
    ) -> Result<()>;

    /// One attempt failed. `connect_failed` marks a host-level connection
    /// failure so the scheduler can penalize the host rather than the
    /// attempt.
    fn fetch_failed(&self, host: &str, attempt: &InputAttemptId, connect_failed: bool);
}
