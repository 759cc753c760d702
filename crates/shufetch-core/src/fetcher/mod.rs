//! Drains one host's batch of attempts over a single HTTP stream.
//!
//! The fetcher runs connect → validate → drain → report on the calling
//! thread; all I/O is blocking and sequential. Failures never escape
//! `run`: they become `fetch_failed` callbacks and pending entries in the
//! `FetchResult`, attributed per phase (connect failures penalize the
//! host, validation failures the first attempt, drain failures the
//! attempt on the wire).

mod builder;

pub use builder::{AssignedFetcherBuilder, FetcherBuilder};

use anyhow::{ensure, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::attempt::InputAttemptId;
use crate::auth::ShuffleSecret;
use crate::callback::FetcherCallback;
use crate::connection::{CancelHandle, HttpConnection, HttpParams, ShuffleUrl};
use crate::output::OutputAllocator;
use crate::wire::{self, Codec, HeaderError, ShuffleHeader};

pub(super) static NEXT_FETCHER_ID: AtomicU32 = AtomicU32::new(0);

/// Outcome handed back to the scheduler. `pending` holds the attempts this
/// fetcher did not drain; empty means the batch completed.
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub host: String,
    pub port: u16,
    pub partition: u32,
    pub pending: Vec<InputAttemptId>,
}

impl FetchResult {
    pub fn is_fully_fetched(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Cloneable cancellation token for one fetcher. Setting the flag never
/// blocks; the socket close runs under its own lock so a cancel call never
/// waits behind a slow read.
#[derive(Clone)]
pub struct FetcherShutdown {
    flag: Arc<AtomicBool>,
    conn: Arc<Mutex<Option<CancelHandle>>>,
    log_id: String,
}

impl FetcherShutdown {
    /// Idempotent; callable from any thread. A read blocked on the socket
    /// observes the close as an I/O error, which the fetcher then swallows
    /// because the flag is set.
    pub fn shutdown(&self) {
        if !self.flag.swap(true, Ordering::SeqCst) {
            tracing::debug!("{} shutdown requested", self.log_id);
            if let Some(handle) = self.conn.lock().unwrap().as_ref() {
                handle.close();
            }
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

pub struct Fetcher {
    pub(super) callback: Arc<dyn FetcherCallback>,
    pub(super) allocator: Arc<OutputAllocator>,
    pub(super) secret: ShuffleSecret,
    pub(super) job_id: String,
    pub(super) params: HttpParams,
    pub(super) codec: Option<Codec>,
    pub(super) read_ahead: Option<usize>,
    pub(super) encrypted: bool,
    pub(super) id: u32,
    pub(super) log_id: String,
    pub(super) host: String,
    pub(super) port: u16,
    pub(super) partition: u32,
    pub(super) attempts: Vec<InputAttemptId>,
    pub(super) path_to_attempt: HashMap<String, InputAttemptId>,
    pub(super) remaining: Vec<InputAttemptId>,
    pub(super) shutdown: Arc<AtomicBool>,
    pub(super) conn_guard: Arc<Mutex<Option<CancelHandle>>>,
}

impl Fetcher {
    /// Process-unique fetcher identifier; also the temp-path suffix.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Token for cancelling this fetcher from another thread.
    pub fn shutdown_handle(&self) -> FetcherShutdown {
        FetcherShutdown {
            flag: Arc::clone(&self.shutdown),
            conn: Arc::clone(&self.conn_guard),
            log_id: self.log_id.clone(),
        }
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    fn result(&self) -> FetchResult {
        FetchResult {
            host: self.host.clone(),
            port: self.port,
            partition: self.partition,
            pending: self.remaining.clone(),
        }
    }

    fn remove_remaining(&mut self, attempt: &InputAttemptId) {
        self.remaining.retain(|a| a != attempt);
    }

    /// Drain the batch. The only error this can return is the end-of-drain
    /// invariant violation: attempts left with no failure recorded.
    pub fn run(mut self) -> Result<FetchResult> {
        if self.attempts.is_empty() {
            return Ok(self.result());
        }
        for attempt in &self.attempts {
            self.path_to_attempt
                .insert(attempt.path_component().to_string(), attempt.clone());
        }
        self.remaining = self.attempts.clone();

        let url = match ShuffleUrl::build(
            &self.host,
            self.port,
            self.partition,
            &self.job_id,
            &self.attempts,
            self.encrypted,
            self.params.keep_alive,
        ) {
            Ok(url) => url,
            Err(e) => return Ok(self.connect_failed(&e.to_string())),
        };
        let mut conn = HttpConnection::new(url, self.params, &self.secret, &self.log_id);
        if let Err(e) = conn.connect() {
            return Ok(self.connect_failed(&e.to_string()));
        }
        if self.is_shutdown() {
            tracing::info!(
                "{} shut down during connection establishment",
                self.log_id
            );
            return Ok(self.result());
        }
        // From here a shutdown closes the socket underneath us and the
        // blocked read surfaces an error we suppress.
        *self.conn_guard.lock().unwrap() = conn.cancel_handle();

        if let Err(e) = conn.open(&self.secret) {
            if self.is_shutdown() {
                tracing::info!(
                    "{} not reporting fetch failure, stream error after shutdown: {}",
                    self.log_id,
                    e
                );
                return Ok(self.result());
            }
            let first = self.attempts[0].clone();
            tracing::warn!(
                "{} failed validating response from {}:{}, penalizing {}: {}",
                self.log_id,
                self.host,
                self.port,
                first,
                e
            );
            self.callback.fetch_failed(&self.host, &first, false);
            self.remove_remaining(&first);
            return Ok(self.result());
        }
        if self.is_shutdown() {
            tracing::info!("{} detected shutdown after opening stream", self.log_id);
            return Ok(self.result());
        }

        let mut failed: Option<Vec<InputAttemptId>> = None;
        while !self.remaining.is_empty() && failed.is_none() {
            failed = self.fetch_inputs(&mut conn);
        }

        if let Some(failed_list) = &failed {
            if self.is_shutdown() {
                tracing::info!(
                    "{} not reporting {} fetch failures after shutdown",
                    self.log_id,
                    failed_list.len()
                );
            } else {
                tracing::warn!("{} fetch failed for {:?}", self.log_id, failed_list);
                for attempt in failed_list {
                    self.callback.fetch_failed(&self.host, attempt, false);
                    self.remove_remaining(attempt);
                }
            }
        }

        // Release the connection before handing the result back.
        drop(conn);
        *self.conn_guard.lock().unwrap() = None;

        ensure!(
            failed.is_some() || self.remaining.is_empty(),
            "{} ended with {} attempts remaining and no failure recorded",
            self.log_id,
            self.remaining.len()
        );

        Ok(self.result())
    }

    /// Connect never succeeded: penalize the host by failing every attempt,
    /// and hand them all back for rescheduling.
    fn connect_failed(&mut self, error: &str) -> FetchResult {
        if self.is_shutdown() {
            tracing::info!(
                "{} not reporting fetch failure, connection error after shutdown: {}",
                self.log_id,
                error
            );
        } else {
            tracing::warn!(
                "{} failed to connect to {}:{}, failing all {} attempts: {}",
                self.log_id,
                self.host,
                self.port,
                self.remaining.len(),
                error
            );
            for attempt in &self.remaining {
                self.callback.fetch_failed(&self.host, attempt, true);
            }
        }
        self.result()
    }

    /// Read one attempt off the stream. `None` means the attempt committed
    /// and left `remaining`; `Some(failed)` names the attempts to fail and
    /// ends the drain.
    fn fetch_inputs(&mut self, conn: &mut HttpConnection) -> Option<Vec<InputAttemptId>> {
        let started = Instant::now();
        let input = match conn.body() {
            Ok(reader) => reader,
            Err(e) => {
                tracing::info!("{} response stream unavailable: {}", self.log_id, e);
                return Some(self.remaining.clone());
            }
        };

        let header = match ShuffleHeader::read_from(input) {
            Ok(header) => header,
            Err(HeaderError::BadHeader(msg)) => {
                // Cannot tell which attempt the bytes belonged to.
                tracing::warn!(
                    "{} invalid shuffle header, failing all remaining: {}",
                    self.log_id,
                    msg
                );
                return Some(self.remaining.clone());
            }
            Err(HeaderError::Io(e)) => {
                tracing::info!("{} stream error reading shuffle header: {}", self.log_id, e);
                return Some(self.remaining.clone());
            }
        };

        let resolved = self.path_to_attempt.get(&header.path_component).cloned();
        let attempt = match self.verify_sanity(&header, resolved) {
            Ok(attempt) => attempt,
            Err(suspect) => return Some(vec![suspect]),
        };
        tracing::debug!(
            "{} header: {}, len: {}, decomp len: {}",
            self.log_id,
            attempt,
            header.compressed_len,
            header.uncompressed_len
        );

        let mut output = match self.allocator.allocate(
            header.uncompressed_len,
            header.compressed_len,
            &attempt,
            self.id,
        ) {
            Ok(output) => output,
            Err(e) => {
                tracing::warn!("{} failed to place output for {}: {}", self.log_id, attempt, e);
                return Some(vec![attempt]);
            }
        };
        tracing::info!(
            "{} fetching {} ({} bytes, {} decompressed) to {}",
            self.log_id,
            attempt,
            header.compressed_len,
            header.uncompressed_len,
            output.kind()
        );

        let streamed = if let Some(buf) = output.memory_mut() {
            wire::shuffle_to_memory(
                buf,
                input,
                header.compressed_len as u64,
                self.codec,
                self.read_ahead,
            )
        } else if let Some(file) = output.disk_writer() {
            wire::shuffle_to_disk(file, input, header.compressed_len as u64)
        } else {
            Err(std::io::Error::new(
                std::io::ErrorKind::WouldBlock,
                "allocator returned a wait placement",
            ))
        };
        if let Err(e) = streamed {
            if self.is_shutdown() {
                tracing::info!(
                    "{} stream error for {} after shutdown: {}",
                    self.log_id,
                    attempt,
                    e
                );
            } else {
                tracing::warn!(
                    "{} failed to shuffle output of {} from {}: {}",
                    self.log_id,
                    attempt,
                    self.host,
                    e
                );
            }
            if output.abort().is_err() {
                tracing::info!("{} failure to clean up output of {}", self.log_id, attempt);
            }
            return Some(vec![attempt]);
        }

        let elapsed = started.elapsed();
        if let Err(e) = self.callback.fetch_succeeded(
            &self.host,
            &attempt,
            output,
            header.compressed_len as u64,
            header.uncompressed_len as u64,
            elapsed,
        ) {
            tracing::warn!(
                "{} scheduler rejected fetched output of {}: {}",
                self.log_id,
                attempt,
                e
            );
            return Some(vec![attempt]);
        }

        self.remove_remaining(&attempt);
        None
    }

    /// Basic verification of a well-formed header before trusting it. On
    /// failure names the suspect attempt: the resolved one, else the next
    /// remaining.
    fn verify_sanity(
        &self,
        header: &ShuffleHeader,
        resolved: Option<InputAttemptId>,
    ) -> std::result::Result<InputAttemptId, InputAttemptId> {
        if header.compressed_len < 0 || header.uncompressed_len < 0 {
            tracing::warn!(
                "{} invalid lengths in header for {}: len {}, decomp len {}",
                self.log_id,
                header.path_component,
                header.compressed_len,
                header.uncompressed_len
            );
            return Err(self.suspect(resolved));
        }
        if header.partition != self.partition as i32 {
            tracing::warn!(
                "{} data for the wrong partition {} while fetching {}",
                self.log_id,
                header.partition,
                self.partition
            );
            return Err(self.suspect(resolved));
        }
        match resolved {
            Some(attempt) if self.remaining.contains(&attempt) => Ok(attempt),
            Some(attempt) => {
                tracing::warn!(
                    "{} received output for {} which is not pending",
                    self.log_id,
                    attempt
                );
                Err(attempt)
            }
            None => {
                tracing::warn!(
                    "{} unknown path component {}",
                    self.log_id,
                    header.path_component
                );
                Err(self.suspect(None))
            }
        }
    }

    fn suspect(&self, resolved: Option<InputAttemptId>) -> InputAttemptId {
        // The drain loop guarantees `remaining` is non-empty here.
        resolved.unwrap_or_else(|| self.remaining[0].clone())
    }
}
