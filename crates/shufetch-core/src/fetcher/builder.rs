//! Construction of fetchers. Work assignment is a type-level step: only an
//! `AssignedFetcherBuilder` can build, so an unassigned fetcher cannot
//! exist at runtime.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::attempt::InputAttemptId;
use crate::auth::ShuffleSecret;
use crate::callback::FetcherCallback;
use crate::config::ShuffleConfig;
use crate::connection::HttpParams;
use crate::fetcher::{Fetcher, NEXT_FETCHER_ID};
use crate::output::OutputAllocator;
use crate::wire::Codec;

pub struct FetcherBuilder {
    callback: Arc<dyn FetcherCallback>,
    allocator: Arc<OutputAllocator>,
    secret: ShuffleSecret,
    job_id: String,
    params: HttpParams,
    codec: Option<Codec>,
    read_ahead: Option<usize>,
    encrypted: bool,
}

impl FetcherBuilder {
    pub fn new(
        callback: Arc<dyn FetcherCallback>,
        allocator: Arc<OutputAllocator>,
        secret: ShuffleSecret,
        job_id: impl Into<String>,
    ) -> Self {
        Self {
            callback,
            allocator,
            secret,
            job_id: job_id.into(),
            params: HttpParams::default(),
            codec: None,
            read_ahead: None,
            encrypted: false,
        }
    }

    pub fn http_params(mut self, params: HttpParams) -> Self {
        self.params = params;
        self
    }

    pub fn compression(mut self, codec: Option<Codec>) -> Self {
        self.codec = codec;
        self
    }

    /// Prefetch hint for the decompressing payload reader.
    pub fn read_ahead(mut self, enabled: bool, bytes: usize) -> Self {
        self.read_ahead = enabled.then_some(bytes);
        self
    }

    pub fn encrypted_transfer(mut self, enabled: bool) -> Self {
        self.encrypted = enabled;
        self
    }

    /// Apply the transfer-related knobs from a loaded config.
    pub fn configure(self, config: &ShuffleConfig) -> anyhow::Result<Self> {
        let codec = config.codec()?;
        Ok(self
            .http_params(config.http_params())
            .compression(codec)
            .read_ahead(config.ifile_read_ahead, config.ifile_read_ahead_bytes)
            .encrypted_transfer(config.encrypted_transfer))
    }

    /// Bind this fetcher to one (host, port, partition) and its batch.
    pub fn assign_work(
        self,
        host: impl Into<String>,
        port: u16,
        partition: u32,
        attempts: Vec<InputAttemptId>,
    ) -> AssignedFetcherBuilder {
        AssignedFetcherBuilder {
            inner: self,
            host: host.into(),
            port,
            partition,
            attempts,
        }
    }
}

pub struct AssignedFetcherBuilder {
    inner: FetcherBuilder,
    host: String,
    port: u16,
    partition: u32,
    attempts: Vec<InputAttemptId>,
}

impl AssignedFetcherBuilder {
    pub fn build(self) -> Fetcher {
        let id = NEXT_FETCHER_ID.fetch_add(1, Ordering::Relaxed);
        let log_id = format!(
            "fetcher {} [{}:{}#{}]",
            id, self.host, self.port, self.partition
        );
        Fetcher {
            callback: self.inner.callback,
            allocator: self.inner.allocator,
            secret: self.inner.secret,
            job_id: self.inner.job_id,
            params: self.inner.params,
            codec: self.inner.codec,
            read_ahead: self.inner.read_ahead,
            encrypted: self.inner.encrypted,
            id,
            log_id,
            host: self.host,
            port: self.port,
            partition: self.partition,
            attempts: self.attempts,
            path_to_attempt: HashMap::new(),
            remaining: Vec::new(),
            shutdown: Arc::new(AtomicBool::new(false)),
            conn_guard: Arc::new(Mutex::new(None)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryLimits;
    use crate::merger::ShuffleMerger;
    use crate::output::{FetchedOutput, LocalDirTaskOutput};
    use std::path::Path;
    use std::time::Duration;

    struct NullMerger;

    impl ShuffleMerger for NullMerger {
        fn close_in_memory_file(&self, _output: FetchedOutput) {}
        fn close_on_disk_file(&self, _path: &Path) {}
        fn unreserve(&self, _n_bytes: u64) {}
    }

    struct NullCallback;

    impl FetcherCallback for NullCallback {
        fn fetch_succeeded(
            &self,
            _host: &str,
            _attempt: &InputAttemptId,
            _output: FetchedOutput,
            _compressed_len: u64,
            _uncompressed_len: u64,
            _elapsed: Duration,
        ) -> anyhow::Result<()> {
            Ok(())
        }

        fn fetch_failed(&self, _host: &str, _attempt: &InputAttemptId, _connect_failed: bool) {}
    }

    fn builder(dir: &Path) -> FetcherBuilder {
        let allocator = Arc::new(OutputAllocator::new(
            MemoryLimits {
                buffer_bytes: 1024,
                max_single_bytes: 512,
            },
            Arc::new(NullMerger),
            Arc::new(LocalDirTaskOutput::new(dir)),
        ));
        FetcherBuilder::new(
            Arc::new(NullCallback),
            allocator,
            ShuffleSecret::new(b"k".to_vec()),
            "job_1",
        )
    }

    #[test]
    fn fetcher_ids_are_unique() {
        let dir = tempfile::tempdir().unwrap();
        let a = builder(dir.path())
            .assign_work("h", 1, 0, Vec::new())
            .build();
        let b = builder(dir.path())
            .assign_work("h", 1, 0, Vec::new())
            .build();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn configure_applies_transfer_knobs() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = ShuffleConfig::default();
        cfg.compression_codec = Some("zlib".to_string());
        cfg.read_timeout_ms = 1234;
        let fetcher = builder(dir.path())
            .configure(&cfg)
            .unwrap()
            .assign_work("h", 1, 0, Vec::new())
            .build();
        assert_eq!(fetcher.codec, Some(Codec::Zlib));
        assert_eq!(fetcher.params.read_timeout, Duration::from_millis(1234));
        assert_eq!(fetcher.read_ahead, Some(4 * 1024 * 1024));
    }

    #[test]
    fn unknown_codec_fails_configuration() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = ShuffleConfig::default();
        cfg.compression_codec = Some("lzo".to_string());
        assert!(builder(dir.path()).configure(&cfg).is_err());
    }

    #[test]
    fn empty_batch_returns_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = builder(dir.path())
            .assign_work("unreachable.invalid", 1, 0, Vec::new())
            .build();
        let result = fetcher.run().unwrap();
        assert!(result.is_fully_fetched());
    }
}
