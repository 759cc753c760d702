use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use shufetch_core::attempt::InputAttemptId;
use shufetch_core::auth::ShuffleSecret;
use shufetch_core::callback::FetcherCallback;
use shufetch_core::config;
use shufetch_core::fetcher::FetcherBuilder;
use shufetch_core::merger::ShuffleMerger;
use shufetch_core::output::{FetchedOutput, LocalDirTaskOutput, OutputAllocator};

/// Top-level CLI for the shufetch shuffle fetcher.
#[derive(Debug, Parser)]
#[command(name = "shufetch")]
#[command(about = "shufetch: drain map outputs from a shuffle daemon", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Debug, Subcommand)]
pub enum CliCommand {
    /// Fetch a batch of attempts from one host and print a JSON report.
    Fetch {
        /// Host the serving daemon runs on.
        #[arg(long)]
        host: String,

        /// Shuffle port of the serving daemon.
        #[arg(long)]
        port: u16,

        /// Partition to drain; the daemon must only answer for this shard.
        #[arg(long)]
        partition: u32,

        /// Job identifier the daemon routes by.
        #[arg(long)]
        job: String,

        /// File holding the shared shuffle secret.
        #[arg(long)]
        secret_file: PathBuf,

        /// Directory fetched outputs are published under.
        #[arg(long, default_value = ".")]
        out_dir: PathBuf,

        /// Memory handed to the shuffle buffer, in bytes.
        #[arg(long, default_value_t = 64 * 1024 * 1024)]
        memory_budget: u64,

        /// Attempts as index:attempt:path-component triples.
        #[arg(required = true)]
        attempts: Vec<String>,
    },

    /// Print the resolved configuration.
    Config,
}

pub fn run_from_args() -> Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_or_init()?;
    tracing::debug!("loaded config: {:?}", cfg);

    match cli.command {
        CliCommand::Config => {
            println!("{}", toml::to_string_pretty(&cfg)?);
            Ok(())
        }
        CliCommand::Fetch {
            host,
            port,
            partition,
            job,
            secret_file,
            out_dir,
            memory_budget,
            attempts,
        } => {
            let batch = parse_attempts(&attempts)?;
            let secret = read_secret(&secret_file)?;

            let merger = Arc::new(SpoolingMerger::default());
            let allocator = Arc::new(OutputAllocator::new(
                cfg.memory_limits(memory_budget),
                Arc::clone(&merger) as Arc<dyn ShuffleMerger>,
                Arc::new(LocalDirTaskOutput::new(&out_dir)),
            ));
            let callback = Arc::new(ReportingCallback::default());

            let fetcher = FetcherBuilder::new(
                Arc::clone(&callback) as Arc<dyn FetcherCallback>,
                Arc::clone(&allocator),
                secret,
                job,
            )
            .configure(&cfg)?
            .assign_work(host, port, partition, batch)
            .build();

            let result = fetcher.run()?;

            // Publish in-memory segments next to the disk ones and give
            // their reservations back.
            for (attempt, bytes) in merger.drain_memory() {
                let path = out_dir.join(format!("input_{}.shuffle", attempt.input_index()));
                fs::write(&path, &bytes)
                    .with_context(|| format!("write {}", path.display()))?;
                allocator.unreserve(bytes.len() as u64);
            }

            let report = json!({
                "host": result.host,
                "port": result.port,
                "partition": result.partition,
                "fetched": callback.fetched.lock().unwrap().clone(),
                "failed": callback.failed.lock().unwrap().clone(),
                "pending": result
                    .pending
                    .iter()
                    .map(|a| a.to_string())
                    .collect::<Vec<_>>(),
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
    }
}

fn parse_attempts(specs: &[String]) -> Result<Vec<InputAttemptId>> {
    let mut batch = Vec::with_capacity(specs.len());
    for spec in specs {
        let mut parts = spec.splitn(3, ':');
        let (index, attempt, path) = match (parts.next(), parts.next(), parts.next()) {
            (Some(i), Some(a), Some(p)) if !p.is_empty() => (i, a, p),
            _ => bail!("malformed attempt spec {:?}, expected index:attempt:path", spec),
        };
        let index: u32 = index
            .parse()
            .with_context(|| format!("bad input index in {:?}", spec))?;
        let attempt: u32 = attempt
            .parse()
            .with_context(|| format!("bad attempt number in {:?}", spec))?;
        batch.push(InputAttemptId::new(index, attempt, path));
    }
    Ok(batch)
}

fn read_secret(path: &Path) -> Result<ShuffleSecret> {
    let mut raw = fs::read(path).with_context(|| format!("read secret {}", path.display()))?;
    while matches!(raw.last(), Some(b'\n') | Some(b'\r')) {
        raw.pop();
    }
    if raw.is_empty() {
        bail!("secret file {} is empty", path.display());
    }
    Ok(ShuffleSecret::new(raw))
}

/// Holds committed in-memory segments until the fetch finishes; disk
/// segments are already at their canonical paths.
#[derive(Default)]
struct SpoolingMerger {
    memory: Mutex<Vec<(InputAttemptId, Vec<u8>)>>,
}

impl SpoolingMerger {
    fn drain_memory(&self) -> Vec<(InputAttemptId, Vec<u8>)> {
        std::mem::take(&mut *self.memory.lock().unwrap())
    }
}

impl ShuffleMerger for SpoolingMerger {
    fn close_in_memory_file(&self, output: FetchedOutput) {
        let attempt = output.attempt().clone();
        if let Some(bytes) = output.into_memory() {
            self.memory.lock().unwrap().push((attempt, bytes));
        }
    }

    fn close_on_disk_file(&self, path: &Path) {
        tracing::info!("published {}", path.display());
    }

    fn unreserve(&self, _n_bytes: u64) {}
}

/// Commits outputs and collects per-attempt lines for the JSON report.
#[derive(Default)]
struct ReportingCallback {
    fetched: Mutex<Vec<String>>,
    failed: Mutex<Vec<String>>,
}

impl FetcherCallback for ReportingCallback {
    fn fetch_succeeded(
        &self,
        _host: &str,
        attempt: &InputAttemptId,
        output: FetchedOutput,
        compressed_len: u64,
        uncompressed_len: u64,
        elapsed: Duration,
    ) -> Result<()> {
        let kind = output.kind();
        output.commit()?;
        self.fetched.lock().unwrap().push(format!(
            "{} -> {} ({} bytes, {} decompressed, {} ms)",
            attempt,
            kind,
            compressed_len,
            uncompressed_len,
            elapsed.as_millis()
        ));
        Ok(())
    }

    fn fetch_failed(&self, host: &str, attempt: &InputAttemptId, connect_failed: bool) {
        let reason = if connect_failed { "connect" } else { "fetch" };
        self.failed
            .lock()
            .unwrap()
            .push(format!("{} ({} failure on {})", attempt, reason, host));
    }
}
