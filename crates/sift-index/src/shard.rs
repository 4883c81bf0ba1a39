//! Shards: one WAL, one bounded queue, one committer and one sync timer each.
//!
//! Write path:
//! 1. reserve queue space (block or fail fast)
//! 2. under the WAL lock: assign the sequence, log the entry, enqueue it
//! 3. the committer drains up to `max_batch` entries, prepares them across
//!    `worker_num` blocking workers and commits them to the segment in
//!    sequence order
//!
//! The sync timer fsyncs the WAL, checkpoints the segment and truncates the
//! log once it outgrows its limit. A write is crash-safe once one sync
//! interval has passed.

use crate::error::{IndexError, Result};
use crate::segment::{MemorySegment, PreparedOp, RedbSegment, SegmentStore};
use crate::wal::{DocOp, ShardWal, WalEntry};
use bytes::Bytes;
use dashmap::DashMap;
use futures::{StreamExt, TryStreamExt, stream};
use parking_lot::Mutex;
use serde_json::Value;
use sift_common::config::{Backpressure, Config, WalConfig};
use sift_common::StorageKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Shard runtime options
#[derive(Clone, Debug)]
pub struct ShardOptions {
    pub storage_kind: StorageKind,
    pub worker_num: usize,
    pub queue_capacity: usize,
    pub backpressure: Backpressure,
    pub max_batch: usize,
    pub close_timeout: Duration,
    pub sync_interval: Duration,
    pub wal: WalConfig,
}

impl ShardOptions {
    /// Options for a shard of an index with the given storage kind
    #[must_use]
    pub fn from_config(config: &Config, storage_kind: StorageKind) -> Self {
        Self {
            storage_kind,
            worker_num: config.shard.worker_num.max(1),
            queue_capacity: config.shard.queue_capacity.max(1),
            backpressure: config.shard.backpressure,
            max_batch: config.shard.max_batch.max(1),
            close_timeout: config.shard.close_timeout(),
            sync_interval: config.wal.sync_interval(),
            wal: config.wal.clone(),
        }
    }
}

/// Directory of shard `id` under an index directory
#[must_use]
pub fn shard_dir(index_dir: &Path, id: u32) -> PathBuf {
    index_dir.join("shards").join(format!("{id:06}"))
}

/// Latest queued operation for a document not yet committed
#[derive(Clone, Copy, Debug)]
struct Pending {
    seq: u64,
    op: DocOp,
}

/// State shared between a shard handle and its background tasks
struct ShardCore {
    id: u32,
    label: String,
    wal: ShardWal,
    segment: Arc<dyn SegmentStore>,
    pending: DashMap<String, Pending>,
    /// First commit failure; the shard accepts no writes after one
    failure: Mutex<Option<String>>,
    storage_size: AtomicU64,
    worker_num: usize,
    max_batch: usize,
}

impl ShardCore {
    fn fail(&self, reason: String) {
        self.failure.lock().get_or_insert(reason);
    }

    fn check(&self) -> Result<()> {
        match self.failure.lock().as_ref() {
            Some(reason) => Err(IndexError::ShardFailed {
                shard: self.label.clone(),
                reason: reason.clone(),
            }),
            None => Ok(()),
        }
    }

    async fn commit(&self, entries: Vec<WalEntry>) -> Result<()> {
        let Some(last_seq) = entries.last().map(|e| e.seq) else {
            return Ok(());
        };
        let done: Vec<(String, u64)> = entries.iter().map(|e| (e.doc_id.clone(), e.seq)).collect();

        let result = async {
            let prepared = prepare_parallel(entries, self.worker_num).await?;
            let segment = Arc::clone(&self.segment);
            tokio::task::spawn_blocking(move || segment.apply(&prepared, last_seq)).await?
        }
        .await;

        // Failed entries stay pending; they are replayed from the WAL on reopen
        if result.is_ok() {
            for (doc_id, seq) in done {
                self.pending.remove_if(&doc_id, |_, p| p.seq == seq);
            }
        }
        result
    }

    /// Apply entries found in the WAL at open time
    fn recover(&self) -> Result<u64> {
        let mut batch: Vec<WalEntry> = Vec::with_capacity(self.max_batch);
        let mut replayed = 0u64;
        let after = self.segment.applied_seq();

        self.wal.replay_after(after, |entry| {
            batch.push(entry);
            replayed += 1;
            if batch.len() >= self.max_batch {
                self.apply_inline(std::mem::take(&mut batch))?;
            }
            Ok(())
        })?;
        self.apply_inline(batch)?;
        Ok(replayed)
    }

    fn apply_inline(&self, batch: Vec<WalEntry>) -> Result<()> {
        let Some(last_seq) = batch.last().map(|e| e.seq) else {
            return Ok(());
        };
        let prepared: Vec<PreparedOp> = batch.into_iter().map(prepare).collect();
        self.segment.apply(&prepared, last_seq)
    }

    fn sync(&self) -> Result<()> {
        self.wal.sync()?;
        let durable = self.segment.checkpoint()?;
        if durable > 0 && self.wal.needs_truncate() {
            self.wal.truncate_before(durable + 1)?;
            debug!("Shard {} truncated WAL through seq {}", self.label, durable);
        }
        self.storage_size.store(self.segment.size_bytes(), Ordering::Relaxed);
        Ok(())
    }
}

/// Turn a logged entry into a segment operation.
///
/// Stored sources always carry their `_id`. Sources that are not JSON
/// objects cannot come from the public API, so they are skipped.
pub(crate) fn prepare(entry: WalEntry) -> PreparedOp {
    match entry.op {
        DocOp::Delete => PreparedOp::Delete {
            doc_id: entry.doc_id,
        },
        DocOp::Put => match serde_json::from_slice::<Value>(&entry.payload) {
            Ok(Value::Object(mut source)) => {
                source
                    .entry("_id")
                    .or_insert_with(|| Value::String(entry.doc_id.clone()));
                match serde_json::to_vec(&source) {
                    Ok(bytes) => PreparedOp::Put {
                        doc_id: entry.doc_id,
                        source: Bytes::from(bytes),
                    },
                    Err(e) => {
                        warn!("Skipping document {} at seq {}: {}", entry.doc_id, entry.seq, e);
                        PreparedOp::Skip
                    }
                }
            }
            _ => {
                warn!(
                    "Skipping document {} at seq {}: source is not a JSON object",
                    entry.doc_id, entry.seq
                );
                PreparedOp::Skip
            }
        },
    }
}

/// Prepare a batch over `workers` blocking tasks, keeping entry order
async fn prepare_parallel(entries: Vec<WalEntry>, workers: usize) -> Result<Vec<PreparedOp>> {
    let workers = workers.max(1);
    let chunk_size = entries.len().div_ceil(workers).max(1);

    let mut chunks = Vec::with_capacity(workers);
    let mut rest = entries.into_iter();
    loop {
        let chunk: Vec<WalEntry> = rest.by_ref().take(chunk_size).collect();
        if chunk.is_empty() {
            break;
        }
        chunks.push(chunk);
    }

    let prepared: Vec<Vec<PreparedOp>> = stream::iter(chunks)
        .map(|chunk| {
            tokio::task::spawn_blocking(move || chunk.into_iter().map(prepare).collect::<Vec<_>>())
        })
        .buffered(workers)
        .try_collect()
        .await?;
    Ok(prepared.into_iter().flatten().collect())
}

/// Resolves once a stop is requested or the shard handle is gone
async fn stopped(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stop| *stop).await;
}

async fn run_committer(
    core: Arc<ShardCore>,
    mut rx: mpsc::Receiver<WalEntry>,
    applied: watch::Sender<u64>,
    mut stop: watch::Receiver<bool>,
) {
    let mut batch = Vec::with_capacity(core.max_batch);
    loop {
        let received = tokio::select! {
            biased;
            () = stopped(&mut stop) => break,
            n = rx.recv_many(&mut batch, core.max_batch) => n,
        };
        // Channel closed and drained
        if received == 0 {
            break;
        }

        let entries = std::mem::take(&mut batch);
        let last_seq = entries.last().map_or(0, |e| e.seq);
        if let Err(e) = core.commit(entries).await {
            error!(
                "Shard {} failed to commit batch ending at seq {}, no longer accepting writes: {}",
                core.label, last_seq, e
            );
            core.fail(e.to_string());
            break;
        }
        applied.send_replace(last_seq);
    }
    debug!("Shard {} committer stopped", core.label);
}

async fn run_syncer(core: Arc<ShardCore>, interval: Duration, mut stop: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            () = stopped(&mut stop) => break,
            _ = ticker.tick() => {}
        }

        let tick_core = Arc::clone(&core);
        match tokio::task::spawn_blocking(move || tick_core.sync()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Shard {} sync failed: {}", core.label, e),
            Err(e) => error!("Shard {} sync task failed: {}", core.label, e),
        }
    }
    debug!("Shard {} sync timer stopped", core.label);
}

/// One partition of an index
pub struct Shard {
    core: Arc<ShardCore>,
    sender: Mutex<Option<mpsc::Sender<WalEntry>>>,
    applied: watch::Receiver<u64>,
    stop: watch::Sender<bool>,
    committer: Mutex<Option<JoinHandle<()>>>,
    syncer: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
    options: ShardOptions,
}

impl Shard {
    /// Open shard `id` in `dir`, recover from its WAL and start its tasks.
    /// Must be called from within a Tokio runtime.
    pub fn open(index: &str, id: u32, dir: &Path, options: ShardOptions) -> Result<Self> {
        let segment: Arc<dyn SegmentStore> = match options.storage_kind {
            StorageKind::Disk => Arc::new(RedbSegment::open(dir)?),
            StorageKind::Memory => Arc::new(MemorySegment::new()),
        };
        Self::open_with_segment(index, id, dir, segment, options)
    }

    /// Open a shard over an existing segment store
    pub fn open_with_segment(
        index: &str,
        id: u32,
        dir: &Path,
        segment: Arc<dyn SegmentStore>,
        options: ShardOptions,
    ) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let wal = ShardWal::open(dir, &options.wal)?;
        wal.advance_to(segment.applied_seq());

        let core = Arc::new(ShardCore {
            id,
            label: format!("{index}/{id}"),
            wal,
            storage_size: AtomicU64::new(segment.size_bytes()),
            segment,
            pending: DashMap::new(),
            failure: Mutex::new(None),
            worker_num: options.worker_num.max(1),
            max_batch: options.max_batch.max(1),
        });

        let replayed = core.recover()?;
        if replayed > 0 {
            info!("Shard {} replayed {} WAL entries", core.label, replayed);
        }

        let (tx, rx) = mpsc::channel(options.queue_capacity.max(1));
        let (applied_tx, applied_rx) = watch::channel(core.wal.current_seq());
        let (stop, stop_rx) = watch::channel(false);

        let committer = tokio::spawn(run_committer(
            Arc::clone(&core),
            rx,
            applied_tx,
            stop_rx.clone(),
        ));
        let syncer = tokio::spawn(run_syncer(Arc::clone(&core), options.sync_interval, stop_rx));

        debug!(
            "Opened shard {}: docs={}, seq={}",
            core.label,
            core.segment.doc_count(),
            core.wal.current_seq()
        );
        Ok(Self {
            core,
            sender: Mutex::new(Some(tx)),
            applied: applied_rx,
            stop,
            committer: Mutex::new(Some(committer)),
            syncer: Mutex::new(Some(syncer)),
            closed: AtomicBool::new(false),
            options,
        })
    }

    /// Log and queue an operation. Returns its sequence number once queued;
    /// durability follows at the next sync tick.
    pub async fn append(&self, entry: WalEntry) -> Result<u64> {
        self.core.check()?;
        let sender = self.sender.lock().clone().ok_or(IndexError::ShardClosed(self.core.id))?;

        let permit = match self.options.backpressure {
            Backpressure::Block => sender.reserve().await.map_err(|_| self.stopped_error())?,
            Backpressure::FailFast => sender.try_reserve().map_err(|e| match e {
                TrySendError::Full(()) => IndexError::QueueFull(self.core.id),
                TrySendError::Closed(()) => self.stopped_error(),
            })?,
        };

        let pending = &self.core.pending;
        self.core.wal.append_then(&entry, |stamped| {
            let seq = stamped.seq;
            pending.insert(
                stamped.doc_id.clone(),
                Pending {
                    seq,
                    op: stamped.op,
                },
            );
            permit.send(stamped);
            seq
        })
    }

    /// Queue a put
    pub async fn put(&self, doc_id: &str, source: Bytes) -> Result<u64> {
        self.append(WalEntry::put(doc_id, source)).await
    }

    /// Queue a delete, failing with `NotFound` when the document is neither
    /// committed nor queued for insertion
    pub async fn delete(&self, doc_id: &str) -> Result<u64> {
        if self.is_closed() {
            return Err(IndexError::ShardClosed(self.core.id));
        }
        self.core.check()?;

        let queued = self.core.pending.get(doc_id).map(|p| p.op);
        let exists = match queued {
            Some(DocOp::Put) => true,
            Some(DocOp::Delete) => false,
            None => self.core.segment.contains(doc_id)?,
        };
        if !exists {
            return Err(IndexError::not_found(format!("document {doc_id}")));
        }
        self.append(WalEntry::delete(doc_id)).await
    }

    /// Committed source of a document
    pub fn get(&self, doc_id: &str) -> Result<Option<Bytes>> {
        self.core.segment.get(doc_id)
    }

    /// Wait until everything queued so far is committed
    pub async fn flush(&self) -> Result<()> {
        self.core.check()?;
        let target = self.core.wal.current_seq();
        let mut applied = self.applied.clone();
        applied
            .wait_for(|seq| *seq >= target)
            .await
            .map(|_| ())
            .map_err(|_| self.stopped_error())
    }

    /// Error for a shard whose committer has exited
    fn stopped_error(&self) -> IndexError {
        self.core
            .check()
            .err()
            .unwrap_or(IndexError::ShardClosed(self.core.id))
    }

    /// Force a WAL sync and segment checkpoint now
    pub async fn sync(&self) -> Result<()> {
        let core = Arc::clone(&self.core);
        tokio::task::spawn_blocking(move || core.sync()).await?
    }

    /// Stop accepting writes, drain the queue, stop the timer and make
    /// everything durable. Fails with `Timeout` when draining exceeds the
    /// configured bound, and with `ShardFailed` after a commit failure; the
    /// WAL is still synced in both cases so nothing is lost.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        drop(self.sender.lock().take());

        let mut result = Ok(());
        let committer = self.committer.lock().take();
        if let Some(handle) = committer {
            match tokio::time::timeout(self.options.close_timeout, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => result = Err(IndexError::from(e)),
                Err(_) => {
                    warn!(
                        "Shard {} did not drain within {:?}",
                        self.core.label, self.options.close_timeout
                    );
                    result = Err(IndexError::Timeout(format!(
                        "draining shard {}",
                        self.core.label
                    )));
                }
            }
        }

        self.stop.send_replace(true);
        let syncer = self.syncer.lock().take();
        if let Some(handle) = syncer {
            if let Err(e) = handle.await {
                error!("Shard {} sync task failed: {}", self.core.label, e);
            }
        }

        let sync_result = self.sync().await;
        info!("Shard {} closed", self.core.label);
        self.core.check().and(result).and(sync_result)
    }

    /// Shard id within its index
    #[must_use]
    pub fn id(&self) -> u32 {
        self.core.id
    }

    /// Whether `close` has been called
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Committed document count
    #[must_use]
    pub fn doc_count(&self) -> u64 {
        self.core.segment.doc_count()
    }

    /// Segment size as of the last sync tick
    #[must_use]
    pub fn storage_size(&self) -> u64 {
        self.core.storage_size.load(Ordering::Relaxed)
    }

    /// Current WAL size
    #[must_use]
    pub fn wal_size(&self) -> u64 {
        self.core.wal.size()
    }

    /// Last assigned sequence number
    #[must_use]
    pub fn last_seq(&self) -> u64 {
        self.core.wal.current_seq()
    }

    /// Simulate a process crash: stop the tasks without syncing and leak
    /// the WAL writer so buffered records never reach the file.
    #[cfg(test)]
    pub(crate) async fn crash(self) {
        self.closed.store(true, Ordering::SeqCst);
        self.stop.send_replace(true);
        let committer = self.committer.lock().take();
        let syncer = self.syncer.lock().take();
        for handle in [committer, syncer].into_iter().flatten() {
            handle.abort();
            let _ = handle.await;
        }
        std::mem::forget(self);
    }
}

impl Drop for Shard {
    fn drop(&mut self) {
        self.stop.send_replace(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn options(kind: StorageKind) -> ShardOptions {
        let mut config = Config::default();
        config.wal.sync_interval_ms = 50;
        ShardOptions::from_config(&config, kind)
    }

    fn source(n: u64) -> Bytes {
        Bytes::from(json!({ "n": n }).to_string())
    }

    fn open(dir: &Path, options: ShardOptions) -> Shard {
        Shard::open("test", 0, dir, options).unwrap()
    }

    /// Memory segment that can refuse its next commit or hold commits
    /// behind a gate
    #[derive(Default)]
    struct ControlledSegment {
        inner: MemorySegment,
        fail_next: AtomicBool,
        gate: Mutex<()>,
    }

    impl SegmentStore for ControlledSegment {
        fn apply(&self, batch: &[PreparedOp], last_seq: u64) -> Result<()> {
            let _gate = self.gate.lock();
            if self.fail_next.swap(false, Ordering::SeqCst) {
                return Err(IndexError::Internal("segment write refused".into()));
            }
            self.inner.apply(batch, last_seq)
        }

        fn get(&self, doc_id: &str) -> Result<Option<Bytes>> {
            self.inner.get(doc_id)
        }

        fn doc_count(&self) -> u64 {
            self.inner.doc_count()
        }

        fn applied_seq(&self) -> u64 {
            self.inner.applied_seq()
        }

        fn checkpoint(&self) -> Result<u64> {
            self.inner.checkpoint()
        }

        fn size_bytes(&self) -> u64 {
            self.inner.size_bytes()
        }
    }

    #[test]
    fn test_prepare_adds_id() {
        let op = prepare(WalEntry::put("doc-1", Bytes::from_static(b"{\"a\":1}")));
        let PreparedOp::Put { doc_id, source } = op else {
            panic!("expected put");
        };
        assert_eq!(doc_id, "doc-1");
        let value: Value = serde_json::from_slice(&source).unwrap();
        assert_eq!(value, json!({ "a": 1, "_id": "doc-1" }));

        let op = prepare(WalEntry::put("doc-2", Bytes::from_static(b"[1,2]")));
        assert_eq!(op, PreparedOp::Skip);
    }

    #[tokio::test]
    async fn test_prepare_parallel_keeps_order() {
        let entries: Vec<WalEntry> = (0..100)
            .map(|i| {
                let mut entry = WalEntry::put(format!("d{i}"), source(i));
                entry.seq = i + 1;
                entry
            })
            .collect();
        let prepared = prepare_parallel(entries, 8).await.unwrap();
        assert_eq!(prepared.len(), 100);
        for (i, op) in prepared.iter().enumerate() {
            let PreparedOp::Put { doc_id, .. } = op else {
                panic!("expected put");
            };
            assert_eq!(doc_id, &format!("d{i}"));
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_put_flush_get() {
        let dir = tempdir().unwrap();
        let shard = open(dir.path(), options(StorageKind::Disk));

        for i in 0..100 {
            shard.put(&format!("d{i}"), source(i)).await.unwrap();
        }
        shard.flush().await.unwrap();
        assert_eq!(shard.doc_count(), 100);
        assert_eq!(shard.last_seq(), 100);

        let stored: Value = serde_json::from_slice(&shard.get("d7").unwrap().unwrap()).unwrap();
        assert_eq!(stored["n"], 7);
        shard.close().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_delete_not_found_and_pending() {
        let dir = tempdir().unwrap();
        let shard = open(dir.path(), options(StorageKind::Disk));

        assert!(shard.delete("ghost").await.unwrap_err().is_not_found());

        // A queued put is deletable before it is committed
        shard.put("a", source(1)).await.unwrap();
        shard.delete("a").await.unwrap();
        // ...but not twice
        assert!(shard.delete("a").await.unwrap_err().is_not_found());

        shard.flush().await.unwrap();
        assert_eq!(shard.doc_count(), 0);
        assert!(shard.get("a").unwrap().is_none());
        shard.close().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_closed_shard_rejects() {
        let dir = tempdir().unwrap();
        let shard = open(dir.path(), options(StorageKind::Disk));
        shard.close().await.unwrap();

        assert!(matches!(
            shard.put("a", source(1)).await,
            Err(IndexError::ShardClosed(0))
        ));
        assert!(matches!(
            shard.delete("a").await,
            Err(IndexError::ShardClosed(0))
        ));
        // Closing twice is harmless
        shard.close().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_reopen_recovers_committed_state() {
        let dir = tempdir().unwrap();
        {
            let shard = open(dir.path(), options(StorageKind::Disk));
            for i in 0..20 {
                shard.put(&format!("d{i}"), source(i)).await.unwrap();
            }
            shard.close().await.unwrap();
        }

        let shard = open(dir.path(), options(StorageKind::Disk));
        assert_eq!(shard.doc_count(), 20);
        assert_eq!(shard.put("d20", source(20)).await.unwrap(), 21);
        shard.close().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_write_survives_crash_after_sync_interval() {
        let dir = tempdir().unwrap();
        let opts = options(StorageKind::Memory);
        let interval = opts.sync_interval;

        let shard = open(dir.path(), opts.clone());
        for i in 0..50 {
            shard.put(&format!("d{i}"), source(i)).await.unwrap();
        }
        tokio::time::sleep(interval * 3).await;
        shard.crash().await;

        let shard = open(dir.path(), opts);
        shard.flush().await.unwrap();
        assert_eq!(shard.doc_count(), 50);
        assert!(shard.get("d49").unwrap().is_some());
        shard.close().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_fail_fast_queue_full() {
        let dir = tempdir().unwrap();
        let mut opts = options(StorageKind::Disk);
        opts.backpressure = Backpressure::FailFast;
        opts.queue_capacity = 1;
        opts.max_batch = 1;
        let shard = open(dir.path(), opts);

        let mut saw_full = false;
        for i in 0..2000 {
            match shard.put(&format!("d{i}"), source(i)).await {
                Ok(_) => {}
                Err(IndexError::QueueFull(0)) => {
                    saw_full = true;
                    break;
                }
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert!(saw_full, "a single-slot queue never filled");
        assert!(IndexError::QueueFull(0).is_retryable());
        shard.close().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_failed_commit_stops_shard_and_replays_on_reopen() {
        let dir = tempdir().unwrap();
        let opts = options(StorageKind::Memory);
        let segment = Arc::new(ControlledSegment::default());
        segment.fail_next.store(true, Ordering::SeqCst);
        let shard =
            Shard::open_with_segment("test", 0, dir.path(), segment, opts.clone()).unwrap();

        shard.put("a", source(1)).await.unwrap();
        assert!(matches!(
            shard.flush().await,
            Err(IndexError::ShardFailed { .. })
        ));
        // The failure is sticky
        assert!(matches!(
            shard.put("b", source(2)).await,
            Err(IndexError::ShardFailed { .. })
        ));
        assert!(matches!(
            shard.flush().await,
            Err(IndexError::ShardFailed { .. })
        ));
        assert!(shard.get("a").unwrap().is_none());
        assert!(matches!(
            shard.close().await,
            Err(IndexError::ShardFailed { .. })
        ));
        drop(shard);

        // The write is still in the WAL, so a reopen commits it
        let shard = open(dir.path(), opts);
        shard.flush().await.unwrap();
        assert!(shard.get("a").unwrap().is_some());
        assert!(shard.get("b").unwrap().is_none());
        assert_eq!(shard.doc_count(), 1);
        shard.close().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_block_backpressure_waits_for_room() {
        let dir = tempdir().unwrap();
        let mut opts = options(StorageKind::Memory);
        opts.backpressure = Backpressure::Block;
        opts.queue_capacity = 1;
        opts.max_batch = 1;
        let segment = Arc::new(ControlledSegment::default());
        let shard =
            Shard::open_with_segment("test", 0, dir.path(), Arc::clone(&segment) as _, opts)
                .unwrap();

        // Hold the committer inside its first commit so the queue stays full
        let gate = segment.gate.lock();
        shard.put("d0", source(0)).await.unwrap();
        shard.put("d1", source(1)).await.unwrap();

        let blocked = shard.put("d2", source(2));
        tokio::pin!(blocked);
        assert!(
            tokio::time::timeout(Duration::from_millis(100), &mut blocked)
                .await
                .is_err(),
            "put returned while the queue was full"
        );

        drop(gate);
        assert_eq!(blocked.await.unwrap(), 3);
        shard.flush().await.unwrap();
        assert_eq!(shard.doc_count(), 3);
        shard.close().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_close_times_out_while_draining() {
        let dir = tempdir().unwrap();
        let mut opts = options(StorageKind::Disk);
        opts.max_batch = 1;
        opts.close_timeout = Duration::ZERO;
        let shard = open(dir.path(), opts.clone());

        for i in 0..5000 {
            shard.put(&format!("d{i}"), source(i)).await.unwrap();
        }
        let err = shard.close().await.unwrap_err();
        assert!(matches!(err, IndexError::Timeout(_)), "{err}");
        drop(shard);

        // Everything was logged and synced, so a reopen recovers it all
        tokio::time::sleep(Duration::from_millis(300)).await;
        opts.close_timeout = Duration::from_secs(30);
        let shard = open(dir.path(), opts);
        assert_eq!(shard.doc_count(), 5000);
        shard.close().await.unwrap();
    }
}
