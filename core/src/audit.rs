//! # Audit Log
//!
//! Append-only, encrypted record of everything an assessment did. Events
//! are sealed with [`RecordCipher`] and handed to an [`AuditStore`]; the
//! key lives only in memory.
//!
//! Sequence numbers are assigned inside the same critical section that
//! persists the record, and only once the store accepted it, so every run
//! reads back as `1..=N` without gaps.
//!
//! Store I/O runs on a writer thread. An attempt waits at most
//! `write_timeout` in total, for the critical section and the store
//! together; a persist that outlives its caller is settled by the next
//! append of the same run before a new number is handed out. A failed or
//! timed-out write is retried once; a second failure is reported as
//! [`AuditError::Lost`] together with a best-effort `DegradedLogging` event.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use fortress_common::audit::{
    AuditError, AuditEvent, AuditPayload, AuditSink, RunId, Severity, StageId,
};
use fortress_common::config::ConfigStore;
use parking_lot::Mutex;
use tracing::{error, warn};

pub mod cipher;
pub mod store;
mod writer;

pub use cipher::{AuditKey, RecordCipher};
pub use store::{AuditStore, DamagedLine, FileStore, MemoryStore, SealedRecord, StoredRun};

use writer::{StoreWriter, Ticket, wait_until};

/// Environment variable consulted when `security.encryption_key` is empty.
pub const KEY_ENV: &str = "FORTRESS_AUDIT_KEY";

/// Append bookkeeping of one run.
#[derive(Default)]
struct RunSequence {
    /// Last committed number; unknown until the store was consulted.
    last: Option<u64>,
    /// A persist whose caller stopped waiting for it.
    orphan: Option<(u64, Ticket<()>)>,
    /// How the most recently settled orphan ended.
    settled: Option<(u64, bool)>,
}

pub struct AuditLog {
    cipher: RecordCipher,
    store: Arc<dyn AuditStore>,
    writer: StoreWriter,
    sequences: Mutex<HashMap<RunId, RunSequence>>,
    write_timeout: Duration,
}

impl AuditLog {
    pub fn new(key: &AuditKey, store: Arc<dyn AuditStore>, write_timeout: Duration) -> Self {
        Self {
            cipher: RecordCipher::new(key),
            writer: StoreWriter::spawn(store.clone()),
            store,
            sequences: Mutex::new(HashMap::new()),
            write_timeout,
        }
    }

    pub fn in_memory(key: &AuditKey) -> Self {
        Self::new(key, Arc::new(MemoryStore::new()), Duration::from_secs(2))
    }

    /// File-backed log from `audit.*` and `security.encryption_key`.
    pub fn from_config(cfg: &ConfigStore) -> Result<Self, AuditError> {
        let configured: String = cfg.get_or("security.encryption_key", String::new());
        let secret = if configured.trim().is_empty() {
            std::env::var(KEY_ENV).unwrap_or_default()
        } else {
            configured
        };
        let key = AuditKey::parse(&secret)?;

        let dir: String = cfg.get_or("audit.dir", "audit".to_string());
        let store = FileStore::open(dir)?;
        let timeout = Duration::from_millis(cfg.get_or("audit.write_timeout_ms", 2000u64));
        Ok(Self::new(&key, Arc::new(store), timeout))
    }

    pub fn append(
        &self,
        run_id: RunId,
        stage_id: Option<StageId>,
        severity: Severity,
        payload: AuditPayload,
    ) -> Result<u64, AuditError> {
        let mut pending = None;
        let first = match self.try_append(run_id, stage_id, severity, &payload, &mut pending) {
            Ok(seq) => return Ok(seq),
            Err(e) => e,
        };
        warn!(%run_id, error = %first, "audit write failed, retrying once");

        match self.try_append(run_id, stage_id, severity, &payload, &mut pending) {
            Ok(seq) => Ok(seq),
            Err(second) => {
                let reason = format!("{} event not persisted: {second}", payload.kind());
                self.raise_degraded(run_id, &reason);
                Err(AuditError::Lost { run_id, reason })
            }
        }
    }

    /// Decrypted events of `run_id` in sequence order, followed by one
    /// error per stored line that could not be parsed.
    ///
    /// The returned iterator works on a snapshot taken now; appends made
    /// afterwards are not included. Call [`RunEvents::rewind`] to replay.
    pub fn read_run(&self, run_id: RunId) -> Result<RunEvents, AuditError> {
        let StoredRun { mut records, damaged } = self.store.load(run_id)?;
        records.sort_by_key(|r| r.seq);
        records.dedup_by_key(|r| r.seq);
        Ok(RunEvents {
            cipher: self.cipher.clone(),
            run_id,
            records,
            damaged,
            position: 0,
        })
    }

    /// Shortcut for collecting [`read_run`](Self::read_run), skipping
    /// records that fail to open.
    pub fn events(&self, run_id: RunId) -> Result<Vec<AuditEvent>, AuditError> {
        Ok(self
            .read_run(run_id)?
            .filter_map(|event| match event {
                Ok(event) => Some(event),
                Err(e) => {
                    warn!(%run_id, error = %e, "skipping unreadable audit record");
                    None
                }
            })
            .collect())
    }

    pub fn runs(&self) -> Result<Vec<RunId>, AuditError> {
        self.store.runs()
    }

    /// One bounded attempt. `pending` carries the number of a persist this
    /// caller gave up on, so a retry can claim it instead of writing the
    /// event twice.
    fn try_append(
        &self,
        run_id: RunId,
        stage_id: Option<StageId>,
        severity: Severity,
        payload: &AuditPayload,
        pending: &mut Option<u64>,
    ) -> Result<u64, AuditError> {
        let timed_out = AuditError::WriteTimeout(self.write_timeout);
        let deadline = Instant::now() + self.write_timeout;
        let mut sequences = self.sequences.try_lock_until(deadline).ok_or(timed_out)?;
        let state = sequences.entry(run_id).or_default();

        if let Some((seq, ticket)) = state.orphan.take() {
            match wait_until(&ticket, deadline) {
                Some(result) => {
                    if let Err(e) = &result {
                        warn!(%run_id, seq, error = %e, "abandoned audit write failed");
                    } else {
                        state.last = Some(seq);
                    }
                    state.settled = Some((seq, result.is_ok()));
                }
                None => {
                    state.orphan = Some((seq, ticket));
                    return Err(AuditError::WriteTimeout(self.write_timeout));
                }
            }
        }
        if let Some(mine) = pending.take() {
            if state.settled == Some((mine, true)) {
                return Ok(mine);
            }
        }

        let last = match state.last {
            Some(last) => last,
            None => {
                let ticket = self.writer.submit(move |store: &dyn AuditStore| {
                    store.recover(run_id)?;
                    store.last_seq(run_id)
                });
                let last = wait_until(&ticket, deadline)
                    .ok_or(AuditError::WriteTimeout(self.write_timeout))??;
                state.last = Some(last);
                last
            }
        };
        let seq = last + 1;

        let event = AuditEvent {
            run_id,
            seq,
            stage_id,
            severity,
            timestamp: Utc::now(),
            payload: payload.clone(),
        };
        let plaintext = serde_json::to_vec(&event)?;
        let record = SealedRecord {
            run_id,
            seq,
            sealed: hex::encode(self.cipher.seal(run_id, seq, &plaintext)?),
        };

        let ticket = self.writer.submit(move |store: &dyn AuditStore| store.persist(&record));
        match wait_until(&ticket, deadline) {
            Some(Ok(())) => {
                state.last = Some(seq);
                Ok(seq)
            }
            Some(Err(e)) => Err(e),
            None => {
                state.orphan = Some((seq, ticket));
                *pending = Some(seq);
                Err(AuditError::WriteTimeout(self.write_timeout))
            }
        }
    }

    /// Single attempt; the log is already misbehaving.
    fn raise_degraded(&self, run_id: RunId, reason: &str) {
        error!(%run_id, reason, "audit event lost");
        let payload = AuditPayload::DegradedLogging {
            reason: reason.to_string(),
        };
        if let Err(e) = self.try_append(run_id, None, Severity::Critical, &payload, &mut None) {
            error!(%run_id, error = %e, "degraded-logging event could not be recorded");
        }
    }
}

impl AuditSink for AuditLog {
    fn append(
        &self,
        run_id: RunId,
        stage_id: Option<StageId>,
        severity: Severity,
        payload: AuditPayload,
    ) -> Result<u64, AuditError> {
        AuditLog::append(self, run_id, stage_id, severity, payload)
    }
}

/// Restartable iterator over one run's events.
pub struct RunEvents {
    cipher: RecordCipher,
    run_id: RunId,
    records: Vec<SealedRecord>,
    damaged: Vec<DamagedLine>,
    position: usize,
}

impl RunEvents {
    /// Items the iterator yields, damaged lines included.
    pub fn len(&self) -> usize {
        self.records.len() + self.damaged.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn rewind(&mut self) {
        self.position = 0;
    }

    fn open(&self, record: &SealedRecord) -> Result<AuditEvent, AuditError> {
        let corrupt = |reason: String| AuditError::Corrupt {
            run_id: self.run_id,
            seq: record.seq,
            reason,
        };
        if record.run_id != self.run_id {
            return Err(corrupt("record belongs to another run".into()));
        }
        let sealed = hex::decode(&record.sealed).map_err(|e| corrupt(e.to_string()))?;
        let plaintext = self.cipher.open(self.run_id, record.seq, &sealed)?;
        let event: AuditEvent = serde_json::from_slice(&plaintext)?;
        if event.seq != record.seq || event.run_id != self.run_id {
            return Err(corrupt("sealed header does not match contents".into()));
        }
        Ok(event)
    }
}

impl Iterator for RunEvents {
    type Item = Result<AuditEvent, AuditError>;

    fn next(&mut self) -> Option<Self::Item> {
        let position = self.position;
        if let Some(record) = self.records.get(position) {
            self.position += 1;
            return Some(self.open(record));
        }

        let damaged = self.damaged.get(position - self.records.len())?;
        self.position += 1;
        Some(Err(AuditError::Corrupt {
            run_id: self.run_id,
            seq: damaged.seq,
            reason: format!("unparseable line {}: {}", damaged.line, damaged.reason),
        }))
    }
}

// ╔════════════════════════════════════════════╗
// ║ ████████╗███████╗███████╗████████╗███████╗ ║
// ║ ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝██╔════╝ ║
// ║    ██║   █████╗  ███████╗   ██║   ███████╗ ║
// ║    ██║   ██╔══╝  ╚════██║   ██║   ╚════██║ ║
// ║    ██║   ███████╗███████║   ██║   ███████║ ║
// ║    ╚═╝   ╚══════╝╚══════╝   ╚═╝   ╚══════╝ ║
// ╚════════════════════════════════════════════╝

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Fails the first `failures` persists, then delegates.
    struct FlakyStore {
        inner: MemoryStore,
        failures: AtomicUsize,
    }

    impl FlakyStore {
        fn new(failures: usize) -> Self {
            Self {
                inner: MemoryStore::new(),
                failures: AtomicUsize::new(failures),
            }
        }
    }

    impl AuditStore for FlakyStore {
        fn persist(&self, record: &SealedRecord) -> Result<(), AuditError> {
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(std::io::Error::other("disk full").into());
            }
            self.inner.persist(record)
        }

        fn load(&self, run_id: RunId) -> Result<StoredRun, AuditError> {
            self.inner.load(run_id)
        }

        fn runs(&self) -> Result<Vec<RunId>, AuditError> {
            self.inner.runs()
        }
    }

    /// Sleeps `delay` inside every persist while `slow` is set.
    struct SlowStore {
        inner: MemoryStore,
        slow: AtomicBool,
        delay: Duration,
    }

    impl SlowStore {
        fn new(delay: Duration) -> Self {
            Self {
                inner: MemoryStore::new(),
                slow: AtomicBool::new(true),
                delay,
            }
        }
    }

    impl AuditStore for SlowStore {
        fn persist(&self, record: &SealedRecord) -> Result<(), AuditError> {
            if self.slow.load(Ordering::SeqCst) {
                std::thread::sleep(self.delay);
            }
            self.inner.persist(record)
        }

        fn load(&self, run_id: RunId) -> Result<StoredRun, AuditError> {
            self.inner.load(run_id)
        }

        fn runs(&self) -> Result<Vec<RunId>, AuditError> {
            self.inner.runs()
        }
    }

    fn note(i: usize) -> AuditPayload {
        AuditPayload::note(format!("event {i}"))
    }

    #[test]
    fn concurrent_appenders_get_contiguous_sequences() {
        let log = Arc::new(AuditLog::in_memory(&AuditKey::generate()));
        let run = RunId::new();

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let log = log.clone();
                std::thread::spawn(move || {
                    (0..25)
                        .map(|i| log.append(run, None, Severity::Info, note(t * 100 + i)).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seqs: Vec<u64> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        seqs.sort();
        assert_eq!(seqs, (1..=200).collect::<Vec<u64>>());

        let read: Vec<u64> = log.events(run).unwrap().iter().map(|e| e.seq).collect();
        assert_eq!(read, (1..=200).collect::<Vec<u64>>());
    }

    #[test]
    fn runs_have_independent_sequences() {
        let log = AuditLog::in_memory(&AuditKey::generate());
        let (a, b) = (RunId::new(), RunId::new());
        assert_eq!(log.append(a, None, Severity::Info, note(1)).unwrap(), 1);
        assert_eq!(log.append(b, None, Severity::Info, note(1)).unwrap(), 1);
        assert_eq!(log.append(a, None, Severity::Info, note(2)).unwrap(), 2);
        assert_eq!(log.runs().unwrap().len(), 2);
    }

    #[test]
    fn read_run_is_ordered_and_restartable() {
        let log = AuditLog::in_memory(&AuditKey::generate());
        let run = RunId::new();
        for i in 0..3 {
            log.append(run, None, Severity::Info, note(i)).unwrap();
        }

        let mut events = log.read_run(run).unwrap();
        assert_eq!(events.len(), 3);
        let first: Vec<u64> = events.by_ref().map(|e| e.unwrap().seq).collect();
        assert!(events.next().is_none());

        events.rewind();
        let second: Vec<u64> = events.map(|e| e.unwrap().seq).collect();
        assert_eq!(first, vec![1, 2, 3]);
        assert_eq!(first, second);

        // A snapshot does not see later appends, a new read does.
        let snapshot = log.read_run(run).unwrap();
        log.append(run, None, Severity::Info, note(9)).unwrap();
        assert_eq!(snapshot.count(), 3);
        assert_eq!(log.events(run).unwrap().len(), 4);
    }

    #[test]
    fn one_failure_is_retried_transparently() {
        let log = AuditLog::new(
            &AuditKey::generate(),
            Arc::new(FlakyStore::new(1)),
            Duration::from_millis(50),
        );
        let run = RunId::new();
        assert_eq!(log.append(run, None, Severity::Info, note(1)).unwrap(), 1);
        assert_eq!(log.append(run, None, Severity::Info, note(2)).unwrap(), 2);
    }

    #[test]
    fn second_failure_is_lost_and_degraded_event_follows() {
        let log = AuditLog::new(
            &AuditKey::generate(),
            Arc::new(FlakyStore::new(2)),
            Duration::from_millis(50),
        );
        let run = RunId::new();

        let err = log.append(run, None, Severity::Info, note(1)).unwrap_err();
        assert!(err.is_fatal());

        let events = log.events(run).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].seq, 1);
        assert!(matches!(events[0].payload, AuditPayload::DegradedLogging { .. }));
        assert_eq!(events[0].severity, Severity::Critical);
    }

    #[test]
    fn blocked_writer_times_out() {
        let log = AuditLog::new(
            &AuditKey::generate(),
            Arc::new(MemoryStore::new()),
            Duration::from_millis(20),
        );
        let run = RunId::new();
        let held = log.sequences.lock();

        let err = log
            .try_append(run, None, Severity::Info, &note(1), &mut None)
            .unwrap_err();
        assert!(matches!(err, AuditError::WriteTimeout(_)));

        // The public path retries, then reports the event as lost.
        assert!(matches!(
            log.append(run, None, Severity::Info, note(1)),
            Err(AuditError::Lost { .. })
        ));
        drop(held);

        assert_eq!(log.append(run, None, Severity::Info, note(2)).unwrap(), 1);
    }

    #[test]
    fn slow_store_is_bounded_by_the_write_timeout() {
        let store = Arc::new(SlowStore::new(Duration::from_millis(200)));
        let log = AuditLog::new(&AuditKey::generate(), store.clone(), Duration::from_millis(20));
        let run = RunId::new();

        let started = Instant::now();
        let err = log.append(run, None, Severity::Info, note(1)).unwrap_err();
        assert!(matches!(err, AuditError::Lost { .. }));
        assert!(started.elapsed() < Duration::from_millis(150), "took {:?}", started.elapsed());

        // The abandoned write still lands and the next number follows it.
        store.slow.store(false, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(300));
        assert_eq!(log.append(run, None, Severity::Info, note(2)).unwrap(), 2);

        let seqs: Vec<u64> = log.events(run).unwrap().iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2]);
    }

    #[test]
    fn retry_claims_a_write_that_finished_late() {
        let log = AuditLog::new(
            &AuditKey::generate(),
            Arc::new(SlowStore::new(Duration::from_millis(60))),
            Duration::from_millis(50),
        );
        let run = RunId::new();

        assert_eq!(log.append(run, None, Severity::Info, note(1)).unwrap(), 1);
        assert_eq!(log.events(run).unwrap().len(), 1);
    }

    #[test]
    fn torn_append_does_not_break_later_reads() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(
            &AuditKey::generate(),
            Arc::new(FileStore::open(dir.path()).unwrap()),
            Duration::from_secs(1),
        );
        let run = RunId::new();
        log.append(run, None, Severity::Info, note(1)).unwrap();

        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(dir.path().join(format!("{run}.jsonl")))
            .unwrap();
        file.write_all(br#"{"run_id":"half"#).unwrap();
        drop(file);

        assert_eq!(log.append(run, None, Severity::Info, note(2)).unwrap(), 2);
        assert_eq!(log.append(run, None, Severity::Info, note(3)).unwrap(), 3);

        let events = log.read_run(run).unwrap();
        assert_eq!(events.len(), 3);
        assert!(events.map(|e| e.unwrap().seq).eq(1..=3));
    }

    #[test]
    fn damaged_lines_are_reported_after_the_readable_events() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(
            &AuditKey::generate(),
            Arc::new(FileStore::open(dir.path()).unwrap()),
            Duration::from_secs(1),
        );
        let run = RunId::new();
        log.append(run, None, Severity::Info, note(1)).unwrap();

        let path = dir.path().join(format!("{run}.jsonl"));
        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"not a record\n").unwrap();
        drop(file);

        let items: Vec<_> = log.read_run(run).unwrap().collect();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap().seq, 1);
        assert!(matches!(&items[1], Err(AuditError::Corrupt { seq: 2, .. })));
        assert_eq!(log.events(run).unwrap().len(), 1);
    }

    #[test]
    fn file_backed_log_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let key = AuditKey::generate();
        let run = RunId::new();

        {
            let log = AuditLog::new(&key, Arc::new(FileStore::open(dir.path()).unwrap()), Duration::from_secs(1));
            log.append(run, None, Severity::Info, note(1)).unwrap();
            log.append(run, None, Severity::Warning, note(2)).unwrap();
        }

        let reopened = AuditLog::new(&key, Arc::new(FileStore::open(dir.path()).unwrap()), Duration::from_secs(1));
        assert_eq!(reopened.append(run, None, Severity::Info, note(3)).unwrap(), 3);
        assert_eq!(reopened.events(run).unwrap().len(), 3);

        let raw = std::fs::read_to_string(dir.path().join(format!("{run}.jsonl"))).unwrap();
        assert!(!raw.contains("event 1"));

        let wrong_key = AuditLog::new(
            &AuditKey::generate(),
            Arc::new(FileStore::open(dir.path()).unwrap()),
            Duration::from_secs(1),
        );
        let mut events = wrong_key.read_run(run).unwrap();
        assert!(matches!(events.next(), Some(Err(AuditError::Corrupt { .. }))));
    }
}
