use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use fortress_common::audit::{AuditError, AuditPayload, RunId, Severity};
use fortress_core::audit::FileStore;
use fortress_core::{AuditKey, AuditLog};

fn file_log(key: &AuditKey, dir: &std::path::Path) -> AuditLog {
    AuditLog::new(key, Arc::new(FileStore::open(dir).unwrap()), Duration::from_secs(2))
}

fn note(message: String) -> AuditPayload {
    AuditPayload::Note { message }
}

#[test]
fn concurrent_appenders_get_gapless_sequences() {
    const WRITERS: u64 = 8;
    const PER_WRITER: u64 = 25;

    let dir = tempfile::tempdir().unwrap();
    let log = Arc::new(file_log(&AuditKey::generate(), dir.path()));
    let run = RunId::new();

    let handles: Vec<_> = (0..WRITERS)
        .map(|w| {
            let log = log.clone();
            std::thread::spawn(move || {
                (0..PER_WRITER)
                    .map(|i| log.append(run, None, Severity::Info, note(format!("{w}-{i}"))).unwrap())
                    .collect::<Vec<u64>>()
            })
        })
        .collect();

    let seqs: BTreeSet<u64> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
    let total = WRITERS * PER_WRITER;
    assert_eq!(seqs, (1..=total).collect());

    let read: Vec<u64> = log.events(run).unwrap().iter().map(|e| e.seq).collect();
    assert_eq!(read, (1..=total).collect::<Vec<_>>());
}

#[test]
fn reopened_log_continues_the_sequence() {
    let dir = tempfile::tempdir().unwrap();
    let key = AuditKey::generate();
    let run = RunId::new();

    {
        let log = file_log(&key, dir.path());
        log.append(run, None, Severity::Info, note("first".into())).unwrap();
        log.append(run, None, Severity::Info, note("second".into())).unwrap();
    }

    let log = file_log(&key, dir.path());
    assert_eq!(log.append(run, None, Severity::Warning, note("third".into())).unwrap(), 3);
    assert_eq!(log.runs().unwrap(), vec![run]);

    let messages: Vec<String> = log.events(run).unwrap().into_iter().map(|e| e.payload.to_string()).collect();
    assert_eq!(messages.len(), 3);
    assert!(messages[2].contains("third"));
}

#[test]
fn records_do_not_open_under_another_key() {
    let dir = tempfile::tempdir().unwrap();
    let run = RunId::new();
    file_log(&AuditKey::generate(), dir.path())
        .append(run, None, Severity::Info, note("secret".into()))
        .unwrap();

    let stranger = file_log(&AuditKey::generate(), dir.path());
    let mut events = stranger.read_run(run).unwrap();

    assert!(matches!(events.next(), Some(Err(AuditError::Corrupt { .. }))));
    assert!(events.next().is_none());
    assert!(stranger.events(run).unwrap().is_empty());

    let raw = std::fs::read_dir(dir.path()).unwrap().count();
    assert_eq!(raw, 1);
}
