use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use fortress_common::audit::{AuditPayload, RunId};
use fortress_common::error::Error;

use crate::support::{self, LabScanner};

#[tokio::test]
async fn invalid_cidr_consumes_no_slot() {
    let scanner = LabScanner::new(Duration::ZERO);
    let audit = support::audit_log();
    let mapper = support::mapper(scanner.clone(), audit.clone(), 1);

    let err = mapper.scan_network("wlan0", "10.0.0.0/33").await.unwrap_err();
    assert!(matches!(err, Error::InvalidArgument { .. }), "{err}");
    assert_eq!(mapper.limiter().current_usage(), 0);
    assert_eq!(scanner.sweeps.load(Ordering::SeqCst), 0);

    // The single concurrency slot is still free.
    let targets = mapper.scan_network("wlan0", "10.0.0.0/24").await.unwrap();
    assert_eq!(targets.len(), 2);
    assert_eq!(mapper.active_targets().len(), 2);

    let completed = audit
        .events(RunId::system())
        .unwrap()
        .into_iter()
        .filter(|e| matches!(e.payload, AuditPayload::ScanCompleted { .. }))
        .count();
    assert_eq!(completed, 1);
}

#[tokio::test]
async fn continuous_scanning_stops_only_once_the_sweep_drains() {
    let scanner = LabScanner::new(Duration::from_millis(300));
    let mapper = Arc::new(support::mapper(scanner.clone(), support::audit_log(), 3));

    mapper
        .start_continuous_scanning("wlan0", "10.0.0.0/24", Duration::from_secs(60))
        .await
        .unwrap();
    assert!(mapper.is_scanning().await);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(!mapper.stop_continuous_scanning(Duration::ZERO).await);
    assert!(mapper.stop_continuous_scanning(Duration::from_secs(10)).await);
    assert!(!mapper.is_scanning().await);
    assert_eq!(scanner.sweeps.load(Ordering::SeqCst), 1);
    assert_eq!(mapper.target_history().len(), 2);

    // A new loop can start after a clean stop.
    mapper
        .start_continuous_scanning("wlan0", "10.0.0.0/24", Duration::from_secs(60))
        .await
        .unwrap();
    assert!(mapper.stop_continuous_scanning(Duration::from_secs(10)).await);
}
