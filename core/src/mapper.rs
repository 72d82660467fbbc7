//! # Network Mapper
//!
//! Discrete and continuous discovery of the networks and devices in range.
//!
//! Every sweep goes through the same gate, in this order:
//! 1. the interface name and CIDR are validated (nothing else happens on
//!    malformed input),
//! 2. the number of sweeps in flight is checked against `scan.max_concurrent`,
//! 3. the rate limiter is consulted,
//! 4. the backend runs, bounded by `scan.timeout`.
//!
//! Results are vendor-enriched, merged into the inventory and audited.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use fortress_common::audit::{AuditPayload, AuditSink, RunId, Severity, StageId};
use fortress_common::config::ConfigStore;
use fortress_common::error::{Error, Result};
use fortress_common::network::interface;
use fortress_common::network::range::ScanNetwork;
use fortress_common::network::target::Target;
use fortress_common::rate_limit::RateLimiter;
use fortress_common::scanning::NetworkScanner;
use fortress_common::vendors::VendorRepository;
use tracing::{info, warn};

mod continuous;
pub mod inventory;

use continuous::ScanLoop;
use inventory::Inventory;

/// Shortest interval accepted for continuous scanning.
pub const MIN_SCAN_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct MapperSettings {
    pub max_addresses: u128,
    pub max_concurrent: usize,
    pub scan_timeout: Duration,
    pub stale_after: Duration,
}

impl MapperSettings {
    pub fn from_config(cfg: &ConfigStore) -> Self {
        Self {
            max_addresses: cfg.get_or::<u64>("scan.max_addresses", 256).into(),
            max_concurrent: cfg.get_or("scan.max_concurrent", 3),
            scan_timeout: cfg.get_secs("scan.timeout", 30),
            stale_after: cfg.get_secs("scan.stale_after", 3600),
        }
    }
}

impl Default for MapperSettings {
    fn default() -> Self {
        Self {
            max_addresses: 256,
            max_concurrent: 3,
            scan_timeout: Duration::from_secs(30),
            stale_after: Duration::from_secs(3600),
        }
    }
}

pub struct NetworkMapper {
    inner: Arc<MapperInner>,
    scan_loop: tokio::sync::Mutex<Option<ScanLoop>>,
}

pub(crate) struct MapperInner {
    scanner: Arc<dyn NetworkScanner>,
    vendors: Option<Arc<dyn VendorRepository>>,
    limiter: RateLimiter,
    audit: Arc<dyn AuditSink>,
    inventory: Inventory,
    settings: MapperSettings,
    in_flight: AtomicUsize,
}

/// Collects what a [`NetworkMapper`] is made of before it is shared.
pub struct MapperBuilder {
    scanner: Arc<dyn NetworkScanner>,
    vendors: Option<Arc<dyn VendorRepository>>,
    limiter: RateLimiter,
    audit: Arc<dyn AuditSink>,
    settings: MapperSettings,
}

impl MapperBuilder {
    /// Enables MAC vendor enrichment.
    pub fn vendors(mut self, vendors: Arc<dyn VendorRepository>) -> Self {
        self.vendors = Some(vendors);
        self
    }

    pub fn build(self) -> NetworkMapper {
        NetworkMapper {
            inner: Arc::new(MapperInner {
                scanner: self.scanner,
                vendors: self.vendors,
                limiter: self.limiter,
                audit: self.audit,
                inventory: Inventory::new(),
                settings: self.settings,
                in_flight: AtomicUsize::new(0),
            }),
            scan_loop: tokio::sync::Mutex::new(None),
        }
    }
}

impl NetworkMapper {
    /// A mapper without vendor enrichment.
    pub fn new(
        scanner: Arc<dyn NetworkScanner>,
        limiter: RateLimiter,
        audit: Arc<dyn AuditSink>,
        settings: MapperSettings,
    ) -> Self {
        Self::builder(scanner, limiter, audit, settings).build()
    }

    pub fn builder(
        scanner: Arc<dyn NetworkScanner>,
        limiter: RateLimiter,
        audit: Arc<dyn AuditSink>,
        settings: MapperSettings,
    ) -> MapperBuilder {
        MapperBuilder {
            scanner,
            vendors: None,
            limiter,
            audit,
            settings,
        }
    }

    /// One sweep of `network_cidr` through `interface`.
    pub async fn scan_network(&self, interface: &str, network_cidr: &str) -> Result<Vec<Target>> {
        self.inner.scan(RunId::system(), None, interface, network_cidr).await
    }

    /// Same as [`scan_network`](Self::scan_network), audited under a run
    /// and stage.
    pub async fn scan_network_in(
        &self,
        run_id: RunId,
        stage_id: Option<StageId>,
        interface: &str,
        network_cidr: &str,
    ) -> Result<Vec<Target>> {
        self.inner.scan(run_id, stage_id, interface, network_cidr).await
    }

    /// Starts a background loop sweeping every `interval`. The first sweep
    /// runs immediately.
    pub async fn start_continuous_scanning(
        &self,
        interface: &str,
        network_cidr: &str,
        interval: Duration,
    ) -> Result<()> {
        interface::validate_name(interface)?;
        self.inner.validate_network(network_cidr)?;
        if interval < MIN_SCAN_INTERVAL {
            return Err(Error::invalid_argument(
                "interval",
                format!("must be at least {}s, got {}s", MIN_SCAN_INTERVAL.as_secs(), interval.as_secs()),
            ));
        }

        let mut scan_loop = self.scan_loop.lock().await;
        if scan_loop.as_ref().is_some_and(|l| !l.is_finished()) {
            return Err(Error::AlreadyRunning("continuous scanning"));
        }

        *scan_loop = Some(ScanLoop::spawn(
            self.inner.clone(),
            interface.to_string(),
            network_cidr.to_string(),
            interval,
        ));
        info!(interface, network = network_cidr, ?interval, "continuous scanning started");
        Ok(())
    }

    /// Signals the loop to stop and waits up to `timeout` for it to finish.
    ///
    /// Returns false if the loop is still running (typically mid-sweep);
    /// the stop signal stays set and the call can be repeated. Returns true
    /// when no loop is running.
    pub async fn stop_continuous_scanning(&self, timeout: Duration) -> bool {
        let mut scan_loop = self.scan_loop.lock().await;
        let Some(active) = scan_loop.as_mut() else {
            return true;
        };

        if active.stop_within(timeout).await {
            *scan_loop = None;
            info!("continuous scanning stopped");
            true
        } else {
            false
        }
    }

    pub async fn is_scanning(&self) -> bool {
        self.scan_loop
            .lock()
            .await
            .as_ref()
            .is_some_and(|l| !l.is_finished())
    }

    /// Targets seen within `scan.stale_after`.
    pub fn active_targets(&self) -> Vec<Target> {
        let max_age = chrono::Duration::from_std(self.inner.settings.stale_after)
            .unwrap_or(chrono::Duration::MAX);
        self.inner.inventory.active(Utc::now(), max_age)
    }

    pub fn target_history(&self) -> Vec<Target> {
        self.inner.inventory.history()
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.inner.limiter
    }
}

/// Decrements the in-flight counter when a sweep ends, however it ends.
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn acquire(counter: &'a AtomicUsize, max: usize) -> Result<Self> {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < max).then_some(n + 1))
            .map(|_| InFlight(counter))
            .map_err(|active| Error::ScanBusy { active, max })
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MapperInner {
    fn validate_network(&self, network_cidr: &str) -> Result<ScanNetwork> {
        let network = ScanNetwork::parse(network_cidr)?;
        let count = network.address_count();
        if count > self.settings.max_addresses {
            return Err(Error::invalid_argument(
                "network_cidr",
                format!(
                    "{network} spans {count} addresses, more than the {} allowed",
                    self.settings.max_addresses
                ),
            ));
        }
        Ok(network)
    }

    pub(crate) async fn scan(
        &self,
        run_id: RunId,
        stage_id: Option<StageId>,
        interface: &str,
        network_cidr: &str,
    ) -> Result<Vec<Target>> {
        interface::validate_name(interface)?;
        let network = self.validate_network(network_cidr)?;
        let _slot = InFlight::acquire(&self.in_flight, self.settings.max_concurrent)?;
        self.limiter.acquire()?;

        let sweep = tokio::time::timeout(
            self.settings.scan_timeout,
            self.scanner.scan(interface, &network),
        )
        .await;

        let mut found = match sweep {
            Ok(Ok(found)) => found,
            Ok(Err(e)) => return Err(self.failed(run_id, stage_id, interface, &network, format!("{e:#}"))?),
            Err(_) => {
                let reason = format!("timed out after {:?}", self.settings.scan_timeout);
                return Err(self.failed(run_id, stage_id, interface, &network, reason)?);
            }
        };

        if let Some(vendors) = &self.vendors {
            for target in found.iter_mut().filter(|t| t.vendor.is_none()) {
                target.vendor = vendors.get_vendor(target.id);
            }
        }

        let targets = self.inventory.upsert(&found);
        self.audit.append(
            run_id,
            stage_id,
            Severity::Info,
            AuditPayload::ScanCompleted {
                interface: interface.to_string(),
                network: network.to_string(),
                targets: targets.clone(),
            },
        )?;
        info!(interface, %network, found = targets.len(), "scan completed");
        Ok(targets)
    }

    /// Audits a failed sweep and builds the error to return. The outer
    /// `Err` carries an audit failure instead.
    fn failed(
        &self,
        run_id: RunId,
        stage_id: Option<StageId>,
        interface: &str,
        network: &ScanNetwork,
        reason: String,
    ) -> Result<Error> {
        warn!(interface, %network, %reason, "scan failed");
        self.audit.append(
            run_id,
            stage_id,
            Severity::Warning,
            AuditPayload::ScanFailed {
                interface: interface.to_string(),
                network: network.to_string(),
                reason: reason.clone(),
            },
        )?;
        Ok(Error::ScanFailed {
            interface: interface.to_string(),
            reason,
        })
    }

    pub(crate) fn audit(&self) -> &dyn AuditSink {
        self.audit.as_ref()
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
    use crate::audit::{AuditKey, AuditLog};
    use async_trait::async_trait;
    use fortress_common::network::target::MacAddr;

    struct FixtureScanner {
        delay: Duration,
        fail: bool,
    }

    impl FixtureScanner {
        fn new(delay: Duration) -> Self {
            Self {
                delay,
                fail: false,
            }
        }
    }

    #[async_trait]
    impl NetworkScanner for FixtureScanner {
        async fn scan(&self, _interface: &str, _network: &ScanNetwork) -> anyhow::Result<Vec<Target>> {
            tokio::time::sleep(self.delay).await;
            if self.fail {
                anyhow::bail!("adapter vanished");
            }
            Ok(vec![
                Target::new(MacAddr(0, 0x11, 0x22, 0x33, 0x44, 0x55)).with_signal(-50),
                Target::new(MacAddr(0, 0x11, 0x22, 0x33, 0x44, 0x66)).with_signal(-70),
            ])
        }
    }

    struct StaticVendors;

    impl VendorRepository for StaticVendors {
        fn get_vendor(&self, mac: MacAddr) -> Option<String> {
            (mac.5 == 0x55).then(|| "Acme Radios".to_string())
        }
    }

    fn builder(scanner: FixtureScanner, max_requests: usize) -> (MapperBuilder, Arc<AuditLog>) {
        let audit = Arc::new(AuditLog::in_memory(&AuditKey::generate()));
        let builder = NetworkMapper::builder(
            Arc::new(scanner),
            RateLimiter::new("scan", max_requests, Duration::from_secs(60)),
            audit.clone(),
            MapperSettings {
                scan_timeout: Duration::from_millis(500),
                ..MapperSettings::default()
            },
        );
        (builder, audit)
    }

    fn mapper(scanner: FixtureScanner, max_requests: usize) -> (NetworkMapper, Arc<AuditLog>) {
        let (builder, audit) = builder(scanner, max_requests);
        (builder.build(), audit)
    }

    #[tokio::test]
    async fn scan_returns_enriched_targets_and_audits() {
        let (builder, audit) = builder(FixtureScanner::new(Duration::ZERO), 5);
        let mapper = builder.vendors(Arc::new(StaticVendors)).build();

        let targets = mapper.scan_network("wlan0", "192.168.1.0/24").await.unwrap();

        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].vendor.as_deref(), Some("Acme Radios"));
        assert_eq!(mapper.active_targets().len(), 2);
        let events = audit.events(RunId::system()).unwrap();
        assert!(matches!(events[0].payload, AuditPayload::ScanCompleted { .. }));
    }

    #[tokio::test]
    async fn invalid_input_consumes_no_rate_limit_slot() {
        let (mapper, _audit) = mapper(FixtureScanner::new(Duration::ZERO), 1);

        for bad in ["", "10.0.0.0", "10.0.0.0/33", "not-a-network"] {
            let err = mapper.scan_network("wlan0", bad).await.unwrap_err();
            assert!(matches!(err, Error::InvalidArgument { .. }), "{bad}: {err}");
        }
        let err = mapper.scan_network("", "10.0.0.0/24").await.unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { name: "interface", .. }));

        assert_eq!(mapper.limiter().current_usage(), 0);
        assert!(mapper.scan_network("wlan0", "10.0.0.0/24").await.is_ok());
        assert!(mapper.scan_network("wlan0", "10.0.0.0/24").await.unwrap_err().is_rate_limited());
    }

    #[tokio::test]
    async fn oversized_networks_are_rejected() {
        let (mapper, _audit) = mapper(FixtureScanner::new(Duration::ZERO), 5);
        let err = mapper.scan_network("wlan0", "10.0.0.0/16").await.unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { name: "network_cidr", .. }));
        assert_eq!(mapper.limiter().current_usage(), 0);
    }

    #[tokio::test]
    async fn concurrent_scans_are_capped() {
        let (mapper, _audit) = mapper(FixtureScanner::new(Duration::from_millis(200)), 10);
        let mapper = Arc::new(mapper);

        let mut handles = Vec::new();
        for _ in 0..4 {
            let mapper = mapper.clone();
            handles.push(tokio::spawn(async move {
                mapper.scan_network("wlan0", "10.0.0.0/24").await
            }));
        }

        let mut busy = 0;
        for handle in handles {
            if let Err(Error::ScanBusy { max: 3, .. }) = handle.await.unwrap() {
                busy += 1;
            }
        }
        assert_eq!(busy, 1);
    }

    #[tokio::test]
    async fn backend_failure_is_audited() {
        let mut scanner = FixtureScanner::new(Duration::ZERO);
        scanner.fail = true;
        let (mapper, audit) = mapper(scanner, 5);

        let err = mapper.scan_network("wlan0", "10.0.0.0/24").await.unwrap_err();
        assert!(matches!(err, Error::ScanFailed { .. }));
        let events = audit.events(RunId::system()).unwrap();
        assert!(matches!(events[0].payload, AuditPayload::ScanFailed { .. }));
    }

    #[tokio::test]
    async fn slow_backend_times_out() {
        let (mapper, _audit) = mapper(FixtureScanner::new(Duration::from_secs(5)), 5);
        let err = mapper.scan_network("wlan0", "10.0.0.0/24").await.unwrap_err();
        assert!(matches!(err, Error::ScanFailed { ref reason, .. } if reason.contains("timed out")));
    }

    #[tokio::test]
    async fn continuous_scanning_lifecycle() {
        let (mapper, _audit) = mapper(FixtureScanner::new(Duration::from_millis(300)), 5);

        assert!(matches!(
            mapper
                .start_continuous_scanning("wlan0", "10.0.0.0/24", Duration::from_secs(5))
                .await,
            Err(Error::InvalidArgument { name: "interval", .. })
        ));

        mapper
            .start_continuous_scanning("wlan0", "10.0.0.0/24", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(matches!(
            mapper
                .start_continuous_scanning("wlan0", "10.0.0.0/24", Duration::from_secs(60))
                .await,
            Err(Error::AlreadyRunning(_))
        ));

        // Let the first sweep start, then try to stop it mid-flight.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!mapper.stop_continuous_scanning(Duration::ZERO).await);
        assert!(mapper.stop_continuous_scanning(Duration::from_secs(10)).await);
        assert!(!mapper.is_scanning().await);
        assert_eq!(mapper.target_history().len(), 2);

        // Nothing left to stop.
        assert!(mapper.stop_continuous_scanning(Duration::ZERO).await);
    }
}
