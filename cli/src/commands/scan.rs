use std::time::{Duration, Instant};

use colored::*;
use fortress_common::network::target::Target;
use tracing::{info, warn};

use crate::app::App;
use crate::terminal::{colors, print, spinner};

type Detail = (String, ColoredString);

pub async fn scan(app: &mut App, interface: &str, network: &str) -> anyhow::Result<()> {
    let mapper = app.mapper()?;
    warn_unprivileged();

    spinner::start(format!("Sweeping {network} on {interface}..."));
    let start_time = Instant::now();
    let result = mapper.scan_network(interface, network).await;
    spinner::finish();

    let targets = result?;
    print_targets(&targets, start_time.elapsed());
    Ok(())
}

pub async fn watch(app: &mut App, interface: &str, network: &str, interval: Option<u64>) -> anyhow::Result<()> {
    let mapper = app.mapper()?;
    warn_unprivileged();

    let interval = interval
        .map(Duration::from_secs)
        .unwrap_or_else(|| app.cfg.get_secs("scan.interval", 300));
    mapper.start_continuous_scanning(interface, network, interval).await?;
    info!("watching {network} every {}s, press ctrl-c to stop", interval.as_secs());

    let start_time = Instant::now();
    tokio::signal::ctrl_c().await?;

    spinner::start("Waiting for the current sweep to finish...");
    let timeout = app.cfg.get_secs("scan.timeout", 30);
    while !mapper.stop_continuous_scanning(timeout).await {
        warn!("sweep still in flight after {}s, waiting again", timeout.as_secs());
    }
    spinner::finish();

    print_targets(&mapper.target_history(), start_time.elapsed());
    Ok(())
}

fn warn_unprivileged() {
    if !is_root::is_root() {
        warn!("not running as root, the sweep tool may be unable to open the interface");
    }
}

fn print_targets(targets: &[Target], total_time: Duration) {
    if targets.is_empty() {
        print::header("zero targets detected");
        print::no_results("targets");
        return;
    }

    print::header("network map");
    for (idx, target) in targets.iter().enumerate() {
        print::tree_head(idx, &target.display_name());
        print::as_tree_one_level(target_details(target));
        if idx + 1 != targets.len() {
            print::print("");
        }
    }

    let found: ColoredString = format!("{} targets", targets.len()).bold().green();
    let elapsed: ColoredString = format!("{:.2}s", total_time.as_secs_f64()).bold().yellow();
    print::fat_separator();
    print::centerln(&format!("Mapping complete: {found} identified in {elapsed}"));
}

fn target_details(target: &Target) -> Vec<Detail> {
    let mut details: Vec<Detail> = vec![("MAC".to_string(), target.id.to_string().color(colors::MAC_ADDR))];
    if let Some(ip) = target.ip {
        details.push(("IP".to_string(), ip.to_string().color(colors::IPV4_ADDR)));
    }
    if let Some(vendor) = &target.vendor {
        details.push(("Vendor".to_string(), vendor.normal()));
    }
    details.push(("Security".to_string(), target.security.to_string().normal()));
    if let Some(dbm) = target.signal_dbm {
        details.push(("Signal".to_string(), format!("{dbm} dBm").normal()));
    }
    details.push((
        "Seen".to_string(),
        target.last_seen.format("%H:%M:%S").to_string().dimmed(),
    ));
    details
}
