pub mod config;
pub mod plugins;
pub mod report;
pub mod run;
pub mod scan;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use fortress_common::audit::RunId;
use fortress_common::lifecycle::StageKind;
use fortress_core::ReportFormat;

#[derive(Parser)]
#[command(name = "fortress")]
#[command(about = "Orchestrated wireless security assessments.")]
pub struct CommandLine {
    /// Configuration file, created with defaults on the first `config` write
    #[arg(short, long, global = true, default_value = "fortress.toml")]
    pub config: PathBuf,

    /// Skip the banner
    #[arg(long, global = true)]
    pub no_banner: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Sweep a network once
    #[command(alias = "s")]
    Scan { interface: String, network: String },
    /// Sweep a network periodically until interrupted
    #[command(alias = "w")]
    Watch {
        interface: String,
        network: String,
        /// Seconds between sweeps, at least 60 [default: scan.interval]
        #[arg(short, long)]
        interval: Option<u64>,
    },
    /// Run the attack chain, or a single stage followed by a report
    #[command(alias = "r")]
    Run {
        /// Interface to scan from [default: first viable interface]
        #[arg(short, long)]
        interface: Option<String>,
        /// Network to scan [default: the interface's private IPv4 network]
        #[arg(short, long)]
        network: Option<String>,
        /// Execute only this stage (scan, capture, crack, mitm, report)
        #[arg(short, long)]
        stage: Option<StageKind>,
    },
    /// Render the report of a run from the audit log
    Report {
        run: RunId,
        #[arg(short, long)]
        format: Option<ReportFormat>,
        /// Output directory [default: report.dir]
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// List runs recorded in the audit log
    Runs,
    /// Load and list plugins
    #[command(alias = "p")]
    Plugins,
    /// Read or write a configuration value by dotted key
    Config { key: String, value: Option<String> },
}

impl CommandLine {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
