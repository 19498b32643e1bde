//! Suite runner: establishes a lab session and drives the selected
//! scenario suites against it.
//!
//! ```bash
//! cargo run --features live-e2e -- \
//!     --labs-file labs.json5 --lab wcp_3_6 --log-dir /tmp/stratus \
//!     --suite connectivity --suite alarms
//! ```

mod harness;
#[cfg(feature = "live-e2e")]
mod suites;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use tracing::error;

use stratus_harness::settings::{LabDescriptor, LogPaths, NatBoxDescriptor};
use stratus_harness::steplog::init_session_logging;

/// Lab catalog file: every lab the runner knows about, plus the shared
/// NAT box when the rig has one.
#[derive(Debug, Deserialize)]
#[allow(dead_code)]
struct LabCatalog {
    labs: Vec<LabDescriptor>,
    #[serde(default)]
    natbox: Option<NatBoxDescriptor>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum SuiteName {
    Alarms,
    Connectivity,
    Swact,
    Evacuate,
    Dc,
}

#[derive(Parser, Debug)]
#[command(name = "stratus-suite", about = "End-to-end suites for a Stratus lab")]
struct Args {
    /// Lab short name, human name, or floating IP
    #[arg(long)]
    lab: String,

    /// JSON5 catalog of lab descriptors
    #[arg(long, default_value = "labs.json5")]
    labs_file: PathBuf,

    /// Directory for the session log and per-failure artifacts
    #[arg(long, default_value = "/tmp/stratus-logs")]
    log_dir: PathBuf,

    /// Primary tenant profile for OpenStack operations
    #[arg(long, default_value = "tenant1")]
    tenant: String,

    /// Collect logs from all hosts at session end
    #[arg(long)]
    collect_all: bool,

    /// Run Horizon-driven checks with a visible browser
    #[arg(long)]
    horizon_visible: bool,

    /// Suites to run; repeat the flag to select several. Default: all.
    #[arg(long, value_enum)]
    suite: Vec<SuiteName>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let logs = LogPaths::derive(&args.log_dir);
    if let Err(e) = init_session_logging(&logs) {
        eprintln!("cannot initialize logging: {e}");
        return ExitCode::FAILURE;
    }

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("suite run failed: {e}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(feature = "live-e2e")]
async fn run(args: Args) -> Result<(), String> {
    use stratus_harness::assets::load_json5;
    use stratus_harness::settings::{FeatureFlags, SessionConfig};
    use stratus_harness::Session;
    use tracing::info;

    let catalog: LabCatalog = load_json5(&args.labs_file).map_err(|e| e.to_string())?;
    let lab = LabDescriptor::lookup(&catalog.labs, &args.lab)
        .map_err(|e| e.to_string())?
        .clone();
    info!(lab = %lab.short_name, "establishing session");

    let session = Session::establish(SessionConfig {
        lab,
        natbox: catalog.natbox,
        log_dir: args.log_dir.clone(),
        primary_tenant: args.tenant.clone(),
        flags: FeatureFlags {
            collect_all: args.collect_all,
            always_collect: false,
            horizon_visible: args.horizon_visible,
        },
    })
    .await
    .map_err(|e| e.to_string())?;

    let selected = |name: SuiteName| args.suite.is_empty() || args.suite.contains(&name);
    let ctx = &session.ctx;
    let report = harness::SuiteHarness::new("stratus e2e");
    if selected(SuiteName::Connectivity) {
        suites::connectivity::run(ctx, &report).await;
    }
    if selected(SuiteName::Alarms) {
        suites::alarms::run(ctx, &report).await;
    }
    if selected(SuiteName::Swact) {
        suites::swact::run(ctx, &report).await;
    }
    if selected(SuiteName::Evacuate) {
        suites::evacuate::run(ctx, &report).await;
    }
    if selected(SuiteName::Dc) {
        suites::dc::run(ctx, &report).await;
    }

    let verdict = report.finish();
    let finish = session.finish().await.map_err(|e| e.to_string());
    verdict?;
    finish
}

#[cfg(not(feature = "live-e2e"))]
async fn run(_args: Args) -> Result<(), String> {
    Err("built without the live-e2e feature; rebuild with --features live-e2e".to_string())
}
