//! Basic reachability of every inventory host

use std::sync::Arc;

use tracing::info;

use stratus_harness::cli::{Cli, Tool};
use stratus_harness::fixtures::HarnessContext;
use stratus_harness::poll::ping_from;
use stratus_harness::ssh::client::{RetryPolicy, SshClient};
use stratus_harness::ssh::registry::ScopedSsh;
use stratus_harness::ssh::transport::{HostAccess, SshConnector};
use stratus_harness::table::{parse_table, FilterOpts, Match};
use stratus_harness::{Error, TestFixture, PLATFORM_USER};

use crate::harness::{ScenarioOutcome, SuiteHarness};
use crate::suites::inventory_hostnames;

pub async fn run(ctx: &Arc<HarnessContext>, harness: &SuiteHarness) {
    harness
        .run("ping_all_hosts", || ping_all_hosts(ctx.clone()))
        .await;
    harness
        .run("ssh_all_online_hosts", || ssh_all_online_hosts(ctx.clone()))
        .await;
}

/// 100 echoes to every inventory host from the active controller; any loss
/// on the management network is a defect.
async fn ping_all_hosts(ctx: Arc<HarnessContext>) -> ScenarioOutcome {
    let fixture = TestFixture::setup(ctx.clone(), "ping_all_hosts")
        .await
        .map_err(|e| e.to_string())?;
    let body = async {
        let shared = ctx.active_client()?;
        let auth = ctx.profile("admin_platform")?;
        let cli = Cli::new(&shared, &auth);
        let hosts = inventory_hostnames(&cli).await?;

        for host in &hosts {
            ctx.steps.test_step(&format!("ping {host} with 100 echoes"))?;
            let stats = ping_from(&shared, host, 100).await?;
            if stats.transmitted != 100 || stats.loss() != 0 {
                return Err(Error::host_op(
                    host,
                    "ping",
                    format!(
                        "{} transmitted, {} received",
                        stats.transmitted, stats.received
                    ),
                ));
            }
        }
        info!(hosts = hosts.len(), "all hosts pingable with zero loss");
        Ok(())
    }
    .await;

    let passed = body.is_ok();
    let teardown = fixture.teardown(passed).await;
    body.map_err(|e: Error| e.to_string())?;
    teardown.map_err(|e| e.to_string())?;
    Ok(None)
}

/// Open an authenticated shell to every host that is available or online
async fn ssh_all_online_hosts(ctx: Arc<HarnessContext>) -> ScenarioOutcome {
    let fixture = TestFixture::setup(ctx.clone(), "ssh_all_online_hosts")
        .await
        .map_err(|e| e.to_string())?;
    let body = async {
        let shared = ctx.active_client()?;
        let auth = ctx.profile("admin_platform")?;
        let cli = Cli::new(&shared, &auth);
        let out = cli.exec(Tool::System, "host-list --nowrap").await?;
        let table = parse_table(&out)?;
        let mut reachable: Vec<String> = table
            .filter(
                &[("availability", Match::is("available"))],
                FilterOpts::default(),
            )?
            .column("hostname")?;
        reachable.extend(
            table
                .filter(
                    &[("availability", Match::is("online"))],
                    FilterOpts::default(),
                )?
                .column("hostname")?,
        );

        let (region, password) = {
            let s = ctx.settings();
            (s.region.clone(), s.profile("admin_platform")?.password.clone())
        };
        for host in &reachable {
            ctx.steps.test_step(&format!("open shell on {host}"))?;
            let access = HostAccess::new(host.as_str(), PLATFORM_USER, &password);
            let client = SshClient::new(
                Arc::new(SshConnector::new(access)),
                None,
                &password,
            )?;
            let scoped = ScopedSsh::open(
                &ctx.registry,
                &region,
                host,
                client,
                RetryPolicy::default(),
            )
            .await
            .map_err(|e| Error::host_op(host, "ssh", e.to_string()))?;
            scoped.close().await;
        }
        info!(hosts = reachable.len(), "all online hosts accept ssh");
        Ok(())
    }
    .await;

    let passed = body.is_ok();
    let teardown = fixture.teardown(passed).await;
    body.map_err(|e: Error| e.to_string())?;
    teardown.map_err(|e| e.to_string())?;
    Ok(None)
}
