//! Subcloud resync after a central controller swact

use std::sync::Arc;

use tracing::info;

use stratus_harness::cli::{Cli, Tool};
use stratus_harness::error::{Error, Result};
use stratus_harness::fixtures::{HarnessContext, Precondition, TestFixture};
use stratus_harness::poll::{wait_for_subcloud_status, wait_for_val, WaitOpts};
use stratus_harness::ssh::client::RetryPolicy;
use stratus_harness::table::{parse_table, FilterOpts, Match};
use stratus_harness::timeouts::{DcTimeout, HostTimeout};

use crate::harness::{ScenarioOutcome, SuiteHarness};
use crate::suites::{active_controller_host, standby_takes_over};

pub async fn run(ctx: &Arc<HarnessContext>, harness: &SuiteHarness) {
    harness
        .run("subcloud_resync_after_central_swact", || {
            subcloud_resync_after_central_swact(ctx.clone())
        })
        .await;
}

/// Unmanage one subcloud, swact the central controllers underneath it,
/// re-manage it, and require it (and every bystander subcloud) to end up
/// managed/online/in-sync.
async fn subcloud_resync_after_central_swact(ctx: Arc<HarnessContext>) -> ScenarioOutcome {
    let fixture = TestFixture::setup(ctx.clone(), "subcloud_resync_after_central_swact")
        .await
        .map_err(|e| e.to_string())?;
    if !ctx.settings().is_dc {
        fixture.teardown(true).await.map_err(|e| e.to_string())?;
        return Ok(Some(stratus_harness::Skip::new(
            "requires a distributed-cloud system controller",
        )));
    }
    if let Precondition::Skip(skip) = fixture.no_simplex() {
        fixture.teardown(true).await.map_err(|e| e.to_string())?;
        return Ok(Some(skip));
    }

    let body = body(&ctx).await;
    let passed = body.is_ok();
    let teardown = fixture.teardown(passed).await;
    body.map_err(|e| e.to_string())?;
    teardown.map_err(|e| e.to_string())?;
    Ok(None)
}

async fn body(ctx: &Arc<HarnessContext>) -> Result<()> {
    let shared = ctx.active_client()?;
    let auth = ctx.profile("admin_platform")?;
    let cli = Cli::new(&shared, &auth);
    let dc_cli = Cli::new(&shared, &auth).central(true);

    let (primary, bystanders) = partition_subclouds(&dc_cli).await?;

    ctx.steps.test_step(&format!("unmanage {primary}"))?;
    dc_cli
        .exec(Tool::Dcmanager, &format!("subcloud unmanage {primary}"))
        .await?;
    let dcli = &dc_cli;
    let name = primary.as_str();
    wait_for_val(
        &format!("{name} unmanaged"),
        WaitOpts::new(DcTimeout::UNMANAGE),
        || async move { subcloud_tuple(dcli, name).await },
        |(mgmt, _, _)| mgmt == "unmanaged",
    )
    .await?;

    ctx.steps.test_step("swact the central controllers")?;
    let active = active_controller_host(&cli).await?;
    cli.exec(Tool::System, &format!("host-swact {active}")).await?;
    standby_takes_over(&cli, &active, WaitOpts::new(HostTimeout::SWACT)).await?;
    ctx.registry.reconnect_active(RetryPolicy::default()).await?;

    ctx.steps.test_step(&format!("re-manage {primary}"))?;
    dc_cli
        .exec(Tool::Dcmanager, &format!("subcloud manage {primary}"))
        .await?;
    wait_for_subcloud_status(
        &dc_cli,
        &primary,
        "managed",
        "online",
        "in-sync",
        WaitOpts::new(DcTimeout::SYNC),
    )
    .await?;

    ctx.steps.test_step("verify bystander subclouds never left sync")?;
    for name in &bystanders {
        let (mgmt, avail, sync) = subcloud_tuple(&dc_cli, name).await?;
        if (mgmt.as_str(), avail.as_str(), sync.as_str()) != ("managed", "online", "in-sync") {
            return Err(Error::service(
                "dcmanager",
                format!("bystander {name} degraded to {mgmt}/{avail}/{sync}"),
            ));
        }
    }
    info!(primary = %primary, bystanders = bystanders.len(), "dc resync verified");
    Ok(())
}

/// Pick the first fully healthy subcloud as the test subject; the rest of
/// the managed set are bystanders whose state must not move.
async fn partition_subclouds(dc_cli: &Cli<'_>) -> Result<(String, Vec<String>)> {
    let out = dc_cli.exec(Tool::Dcmanager, "subcloud list").await?;
    let healthy = parse_table(&out)?.filter(
        &[
            ("management", Match::is("managed")),
            ("availability", Match::is("online")),
            ("sync", Match::is("in-sync")),
        ],
        FilterOpts::default(),
    )?;
    let mut names = healthy.column("name")?.into_iter();
    let primary = names
        .next()
        .ok_or_else(|| Error::no_match("a managed/online/in-sync subcloud"))?;
    Ok((primary, names.collect()))
}

async fn subcloud_tuple(dc_cli: &Cli<'_>, name: &str) -> Result<(String, String, String)> {
    let out = dc_cli.exec(Tool::Dcmanager, "subcloud list").await?;
    let rows = parse_table(&out)?.filter(&[("name", Match::is(name))], FilterOpts::default())?;
    if rows.values.is_empty() {
        return Err(Error::no_match(format!("subcloud '{name}'")));
    }
    Ok((
        rows.column("management")?[0].clone(),
        rows.column("availability")?[0].clone(),
        rows.column("sync")?[0].clone(),
    ))
}
