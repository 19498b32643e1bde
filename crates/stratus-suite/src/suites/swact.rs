//! Controller swact with tenant traffic in flight

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use stratus_harness::cli::{Cli, Tool};
use stratus_harness::error::Result;
use stratus_harness::fixtures::{standby_controller, HarnessContext, Precondition, TestFixture};
use stratus_harness::poll::{wait_for_nodes_ready, wait_for_pingable, wait_for_val, WaitOpts};
use stratus_harness::ssh::client::RetryPolicy;
use stratus_harness::table::{parse_table, FilterOpts, Match};
use stratus_harness::timeouts::{HostTimeout, K8sTimeout, VmTimeout};

use crate::harness::{ScenarioOutcome, SuiteHarness};
use crate::suites::{active_controller_host, assign_floating_ip, boot_vm, standby_takes_over, VmSource};

pub async fn run(ctx: &Arc<HarnessContext>, harness: &SuiteHarness) {
    harness
        .run("swact_preserves_vm_connectivity", || {
            swact_preserves_vm_connectivity(ctx.clone())
        })
        .await;
}

/// Boot one image-backed and one volume-backed VM, swact, and require both
/// to stay reachable while the platform converges behind the new active
/// controller.
async fn swact_preserves_vm_connectivity(ctx: Arc<HarnessContext>) -> ScenarioOutcome {
    let fixture = TestFixture::setup(ctx.clone(), "swact_preserves_vm_connectivity")
        .await
        .map_err(|e| e.to_string())?;
    if let Precondition::Skip(skip) = fixture.no_simplex() {
        fixture.teardown(true).await.map_err(|e| e.to_string())?;
        return Ok(Some(skip));
    }
    {
        let shared = ctx.active_client().map_err(|e| e.to_string())?;
        let auth = ctx.profile("admin_platform").map_err(|e| e.to_string())?;
        let cli = Cli::new(&shared, &auth);
        if let Precondition::Skip(skip) = fixture
            .stx_openstack_required(&cli)
            .await
            .map_err(|e| e.to_string())?
        {
            fixture.teardown(true).await.map_err(|e| e.to_string())?;
            return Ok(Some(skip));
        }
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
    let platform = ctx.profile("admin_platform")?;
    let tenant = ctx.settings().primary_tenant().clone();
    let auth_url = ctx.settings().auth_url.clone();
    let cli = Cli::new(&shared, &platform);
    let mut tenant_cli = Cli::new(&shared, &tenant);
    if let Some(url) = &auth_url {
        tenant_cli = tenant_cli.auth_url(url);
    }

    ctx.steps.test_step("boot one image-backed and one volume-backed VM")?;
    let vm_image = boot_vm(ctx, &tenant_cli, "swact-img", VmSource::Image, None).await?;
    let vm_volume = boot_vm(ctx, &tenant_cli, "swact-vol", VmSource::Volume, None).await?;
    let fip_image = assign_floating_ip(ctx, &tenant_cli, &vm_image).await?;
    let fip_volume = assign_floating_ip(ctx, &tenant_cli, &vm_volume).await?;
    for fip in [&fip_image, &fip_volume] {
        stratus_harness::fixtures::natbox_ping(ctx, fip, 3).await?;
    }

    let active = active_controller_host(&cli).await?;
    let standby = standby_controller(&cli).await?;
    ctx.steps.test_step(&format!("swact from {active} to {standby}"))?;
    cli.exec(Tool::System, &format!("host-swact {active}")).await?;

    let new_active = standby_takes_over(&cli, &active, WaitOpts::new(HostTimeout::SWACT)).await?;
    if new_active != standby {
        return Err(stratus_harness::Error::host_op(
            &standby,
            "swact",
            format!("active role landed on {new_active}"),
        ));
    }

    ctx.steps.test_step("reconnect the floating-IP channel")?;
    ctx.registry.reconnect_active(RetryPolicy::default()).await?;
    // Keystone endpoint re-registration after swact exposes no observable
    // condition to poll on.
    tokio::time::sleep(Duration::from_secs(20)).await;

    ctx.steps.test_step("verify both VMs stayed reachable")?;
    let natbox = ctx
        .registry
        .active_controller(stratus_harness::fixtures::NATBOX_REGION)?;
    for fip in [&fip_image, &fip_volume] {
        let stats = wait_for_pingable(
            &natbox,
            fip,
            10,
            WaitOpts::new(Duration::from_secs(30)).interval(Duration::from_secs(5)),
        )
        .await?;
        info!(target = %fip, received = stats.received, "vm reachable after swact");
    }

    ctx.steps.test_step("verify platform services converge")?;
    wait_for_service_groups_active(&cli).await?;
    wait_for_neutron_agents_alive(&tenant_cli).await?;
    wait_for_nodes_ready(&cli, WaitOpts::new(K8sTimeout::NODES_READY)).await?;

    // VMs stay on their hypervisors over a swact; status must still be ACTIVE.
    for vm in [&vm_image, &vm_volume] {
        stratus_harness::poll::wait_for_vm_status(
            &tenant_cli,
            vm,
            &["ACTIVE"],
            WaitOpts::new(VmTimeout::STATUS_CHANGE),
        )
        .await?;
    }
    Ok(())
}

/// Every `system servicegroup-list` row reaches state=active
async fn wait_for_service_groups_active(cli: &Cli<'_>) -> Result<()> {
    wait_for_val(
        "all service groups active",
        WaitOpts::new(HostTimeout::WEB_SERVICE_UP),
        || async move {
            let out = cli.exec(Tool::System, "servicegroup-list").await?;
            let table = parse_table(&out)?;
            let stragglers = table
                .filter(&[("state", Match::not("active"))], FilterOpts::default())?
                .values
                .len();
            Ok(stragglers)
        },
        |stragglers| *stragglers == 0,
    )
    .await
    .map(|_| ())
}

/// Every neutron agent reports alive
async fn wait_for_neutron_agents_alive(cli: &Cli<'_>) -> Result<()> {
    wait_for_val(
        "all neutron agents alive",
        WaitOpts::new(HostTimeout::WEB_SERVICE_UP),
        || async move {
            let out = cli.exec(Tool::Openstack, "network agent list").await?;
            let table = parse_table(&out)?;
            let dead: Vec<String> = table
                .filter(&[("alive", Match::not(":-)"))], FilterOpts::default())?
                .column("agent type")?;
            Ok(dead)
        },
        |dead: &Vec<String>| dead.is_empty(),
    )
    .await
    .map(|_| ())
}
