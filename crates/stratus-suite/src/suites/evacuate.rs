//! Force-reboot evacuation: a dead hypervisor's VMs restart elsewhere

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use stratus_harness::cleanup::Scope;
use stratus_harness::cli::{Cli, Tool};
use stratus_harness::error::Result;
use stratus_harness::fixtures::{HarnessContext, Precondition, TestFixture};
use stratus_harness::poll::{wait_for_host_states, wait_for_val, WaitOpts};
use stratus_harness::ssh::client::{RetryPolicy, SshClient};
use stratus_harness::ssh::registry::ScopedSsh;
use stratus_harness::ssh::transport::{HostAccess, SshConnector};
use stratus_harness::table::parse_table;
use stratus_harness::timeouts::{HostTimeout, VmTimeout};
use stratus_harness::PLATFORM_USER;

use crate::harness::{ScenarioOutcome, SuiteHarness};
use crate::suites::{assign_floating_ip, boot_vm, vm_host, VmSource};

pub async fn run(ctx: &Arc<HarnessContext>, harness: &SuiteHarness) {
    harness
        .run("force_reboot_evacuates_vms", || {
            force_reboot_evacuates_vms(ctx.clone())
        })
        .await;
}

/// Colocate four differently-backed VMs on one hypervisor, kill the host
/// with `reboot -f`, and require every VM to restart ACTIVE elsewhere.
/// Once the host returns, live-migrate a VM back and ping it.
async fn force_reboot_evacuates_vms(ctx: Arc<HarnessContext>) -> ScenarioOutcome {
    let fixture = TestFixture::setup(ctx.clone(), "force_reboot_evacuates_vms")
        .await
        .map_err(|e| e.to_string())?;

    let gate = async {
        let shared = ctx.active_client()?;
        let auth = ctx.profile("admin_platform")?;
        let cli = Cli::new(&shared, &auth);
        fixture.min_hypervisors(&cli, 2).await
    }
    .await
    .map_err(|e| e.to_string())?;
    if let Precondition::Skip(skip) = gate {
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
    let platform = ctx.profile("admin_platform")?;
    let tenant = ctx.settings().primary_tenant().clone();
    let auth_url = ctx.settings().auth_url.clone();
    let cli = Cli::new(&shared, &platform);
    let mut tenant_cli = Cli::new(&shared, &tenant);
    if let Some(url) = &auth_url {
        tenant_cli = tenant_cli.auth_url(url);
    }

    ctx.steps.test_step("boot four VMs colocated on one hypervisor")?;
    let anchor = boot_vm(ctx, &tenant_cli, "evac-vol", VmSource::Volume, None).await?;
    let target = vm_host(&tenant_cli, &anchor).await?;
    let mut vms = vec![anchor];
    for (name, source) in [
        ("evac-vol-2", VmSource::Volume),
        ("evac-img", VmSource::Image),
        ("evac-img-vol", VmSource::Image),
    ] {
        vms.push(boot_vm(ctx, &tenant_cli, name, source, Some(&target)).await?);
    }
    // The fourth VM carries an attached data volume through the evacuation.
    let out = tenant_cli
        .exec(Tool::Openstack, "volume create --size 1 evac-data")
        .await?;
    let data_vol = parse_table(&out)?.value_two_col("id")?;
    ctx.cleanup.remove(
        stratus_harness::cleanup::ResourceType::Vm,
        [vms[3].clone()],
        Scope::Function,
    );
    ctx.cleanup
        .add_vm_with_vols(vms[3].clone(), vec![data_vol.clone()], Scope::Function);
    tenant_cli
        .exec(
            Tool::Openstack,
            &format!("server add volume {} {data_vol}", vms[3]),
        )
        .await?;

    ctx.steps.test_step(&format!("force-reboot {target}"))?;
    ctx.recovery.add([target.clone()], Scope::Function);
    let password = ctx.settings().profile("admin_platform")?.password.clone();
    let region = ctx.settings().region.clone();
    let access = HostAccess::new(target.as_str(), PLATFORM_USER, &password);
    let client = SshClient::new(Arc::new(SshConnector::new(access)), None, &password)?;
    let scoped = ScopedSsh::open(&ctx.registry, &region, &target, client, RetryPolicy::default())
        .await?;
    {
        let shell = scoped.client();
        let mut shell = shell.lock().await;
        shell
            .send_sudo("reboot -f", Duration::from_secs(30))
            .await?;
    }
    scoped.close().await;

    ctx.steps.test_step("wait for every VM to evacuate")?;
    for vm in &vms {
        wait_for_evacuated(&tenant_cli, vm, &target).await?;
    }

    ctx.steps.test_step(&format!("wait for {target} to recover"))?;
    wait_for_host_states(
        &cli,
        &target,
        "unlocked",
        "enabled",
        "available",
        WaitOpts::new(HostTimeout::REBOOT),
    )
    .await?;
    ctx.recovery.remove([target.clone()], Scope::Function);

    ctx.steps.test_step("live-migrate a VM back and ping it")?;
    tenant_cli
        .exec(
            Tool::Openstack,
            &format!("server migrate --live-migration --host {target} {}", vms[0]),
        )
        .await?;
    let tcli = &tenant_cli;
    let vm0 = vms[0].as_str();
    wait_for_val(
        &format!("vm {vm0} back on {target}"),
        WaitOpts::new(VmTimeout::LIVE_MIGRATE),
        || async move { vm_host(tcli, vm0).await },
        |host| host == &target,
    )
    .await?;
    let fip = assign_floating_ip(ctx, &tenant_cli, &vms[0]).await?;
    let stats = stratus_harness::fixtures::natbox_ping(ctx, &fip, 5).await?;
    if stats.received == 0 {
        return Err(stratus_harness::Error::resource(
            "vm",
            vms[0].clone(),
            "not pingable after live migration back",
        ));
    }
    info!(host = %target, vms = vms.len(), "evacuation cycle complete");
    Ok(())
}

/// ACTIVE on a hypervisor other than `failed_host`
async fn wait_for_evacuated(cli: &Cli<'_>, vm_id: &str, failed_host: &str) -> Result<()> {
    wait_for_val(
        &format!("vm {vm_id} evacuated off {failed_host}"),
        WaitOpts::new(VmTimeout::EVACUATE),
        || async move {
            let out = cli
                .exec(Tool::Openstack, &format!("server show {vm_id}"))
                .await?;
            let table = parse_table(&out)?;
            let status = table.value_two_col("status")?;
            let host = table.value_two_col("OS-EXT-SRV-ATTR:host")?;
            Ok((status, host))
        },
        |(status, host)| status == "ACTIVE" && host != failed_host,
    )
    .await
    .map(|_| ())
}
