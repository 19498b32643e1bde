//! Live lab scenarios
//!
//! Each suite drives a real lab end to end through the harness context.
//! Scenarios are written run-all-and-report: the fixture teardown always
//! executes, and precondition gates surface as skips, not failures.

use std::sync::Arc;

use stratus_harness::cleanup::{ResourceType, Scope};
use stratus_harness::cli::{Cli, Tool};
use stratus_harness::error::{Error, Result};
use stratus_harness::fixtures::HarnessContext;
use stratus_harness::poll::{wait_for_val, wait_for_vm_status, WaitOpts};
use stratus_harness::table::{parse_table, FilterOpts, Match};
use stratus_harness::timeouts::{VmTimeout, VolumeTimeout};

pub mod alarms;
pub mod connectivity;
pub mod dc;
pub mod evacuate;
pub mod swact;

/// Guest image preloaded on every lab
pub const GUEST_IMAGE: &str = "tis-centos-guest";
/// Default tenant flavor
pub const FLAVOR: &str = "small";
/// Tenant management network VMs boot on
pub const TENANT_NET: &str = "tenant1-mgmt-net";
/// External network floating IPs are allocated from
pub const EXTERNAL_NET: &str = "external-net0";

/// How a VM gets its root disk
pub enum VmSource {
    Image,
    /// Boot from a volume created out of the guest image
    Volume,
}

/// Boot a VM and register it (and any boot volume) for function-scope
/// cleanup. Returns the server id.
pub async fn boot_vm(
    ctx: &Arc<HarnessContext>,
    cli: &Cli<'_>,
    name: &str,
    source: VmSource,
    host: Option<&str>,
) -> Result<String> {
    let mut create = String::from("server create");
    match source {
        VmSource::Image => {
            create.push_str(&format!(" --image {GUEST_IMAGE}"));
        }
        VmSource::Volume => {
            let vol_name = format!("{name}-boot");
            let out = cli
                .exec(
                    Tool::Openstack,
                    &format!("volume create --image {GUEST_IMAGE} --size 2 {vol_name}"),
                )
                .await?;
            let vol_id = parse_table(&out)?.value_two_col("id")?;
            ctx.cleanup
                .add(ResourceType::Volume, [vol_id.clone()], Scope::Function);
            let vol = vol_id.as_str();
            wait_for_val(
                &format!("volume {vol_name} available"),
                WaitOpts::new(VolumeTimeout::CREATE),
                || async move {
                    let out = cli
                        .exec(Tool::Openstack, &format!("volume show {vol}"))
                        .await?;
                    parse_table(&out)?.value_two_col("status")
                },
                |status| status == "available",
            )
            .await?;
            create.push_str(&format!(" --volume {vol_id}"));
        }
    }
    create.push_str(&format!(" --flavor {FLAVOR} --network {TENANT_NET}"));
    if let Some(host) = host {
        create.push_str(&format!(" --availability-zone nova:{host}"));
    }
    create.push(' ');
    create.push_str(name);

    let out = cli.exec(Tool::Openstack, &create).await?;
    let vm_id = parse_table(&out)?.value_two_col("id")?;
    ctx.cleanup
        .add(ResourceType::Vm, [vm_id.clone()], Scope::Function);

    wait_for_vm_status(cli, &vm_id, &["ACTIVE"], WaitOpts::new(VmTimeout::BOOT)).await?;
    Ok(vm_id)
}

/// Allocate a floating IP, attach it to the VM, and register it for
/// cleanup. Returns the address.
pub async fn assign_floating_ip(
    ctx: &Arc<HarnessContext>,
    cli: &Cli<'_>,
    vm_id: &str,
) -> Result<String> {
    let out = cli
        .exec(Tool::Openstack, &format!("floating ip create {EXTERNAL_NET}"))
        .await?;
    let table = parse_table(&out)?;
    let fip_id = table.value_two_col("id")?;
    let address = table.value_two_col("floating_ip_address")?;
    ctx.cleanup
        .add(ResourceType::FloatingIp, [fip_id], Scope::Function);

    cli.exec(
        Tool::Openstack,
        &format!("server add floating ip {vm_id} {address}"),
    )
    .await?;
    Ok(address)
}

/// Hypervisor currently hosting the VM
pub async fn vm_host(cli: &Cli<'_>, vm_id: &str) -> Result<String> {
    let out = cli
        .exec(Tool::Openstack, &format!("server show {vm_id}"))
        .await?;
    parse_table(&out)?.value_two_col("OS-EXT-SRV-ATTR:host")
}

/// Controller currently holding the active role
pub async fn active_controller_host(cli: &Cli<'_>) -> Result<String> {
    let out = cli.exec(Tool::System, "host-list --nowrap").await?;
    let controllers = parse_table(&out)?.filter(
        &[("personality", Match::is("controller"))],
        FilterOpts::default(),
    )?;
    for name in controllers.column("hostname")? {
        let show = cli
            .exec(Tool::System, &format!("host-show {name} --nowrap"))
            .await?;
        if parse_table(&show)?
            .value_two_col("capabilities")?
            .contains("Controller-Active")
        {
            return Ok(name);
        }
    }
    Err(Error::no_match("active controller"))
}

/// Wait until a controller other than `old_active` holds the active role.
/// Returns the new active controller's hostname. sysinv refuses commands
/// for part of the transition, so rejections count as not-there-yet.
pub async fn standby_takes_over(
    cli: &Cli<'_>,
    old_active: &str,
    opts: WaitOpts,
) -> Result<String> {
    wait_for_val(
        &format!("standby takes over from {old_active}"),
        opts,
        || async move {
            let out = cli.try_exec(Tool::System, "host-list --nowrap").await?;
            if !out.succeeded() {
                return Ok(String::new());
            }
            let controllers = parse_table(&out.output)?.filter(
                &[("personality", Match::is("controller"))],
                FilterOpts::default(),
            )?;
            for name in controllers.column("hostname")? {
                if name == old_active {
                    continue;
                }
                let show = cli
                    .try_exec(Tool::System, &format!("host-show {name} --nowrap"))
                    .await?;
                if !show.succeeded() {
                    continue;
                }
                if parse_table(&show.output)?
                    .value_two_col("capabilities")?
                    .contains("Controller-Active")
                {
                    return Ok(name);
                }
            }
            Ok(String::new())
        },
        |winner| !winner.is_empty(),
    )
    .await
}

/// All hostnames in the inventory
pub async fn inventory_hostnames(cli: &Cli<'_>) -> Result<Vec<String>> {
    let out = cli.exec(Tool::System, "host-list --nowrap").await?;
    parse_table(&out)?.column("hostname")
}
