//! Timeout buckets for platform operations
//!
//! Every value is an upper bound handed to the poll engine, never a sleep.
//! The grouping is deliberate: host-operation budgets are reviewed against
//! maintenance SLAs, VM budgets against nova/vim behavior, DC budgets
//! against audit intervals. Keep new constants in the bucket they belong to.

use std::time::Duration;

/// Default interval between polls when a waiter does not override it
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(3);

/// Budgets for host maintenance operations
pub struct HostTimeout;

impl HostTimeout {
    /// `system host-lock` to administrative=locked
    pub const LOCK: Duration = Duration::from_secs(600);
    /// `system host-unlock` through reboot to unlocked/enabled/available
    pub const UNLOCK: Duration = Duration::from_secs(1800);
    /// Controlled swact completion, standby takes over
    pub const SWACT: Duration = Duration::from_secs(900);
    /// Host reboot until ssh-able again
    pub const REBOOT: Duration = Duration::from_secs(2400);
    /// Availability transition to online/offline after an action
    pub const ONLINE_AFTER_LOCK: Duration = Duration::from_secs(1200);
    /// Hypervisor state up after unlock (OpenStack deployments only)
    pub const HYPERVISOR_UP: Duration = Duration::from_secs(300);
    /// Web service restored after a controller transition
    pub const WEB_SERVICE_UP: Duration = Duration::from_secs(180);
    /// Ping a platform host from the active controller
    pub const PING: Duration = Duration::from_secs(300);
}

/// Budgets for VM lifecycle operations
pub struct VmTimeout;

impl VmTimeout {
    /// Boot to ACTIVE
    pub const BOOT: Duration = Duration::from_secs(1800);
    /// Status transition after stop/start/pause
    pub const STATUS_CHANGE: Duration = Duration::from_secs(300);
    /// First successful ping from the NAT box after boot/migrate
    pub const PING_FROM_NATBOX: Duration = Duration::from_secs(240);
    /// Live migration completion
    pub const LIVE_MIGRATE: Duration = Duration::from_secs(800);
    /// Evacuation of all VMs off a failed host
    pub const EVACUATE: Duration = Duration::from_secs(600);
    /// VM deletion observed gone
    pub const DELETE: Duration = Duration::from_secs(180);
}

/// Budgets for volume operations
pub struct VolumeTimeout;

impl VolumeTimeout {
    /// Create to status=available
    pub const CREATE: Duration = Duration::from_secs(1800);
    /// Delete observed gone
    pub const DELETE: Duration = Duration::from_secs(90);
    /// Attach/detach observed in volume list
    pub const ATTACH: Duration = Duration::from_secs(120);
}

/// Budgets for the fault-management event log
pub struct EventLogTimeout;

impl EventLogTimeout {
    /// A set/clear event appears in `fm event-list`
    pub const EVENT_APPEARS: Duration = Duration::from_secs(120);
    /// An expected alarm appears in `fm alarm-list`
    pub const ALARM_APPEARS: Duration = Duration::from_secs(120);
    /// Unexpected post-test alarms given time to clear
    pub const ALARM_CLEARS: Duration = Duration::from_secs(300);
    /// DRBD sync alarm (400.001) clear after controller data sync
    pub const DRBD_SYNC: Duration = Duration::from_secs(1200);
}

/// Budgets for upgrade and patch orchestration
pub struct UpgradeTimeout;

impl UpgradeTimeout {
    /// `sw-manager` / `software` upload completes
    pub const UPLOAD: Duration = Duration::from_secs(900);
    /// Strategy apply for one host
    pub const STRATEGY_HOST: Duration = Duration::from_secs(3600);
    /// Full strategy apply
    pub const STRATEGY_APPLY: Duration = Duration::from_secs(14400);
    /// Platform application apply/reapply returns to applied
    pub const APP_APPLY: Duration = Duration::from_secs(3600);
}

/// Budgets for distributed-cloud synchronization
pub struct DcTimeout;

impl DcTimeout {
    /// Subcloud reaches managed/online/in-sync after manage
    pub const SYNC: Duration = Duration::from_secs(1800);
    /// Subcloud audit notices an availability change
    pub const AUDIT: Duration = Duration::from_secs(600);
    /// Subcloud unmanage acknowledged
    pub const UNMANAGE: Duration = Duration::from_secs(300);
}

/// Budgets for Kubernetes resources on the platform
pub struct K8sTimeout;

impl K8sTimeout {
    /// All pods in a namespace Running/Completed
    pub const PODS_READY: Duration = Duration::from_secs(600);
    /// All nodes Ready
    pub const NODES_READY: Duration = Duration::from_secs(600);
    /// Single pod deletion observed gone
    pub const POD_DELETE: Duration = Duration::from_secs(120);
}
