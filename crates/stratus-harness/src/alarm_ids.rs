//! Fault-management alarm identities the harness keys on
//!
//! Alarm identity is the `(alarm_id, entity_instance_id, severity)` tuple;
//! reason text is display-only and excluded from comparisons.

/// Well-known alarm IDs
pub struct AlarmId;

impl AlarmId {
    /// Host was administratively locked
    pub const HOST_LOCKED: &'static str = "200.001";
    /// Host experienced a service-affecting failure
    pub const HOST_FAILED: &'static str = "200.004";
    /// Configuration is out-of-date on a host
    pub const CONFIG_OUT_OF_DATE: &'static str = "250.001";
    /// Controller filesystem / DRBD data sync in progress
    pub const CON_DRBD_SYNC: &'static str = "400.001";
    /// Loss of service redundancy
    pub const SERVICE_REDUNDANCY: &'static str = "400.002";
    /// VM failed or is being evacuated
    pub const VM_FAILED: &'static str = "700.001";
    /// VM is being live-migrated
    pub const VM_LIVE_MIGRATING: &'static str = "700.009";
    /// Platform application apply in progress
    pub const APP_APPLY_IN_PROGRESS: &'static str = "750.004";
    /// NTP configuration does not agree with peers
    pub const NTP_ALARM: &'static str = "100.114";
    /// Subcloud sync out-of-date
    pub const DC_SYNC: &'static str = "280.002";
}

/// Alarm IDs that the baseline guard always ignores when they show up as
/// new after a test. These set and clear on their own during normal
/// maintenance activity and would make unrelated tests flaky.
pub const DEFAULT_ALARM_WHITELIST: &[&str] = &[
    AlarmId::CONFIG_OUT_OF_DATE,
    AlarmId::APP_APPLY_IN_PROGRESS,
    AlarmId::NTP_ALARM,
];
