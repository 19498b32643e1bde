//! Session settings: lab identity, credentials, log layout, feature flags
//!
//! There is deliberately no process-wide registry here. A [`Settings`] value
//! is built once at session setup and owned by the harness context; parallel
//! workers each hold their own. Fields that are session-immutable (lab, log
//! dir, region) may be cached by callers; everything else must be re-read.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Identity of the lab under test. Immutable for the whole session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabDescriptor {
    /// Stable short name used as the lookup key (e.g. "wcp_3_6")
    pub short_name: String,
    /// Human-readable name
    pub name: String,
    /// OAM floating IP of the controller pair
    pub floating_ip: String,
    /// controller-0 OAM IP
    pub controller0_ip: String,
    /// controller-1 OAM IP, absent on simplex labs
    #[serde(default)]
    pub controller1_ip: Option<String>,
    /// Subcloud short names when this lab is a DC system controller
    #[serde(default)]
    pub subclouds: Vec<String>,
    /// Non-default shell prompt pattern, when the lab image customizes it
    #[serde(default)]
    pub prompt_override: Option<String>,
}

impl LabDescriptor {
    /// Find a lab by short name, human name, or floating IP.
    pub fn lookup<'a>(labs: &'a [LabDescriptor], query: &str) -> Result<&'a LabDescriptor> {
        labs.iter()
            .find(|l| {
                l.short_name.eq_ignore_ascii_case(query)
                    || l.name.eq_ignore_ascii_case(query)
                    || l.floating_ip == query
            })
            .ok_or_else(|| {
                let known: Vec<&str> = labs.iter().map(|l| l.short_name.as_str()).collect();
                Error::Config(format!(
                    "unknown lab '{}'; known labs: {}",
                    query,
                    known.join(", ")
                ))
            })
    }
}

/// The NAT box used to reach tenant VM floating IPs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NatBoxDescriptor {
    pub ip: String,
    pub user: String,
    pub password: String,
    #[serde(default)]
    pub prompt: Option<String>,
}

/// A named credential used to scope CLI invocations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthProfile {
    /// Symbolic name: `admin`, `admin_platform`, `tenant1`, `tenant2`
    pub name: String,
    pub user: String,
    pub password: String,
    pub project: String,
    pub project_domain: String,
    pub user_domain: String,
    /// Keystone endpoint interface (internal/public/admin)
    pub endpoint_type: String,
    /// Region the profile is pinned to; labs are referenced by short name
    /// only, never by descriptor, to keep profiles cycle-free
    #[serde(default)]
    pub region: Option<String>,
    /// true: platform keystone (bare `system`/`fm`); false: OpenStack
    pub platform: bool,
}

impl AuthProfile {
    /// The OpenStack admin profile with default lab credentials
    pub fn admin() -> Self {
        Self {
            name: "admin".to_string(),
            user: "admin".to_string(),
            password: "Li69nux*".to_string(),
            project: "admin".to_string(),
            project_domain: "Default".to_string(),
            user_domain: "Default".to_string(),
            endpoint_type: "internal".to_string(),
            region: None,
            platform: false,
        }
    }

    /// The platform-keystone admin profile
    pub fn admin_platform() -> Self {
        Self {
            name: "admin_platform".to_string(),
            platform: true,
            ..Self::admin()
        }
    }

    /// A tenant profile with the lab's default tenant credentials
    pub fn tenant(name: &str) -> Self {
        Self {
            name: name.to_string(),
            user: name.to_string(),
            password: "Li69nux*".to_string(),
            project: name.to_string(),
            ..Self::admin()
        }
    }
}

/// System topology discovered from `system show` at session setup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SystemType {
    /// Single all-in-one node
    Simplex,
    /// Two all-in-one nodes
    Duplex,
    /// Dedicated controllers plus workers
    Standard,
    /// Standard with dedicated storage hosts
    Storage,
}

impl SystemType {
    pub fn is_simplex(self) -> bool {
        matches!(self, SystemType::Simplex)
    }

    /// All-in-one topologies (controller doubles as worker)
    pub fn is_aio(self) -> bool {
        matches!(self, SystemType::Simplex | SystemType::Duplex)
    }
}

/// Session feature flags
#[derive(Debug, Clone, Copy, Default)]
pub struct FeatureFlags {
    /// Collect logs from all hosts at session end
    pub collect_all: bool,
    /// Collect even when every test passed
    pub always_collect: bool,
    /// Run Horizon-driven checks with a visible browser
    pub horizon_visible: bool,
}

/// Per-session log directory layout, derived once from the base directory
#[derive(Debug, Clone)]
pub struct LogPaths {
    pub base: PathBuf,
    pub temp: PathBuf,
    pub ping_failures: PathBuf,
    pub guest_logs: PathBuf,
    pub horizon: PathBuf,
}

impl LogPaths {
    /// Derive the sub-paths. Directories are created on first use, not here.
    pub fn derive(base: impl AsRef<Path>) -> Self {
        let base = base.as_ref().to_path_buf();
        Self {
            temp: base.join("tmp"),
            ping_failures: base.join("ping_failures"),
            guest_logs: base.join("guest_logs"),
            horizon: base.join("horizon"),
            base,
        }
    }

    /// Session logfile path
    pub fn session_log(&self) -> PathBuf {
        self.base.join("TIS_AUTOMATION.log")
    }
}

/// Everything a session needs, handed to [`Settings::initialize`]
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub lab: LabDescriptor,
    pub natbox: Option<NatBoxDescriptor>,
    pub log_dir: PathBuf,
    /// Symbolic name of the primary tenant (`tenant1` unless overridden)
    pub primary_tenant: String,
    pub flags: FeatureFlags,
}

/// Typed session settings, built once and threaded through fixtures.
#[derive(Debug, Clone)]
pub struct Settings {
    pub lab: LabDescriptor,
    pub natbox: Option<NatBoxDescriptor>,
    /// Path of the NAT box ssh keyfile copied from the controller
    pub natbox_keyfile: PathBuf,
    pub logs: LogPaths,
    pub flags: FeatureFlags,
    /// Region for this session's commands
    pub region: String,
    /// Distributed-cloud system controller session
    pub is_dc: bool,
    /// Central region auth URL, set during DC session setup
    pub dc_central_auth_url: Option<String>,
    /// Keystone auth URL parsed from openrc
    pub auth_url: Option<String>,
    /// Whether the platform endpoints are HTTPS
    pub https: bool,
    /// Software version reported by the build info
    pub software_version: Option<String>,
    /// Topology discovered at session setup
    pub system_type: Option<SystemType>,
    /// Whether the stx-openstack application is deployed
    pub openstack_deployed: bool,
    primary_tenant: String,
    profiles: HashMap<String, AuthProfile>,
    /// List-valued scratch keys written by fixtures (e.g. danger zones
    /// entered, hosts collected from). Unknown reads fail loudly.
    extras: HashMap<String, Vec<String>>,
}

impl Settings {
    /// Build session settings from the session config, deriving log
    /// sub-paths, the NAT box keyfile location, and the default auth
    /// profiles for the primary tenant.
    pub fn initialize(config: SessionConfig) -> Result<Self> {
        let logs = LogPaths::derive(&config.log_dir);
        let mut profiles = HashMap::new();
        for p in [
            AuthProfile::admin(),
            AuthProfile::admin_platform(),
            AuthProfile::tenant("tenant1"),
            AuthProfile::tenant("tenant2"),
        ] {
            profiles.insert(p.name.clone(), p);
        }
        if !profiles.contains_key(&config.primary_tenant) {
            return Err(Error::Config(format!(
                "primary tenant '{}' is not a known auth profile",
                config.primary_tenant
            )));
        }
        Ok(Self {
            natbox_keyfile: logs.temp.join("natbox_keyfile"),
            lab: config.lab,
            natbox: config.natbox,
            logs,
            flags: config.flags,
            region: "RegionOne".to_string(),
            is_dc: false,
            dc_central_auth_url: None,
            auth_url: None,
            https: false,
            software_version: None,
            system_type: None,
            openstack_deployed: false,
            primary_tenant: config.primary_tenant,
            profiles,
            extras: HashMap::new(),
        })
    }

    /// The auth profile for `name`; unknown names fail loudly with the
    /// full list of known profiles.
    pub fn profile(&self, name: &str) -> Result<&AuthProfile> {
        self.profiles.get(name).ok_or_else(|| {
            let mut known: Vec<&str> = self.profiles.keys().map(String::as_str).collect();
            known.sort_unstable();
            Error::Config(format!(
                "unknown auth profile '{}'; known profiles: {}",
                name,
                known.join(", ")
            ))
        })
    }

    /// The profile of the primary tenant selected at session start
    pub fn primary_tenant(&self) -> &AuthProfile {
        &self.profiles[&self.primary_tenant]
    }

    /// Replace a profile (used when the admin password is rotated at setup)
    pub fn set_profile(&mut self, profile: AuthProfile) {
        self.profiles.insert(profile.name.clone(), profile);
    }

    /// Append to a list-valued scratch key, creating it on first write
    pub fn append_extra(&mut self, key: &str, value: impl Into<String>) {
        self.extras.entry(key.to_string()).or_default().push(value.into());
    }

    /// Read a list-valued scratch key; unknown keys fail loudly
    pub fn extra(&self, key: &str) -> Result<&[String]> {
        self.extras.get(key).map(Vec::as_slice).ok_or_else(|| {
            let mut known: Vec<&str> = self.extras.keys().map(String::as_str).collect();
            known.sort_unstable();
            Error::Config(format!(
                "unknown settings key '{}'; known keys: [{}]",
                key,
                known.join(", ")
            ))
        })
    }
}
