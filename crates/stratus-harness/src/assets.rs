//! Typed test-asset configs
//!
//! Asset files are JSON5 (JSON plus comments and trailing commas) so lab
//! engineers can annotate them in place. Deployment assets may also carry
//! YAML documents; those round-trip through [`write_yaml`] with two-space
//! indentation.
//!
//! Every typed object fails at load time when a required field is missing;
//! optional fields deserialize to `None`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

/// Load any typed asset from a JSON5 file
pub fn load_json5<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .map_err(|e| Error::asset(path.display().to_string(), e.to_string()))?;
    json5::from_str(&text).map_err(|e| Error::asset(path.display().to_string(), e.to_string()))
}

/// Parse any typed asset from a JSON5 string
pub fn parse_json5<T: DeserializeOwned>(text: &str) -> Result<T> {
    json5::from_str(text).map_err(|e| Error::asset("<inline>", e.to_string()))
}

/// Load a YAML document (deployment assets only)
pub fn load_yaml<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .map_err(|e| Error::asset(path.display().to_string(), e.to_string()))?;
    serde_yaml::from_str(&text)
        .map_err(|e| Error::asset(path.display().to_string(), e.to_string()))
}

/// Write a YAML document with two-space indentation
pub fn write_yaml<T: Serialize>(path: impl AsRef<Path>, value: &T) -> Result<()> {
    let path = path.as_ref();
    // serde_yaml emits two-space indentation, matching the files the
    // deployment tooling consumes.
    let text = serde_yaml::to_string(value)
        .map_err(|e| Error::asset(path.display().to_string(), e.to_string()))?;
    std::fs::write(path, text)?;
    debug!(path = %path.display(), "asset written");
    Ok(())
}

// =============================================================================
// Application install targets
// =============================================================================

/// Where a platform application's tarball lives and how to upload it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub name: String,
    /// Tarball path on the controller, or the path to place it at
    pub tarball: PathBuf,
    /// Remote registry to pull images through, if not the default
    pub registry: Option<String>,
    /// Helm overrides applied after upload
    #[serde(default)]
    pub overrides: HashMap<String, String>,
}

// =============================================================================
// Deployment assets
// =============================================================================

/// One host's install files
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostInstallAssets {
    pub boot_image: Option<PathBuf>,
    pub install_values: Option<PathBuf>,
}

/// Bootstrap and deployment files for a lab, keyed per controller and per
/// subcloud
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentAssets {
    pub bootstrap_values: PathBuf,
    pub deployment_config: Option<PathBuf>,
    #[serde(default)]
    pub controllers: HashMap<String, HostInstallAssets>,
    #[serde(default)]
    pub subclouds: HashMap<String, DeploymentAssets>,
}

// =============================================================================
// Unified software management
// =============================================================================

/// Credentials for the build server holding ISO and patch artifacts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildServerAuth {
    pub host: String,
    pub user: String,
    pub password: String,
}

/// Inputs for a USM upgrade or patch run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsmConfig {
    pub iso_path: PathBuf,
    pub signature_path: PathBuf,
    pub patch_path: Option<PathBuf>,
    pub build_server: Option<BuildServerAuth>,
    /// Release IDs in apply order
    #[serde(default)]
    pub release_ids: Vec<String>,
    /// Free-form attributes forwarded to `software deploy` flags
    #[serde(default)]
    pub extra_attributes: HashMap<String, String>,
}

// =============================================================================
// SNMP wiring
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnmpV3Credentials {
    pub user: String,
    pub auth_password: String,
    pub priv_password: String,
}

/// Parameters for raising and validating a test alarm over SNMP
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnmpTestAlarm {
    pub alarm_id: String,
    pub entity: String,
    pub severity: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnmpConfig {
    pub app_name: String,
    #[serde(default)]
    pub namespaces: Vec<String>,
    #[serde(default)]
    pub config_files: Vec<PathBuf>,
    pub community: Option<String>,
    pub v3: Option<SnmpV3Credentials>,
    pub test_alarm: Option<SnmpTestAlarm>,
    /// `host:port` trap receiver endpoints
    #[serde(default)]
    pub trap_endpoints: Vec<String>,
    /// Regex patterns the trap payload must match
    #[serde(default)]
    pub validation_patterns: Vec<String>,
}

// =============================================================================
// PTP templates
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PtpPortDataSet {
    pub log_announce_interval: Option<i32>,
    pub log_sync_interval: Option<i32>,
    pub announce_receipt_timeout: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PtpParentDataSet {
    pub grandmaster_identity: Option<String>,
    pub grandmaster_priority1: Option<u8>,
    pub grandmaster_priority2: Option<u8>,
}

/// PTP instance template: grandmaster settings plus the data sets pushed to
/// `system ptp-instance-parameter-add`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PtpConfig {
    pub instance_name: String,
    pub grandmaster: bool,
    pub parent_data_set: Option<PtpParentDataSet>,
    pub port_data_set: Option<PtpPortDataSet>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json5_comments_and_trailing_commas_are_accepted() {
        let text = r#"{
            // platform-integ-apps replacement under test
            name: "stx-openstack",
            tarball: "/home/sysadmin/stx-openstack.tgz",
            overrides: {
                "glance.storage": "rbd", // ceph-backed
            },
        }"#;
        let app: AppConfig = parse_json5(text).unwrap();
        assert_eq!(app.name, "stx-openstack");
        assert!(app.registry.is_none());
        assert_eq!(app.overrides["glance.storage"], "rbd");
    }

    #[test]
    fn load_error_names_the_file_exactly_once() {
        let dir = std::env::temp_dir().join("stratus-assets-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("broken.json5");
        std::fs::write(&path, "{ name: ").unwrap();

        let err = load_json5::<AppConfig>(&path).unwrap_err().to_string();
        assert!(!err.contains("<inline>"), "{err}");
        assert_eq!(err.matches("broken.json5").count(), 1, "{err}");
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn missing_required_field_fails_at_parse_time() {
        // No tarball.
        let err = parse_json5::<AppConfig>(r#"{ name: "stx-openstack" }"#).unwrap_err();
        assert!(err.to_string().contains("tarball"), "{err}");
    }

    #[test]
    fn optional_fields_default_to_none_or_empty() {
        let usm: UsmConfig = parse_json5(
            r#"{
                iso_path: "/builds/starlingx-10.iso",
                signature_path: "/builds/starlingx-10.sig",
            }"#,
        )
        .unwrap();
        assert!(usm.patch_path.is_none());
        assert!(usm.build_server.is_none());
        assert!(usm.release_ids.is_empty());
        assert!(usm.extra_attributes.is_empty());
    }

    #[test]
    fn snmp_config_nests_credentials_and_alarm_params() {
        let snmp: SnmpConfig = parse_json5(
            r#"{
                app_name: "snmp",
                namespaces: ["kube-system"],
                v3: {
                    user: "snmpv3user",
                    auth_password: "authpass",
                    priv_password: "privpass",
                },
                test_alarm: {
                    alarm_id: "300.005",
                    entity: "host=controller-0",
                    severity: "major",
                },
                trap_endpoints: ["10.10.10.12:162"],
            }"#,
        )
        .unwrap();
        assert_eq!(snmp.v3.as_ref().unwrap().user, "snmpv3user");
        assert_eq!(snmp.test_alarm.as_ref().unwrap().alarm_id, "300.005");
        assert!(snmp.community.is_none());
    }

    #[test]
    fn deployment_assets_recurse_into_subclouds() {
        let assets: DeploymentAssets = parse_json5(
            r#"{
                bootstrap_values: "/lab/bootstrap.yaml",
                controllers: {
                    "controller-0": { boot_image: "/lab/boot.iso", install_values: null },
                },
                subclouds: {
                    "subcloud1": {
                        bootstrap_values: "/lab/subcloud1/bootstrap.yaml",
                    },
                },
            }"#,
        )
        .unwrap();
        assert!(assets.deployment_config.is_none());
        assert_eq!(
            assets.subclouds["subcloud1"].bootstrap_values,
            PathBuf::from("/lab/subcloud1/bootstrap.yaml")
        );
    }

    #[test]
    fn yaml_round_trip_preserves_two_space_indent() {
        let assets: DeploymentAssets = parse_json5(
            r#"{
                bootstrap_values: "/lab/bootstrap.yaml",
                controllers: {
                    "controller-0": { boot_image: "/lab/boot.iso", install_values: null },
                },
            }"#,
        )
        .unwrap();
        let dir = std::env::temp_dir().join("stratus-assets-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("deployment.yaml");
        write_yaml(&path, &assets).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let nested = text
            .lines()
            .find(|l| l.contains("boot_image"))
            .expect("nested key present");
        assert!(nested.starts_with("    boot_image") || nested.starts_with("  boot_image"));

        let back: DeploymentAssets = load_yaml(&path).unwrap();
        assert_eq!(back.bootstrap_values, assets.bootstrap_values);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn ptp_template_parses_data_sets() {
        let ptp: PtpConfig = parse_json5(
            r#"{
                instance_name: "ptp1",
                grandmaster: true,
                parent_data_set: { grandmaster_priority1: 128 },
                port_data_set: { log_sync_interval: -4 },
            }"#,
        )
        .unwrap();
        assert!(ptp.grandmaster);
        assert_eq!(
            ptp.parent_data_set.unwrap().grandmaster_priority1,
            Some(128)
        );
        assert_eq!(ptp.port_data_set.unwrap().log_sync_interval, Some(-4));
    }
}
