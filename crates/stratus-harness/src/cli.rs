//! CLI dispatcher: composes platform/OpenStack tool invocations and runs
//! them on a chosen client under a chosen auth profile
//!
//! The dispatcher owns command composition and exit-code policy only.
//! Output is never parsed here; callers hand it to [`crate::table`].

use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::settings::AuthProfile;
use crate::ssh::client::ExecOpts;
use crate::ssh::registry::SharedClient;

/// Exit code and combined stdout/stderr of one remote command
#[derive(Debug, Clone)]
pub struct CmdOutput {
    pub exit_code: i32,
    pub output: String,
}

impl CmdOutput {
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }
}

/// Something that can run a command line on a remote host.
///
/// The production implementation is the registry's shared SSH client; tests
/// substitute a scripted mock.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, cmd: &str, timeout: Duration) -> Result<CmdOutput>;
}

#[async_trait]
impl CommandRunner for SharedClient {
    async fn run(&self, cmd: &str, timeout: Duration) -> Result<CmdOutput> {
        let mut client = self.lock().await;
        let (exit_code, output) = client.try_exec(cmd, ExecOpts::with_timeout(timeout)).await?;
        Ok(CmdOutput { exit_code, output })
    }
}

/// Tool families the dispatcher knows how to invoke
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tool {
    /// Platform inventory (`system host-list`, ...)
    System,
    /// Fault management (`fm alarm-list`, ...)
    Fm,
    /// Legacy patch/upgrade orchestration
    SwManager,
    /// Unified software management
    Software,
    /// OpenStack CLI
    Openstack,
    /// Distributed cloud manager
    Dcmanager,
    Kubectl,
    Helm,
}

impl Tool {
    pub fn as_str(self) -> &'static str {
        match self {
            Tool::System => "system",
            Tool::Fm => "fm",
            Tool::SwManager => "sw-manager",
            Tool::Software => "software",
            Tool::Openstack => "openstack",
            Tool::Dcmanager => "dcmanager",
            Tool::Kubectl => "kubectl",
            Tool::Helm => "helm",
        }
    }

    /// Tools that authenticate through the platform keystone environment
    fn sources_platform_env(self) -> bool {
        matches!(
            self,
            Tool::System | Tool::Fm | Tool::SwManager | Tool::Software | Tool::Dcmanager
        )
    }

    /// Tools that take no keystone credentials at all
    fn unauthenticated(self) -> bool {
        matches!(self, Tool::Kubectl | Tool::Helm)
    }
}

/// Default budget for one CLI invocation
pub const CLI_TIMEOUT: Duration = Duration::from_secs(90);

/// Dispatcher bound to one runner and one auth profile.
///
/// DC central operations (`central(true)`) force `--os-region-name
/// RegionOne` so `dcmanager` talks to the system controller regardless of
/// the profile's pinned region.
pub struct Cli<'r> {
    runner: &'r dyn CommandRunner,
    auth: &'r AuthProfile,
    auth_url: Option<String>,
    central: bool,
    timeout: Duration,
}

impl<'r> Cli<'r> {
    pub fn new(runner: &'r dyn CommandRunner, auth: &'r AuthProfile) -> Self {
        Self {
            runner,
            auth,
            auth_url: None,
            central: false,
            timeout: CLI_TIMEOUT,
        }
    }

    /// Keystone auth URL for OpenStack-family credential flags
    pub fn auth_url(mut self, url: impl Into<String>) -> Self {
        self.auth_url = Some(url.into());
        self
    }

    /// Mark this dispatcher as targeting the DC central region
    pub fn central(mut self, central: bool) -> Self {
        self.central = central;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Build the full command line for `(tool, subcommand-and-args)`
    pub fn compose(&self, tool: Tool, sub: &str) -> String {
        if tool.unauthenticated() {
            return format!("{} {}", tool.as_str(), sub);
        }

        let region = if self.central {
            Some("RegionOne")
        } else {
            self.auth.region.as_deref()
        };

        if tool.sources_platform_env() && self.auth.platform {
            // Platform keystone: source the admin environment in-line.
            let mut cmd = format!(
                "source /etc/platform/openrc > /dev/null 2>&1; {} {}",
                tool.as_str(),
                sub
            );
            if let Some(region) = region {
                if tool == Tool::Dcmanager {
                    cmd = format!(
                        "source /etc/platform/openrc > /dev/null 2>&1; {} --os-region-name {} {}",
                        tool.as_str(),
                        region,
                        sub
                    );
                }
            }
            return cmd;
        }

        // OpenStack keystone: pass credentials explicitly so any tenant can
        // be used without a per-tenant openrc file on the host.
        let mut cmd = tool.as_str().to_string();
        cmd.push_str(&format!(
            " --os-username '{}' --os-password '{}' --os-project-name '{}' \
             --os-user-domain-name {} --os-project-domain-name {}",
            self.auth.user,
            self.auth.password,
            self.auth.project,
            self.auth.user_domain,
            self.auth.project_domain,
        ));
        if let Some(url) = &self.auth_url {
            cmd.push_str(&format!(" --os-auth-url {url}"));
        }
        if let Some(region) = region {
            cmd.push_str(&format!(" --os-region-name {region}"));
        }
        cmd.push_str(&format!(" --os-interface {}", self.auth.endpoint_type));
        cmd.push(' ');
        cmd.push_str(sub);
        cmd
    }

    /// Run and surface `(exit_code, output)` without judging the code
    pub async fn try_exec(&self, tool: Tool, sub: &str) -> Result<CmdOutput> {
        let cmd = self.compose(tool, sub);
        self.runner.run(&cmd, self.timeout).await
    }

    /// Run, failing with [`Error::CommandFailed`] on non-zero exit
    pub async fn exec(&self, tool: Tool, sub: &str) -> Result<String> {
        let cmd = self.compose(tool, sub);
        let out = self.runner.run(&cmd, self.timeout).await?;
        if !out.succeeded() {
            return Err(Error::CommandFailed {
                command: cmd,
                exit_code: out.exit_code,
                output: out.output,
            });
        }
        Ok(out.output)
    }
}
