//! Host-recovery registry
//!
//! Tests that lock, reboot, or otherwise degrade hosts record them here;
//! scope teardown returns every recorded host to
//! `unlocked/enabled/available` even when the test body failed. A host
//! that misses its deadline fails the teardown, but the ledger is always
//! cleared so the next test starts clean.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tracing::{info, warn};

use crate::cleanup::Scope;
use crate::cli::{Cli, Tool};
use crate::error::Error;
use crate::poll::{wait_for_host_states, wait_for_val, WaitOpts};
use crate::table::{parse_table, FilterOpts, Match};
use crate::timeouts::HostTimeout;

/// Environment facts the drain needs from the session
#[derive(Debug, Clone, Copy)]
pub struct RecoveryEnv {
    /// Single-node system: recovery is reconnect-and-wait, no peer to unlock from
    pub simplex: bool,
    /// Hypervisor-up is only checkable when stx-openstack is deployed
    pub openstack_deployed: bool,
    /// Budget per host to reach unlocked/enabled/available
    pub unlock_timeout: Duration,
}

impl Default for RecoveryEnv {
    fn default() -> Self {
        Self {
            simplex: false,
            openstack_deployed: false,
            unlock_timeout: HostTimeout::UNLOCK,
        }
    }
}

/// Scoped ledger of hosts to restore at teardown
#[derive(Default)]
pub struct HostRecovery {
    entries: Mutex<HashMap<Scope, Vec<String>>>,
}

impl HostRecovery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record hosts for recovery at `scope` teardown. Duplicates within a
    /// scope collapse to one entry, so a host locked twice by one test is
    /// unlocked and waited on exactly once.
    pub fn add<I, S>(&self, hosts: I, scope: Scope)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut entries = self.entries.lock().unwrap();
        let list = entries.entry(scope).or_default();
        for host in hosts {
            let host = host.into();
            if !list.contains(&host) {
                list.push(host);
            }
        }
    }

    /// Retract hosts the test recovered itself
    pub fn remove<I, S>(&self, hosts: I, scope: Scope)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let hosts: Vec<String> = hosts.into_iter().map(Into::into).collect();
        let mut entries = self.entries.lock().unwrap();
        if let Some(list) = entries.get_mut(&scope) {
            list.retain(|h| !hosts.contains(h));
        }
    }

    pub fn pending(&self, scope: Scope) -> usize {
        self.entries
            .lock()
            .unwrap()
            .get(&scope)
            .map_or(0, Vec::len)
    }

    /// Restore every host recorded in `scope`. Failures are collected so
    /// each host gets its chance; the scope is cleared regardless.
    pub async fn drain(&self, scope: Scope, cli: &Cli<'_>, env: RecoveryEnv) -> Vec<Error> {
        let hosts: Vec<String> = {
            let mut entries = self.entries.lock().unwrap();
            entries.remove(&scope).unwrap_or_default()
        };
        if hosts.is_empty() {
            return Vec::new();
        }
        info!(?scope, ?hosts, "recovering hosts");

        let mut failures = Vec::new();
        if env.simplex {
            // One node: nothing to drive the recovery from but the host
            // itself. Wait for it to come back and settle.
            for host in &hosts {
                if let Err(e) = wait_for_host_states(
                    cli,
                    host,
                    "unlocked",
                    "enabled",
                    "available",
                    WaitOpts::new(env.unlock_timeout),
                )
                .await
                {
                    failures.push(Error::host_op(host, "simplex-recover", e.to_string()));
                }
            }
            return failures;
        }

        // Partition recorded hosts by current administrative state.
        let locked = match self.locked_hosts(cli, &hosts).await {
            Ok(locked) => locked,
            Err(e) => {
                failures.push(e);
                return failures;
            }
        };

        for host in &locked {
            if let Err(e) = cli.exec(Tool::System, &format!("host-unlock {host}")).await {
                failures.push(Error::host_op(host, "unlock", e.to_string()));
            }
        }

        // All recorded hosts must settle, unlocked or not: a rebooted host
        // that was never locked still has to come back available.
        for host in &hosts {
            if let Err(e) = wait_for_host_states(
                cli,
                host,
                "unlocked",
                "enabled",
                "available",
                WaitOpts::new(env.unlock_timeout),
            )
            .await
            {
                failures.push(Error::host_op(host, "recover", e.to_string()));
                continue;
            }
            if env.openstack_deployed {
                if let Err(e) = self.wait_hypervisor_up(cli, host).await {
                    failures.push(e);
                }
            }
        }
        failures
    }

    async fn locked_hosts(&self, cli: &Cli<'_>, hosts: &[String]) -> Result<Vec<String>, Error> {
        let out = cli.exec(Tool::System, "host-list --nowrap").await?;
        let table = parse_table(&out)?;
        let locked_rows = table.filter(
            &[("administrative", Match::is("locked"))],
            FilterOpts::default(),
        )?;
        let locked = locked_rows.column("hostname")?;
        Ok(hosts
            .iter()
            .filter(|h| locked.contains(h))
            .cloned()
            .collect())
    }

    async fn wait_hypervisor_up(&self, cli: &Cli<'_>, host: &str) -> Result<(), Error> {
        let description = format!("hypervisor {host} up");
        wait_for_val(
            &description,
            WaitOpts::new(HostTimeout::HYPERVISOR_UP),
            || async move {
                let out = cli.try_exec(Tool::Openstack, "hypervisor list").await?;
                if !out.succeeded() {
                    // TODO(hypervisor-check): confirm whether the transient
                    // "Metrics can't being aggregated" rejection still occurs
                    // on current loads; it was tolerated historically and is
                    // treated as not-up-yet rather than a failure.
                    if out.output.contains("Metrics can't being aggregated") {
                        warn!(host, "hypervisor list rejected while metrics settle");
                        return Ok(false);
                    }
                    return Err(Error::service("nova", out.output));
                }
                let table = parse_table(&out.output)?;
                let rows = table.filter(
                    &[
                        ("hypervisor hostname", Match::is(host)),
                        ("state", Match::is("up")),
                    ],
                    FilterOpts::default(),
                )?;
                Ok(!rows.values.is_empty())
            },
            |up| *up,
        )
        .await
        .map(|_| ())
    }
}
