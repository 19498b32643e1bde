//! Scoped resource-cleanup registry
//!
//! Tests register everything they create; scope teardown drains the ledger
//! in reverse registration order so dependents go before dependencies
//! (server before its ports, router before its networks). Scopes obey
//! Function < Class < Module < Session and drain in that order.
//!
//! Deletion is idempotent: a resource that is already gone logs a warning
//! and the drain continues. Real deletion failures are collected so later
//! entries still run, then reported together.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::{info, warn};

use crate::cli::{Cli, Tool};
use crate::error::{Error, Result};

/// Teardown scopes, narrowest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Scope {
    Function,
    Class,
    Module,
    Session,
}

impl Scope {
    /// All scopes in teardown (drain) order
    pub const DRAIN_ORDER: [Scope; 4] = [Scope::Function, Scope::Class, Scope::Module, Scope::Session];
}

/// The closed set of resource kinds the ledger tracks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceType {
    Vm,
    Volume,
    Snapshot,
    Flavor,
    Image,
    ServerGroup,
    Network,
    Subnet,
    Router,
    FloatingIp,
    Port,
    SecurityGroup,
    KeyPair,
    Aggregate,
    Trunk,
    Datanetwork,
    Pod,
    Namespace,
    HelmRelease,
}

impl ResourceType {
    /// The tool and subcommand that deletes one instance of this kind
    fn delete_command(self, id: &str) -> (Tool, String) {
        match self {
            ResourceType::Vm => (Tool::Openstack, format!("server delete {id}")),
            ResourceType::Volume => (Tool::Openstack, format!("volume delete {id}")),
            ResourceType::Snapshot => (Tool::Openstack, format!("volume snapshot delete {id}")),
            ResourceType::Flavor => (Tool::Openstack, format!("flavor delete {id}")),
            ResourceType::Image => (Tool::Openstack, format!("image delete {id}")),
            ResourceType::ServerGroup => (Tool::Openstack, format!("server group delete {id}")),
            ResourceType::Network => (Tool::Openstack, format!("network delete {id}")),
            ResourceType::Subnet => (Tool::Openstack, format!("subnet delete {id}")),
            ResourceType::Router => (Tool::Openstack, format!("router delete {id}")),
            ResourceType::FloatingIp => (Tool::Openstack, format!("floating ip delete {id}")),
            ResourceType::Port => (Tool::Openstack, format!("port delete {id}")),
            ResourceType::SecurityGroup => {
                (Tool::Openstack, format!("security group delete {id}"))
            }
            ResourceType::KeyPair => (Tool::Openstack, format!("keypair delete {id}")),
            ResourceType::Aggregate => (Tool::Openstack, format!("aggregate delete {id}")),
            ResourceType::Trunk => (Tool::Openstack, format!("network trunk delete {id}")),
            ResourceType::Datanetwork => (Tool::System, format!("datanetwork-delete {id}")),
            ResourceType::Pod => (Tool::Kubectl, format!("delete pod {id}")),
            ResourceType::Namespace => (Tool::Kubectl, format!("delete namespace {id}")),
            ResourceType::HelmRelease => (Tool::Helm, format!("uninstall {id}")),
        }
    }

    fn kind_name(self) -> &'static str {
        match self {
            ResourceType::Vm => "vm",
            ResourceType::Volume => "volume",
            ResourceType::Snapshot => "snapshot",
            ResourceType::Flavor => "flavor",
            ResourceType::Image => "image",
            ResourceType::ServerGroup => "server-group",
            ResourceType::Network => "network",
            ResourceType::Subnet => "subnet",
            ResourceType::Router => "router",
            ResourceType::FloatingIp => "floating-ip",
            ResourceType::Port => "port",
            ResourceType::SecurityGroup => "security-group",
            ResourceType::KeyPair => "keypair",
            ResourceType::Aggregate => "aggregate",
            ResourceType::Trunk => "trunk",
            ResourceType::Datanetwork => "datanetwork",
            ResourceType::Pod => "pod",
            ResourceType::Namespace => "namespace",
            ResourceType::HelmRelease => "helm-release",
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    rtype: ResourceType,
    id: String,
    /// Volumes deleted immediately after this VM (vm-with-vol bucket)
    attached_volumes: Vec<String>,
}

/// Scoped, typed ledger of created resources
#[derive(Default)]
pub struct ResourceLedger {
    entries: Mutex<HashMap<Scope, Vec<Entry>>>,
}

impl ResourceLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record resources for deletion at `scope` teardown
    pub fn add<I, S>(&self, rtype: ResourceType, ids: I, scope: Scope)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut entries = self.entries.lock().unwrap();
        let list = entries.entry(scope).or_default();
        for id in ids {
            list.push(Entry {
                rtype,
                id: id.into(),
                attached_volumes: Vec::new(),
            });
        }
    }

    /// Record a VM whose attached volumes are deleted right after it
    pub fn add_vm_with_vols(
        &self,
        vm_id: impl Into<String>,
        volume_ids: Vec<String>,
        scope: Scope,
    ) {
        self.entries
            .lock()
            .unwrap()
            .entry(scope)
            .or_default()
            .push(Entry {
                rtype: ResourceType::Vm,
                id: vm_id.into(),
                attached_volumes: volume_ids,
            });
    }

    /// Retract earlier registrations, e.g. when the test deleted the
    /// resource itself. Unknown ids are ignored.
    pub fn remove<I, S>(&self, rtype: ResourceType, ids: I, scope: Scope)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let ids: Vec<String> = ids.into_iter().map(Into::into).collect();
        let mut entries = self.entries.lock().unwrap();
        if let Some(list) = entries.get_mut(&scope) {
            list.retain(|e| !(e.rtype == rtype && ids.contains(&e.id)));
        }
    }

    /// Number of pending entries in a scope
    pub fn pending(&self, scope: Scope) -> usize {
        self.entries
            .lock()
            .unwrap()
            .get(&scope)
            .map_or(0, Vec::len)
    }

    /// Delete everything registered in `scope`, newest first. Errors are
    /// collected; the drain never stops early. The scope is left empty.
    pub async fn drain(&self, scope: Scope, cli: &Cli<'_>) -> Vec<Error> {
        let drained: Vec<Entry> = {
            let mut entries = self.entries.lock().unwrap();
            entries.remove(&scope).unwrap_or_default()
        };
        if drained.is_empty() {
            return Vec::new();
        }
        info!(?scope, count = drained.len(), "draining resource ledger");

        let mut failures = Vec::new();
        for entry in drained.iter().rev() {
            self.delete_one(entry.rtype, &entry.id, cli, &mut failures)
                .await;
            for vol in &entry.attached_volumes {
                self.delete_one(ResourceType::Volume, vol, cli, &mut failures)
                    .await;
            }
        }
        failures
    }

    async fn delete_one(
        &self,
        rtype: ResourceType,
        id: &str,
        cli: &Cli<'_>,
        failures: &mut Vec<Error>,
    ) {
        let (tool, sub) = rtype.delete_command(id);
        match cli.try_exec(tool, &sub).await {
            Ok(out) if out.succeeded() => {}
            Ok(out) => {
                if already_gone(&out.output) {
                    warn!(kind = rtype.kind_name(), id, "already deleted");
                } else {
                    failures.push(Error::resource(rtype.kind_name(), id, out.output));
                }
            }
            Err(e) => failures.push(Error::resource(rtype.kind_name(), id, e.to_string())),
        }
    }
}

/// Deletion output that means the resource no longer exists
fn already_gone(output: &str) -> bool {
    let lower = output.to_lowercase();
    lower.contains("not found")
        || lower.contains("no such")
        || lower.contains("could not be found")
        || lower.contains("does not exist")
}

/// Convenience: drain all scopes narrowest-first; function-scope entries
/// are gone before any class-scope deletion is issued.
pub async fn drain_all(ledger: &ResourceLedger, cli: &Cli<'_>) -> Vec<Error> {
    let mut failures = Vec::new();
    for scope in Scope::DRAIN_ORDER {
        failures.extend(ledger.drain(scope, cli).await);
    }
    failures
}

/// Collected teardown failures rendered as one error
pub fn summarize_failures(failures: Vec<Error>) -> Result<()> {
    if failures.is_empty() {
        return Ok(());
    }
    let lines: Vec<String> = failures.iter().map(|e| e.to_string()).collect();
    Err(Error::Misuse(format!(
        "{} teardown deletion(s) failed:\n{}",
        failures.len(),
        lines.join("\n")
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::{CmdOutput, CommandRunner};
    use crate::settings::AuthProfile;
    use async_trait::async_trait;
    use mockall::predicate::always;
    use mockall::Sequence;
    use std::time::Duration;

    mockall::mock! {
        Runner {}

        #[async_trait]
        impl CommandRunner for Runner {
            async fn run(&self, cmd: &str, timeout: Duration) -> Result<CmdOutput>;
        }
    }

    fn ok() -> Result<CmdOutput> {
        Ok(CmdOutput {
            exit_code: 0,
            output: String::new(),
        })
    }

    fn expect_delete(runner: &mut MockRunner, seq: &mut Sequence, fragment: &'static str) {
        runner
            .expect_run()
            .withf(move |cmd: &str, _: &Duration| cmd.contains(fragment))
            .times(1)
            .in_sequence(seq)
            .returning(|_, _| ok());
    }

    /// Law: resources added r1..rn are deleted rn..r1.
    #[tokio::test]
    async fn drain_deletes_in_reverse_registration_order() {
        let ledger = ResourceLedger::new();
        ledger.add(ResourceType::Network, ["net1"], Scope::Function);
        ledger.add(ResourceType::Subnet, ["sub1"], Scope::Function);
        ledger.add(ResourceType::Vm, ["vm1"], Scope::Function);

        let mut runner = MockRunner::new();
        let mut seq = Sequence::new();
        expect_delete(&mut runner, &mut seq, "server delete vm1");
        expect_delete(&mut runner, &mut seq, "subnet delete sub1");
        expect_delete(&mut runner, &mut seq, "network delete net1");

        let auth = AuthProfile::admin();
        let cli = Cli::new(&runner, &auth);
        let failures = ledger.drain(Scope::Function, &cli).await;
        assert!(failures.is_empty());
        assert_eq!(ledger.pending(Scope::Function), 0);
    }

    /// Law: a vm-with-vol entry deletes the VM first, then its volumes.
    #[tokio::test]
    async fn vm_with_volumes_deletes_vm_before_volumes() {
        let ledger = ResourceLedger::new();
        ledger.add_vm_with_vols(
            "vm1",
            vec!["vol-a".to_string(), "vol-b".to_string()],
            Scope::Function,
        );

        let mut runner = MockRunner::new();
        let mut seq = Sequence::new();
        expect_delete(&mut runner, &mut seq, "server delete vm1");
        expect_delete(&mut runner, &mut seq, "volume delete vol-a");
        expect_delete(&mut runner, &mut seq, "volume delete vol-b");

        let auth = AuthProfile::admin();
        let cli = Cli::new(&runner, &auth);
        let failures = ledger.drain(Scope::Function, &cli).await;
        assert!(failures.is_empty());
    }

    #[tokio::test]
    async fn already_gone_resources_warn_but_do_not_fail() {
        let ledger = ResourceLedger::new();
        ledger.add(ResourceType::Volume, ["ghost"], Scope::Function);

        let mut runner = MockRunner::new();
        runner.expect_run().with(always(), always()).returning(|_, _| {
            Ok(CmdOutput {
                exit_code: 1,
                output: "No volume with a name or ID of 'ghost' exists... not found".to_string(),
            })
        });

        let auth = AuthProfile::admin();
        let cli = Cli::new(&runner, &auth);
        let failures = ledger.drain(Scope::Function, &cli).await;
        assert!(failures.is_empty());
    }

    #[tokio::test]
    async fn real_failures_are_collected_and_drain_continues() {
        let ledger = ResourceLedger::new();
        ledger.add(ResourceType::Volume, ["vol-stuck"], Scope::Function);
        ledger.add(ResourceType::Vm, ["vm1"], Scope::Function);

        let mut runner = MockRunner::new();
        runner
            .expect_run()
            .withf(|cmd: &str, _: &Duration| cmd.contains("server delete vm1"))
            .times(1)
            .returning(|_, _| ok());
        runner
            .expect_run()
            .withf(|cmd: &str, _: &Duration| cmd.contains("volume delete vol-stuck"))
            .times(1)
            .returning(|_, _| {
                Ok(CmdOutput {
                    exit_code: 1,
                    output: "Invalid volume: status must be available".to_string(),
                })
            });

        let auth = AuthProfile::admin();
        let cli = Cli::new(&runner, &auth);
        let failures = ledger.drain(Scope::Function, &cli).await;
        assert_eq!(failures.len(), 1);
        assert!(failures[0].to_string().contains("vol-stuck"));
        assert!(summarize_failures(failures).is_err());
        // The scope is empty even though a deletion failed.
        assert_eq!(ledger.pending(Scope::Function), 0);
    }

    #[tokio::test]
    async fn remove_retracts_a_registration() {
        let ledger = ResourceLedger::new();
        ledger.add(ResourceType::Flavor, ["f1", "f2"], Scope::Module);
        ledger.remove(ResourceType::Flavor, ["f1"], Scope::Module);
        // Removing again is harmless.
        ledger.remove(ResourceType::Flavor, ["f1"], Scope::Module);

        let mut runner = MockRunner::new();
        runner
            .expect_run()
            .withf(|cmd: &str, _: &Duration| cmd.contains("flavor delete f2"))
            .times(1)
            .returning(|_, _| ok());

        let auth = AuthProfile::admin();
        let cli = Cli::new(&runner, &auth);
        let failures = ledger.drain(Scope::Module, &cli).await;
        assert!(failures.is_empty());
    }

    /// Law: scope drains run function → class → module → session.
    #[tokio::test]
    async fn drain_all_respects_scope_nesting() {
        let ledger = ResourceLedger::new();
        ledger.add(ResourceType::Image, ["session-img"], Scope::Session);
        ledger.add(ResourceType::Network, ["module-net"], Scope::Module);
        ledger.add(ResourceType::Vm, ["func-vm"], Scope::Function);
        ledger.add(ResourceType::Flavor, ["class-flavor"], Scope::Class);

        let mut runner = MockRunner::new();
        let mut seq = Sequence::new();
        expect_delete(&mut runner, &mut seq, "server delete func-vm");
        expect_delete(&mut runner, &mut seq, "flavor delete class-flavor");
        expect_delete(&mut runner, &mut seq, "network delete module-net");
        expect_delete(&mut runner, &mut seq, "image delete session-img");

        let auth = AuthProfile::admin();
        let cli = Cli::new(&runner, &auth);
        let failures = drain_all(&ledger, &cli).await;
        assert!(failures.is_empty());
        for scope in Scope::DRAIN_ORDER {
            assert_eq!(ledger.pending(scope), 0);
        }
    }
}
