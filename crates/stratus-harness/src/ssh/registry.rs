//! Registry of SSH clients keyed by `(region, host)`
//!
//! At most one client per region is *active*: the one pointed at the
//! active controller, the target of every dispatched CLI command. Tests
//! that swact controllers must move the pointer before issuing further
//! commands.
//!
//! Clients are wrapped in async mutexes; a client serves one task at a
//! time and all commands on it are totally ordered.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::{Error, Result};

use super::client::{RetryPolicy, SshClient};

/// Shared handle to one client
pub type SharedClient = Arc<Mutex<SshClient>>;

/// Region name used when a lab is not a DC system
pub const PRIMARY_REGION: &str = "RegionOne";

#[derive(Default)]
pub struct SshRegistry {
    clients: DashMap<(String, String), SharedClient>,
    /// region → hostname of the active client
    active: DashMap<String, String>,
}

impl SshRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a client under `(region, host)`, returning the shared handle.
    /// Re-registering replaces the old entry.
    pub fn insert(&self, region: &str, host: &str, client: SshClient) -> SharedClient {
        let shared = Arc::new(Mutex::new(client));
        self.clients
            .insert((region.to_string(), host.to_string()), shared.clone());
        shared
    }

    pub fn get(&self, region: &str, host: &str) -> Option<SharedClient> {
        self.clients
            .get(&(region.to_string(), host.to_string()))
            .map(|e| e.value().clone())
    }

    /// Remove a client without closing it; callers close first.
    pub fn remove(&self, region: &str, host: &str) -> Option<SharedClient> {
        let removed = self
            .clients
            .remove(&(region.to_string(), host.to_string()))
            .map(|(_, v)| v);
        // A dangling active pointer would hand out a closed client.
        if let Some(active) = self.active.get(region) {
            if active.value() == host {
                drop(active);
                self.active.remove(region);
            }
        }
        removed
    }

    /// Mark the registered `(region, host)` client as the region's active one
    pub fn set_active(&self, region: &str, host: &str) -> Result<()> {
        if self.get(region, host).is_none() {
            return Err(Error::Misuse(format!(
                "cannot activate unregistered client {region}/{host}"
            )));
        }
        info!(region, host, "active controller client set");
        self.active.insert(region.to_string(), host.to_string());
        Ok(())
    }

    /// Hostname of the region's active client
    pub fn active_host(&self, region: &str) -> Option<String> {
        self.active.get(region).map(|e| e.value().clone())
    }

    /// The active client for `region`
    pub fn active_controller(&self, region: &str) -> Result<SharedClient> {
        let host = self.active_host(region).ok_or_else(|| {
            Error::Misuse(format!("no active controller client for region {region}"))
        })?;
        self.get(region, &host)
            .ok_or_else(|| Error::Misuse(format!("active client {region}/{host} vanished")))
    }

    /// All regions with an active client, with their handles
    pub fn active_controllers_map(&self) -> Vec<(String, SharedClient)> {
        self.active
            .iter()
            .filter_map(|e| {
                self.get(e.key(), e.value())
                    .map(|c| (e.key().clone(), c))
            })
            .collect()
    }

    /// Flush and reconnect every active client. Run at test teardown so a
    /// host rebooted mid-test does not leave a dead channel for the next
    /// test.
    pub async fn reconnect_active(&self, policy: RetryPolicy) -> Result<()> {
        for (region, client) in self.active_controllers_map() {
            let mut guard = client.lock().await;
            if guard.flush().await.is_err() || !guard.is_connected() {
                warn!(region = %region, host = guard.host(), "stale channel, reconnecting");
                guard.reconnect(policy).await?;
            }
        }
        Ok(())
    }

    /// Close every client. Session teardown only.
    pub async fn close_all(&self) {
        let handles: Vec<SharedClient> =
            self.clients.iter().map(|e| e.value().clone()).collect();
        for client in handles {
            client.lock().await.close().await;
        }
        self.clients.clear();
        self.active.clear();
    }
}

/// Scoped acquisition of a host client.
///
/// On open: a live, authenticated client registered and marked active for
/// its region, displacing (and remembering) the previously active one. On
/// [`ScopedSsh::close`] or drop: the entry is removed and the displaced
/// client restored. Contract of the `with ssh_to_host(...)` pattern.
pub struct ScopedSsh<'a> {
    registry: &'a SshRegistry,
    region: String,
    host: String,
    displaced: Option<String>,
    client: Option<SharedClient>,
}

impl<'a> ScopedSsh<'a> {
    /// Connect `client` and install it as the region's active client.
    pub async fn open(
        registry: &'a SshRegistry,
        region: &str,
        host: &str,
        mut client: SshClient,
        policy: RetryPolicy,
    ) -> Result<ScopedSsh<'a>> {
        client.connect(policy).await?;
        let displaced = registry.active_host(region);
        let shared = registry.insert(region, host, client);
        registry.set_active(region, host)?;
        Ok(ScopedSsh {
            registry,
            region: region.to_string(),
            host: host.to_string(),
            displaced,
            client: Some(shared),
        })
    }

    pub fn client(&self) -> SharedClient {
        self.client.as_ref().expect("client taken").clone()
    }

    /// Close the borrowed channel and restore the displaced active client.
    pub async fn close(mut self) {
        if let Some(client) = self.client.take() {
            client.lock().await.close().await;
        }
        self.restore();
    }

    fn restore(&mut self) {
        self.registry.remove(&self.region, &self.host);
        if let Some(prev) = self.displaced.take() {
            // The displaced client is still registered; only the pointer moved.
            let _ = self.registry.set_active(&self.region, &prev);
        }
    }
}

impl Drop for ScopedSsh<'_> {
    fn drop(&mut self) {
        // close() already ran restore via take(); a panic path lands here
        // with the client still present and must restore the pointer too.
        if self.client.take().is_some() {
            self.restore();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::transport::{BoxedShellStream, ShellConnector};
    use async_trait::async_trait;

    /// Connector that never connects; registry tests only need identity.
    struct NullConnector(String);

    #[async_trait]
    impl ShellConnector for NullConnector {
        async fn open(&self) -> Result<BoxedShellStream> {
            Err(Error::ssh(&self.0, "null connector"))
        }

        fn host(&self) -> &str {
            &self.0
        }
    }

    fn client(host: &str) -> SshClient {
        SshClient::new(Arc::new(NullConnector(host.to_string())), None, "pw").unwrap()
    }

    #[tokio::test]
    async fn one_active_client_per_region() {
        let reg = SshRegistry::new();
        reg.insert(PRIMARY_REGION, "controller-0", client("controller-0"));
        reg.insert(PRIMARY_REGION, "controller-1", client("controller-1"));

        reg.set_active(PRIMARY_REGION, "controller-0").unwrap();
        assert_eq!(
            reg.active_host(PRIMARY_REGION).as_deref(),
            Some("controller-0")
        );

        // Swact moves the pointer, replacing rather than adding.
        reg.set_active(PRIMARY_REGION, "controller-1").unwrap();
        assert_eq!(
            reg.active_host(PRIMARY_REGION).as_deref(),
            Some("controller-1")
        );
        assert_eq!(reg.active_controllers_map().len(), 1);
    }

    #[tokio::test]
    async fn activating_unregistered_client_is_misuse() {
        let reg = SshRegistry::new();
        assert!(matches!(
            reg.set_active(PRIMARY_REGION, "controller-9"),
            Err(Error::Misuse(_))
        ));
        assert!(matches!(
            reg.active_controller(PRIMARY_REGION),
            Err(Error::Misuse(_))
        ));
    }

    #[tokio::test]
    async fn active_map_lists_all_regions() {
        let reg = SshRegistry::new();
        reg.insert("RegionOne", "controller-0", client("controller-0"));
        reg.insert("subcloud1", "controller-0", client("subcloud1-c0"));
        reg.set_active("RegionOne", "controller-0").unwrap();
        reg.set_active("subcloud1", "controller-0").unwrap();
        let mut regions: Vec<String> = reg
            .active_controllers_map()
            .into_iter()
            .map(|(r, _)| r)
            .collect();
        regions.sort();
        assert_eq!(regions, ["RegionOne", "subcloud1"]);
    }

    #[tokio::test]
    async fn removing_active_client_clears_pointer() {
        let reg = SshRegistry::new();
        reg.insert(PRIMARY_REGION, "controller-0", client("controller-0"));
        reg.set_active(PRIMARY_REGION, "controller-0").unwrap();
        reg.remove(PRIMARY_REGION, "controller-0");
        assert!(reg.active_host(PRIMARY_REGION).is_none());
    }

    #[tokio::test]
    async fn scoped_ssh_restores_displaced_active_client_on_drop() {
        let reg = SshRegistry::new();
        reg.insert(PRIMARY_REGION, "controller-0", client("controller-0"));
        reg.set_active(PRIMARY_REGION, "controller-0").unwrap();

        {
            // Bypass open() so no live connection is needed: install the
            // borrowed client the way open() does.
            let shared = reg.insert(PRIMARY_REGION, "compute-1", client("compute-1"));
            let scoped = ScopedSsh {
                registry: &reg,
                region: PRIMARY_REGION.to_string(),
                host: "compute-1".to_string(),
                displaced: Some("controller-0".to_string()),
                client: Some(shared),
            };
            reg.set_active(PRIMARY_REGION, "compute-1").unwrap();
            assert_eq!(
                reg.active_host(PRIMARY_REGION).as_deref(),
                Some("compute-1")
            );
            drop(scoped);
        }

        assert_eq!(
            reg.active_host(PRIMARY_REGION).as_deref(),
            Some("controller-0")
        );
        assert!(reg.get(PRIMARY_REGION, "compute-1").is_none());
    }
}
