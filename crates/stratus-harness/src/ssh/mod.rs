//! Multi-endpoint SSH connection fabric
//!
//! - [`transport`] — the byte-stream seam and the russh implementation
//! - [`client`] — prompt-following interactive client
//! - [`registry`] — `(region, host)` client registry with active tracking

pub mod client;
pub mod registry;
pub mod transport;

pub use client::{ExecOpts, ExpectMatch, RetryPolicy, SshClient, DEFAULT_PROMPT};
pub use registry::{ScopedSsh, SharedClient, SshRegistry, PRIMARY_REGION};
pub use transport::{HostAccess, ShellConnector, SshConnector};
