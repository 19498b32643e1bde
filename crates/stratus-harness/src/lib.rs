//! Core harness for end-to-end automation of a distributed edge cloud
//! platform: SSH fabric, CLI dispatch, table parsing, polling, and the
//! fixture lifecycle that keeps a shared lab clean between tests.
//!
//! Everything a test touches flows through [`fixtures::HarnessContext`]:
//! commands go out over the [`ssh`] registry, get composed by [`cli`],
//! their tabular output is parsed by [`table`], state transitions are
//! awaited by [`poll`], and anything created or degraded is recorded in
//! [`cleanup`] and [`recovery`] ledgers that drain at scope teardown.

pub mod alarm_guard;
pub mod alarm_ids;
pub mod assets;
pub mod cleanup;
pub mod cli;
pub mod error;
pub mod fixtures;
pub mod poll;
pub mod recovery;
pub mod settings;
pub mod ssh;
pub mod steplog;
pub mod table;
pub mod timeouts;

pub use error::{Error, Result, Skip};
pub use fixtures::{HarnessContext, Precondition, Session, TestFixture};

/// Shell user the platform images ship with
pub const PLATFORM_USER: &str = "sysadmin";

/// Default OpenStack/platform admin password on freshly installed labs
pub const DEFAULT_ADMIN_PASSWORD: &str = "Li69nux*";
