//! Numbered step logging and session log initialization
//!
//! Every test narrates its progress as numbered steps so a failure in a
//! thousand-line session log can be located by its last step banner.
//! Fixture steps and test steps count independently: fixtures narrate
//! setup/teardown work, the test body narrates its own sequence.

use std::fs::{self, OpenOptions};
use std::sync::Mutex;

use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::error::{Error, Result};
use crate::settings::LogPaths;

/// Which part of the test lifecycle is currently narrating
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Setup,
    Test,
    Teardown,
}

#[derive(Debug)]
struct State {
    phase: Phase,
    current_test: Option<String>,
    test_step: u32,
    fixture_step: u32,
}

/// Step counter shared by fixtures and test bodies
pub struct StepLog {
    inner: Mutex<State>,
}

impl Default for StepLog {
    fn default() -> Self {
        Self {
            inner: Mutex::new(State {
                phase: Phase::Setup,
                current_test: None,
                test_step: 0,
                fixture_step: 0,
            }),
        }
    }
}

impl StepLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter setup narration for `fixture`
    pub fn start_setup(&self, fixture: &str) {
        let mut s = self.inner.lock().unwrap();
        s.phase = Phase::Setup;
        info!(fixture, "------ setup ------");
    }

    /// Enter the test body. Step numbering restarts at 1 for each test.
    pub fn start_test(&self, name: &str) {
        let mut s = self.inner.lock().unwrap();
        s.phase = Phase::Test;
        s.current_test = Some(name.to_string());
        s.test_step = 0;
        s.fixture_step = 0;
        info!(test = name, "====== test started ======");
    }

    /// Enter teardown narration for `fixture`
    pub fn start_teardown(&self, fixture: &str) {
        let mut s = self.inner.lock().unwrap();
        s.phase = Phase::Teardown;
        info!(fixture, "------ teardown ------");
    }

    pub fn end_test(&self, name: &str, passed: bool) {
        let mut s = self.inner.lock().unwrap();
        s.current_test = None;
        let verdict = if passed { "PASSED" } else { "FAILED" };
        info!(test = name, verdict, "====== test ended ======");
    }

    pub fn phase(&self) -> Phase {
        self.inner.lock().unwrap().phase
    }

    /// Log `Test Step N: message`. Only valid inside a test body.
    pub fn test_step(&self, message: &str) -> Result<u32> {
        let mut s = self.inner.lock().unwrap();
        if s.phase != Phase::Test {
            return Err(Error::Misuse(format!(
                "test_step called during {:?} phase: {message}",
                s.phase
            )));
        }
        s.test_step += 1;
        info!("Test Step {}: {message}", s.test_step);
        Ok(s.test_step)
    }

    /// Log `Fixture Step N: message`. Only valid during setup/teardown.
    pub fn fixture_step(&self, message: &str) -> Result<u32> {
        let mut s = self.inner.lock().unwrap();
        if s.phase == Phase::Test {
            return Err(Error::Misuse(format!(
                "fixture_step called inside a test body: {message}"
            )));
        }
        s.fixture_step += 1;
        info!("Fixture Step {}: {message}", s.fixture_step);
        Ok(s.fixture_step)
    }
}

/// Install the session-wide tracing subscriber: everything goes to the
/// session logfile, INFO and up also to stderr. `RUST_LOG` overrides the
/// default filter.
///
/// Call once per process; a second call fails with [`Error::Misuse`].
pub fn init_session_logging(logs: &LogPaths) -> Result<()> {
    fs::create_dir_all(&logs.base)?;
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(logs.session_log())?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,stratus_harness=debug"));

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .with_thread_names(true)
        .with_line_number(true);
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(stderr_layer)
        .try_init()
        .map_err(|e| Error::Misuse(format!("logging already initialized: {e}")))
}
