//! Alarm baseline guard
//!
//! Snapshots `fm alarm-list` before a test and verifies afterwards that the
//! test left no new alarms behind. New alarms on the whitelist (transient
//! by design, e.g. config out-of-date during an apply) are given time to
//! clear; anything else fails the check immediately.

use std::sync::Mutex;

use tracing::{info, warn};

use crate::alarm_ids::DEFAULT_ALARM_WHITELIST;
use crate::cli::{Cli, Tool};
use crate::error::{Error, Result};
use crate::poll::{try_wait_for_val, WaitOpts};
use crate::table::parse_table;
use crate::timeouts::EventLogTimeout;

/// Identity of one active alarm. Reason text and timestamp are excluded so
/// a re-raised alarm with a fresher timestamp compares equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AlarmTuple {
    pub alarm_id: String,
    pub entity_id: String,
    pub severity: String,
}

/// Difference between two alarm snapshots
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AlarmDelta {
    pub appeared: Vec<AlarmTuple>,
    pub cleared: Vec<AlarmTuple>,
}

impl AlarmDelta {
    pub fn is_empty(&self) -> bool {
        self.appeared.is_empty() && self.cleared.is_empty()
    }
}

/// Pure set difference of two snapshots. Same inputs, same delta; order
/// follows the `after` (for appeared) and `before` (for cleared) listings.
pub fn diff_alarms(before: &[AlarmTuple], after: &[AlarmTuple]) -> AlarmDelta {
    AlarmDelta {
        appeared: after
            .iter()
            .filter(|a| !before.contains(a))
            .cloned()
            .collect(),
        cleared: before
            .iter()
            .filter(|a| !after.contains(a))
            .cloned()
            .collect(),
    }
}

/// Parse `fm alarm-list --nowrap` output into alarm tuples. An empty alarm
/// table prints nothing at all, which is a valid empty snapshot.
pub fn parse_alarms(output: &str) -> Result<Vec<AlarmTuple>> {
    if !output.lines().any(|l| l.trim_start().starts_with('+')) {
        return Ok(Vec::new());
    }
    let table = parse_table(output)?;
    let ids = table.column("alarm id")?;
    let entities = table.column("entity id")?;
    let severities = table.column("severity")?;
    Ok(ids
        .into_iter()
        .zip(entities)
        .zip(severities)
        .map(|((alarm_id, entity_id), severity)| AlarmTuple {
            alarm_id,
            entity_id,
            severity,
        })
        .collect())
}

/// Per-test alarm guard bound to a whitelist of tolerated alarm ids
pub struct AlarmGuard {
    baseline: Mutex<Vec<AlarmTuple>>,
    whitelist: Vec<String>,
}

impl Default for AlarmGuard {
    fn default() -> Self {
        Self::new(DEFAULT_ALARM_WHITELIST.iter().map(|s| s.to_string()))
    }
}

impl AlarmGuard {
    pub fn new<I: IntoIterator<Item = String>>(whitelist: I) -> Self {
        Self {
            baseline: Mutex::new(Vec::new()),
            whitelist: whitelist.into_iter().collect(),
        }
    }

    async fn list(&self, cli: &Cli<'_>) -> Result<Vec<AlarmTuple>> {
        let out = cli.exec(Tool::Fm, "alarm-list --nowrap").await?;
        parse_alarms(&out)
    }

    /// Record the pre-test snapshot
    pub async fn snapshot(&self, cli: &Cli<'_>) -> Result<()> {
        let alarms = self.list(cli).await?;
        info!(active = alarms.len(), "alarm baseline recorded");
        *self.baseline.lock().unwrap() = alarms;
        Ok(())
    }

    pub fn baseline(&self) -> Vec<AlarmTuple> {
        self.baseline.lock().unwrap().clone()
    }

    fn whitelisted(&self, alarm: &AlarmTuple) -> bool {
        self.whitelist.iter().any(|id| id == &alarm.alarm_id)
    }

    /// Post-test check: any new non-whitelisted alarm fails at once; new
    /// whitelisted alarms get [`EventLogTimeout::ALARM_CLEARS`] to go away.
    pub async fn verify(&self, cli: &Cli<'_>) -> Result<()> {
        let baseline = self.baseline();
        let delta = diff_alarms(&baseline, &self.list(cli).await?);
        if delta.is_empty() {
            return Ok(());
        }
        for gone in &delta.cleared {
            info!(alarm = %gone.alarm_id, entity = %gone.entity_id, "baseline alarm cleared during test");
        }

        let (tolerated, offending): (Vec<_>, Vec<_>) = delta
            .appeared
            .into_iter()
            .partition(|a| self.whitelisted(a));
        if !offending.is_empty() {
            return Err(Error::service(
                "fm",
                format!("unexpected new alarms after test: {offending:?}"),
            ));
        }
        if tolerated.is_empty() {
            return Ok(());
        }

        warn!(?tolerated, "whitelisted alarms raised, waiting for clear");
        let tolerated = &tolerated;
        let outcome = try_wait_for_val(
            "whitelisted alarms clear",
            WaitOpts::new(EventLogTimeout::ALARM_CLEARS),
            || async move {
                let now = self.list(cli).await?;
                let lingering: Vec<AlarmTuple> = tolerated
                    .iter()
                    .filter(|a| now.contains(a))
                    .cloned()
                    .collect();
                Ok(lingering)
            },
            |lingering: &Vec<AlarmTuple>| lingering.is_empty(),
        )
        .await?;
        match outcome {
            o if o.satisfied() => Ok(()),
            o => Err(Error::service(
                "fm",
                format!("whitelisted alarms never cleared: {:?}", o.into_value()),
            )),
        }
    }

    /// Wait for a specific alarm id to appear against an entity
    pub async fn wait_for_alarm(
        &self,
        cli: &Cli<'_>,
        alarm_id: &str,
        entity_contains: Option<&str>,
        opts: WaitOpts,
    ) -> Result<AlarmTuple> {
        let description = format!("alarm {alarm_id} raised");
        let found = crate::poll::wait_for_val(
            &description,
            opts,
            || async move {
                let now = self.list(cli).await?;
                Ok(now.into_iter().find(|a| {
                    a.alarm_id == alarm_id
                        && entity_contains.map_or(true, |e| a.entity_id.contains(e))
                }))
            },
            |hit: &Option<AlarmTuple>| hit.is_some(),
        )
        .await?;
        found.ok_or_else(|| Error::no_match(format!("alarm {alarm_id}")))
    }

    /// Wait for a specific alarm id to disappear
    pub async fn wait_for_alarm_gone(
        &self,
        cli: &Cli<'_>,
        alarm_id: &str,
        entity_contains: Option<&str>,
        opts: WaitOpts,
    ) -> Result<()> {
        let description = format!("alarm {alarm_id} cleared");
        crate::poll::wait_for_val(
            &description,
            opts,
            || async move {
                let now = self.list(cli).await?;
                let lingering = now.iter().any(|a| {
                    a.alarm_id == alarm_id
                        && entity_contains.map_or(true, |e| a.entity_id.contains(e))
                });
                Ok(lingering)
            },
            |lingering| !*lingering,
        )
        .await
        .map(|_| ())
    }
}
