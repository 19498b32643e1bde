//! Poll-until-predicate engine
//!
//! The single primitive underneath every `wait_for_*` helper in the
//! harness. Guarantees: the getter runs at least once before the first
//! sleep; the loop exits as soon as the predicate holds; a timeout carries
//! the last observed value. Cancellation is cooperative — an in-flight
//! getter is never interrupted, so callers bound each getter's own timeout.

use std::fmt::Debug;
use std::future::Future;
use std::time::Duration;

use regex::Regex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::cli::{Cli, CommandRunner, Tool};
use crate::error::{Error, Result};
use crate::table::{parse_table, FilterOpts, Match};
use crate::timeouts::{HostTimeout, DEFAULT_CHECK_INTERVAL};

/// Timeout and interval for one wait
#[derive(Debug, Clone, Copy)]
pub struct WaitOpts {
    pub timeout: Duration,
    pub check_interval: Duration,
}

impl WaitOpts {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            check_interval: DEFAULT_CHECK_INTERVAL,
        }
    }

    pub fn interval(mut self, check_interval: Duration) -> Self {
        self.check_interval = check_interval;
        self
    }
}

/// Outcome of a non-raising wait
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome<T> {
    /// Predicate held; the satisfying value
    Satisfied(T),
    /// Budget expired; the last observed value
    TimedOut(T),
}

impl<T> WaitOutcome<T> {
    pub fn satisfied(&self) -> bool {
        matches!(self, WaitOutcome::Satisfied(_))
    }

    pub fn into_value(self) -> T {
        match self {
            WaitOutcome::Satisfied(v) | WaitOutcome::TimedOut(v) => v,
        }
    }
}

/// Poll `getter` until `predicate` holds, never raising on timeout.
///
/// Transient getter errors are logged and retried; if the budget expires
/// without a single successful observation the last error is returned.
/// The final poll lands at or after the full budget, so a condition that
/// becomes true within the budget is always observed.
pub async fn try_wait_for_val<T, G, Fut, P>(
    description: &str,
    opts: WaitOpts,
    mut getter: G,
    mut predicate: P,
) -> Result<WaitOutcome<T>>
where
    G: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    P: FnMut(&T) -> bool,
{
    let start = Instant::now();
    let mut last: Option<T> = None;
    let mut last_err: Option<Error> = None;

    loop {
        match getter().await {
            Ok(value) => {
                if predicate(&value) {
                    debug!(condition = description, elapsed = ?start.elapsed(), "condition met");
                    return Ok(WaitOutcome::Satisfied(value));
                }
                last = Some(value);
                last_err = None;
            }
            Err(e) if e.is_retryable() => {
                warn!(condition = description, error = %e, "getter failed, retrying");
                last_err = Some(e);
            }
            Err(e) => return Err(e),
        }

        let elapsed = start.elapsed();
        if elapsed >= opts.timeout {
            return match (last, last_err) {
                (Some(v), _) => Ok(WaitOutcome::TimedOut(v)),
                (None, Some(e)) => Err(e),
                (None, None) => unreachable!("no observation and no error"),
            };
        }
        // The last sleep is clamped so the final poll lands at or after the
        // full budget even when the budget is not a multiple of the interval.
        tokio::time::sleep(opts.check_interval.min(opts.timeout - elapsed)).await;
    }
}

/// Poll `getter` until `predicate` holds, raising [`Error::WaitTimeout`]
/// (carrying the last observed value) when the budget expires.
pub async fn wait_for_val<T, G, Fut, P>(
    description: &str,
    opts: WaitOpts,
    getter: G,
    predicate: P,
) -> Result<T>
where
    T: Debug,
    G: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    P: FnMut(&T) -> bool,
{
    match try_wait_for_val(description, opts, getter, predicate).await? {
        WaitOutcome::Satisfied(v) => Ok(v),
        WaitOutcome::TimedOut(v) => Err(Error::WaitTimeout {
            condition: description.to_string(),
            waited: opts.timeout,
            last: format!("{v:?}"),
        }),
    }
}

// =============================================================================
// Derived waiters
// =============================================================================

/// Wait until `system host-show <host>` reports the given field values.
/// Fields compose: `[("administrative", "unlocked"), ("availability", "available")]`.
pub async fn wait_for_host_fields(
    cli: &Cli<'_>,
    host: &str,
    fields: &[(&str, &str)],
    opts: WaitOpts,
) -> Result<Vec<String>> {
    let expected: Vec<String> = fields.iter().map(|(_, v)| v.to_string()).collect();
    let description = format!("{host} reaches {fields:?}");
    wait_for_val(
        &description,
        opts,
        || async move {
            let out = cli
                .exec(Tool::System, &format!("host-show {host} --nowrap"))
                .await?;
            let table = parse_table(&out)?;
            let keys: Vec<&str> = fields.iter().map(|(k, _)| *k).collect();
            table.multi_values_two_col(&keys)
        },
        |vals| vals == &expected,
    )
    .await
}

/// Wait for the host state-machine triple
pub async fn wait_for_host_states(
    cli: &Cli<'_>,
    host: &str,
    administrative: &str,
    operational: &str,
    availability: &str,
    opts: WaitOpts,
) -> Result<Vec<String>> {
    wait_for_host_fields(
        cli,
        host,
        &[
            ("administrative", administrative),
            ("operational", operational),
            ("availability", availability),
        ],
        opts,
    )
    .await
}

/// Wait until a VM reaches one of the given statuses
pub async fn wait_for_vm_status(
    cli: &Cli<'_>,
    vm_id: &str,
    statuses: &[&str],
    opts: WaitOpts,
) -> Result<String> {
    let wanted: Vec<String> = statuses.iter().map(|s| s.to_string()).collect();
    let description = format!("vm {vm_id} status in {statuses:?}");
    wait_for_val(
        &description,
        opts,
        || async move {
            let out = cli
                .exec(Tool::Openstack, &format!("server show {vm_id}"))
                .await?;
            parse_table(&out)?.value_two_col("status")
        },
        |status| wanted.iter().any(|w| w == status),
    )
    .await
}

/// One `kubectl get pods` row that is not in an acceptable state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnhealthyPod {
    pub name: String,
    pub status: String,
}

/// Wait until every pod in `namespace` is Running, or Completed for pods
/// matching `completed_ok`. Returns the final (empty) offender list.
pub async fn wait_for_pods_status(
    cli: &Cli<'_>,
    namespace: &str,
    completed_ok: Option<&Regex>,
    opts: WaitOpts,
) -> Result<Vec<UnhealthyPod>> {
    let description = format!("all pods healthy in {namespace}");
    wait_for_val(
        &description,
        opts,
        || async move {
            let out = cli
                .exec(
                    Tool::Kubectl,
                    &format!("get pods -n {namespace} --no-headers"),
                )
                .await?;
            Ok(unhealthy_pods(&out, completed_ok))
        },
        |offenders: &Vec<UnhealthyPod>| offenders.is_empty(),
    )
    .await
}

/// Parse `kubectl get pods --no-headers` output into the offender list.
/// kubectl emits whitespace columns (NAME READY STATUS RESTARTS AGE), not a
/// framed table.
fn unhealthy_pods(output: &str, completed_ok: Option<&Regex>) -> Vec<UnhealthyPod> {
    let mut offenders = Vec::new();
    for line in output.lines() {
        let cols: Vec<&str> = line.split_whitespace().collect();
        if cols.len() < 3 {
            continue;
        }
        let (name, status) = (cols[0], cols[2]);
        let ok = match status {
            "Running" => true,
            "Completed" => completed_ok.map(|re| re.is_match(name)).unwrap_or(true),
            _ => false,
        };
        if !ok {
            offenders.push(UnhealthyPod {
                name: name.to_string(),
                status: status.to_string(),
            });
        }
    }
    offenders
}

/// Wait until `kubectl get nodes` reports every node Ready
pub async fn wait_for_nodes_ready(cli: &Cli<'_>, opts: WaitOpts) -> Result<Vec<String>> {
    wait_for_val(
        "all kubernetes nodes Ready",
        opts,
        || async move {
            let out = cli.exec(Tool::Kubectl, "get nodes --no-headers").await?;
            let not_ready: Vec<String> = out
                .lines()
                .filter_map(|line| {
                    let cols: Vec<&str> = line.split_whitespace().collect();
                    if cols.len() < 2 {
                        return None;
                    }
                    (cols[1] != "Ready").then(|| format!("{}={}", cols[0], cols[1]))
                })
                .collect();
            Ok(not_ready)
        },
        |not_ready: &Vec<String>| not_ready.is_empty(),
    )
    .await
}

/// Wait until a subcloud's `(management, availability, sync)` tuple reaches
/// the target
pub async fn wait_for_subcloud_status(
    cli: &Cli<'_>,
    subcloud: &str,
    management: &str,
    availability: &str,
    sync: &str,
    opts: WaitOpts,
) -> Result<Vec<String>> {
    let expected = vec![
        management.to_string(),
        availability.to_string(),
        sync.to_string(),
    ];
    let description = format!("subcloud {subcloud} reaches {management}/{availability}/{sync}");
    wait_for_val(
        &description,
        opts,
        || async move {
            let out = cli.exec(Tool::Dcmanager, "subcloud list").await?;
            let table = parse_table(&out)?;
            let rows = table.filter(&[("name", Match::is(subcloud))], FilterOpts::default())?;
            if rows.values.is_empty() {
                return Err(Error::no_match(format!("subcloud '{subcloud}'")));
            }
            Ok(vec![
                rows.values_with("management", &[], FilterOpts::default())?[0].clone(),
                rows.values_with("availability", &[], FilterOpts::default())?[0].clone(),
                rows.values_with("sync", &[], FilterOpts::default())?[0].clone(),
            ])
        },
        |tuple| tuple == &expected,
    )
    .await
}

/// Summary of one ping burst
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingStats {
    pub transmitted: u32,
    pub received: u32,
}

impl PingStats {
    pub fn loss(&self) -> u32 {
        self.transmitted.saturating_sub(self.received)
    }
}

/// Send `count` ICMP echoes from `runner`'s host and parse the summary line
pub async fn ping_from(runner: &dyn CommandRunner, target: &str, count: u32) -> Result<PingStats> {
    let out = runner
        .run(&format!("ping -c {count} -W 2 {target}"), HostTimeout::PING)
        .await?;
    parse_ping_summary(&out.output)
        .ok_or_else(|| Error::no_match(format!("ping summary for {target}")))
}

fn parse_ping_summary(output: &str) -> Option<PingStats> {
    // "100 packets transmitted, 100 received, 0% packet loss, time 99126ms"
    let line = output
        .lines()
        .find(|l| l.contains("packets transmitted"))?;
    let mut nums = line
        .split(|c: char| !c.is_ascii_digit())
        .filter(|s| !s.is_empty());
    let transmitted = nums.next()?.parse().ok()?;
    let received = nums.next()?.parse().ok()?;
    Some(PingStats {
        transmitted,
        received,
    })
}

/// Wait until `target` answers at least one echo out of `count` from the
/// NAT box (or any other runner)
pub async fn wait_for_pingable(
    runner: &dyn CommandRunner,
    target: &str,
    count: u32,
    opts: WaitOpts,
) -> Result<PingStats> {
    let description = format!("{target} pingable");
    wait_for_val(
        &description,
        opts,
        || async move { ping_from(runner, target, count).await },
        |stats| stats.received >= 1,
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn opts(timeout_s: u64, interval_s: u64) -> WaitOpts {
        WaitOpts::new(Duration::from_secs(timeout_s)).interval(Duration::from_secs(interval_s))
    }

    #[tokio::test(start_paused = true)]
    async fn getter_runs_before_first_sleep_and_exits_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let v = wait_for_val(
            "already true",
            opts(10, 1),
            move || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(42)
                }
            },
            |v| *v == 42,
        )
        .await
        .unwrap();
        assert_eq!(v, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    /// Law: a getter that becomes true at t* is observed within one interval.
    #[tokio::test(start_paused = true)]
    async fn satisfied_within_one_interval_of_becoming_true() {
        let start = Instant::now();
        let flip_at = Duration::from_secs(7);
        let v = wait_for_val(
            "flips at 7s",
            opts(60, 2),
            || async move { Ok(start.elapsed() >= flip_at) },
            |v| *v,
        )
        .await
        .unwrap();
        assert!(v);
        let elapsed = start.elapsed();
        assert!(elapsed >= flip_at);
        assert!(elapsed < flip_at + Duration::from_secs(2) + Duration::from_millis(100));
    }

    /// Law: a never-true getter returns TimedOut at ~T with the last value.
    #[tokio::test(start_paused = true)]
    async fn timeout_returns_last_value_without_raising() {
        let start = Instant::now();
        let outcome = try_wait_for_val(
            "never true",
            opts(30, 3),
            || async { Ok("degraded".to_string()) },
            |_| false,
        )
        .await
        .unwrap();
        assert_eq!(outcome, WaitOutcome::TimedOut("degraded".to_string()));
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(30));
        assert!(elapsed <= Duration::from_secs(34));
    }

    /// Law: with a budget that is not a multiple of the interval, the final
    /// poll still lands at the budget, so a condition that becomes true late
    /// in the window is observed rather than misreported as a timeout.
    #[tokio::test(start_paused = true)]
    async fn late_flip_observed_when_budget_not_interval_aligned() {
        let start = Instant::now();
        let flip_at = Duration::from_secs(29);
        let v = wait_for_val(
            "flips at 29s",
            opts(30, 7),
            || async move { Ok(start.elapsed() >= flip_at) },
            |v| *v,
        )
        .await
        .unwrap();
        assert!(v);
        let elapsed = start.elapsed();
        assert!(elapsed >= flip_at);
        assert!(elapsed <= Duration::from_secs(30) + Duration::from_millis(100));
    }

    /// Law: a never-true getter runs for the whole budget, never less.
    #[tokio::test(start_paused = true)]
    async fn timeout_waits_out_the_full_budget() {
        let start = Instant::now();
        let outcome = try_wait_for_val("never true", opts(30, 7), || async { Ok(false) }, |v| *v)
            .await
            .unwrap();
        assert!(!outcome.satisfied());
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(30));
        assert!(elapsed <= Duration::from_secs(37));
    }

    #[tokio::test(start_paused = true)]
    async fn raising_variant_carries_last_value_in_error() {
        let err = wait_for_val(
            "host availability",
            opts(10, 2),
            || async { Ok("offline".to_string()) },
            |v| v == "available",
        )
        .await
        .unwrap_err();
        match err {
            Error::WaitTimeout { condition, last, .. } => {
                assert_eq!(condition, "host availability");
                assert!(last.contains("offline"));
            }
            other => panic!("expected WaitTimeout, got {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn transient_getter_errors_are_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let v = wait_for_val(
            "flaky getter",
            opts(30, 1),
            move || {
                let c = c.clone();
                async move {
                    let n = c.fetch_add(1, Ordering::SeqCst);
                    if n < 2 {
                        Err(Error::ssh("controller-0", "channel reset"))
                    } else {
                        Ok(n)
                    }
                }
            },
            |v| *v >= 2,
        )
        .await
        .unwrap();
        assert_eq!(v, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_getter_error_aborts_the_wait() {
        let err = wait_for_val(
            "bad table",
            opts(30, 1),
            || async { Err::<u32, _>(Error::table("missing separator")) },
            |_| true,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::InvalidTableStructure { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn all_errors_until_timeout_returns_last_error() {
        let err = try_wait_for_val(
            "never reachable",
            opts(5, 1),
            || async { Err::<u32, _>(Error::ssh("compute-1", "no route")) },
            |_| true,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Ssh { .. }));
    }

    struct RecordingPinger {
        timeouts: std::sync::Mutex<Vec<Duration>>,
    }

    #[async_trait::async_trait]
    impl CommandRunner for RecordingPinger {
        async fn run(&self, _cmd: &str, timeout: Duration) -> Result<crate::cli::CmdOutput> {
            self.timeouts.lock().unwrap().push(timeout);
            Ok(crate::cli::CmdOutput {
                exit_code: 0,
                output: "2 packets transmitted, 2 received, 0% packet loss".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn ping_burst_runs_under_the_host_ping_budget() {
        let runner = RecordingPinger {
            timeouts: std::sync::Mutex::new(Vec::new()),
        };
        let stats = ping_from(&runner, "192.168.101.5", 2).await.unwrap();
        assert_eq!(stats.received, 2);
        assert_eq!(runner.timeouts.lock().unwrap()[0], HostTimeout::PING);
    }

    #[test]
    fn ping_summary_parsing() {
        let out = "PING 192.168.101.5\n\
                   64 bytes from 192.168.101.5: icmp_seq=1 ttl=64 time=0.5 ms\n\
                   --- 192.168.101.5 ping statistics ---\n\
                   100 packets transmitted, 98 received, 2% packet loss, time 99126ms";
        let stats = parse_ping_summary(out).unwrap();
        assert_eq!(stats.transmitted, 100);
        assert_eq!(stats.received, 98);
        assert_eq!(stats.loss(), 2);
        assert!(parse_ping_summary("garbage").is_none());
    }

    #[test]
    fn pod_health_classification() {
        let out = "\
ingress-abc                      1/1   Running     0  4d
audit-job-xyz                    0/1   Completed   0  2h
image-prefetch-7                 0/1   Completed   0  2h
calico-node-2                    0/1   CrashLoopBackOff  7  4d";
        // No allowlist: Completed is acceptable for any pod.
        let offenders = unhealthy_pods(out, None);
        assert_eq!(offenders.len(), 1);
        assert_eq!(offenders[0].status, "CrashLoopBackOff");

        // Allowlist: only matching pods may be Completed.
        let re = Regex::new("^audit-job").unwrap();
        let offenders = unhealthy_pods(out, Some(&re));
        assert_eq!(offenders.len(), 2);
        assert!(offenders.iter().any(|p| p.name == "image-prefetch-7"));
    }
}
