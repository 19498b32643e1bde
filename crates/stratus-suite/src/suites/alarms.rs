//! Alarm-show vs alarm-list agreement across a host lock cycle

use std::sync::Arc;

use tracing::info;

use stratus_harness::alarm_ids::AlarmId;
use stratus_harness::cleanup::Scope;
use stratus_harness::cli::{Cli, Tool};
use stratus_harness::error::Result;
use stratus_harness::fixtures::{HarnessContext, Precondition, TestFixture};
use stratus_harness::poll::{wait_for_host_states, WaitOpts};
use stratus_harness::table::{parse_table, FilterOpts, Match};
use stratus_harness::timeouts::{EventLogTimeout, HostTimeout};

use crate::harness::{ScenarioOutcome, SuiteHarness};

pub async fn run(ctx: &Arc<HarnessContext>, harness: &SuiteHarness) {
    harness
        .run("lock_alarm_agreement", || lock_alarm_agreement(ctx.clone()))
        .await;
}

/// Lock a worker host and verify the fault subsystem tells one coherent
/// story: alarm-list gains a 200.001 tuple, alarm-show for its UUID agrees
/// cell for cell, the event log carries a set and later a clear entry.
async fn lock_alarm_agreement(ctx: Arc<HarnessContext>) -> ScenarioOutcome {
    let fixture = TestFixture::setup(ctx.clone(), "lock_alarm_agreement")
        .await
        .map_err(|e| e.to_string())?;
    if let Precondition::Skip(skip) = fixture.no_simplex() {
        fixture.teardown(true).await.map_err(|e| e.to_string())?;
        return Ok(Some(skip));
    }

    let body = body(&ctx).await;
    let passed = body.is_ok();
    let teardown = fixture.teardown(passed).await;
    body.map_err(|e| e.to_string())?;
    teardown.map_err(|e| e.to_string())?;
    Ok(None)
}

async fn body(ctx: &Arc<HarnessContext>) -> Result<()> {
    let shared = ctx.active_client()?;
    let auth = ctx.profile("admin_platform")?;
    let cli = Cli::new(&shared, &auth);

    let target = pick_unlocked_worker(&cli).await?;
    ctx.recovery.add([target.clone()], Scope::Function);

    ctx.steps.test_step(&format!("lock {target}"))?;
    cli.exec(Tool::System, &format!("host-lock {target}")).await?;
    wait_for_host_states(
        &cli,
        &target,
        "locked",
        "disabled",
        "online",
        WaitOpts::new(HostTimeout::LOCK),
    )
    .await?;

    ctx.steps.test_step("verify the host-locked alarm is raised")?;
    let raised = ctx
        .alarms
        .wait_for_alarm(
            &cli,
            AlarmId::HOST_LOCKED,
            Some(&target),
            WaitOpts::new(EventLogTimeout::ALARM_APPEARS),
        )
        .await?;

    ctx.steps.test_step("compare alarm-show against alarm-list")?;
    let uuid = alarm_uuid(&cli, AlarmId::HOST_LOCKED, &target).await?;
    let show = cli
        .exec(Tool::Fm, &format!("alarm-show {uuid}"))
        .await?;
    let show = parse_table(&show)?;
    assert_cells_agree(&show, &raised.alarm_id, &raised.entity_id, &raised.severity)?;

    ctx.steps.test_step("verify a set event was logged")?;
    expect_event(&cli, AlarmId::HOST_LOCKED, &target, "set").await?;

    ctx.steps.test_step(&format!("unlock {target}"))?;
    cli.exec(Tool::System, &format!("host-unlock {target}"))
        .await?;
    wait_for_host_states(
        &cli,
        &target,
        "unlocked",
        "enabled",
        "available",
        WaitOpts::new(HostTimeout::UNLOCK),
    )
    .await?;
    // Recovered by the test itself.
    ctx.recovery.remove([target.clone()], Scope::Function);

    ctx.steps.test_step("verify the alarm cleared and a clear event was logged")?;
    ctx.alarms
        .wait_for_alarm_gone(
            &cli,
            AlarmId::HOST_LOCKED,
            Some(&target),
            WaitOpts::new(EventLogTimeout::ALARM_CLEARS),
        )
        .await?;
    expect_event(&cli, AlarmId::HOST_LOCKED, &target, "clear").await?;

    info!(host = %target, "alarm agreement verified");
    Ok(())
}

/// First unlocked non-controller host in the inventory
async fn pick_unlocked_worker(cli: &Cli<'_>) -> Result<String> {
    let out = cli.exec(Tool::System, "host-list --nowrap").await?;
    let workers = parse_table(&out)?.filter(
        &[
            ("personality", Match::not("controller")),
            ("administrative", Match::is("unlocked")),
        ],
        FilterOpts::default(),
    )?;
    workers
        .column("hostname")?
        .into_iter()
        .next()
        .ok_or_else(|| stratus_harness::Error::no_match("unlocked worker host"))
}

/// UUID of the active alarm matching `(alarm_id, entity substring)`
async fn alarm_uuid(cli: &Cli<'_>, alarm_id: &str, entity: &str) -> Result<String> {
    let out = cli.exec(Tool::Fm, "alarm-list --nowrap --uuid").await?;
    let table = parse_table(&out)?;
    let rows = table.filter(
        &[
            ("alarm id", Match::is(alarm_id)),
            ("entity id", Match::is(entity)),
        ],
        FilterOpts::loose(),
    )?;
    rows.column("uuid")?
        .into_iter()
        .next()
        .ok_or_else(|| stratus_harness::Error::no_match(format!("alarm {alarm_id} uuid")))
}

fn assert_cells_agree(
    show: &stratus_harness::table::Table,
    alarm_id: &str,
    entity_id: &str,
    severity: &str,
) -> Result<()> {
    let pairs = [
        ("alarm_id", alarm_id),
        ("entity_instance_id", entity_id),
        ("severity", severity),
    ];
    for (key, expected) in pairs {
        let got = show.value_two_col(key)?;
        if got != expected {
            return Err(stratus_harness::Error::service(
                "fm",
                format!("alarm-show {key} is '{got}', alarm-list says '{expected}'"),
            ));
        }
    }
    Ok(())
}

/// Wait for an event-list entry with the given state for `(event, entity)`
async fn expect_event(cli: &Cli<'_>, event_id: &str, entity: &str, state: &str) -> Result<()> {
    stratus_harness::poll::wait_for_val(
        &format!("event {event_id} state={state}"),
        WaitOpts::new(EventLogTimeout::EVENT_APPEARS),
        || async move {
            let out = cli
                .exec(
                    Tool::Fm,
                    &format!("event-list --nowrap --limit 50 -q event_log_id={event_id}"),
                )
                .await?;
            let table = parse_table(&out)?;
            let rows = table.filter(
                &[
                    ("state", Match::is(state)),
                    ("entity instance id", Match::is(entity)),
                ],
                FilterOpts::loose(),
            )?;
            Ok(!rows.values.is_empty())
        },
        |hit| *hit,
    )
    .await
    .map(|_| ())
}
