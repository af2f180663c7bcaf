//! `crowdrun status` command: show task run progress and unit counts.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use uuid::Uuid;

use crowdrun_core::assignment::assignment_status;
use crowdrun_db::Datastore;
use crowdrun_db::models::TaskRun;

/// Run the status command.
///
/// When `task_run_id_str` is `Some`, shows detailed status for that run.
/// When `None`, lists all task runs with a progress summary.
pub async fn run_status(datastore: &dyn Datastore, task_run_id_str: Option<&str>) -> Result<()> {
    let report = match task_run_id_str {
        Some(id_str) => task_run_report(datastore, id_str).await?,
        None => fleet_report(datastore).await?,
    };
    print!("{report}");
    Ok(())
}

/// Terminal and total assignment counts for one run.
struct Progress {
    done: usize,
    total: usize,
    by_status: BTreeMap<String, usize>,
}

async fn progress(datastore: &dyn Datastore, task_run_id: Uuid) -> Result<Progress> {
    let assignments = datastore
        .list_assignments(task_run_id)
        .await
        .with_context(|| format!("failed to list assignments of task run {task_run_id}"))?;

    let mut progress = Progress {
        done: 0,
        total: assignments.len(),
        by_status: BTreeMap::new(),
    };
    for assignment in &assignments {
        let status = assignment_status(datastore, assignment.id).await?;
        if status.is_terminal() {
            progress.done += 1;
        }
        *progress.by_status.entry(status.to_string()).or_insert(0) += 1;
    }
    Ok(progress)
}

fn run_state(run: &TaskRun) -> &'static str {
    if run.is_completed { "completed" } else { "running" }
}

/// Detailed report for a single task run.
async fn task_run_report(datastore: &dyn Datastore, task_run_id_str: &str) -> Result<String> {
    let task_run_id = Uuid::parse_str(task_run_id_str)
        .with_context(|| format!("invalid task run ID: {task_run_id_str}"))?;

    let run = datastore
        .get_task_run(task_run_id)
        .await
        .with_context(|| format!("task run {task_run_id} not found"))?;
    let task = datastore
        .get_task(run.task_id)
        .await
        .with_context(|| format!("failed to load task {}", run.task_id))?;

    let mut out = String::new();
    out.push_str(&format!("Task run: {} ({})\n", task.name, run.id));
    out.push_str(&format!("Task type: {}\n", run.task_type));
    out.push_str(&format!("Provider: {}\n", run.provider_type));
    out.push_str(&format!("State: {}\n", run_state(&run)));
    out.push_str(&format!(
        "Created: {}\n\n",
        run.created_at.format("%Y-%m-%d %H:%M:%S UTC")
    ));

    let progress = progress(datastore, run.id).await?;
    out.push_str(&format!(
        "Assignments: {}/{} finished\n",
        progress.done, progress.total
    ));
    for (status, count) in &progress.by_status {
        out.push_str(&format!("  {status:<14} {count:>6}\n"));
    }
    out.push('\n');

    let units = datastore
        .list_units_for_task_run(run.id, None)
        .await
        .with_context(|| format!("failed to list units of task run {}", run.id))?;
    let mut unit_counts: BTreeMap<String, usize> = BTreeMap::new();
    for unit in &units {
        *unit_counts.entry(unit.status.to_string()).or_insert(0) += 1;
    }
    out.push_str(&format!("Units: {}\n", units.len()));
    for (status, count) in &unit_counts {
        out.push_str(&format!("  {status:<14} {count:>6}\n"));
    }

    Ok(out)
}

/// All task runs with a progress summary, oldest first.
async fn fleet_report(datastore: &dyn Datastore) -> Result<String> {
    let runs = datastore
        .list_task_runs(false)
        .await
        .context("failed to list task runs")?;

    if runs.is_empty() {
        return Ok("No task runs found.\n".to_string());
    }

    let mut out = String::new();
    out.push_str(&format!(
        "{:<38} {:<24} {:<10} {:<10} {:>10}\n",
        "ID", "TASK", "PROVIDER", "STATE", "PROGRESS"
    ));
    out.push_str(&format!("{}\n", "-".repeat(96)));

    for run in &runs {
        let task = datastore
            .get_task(run.task_id)
            .await
            .with_context(|| format!("failed to load task {}", run.task_id))?;
        let progress = progress(datastore, run.id).await?;
        let name_display = if task.name.chars().count() > 22 {
            format!("{}...", task.name.chars().take(19).collect::<String>())
        } else {
            task.name.clone()
        };
        out.push_str(&format!(
            "{:<38} {:<24} {:<10} {:<10} {:>10}\n",
            run.id,
            name_display,
            run.provider_type,
            run_state(run),
            format!("{}/{}", progress.done, progress.total),
        ));
    }

    Ok(out)
}
