//! Background scheduler for one-time and recurring task runs.
//!
//! A single polling task wakes on a fixed interval, finds non-paused
//! runs whose `next_run_at` has elapsed and re-drives them through the
//! orchestrator. For recurring runs `next_run_at` is recomputed from the
//! fire time rather than from completion, so a slow run never causes the
//! next tick to fire again the moment it finishes. A run that is still
//! executing when its fire time elapses is skipped until a later tick
//! finds it idle.

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::db::{db_task, task_run_repo};
use crate::error::{AppError, AppResult};
use crate::models::task_run::{ScheduleTaskRequest, ScheduleType, TaskRun, TaskRunStatus};
use crate::orchestrator;
use crate::recurrence;
use crate::state::AppState;

pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 60;

/// Scheduler state for managing the background task.
pub struct SchedulerState {
    cancel_token: CancellationToken,
    #[allow(dead_code)]
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl SchedulerState {
    /// Stop the scheduler.
    pub fn stop(&mut self) {
        self.cancel_token.cancel();
    }
}

/// Start the background scheduler polling at `poll_interval_secs`.
pub fn start_scheduler(state: AppState, poll_interval_secs: u64) -> SchedulerState {
    let cancel_token = CancellationToken::new();
    let cancel_token_clone = cancel_token.clone();

    let task_handle = tokio::spawn(async move {
        log::info!("[Scheduler] Starting task scheduler");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(std::time::Duration::from_secs(poll_interval_secs)) => {
                    match run_due_tasks(&state, Utc::now()).await {
                        Ok(fired) if !fired.is_empty() => {
                            log::info!("[Scheduler] Fired {} due task runs", fired.len());
                        }
                        Ok(_) => {}
                        Err(e) => {
                            log::error!("[Scheduler] Error checking scheduled tasks: {:?}", e);
                        }
                    }
                }
                _ = cancel_token_clone.cancelled() => {
                    log::info!("[Scheduler] Scheduler stopped");
                    break;
                }
            }
        }
    });

    SchedulerState {
        cancel_token,
        task_handle: Some(task_handle),
    }
}

/// One scheduler tick: fire every due run. Returns the ids of the runs
/// that were started. Split out from the loop so the tick is testable
/// with an explicit `now`.
pub async fn run_due_tasks(state: &AppState, now: DateTime<Utc>) -> AppResult<Vec<String>> {
    let now_str = recurrence::format_utc(now);
    let due_tasks = {
        let now_str = now_str.clone();
        db_task(state, move |s| {
            task_run_repo::list_due_scheduled_tasks(&s, &now_str)
        })
        .await?
    };

    let mut fired = Vec::new();
    for task in due_tasks {
        {
            let active = state.active_task_runs.lock().await;
            if active.contains_key(&task.id) {
                log::info!(
                    "[Scheduler] Task {} is still running, skipping this fire",
                    task.id
                );
                continue;
            }
        }

        log::info!("[Scheduler] Executing scheduled task: {} ({})", task.title, task.id);

        match task.schedule_type {
            ScheduleType::Once => {
                // Fire-once: consume the schedule before triggering.
                let id = task.id.clone();
                db_task(state, move |s| task_run_repo::clear_schedule(&s, &id)).await?;
            }
            ScheduleType::Recurring => {
                let next = task
                    .recurrence_pattern()
                    .and_then(|p| recurrence::next_occurrence(&p, now))
                    .map(recurrence::format_utc);
                if next.is_none() {
                    log::warn!(
                        "[Scheduler] Recurrence pattern for task {} is unusable; schedule suspended",
                        task.id
                    );
                }
                let id = task.id.clone();
                db_task(state, move |s| {
                    task_run_repo::set_next_run_at(&s, &id, next.as_deref())
                })
                .await?;
            }
            ScheduleType::None => continue,
        }

        // The previous execution's plan and assignments belong to the
        // old lifecycle; clear them before re-driving the row.
        {
            let id = task.id.clone();
            db_task(state, move |s| task_run_repo::reset_for_rerun(&s, &id)).await?;
        }

        // Scheduled executions run unattended; no confirmation gate.
        orchestrator::spawn_driver(
            state,
            task.id.clone(),
            task.user_prompt.clone(),
            task.workspace_id.clone(),
            false,
        )
        .await;

        fired.push(task.id);
    }

    Ok(fired)
}

// ============== Scheduling API ==============

/// Attach a schedule to a completed task run. Scheduling fields are
/// independent of status fields and never touch an in-flight driver.
pub async fn schedule_task(state: &AppState, request: ScheduleTaskRequest) -> AppResult<TaskRun> {
    let task = {
        let id = request.task_run_id.clone();
        db_task(state, move |s| task_run_repo::get_task_run(&s, &id)).await?
    };

    if task.status != TaskRunStatus::Completed {
        return Err(AppError::InvalidRequest(
            "Only completed tasks can be scheduled for re-execution".into(),
        ));
    }

    let (scheduled_time, recurrence_pattern_json, next_run_at) = match request.schedule_type {
        ScheduleType::None => (None, None, None),
        ScheduleType::Once => {
            let time = request.scheduled_time.clone().ok_or_else(|| {
                AppError::InvalidRequest("scheduled_time is required for a one-time schedule".into())
            })?;
            // For one-time tasks, next_run_at is the scheduled time.
            (Some(time.clone()), None, Some(time))
        }
        ScheduleType::Recurring => {
            let pattern = request.recurrence_pattern.as_ref().ok_or_else(|| {
                AppError::InvalidRequest(
                    "recurrence_pattern is required for a recurring schedule".into(),
                )
            })?;
            let next_run = recurrence::next_occurrence(pattern, Utc::now())
                .map(recurrence::format_utc)
                .ok_or_else(|| {
                    AppError::InvalidRequest("recurrence_pattern is not computable".into())
                })?;
            let pattern_json = serde_json::to_string(pattern)?;
            (request.scheduled_time.clone(), Some(pattern_json), Some(next_run))
        }
    };

    let id = request.task_run_id.clone();
    let schedule_type = request.schedule_type;
    db_task(state, move |s| {
        task_run_repo::update_schedule(
            &s,
            &id,
            schedule_type,
            scheduled_time.as_deref(),
            recurrence_pattern_json.as_deref(),
            next_run_at.as_deref(),
        )
    })
    .await
}

pub async fn clear_schedule(state: &AppState, task_run_id: &str) -> AppResult<()> {
    let id = task_run_id.to_string();
    db_task(state, move |s| task_run_repo::clear_schedule(&s, &id)).await
}

pub async fn pause_scheduled_task(state: &AppState, task_run_id: &str) -> AppResult<()> {
    let id = task_run_id.to_string();
    db_task(state, move |s| task_run_repo::pause_scheduled_task(&s, &id)).await
}

pub async fn resume_scheduled_task(state: &AppState, task_run_id: &str) -> AppResult<()> {
    let id = task_run_id.to_string();
    db_task(state, move |s| task_run_repo::resume_scheduled_task(&s, &id)).await
}
