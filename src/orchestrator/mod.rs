//! Task run orchestration: public operations and the run driver.

pub mod engine;
pub mod plan;
pub mod tracker;
pub mod validator;


use tokio_util::sync::CancellationToken;

use crate::db::{agent_repo, db_task, task_run_repo};
use crate::error::{AppError, AppResult};
use crate::models::agent::AgentConfig;
use crate::models::task_run::{
    CreateTaskRunRequest, TaskAssignment, TaskRun, TaskRunStatus,
};
use crate::orchestrator::tracker::AgentTrackingSnapshot;
use crate::state::{ActiveRun, AppState, ConfirmationAction};

/// Sentinel agent id accepted by [`regenerate_agent`] to reset the whole
/// run.
pub const REGENERATE_ALL: &str = "__all__";

/// Start orchestrating a user prompt. Fails fast, before any row is
/// created, when no control hub is configured, and rejects a second
/// start while an orchestration is already in flight for the same
/// workspace context.
pub async fn start_task_run(
    state: &AppState,
    request: CreateTaskRunRequest,
) -> AppResult<TaskRun> {
    {
        let active = state.active_task_runs.lock().await;
        let clash = active
            .values()
            .any(|run| run.workspace_id.as_deref() == request.workspace_id.as_deref());
        if clash {
            return Err(AppError::InvalidRequest(
                "An orchestration task is already running for this workspace. Wait for it to complete or cancel it before starting a new one.".into(),
            ));
        }
    }

    let hub: AgentConfig = {
        let ws_id = request.workspace_id.clone();
        db_task(state, move |s| agent_repo::get_control_hub(&s, ws_id.as_deref()))
            .await?
            .ok_or_else(|| {
                AppError::Configuration(
                    "No control hub agent configured. Set an agent as control hub first.".into(),
                )
            })?
    };

    let task_run_id = uuid::Uuid::new_v4().to_string();
    let title = if request.title.is_empty() {
        request.user_prompt.chars().take(100).collect::<String>()
    } else {
        request.title.clone()
    };

    let task_run: TaskRun = {
        let trid = task_run_id.clone();
        let t = title.clone();
        let up = request.user_prompt.clone();
        let hub_id = hub.id.clone();
        let ws_id = request.workspace_id.clone();
        db_task(state, move |s| {
            task_run_repo::create_task_run(&s, &trid, &t, &up, &hub_id, ws_id.as_deref())
        })
        .await?
    };

    spawn_driver(
        state,
        task_run_id,
        request.user_prompt,
        request.workspace_id,
        request.require_confirmation,
    )
    .await;

    Ok(task_run)
}

/// Register the run as active and hand it to a driver task. The caller
/// is responsible for any start-time guards.
pub(crate) async fn spawn_driver(
    state: &AppState,
    task_run_id: String,
    user_prompt: String,
    workspace_id: Option<String>,
    require_confirmation: bool,
) {
    let cancel_token = CancellationToken::new();
    {
        let mut active = state.active_task_runs.lock().await;
        active.insert(
            task_run_id.clone(),
            ActiveRun {
                workspace_id: workspace_id.clone(),
                cancel_token: cancel_token.clone(),
            },
        );
    }

    let state_clone = state.clone();
    tokio::spawn(async move {
        engine::run_orchestration(
            state_clone,
            task_run_id,
            user_prompt,
            workspace_id,
            require_confirmation,
        )
        .await;
    });
}

/// Cancel a whole task run. Idempotent: cancelling a run that is already
/// terminal is a no-op.
pub async fn cancel_task_run(state: &AppState, task_run_id: &str) -> AppResult<()> {
    {
        let mut active = state.active_task_runs.lock().await;
        if let Some(run) = active.remove(task_run_id) {
            run.cancel_token.cancel();
        }
    }

    let current = {
        let id = task_run_id.to_string();
        db_task(state, move |s| task_run_repo::get_task_run(&s, &id)).await?
    };
    if current.status.is_terminal() {
        return Ok(());
    }

    let id = task_run_id.to_string();
    db_task(state, move |s| {
        task_run_repo::transition_task_run_status(&s, &id, TaskRunStatus::Cancelled)
    })
    .await?;
    Ok(())
}

/// Cancel exactly one in-flight assignment; the run itself keeps going
/// and dependents of the cancelled agent are skipped.
pub async fn cancel_agent(state: &AppState, task_run_id: &str, agent_id: &str) -> AppResult<()> {
    let agent_cancels = state.agent_cancellations.lock().await;
    if let Some(token) = agent_cancels.get(&(task_run_id.to_string(), agent_id.to_string())) {
        token.cancel();
        Ok(())
    } else {
        Err(AppError::NotFound("No active agent".into()))
    }
}

/// Accept the results of a run paused at the confirmation gate.
/// Confirming an already-completed run is a no-op.
pub async fn confirm_results(state: &AppState, task_run_id: &str) -> AppResult<()> {
    {
        let mut confirmations = state.pending_confirmations.lock().await;
        if let Some(tx) = confirmations.remove(task_run_id) {
            let _ = tx.send(ConfirmationAction::Confirm);
            return Ok(());
        }
    }

    let run = {
        let id = task_run_id.to_string();
        db_task(state, move |s| task_run_repo::get_task_run(&s, &id)).await?
    };
    if run.status == TaskRunStatus::Completed {
        return Ok(());
    }
    Err(AppError::NotFound(format!(
        "No pending confirmation for task run {task_run_id}"
    )))
}

/// Re-run one agent's assignment, or every assignment when `agent_id`
/// is [`REGENERATE_ALL`]. Valid only while the run waits at the
/// confirmation gate.
pub async fn regenerate_agent(
    state: &AppState,
    task_run_id: &str,
    agent_id: &str,
) -> AppResult<()> {
    let mut confirmations = state.pending_confirmations.lock().await;
    if let Some(tx) = confirmations.remove(task_run_id) {
        let action = if agent_id == REGENERATE_ALL {
            ConfirmationAction::RegenerateAll
        } else {
            ConfirmationAction::RegenerateAgent(agent_id.to_string())
        };
        let _ = tx.send(action);
        Ok(())
    } else {
        Err(AppError::NotFound(format!(
            "No pending confirmation for task run {task_run_id}"
        )))
    }
}

/// Forward a human decision for an agent's mid-execution permission
/// prompt to the transport. Does not change run status.
pub async fn respond_permission(
    state: &AppState,
    task_run_id: &str,
    _agent_id: &str,
    request_id: &str,
    option_id: &str,
) -> AppResult<()> {
    let pending = {
        let mut perms = state.pending_permissions.lock().await;
        perms.remove(&(task_run_id.to_string(), request_id.to_string()))
    };
    match pending {
        Some(perm) => {
            state
                .transport
                .respond_permission(&perm.correlation_id, request_id, option_id);
            Ok(())
        }
        None => Err(AppError::NotFound(format!(
            "No pending permission for task run {task_run_id}, request {request_id}"
        ))),
    }
}

/// Rate a completed task run (1-5 stars).
pub async fn rate_task_run(state: &AppState, task_run_id: &str, rating: i64) -> AppResult<()> {
    if !(1..=5).contains(&rating) {
        return Err(AppError::InvalidRequest(
            "Rating must be between 1 and 5 stars".into(),
        ));
    }
    let id = task_run_id.to_string();
    db_task(state, move |s| task_run_repo::rate_task_run(&s, &id, rating)).await
}

pub async fn get_task_run(state: &AppState, task_run_id: &str) -> AppResult<TaskRun> {
    let id = task_run_id.to_string();
    db_task(state, move |s| task_run_repo::get_task_run(&s, &id)).await
}

pub async fn list_task_runs(
    state: &AppState,
    workspace_id: Option<&str>,
) -> AppResult<Vec<TaskRun>> {
    let ws_id = workspace_id.map(|s| s.to_string());
    db_task(state, move |s| task_run_repo::list_task_runs(&s, ws_id.as_deref())).await
}

pub async fn get_task_assignments(
    state: &AppState,
    task_run_id: &str,
) -> AppResult<Vec<TaskAssignment>> {
    let id = task_run_id.to_string();
    db_task(state, move |s| task_run_repo::list_assignments_for_run(&s, &id)).await
}

/// Read-side view of the live per-agent trackers for a run. Snapshot
/// based; may trail the driver by a beat.
pub async fn run_tracker_snapshots(
    state: &AppState,
    task_run_id: &str,
) -> Vec<AgentTrackingSnapshot> {
    let mirror = state.tracker_snapshots.lock().await;
    mirror.get(task_run_id).cloned().unwrap_or_default()
}

/// Re-drive every run that a process restart left in a non-terminal
/// state. Completed assignments keep their outputs; interrupted ones are
/// re-executed from the persisted plan.
pub async fn resume_incomplete_task_runs(state: &AppState) {
    let incomplete = match db_task(state, |s| task_run_repo::list_incomplete_task_runs(&s)).await {
        Ok(runs) => runs,
        Err(e) => {
            log::error!("Failed to list incomplete task runs: {}", e);
            return;
        }
    };

    for run in incomplete {
        {
            let active = state.active_task_runs.lock().await;
            if active.contains_key(&run.id) {
                continue;
            }
        }
        log::info!("Resuming interrupted task run {} ({})", run.title, run.id);

        {
            let id = run.id.clone();
            if let Err(e) = db_task(state, move |s| {
                task_run_repo::force_task_run_status(&s, &id, TaskRunStatus::Pending)
            })
            .await
            {
                log::error!("Failed to reset task run {} for resume: {}", run.id, e);
                continue;
            }
        }

        spawn_driver(
            state,
            run.id.clone(),
            run.user_prompt.clone(),
            run.workspace_id.clone(),
            true,
        )
        .await;
    }
}
