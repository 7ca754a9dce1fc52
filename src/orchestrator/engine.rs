//! The per-run driver.
//!
//! One spawned task owns the whole lifecycle of a TaskRun: planning,
//! dependency-ordered execution, the confirmation gate and finalization.
//! All mutation of the run's state happens on this task; in-flight
//! assignments run on their own executor tasks and report back over a
//! single mpsc channel demultiplexed by agent id, so ingesting a chunk
//! from one agent never blocks on another.

use std::collections::HashMap;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::db::{agent_repo, db_task, task_run_repo};
use crate::error::{AppError, AppResult};
use crate::events::{AgentOutputSummary, OrchestrationEvent};
use crate::models::agent::AgentConfig;
use crate::models::task_run::{
    AssignmentStatus, PlannedAssignment, TaskPlan, TaskRunStatus,
};
use crate::orchestrator::plan;
use crate::orchestrator::tracker::AgentExecutionTracker;
use crate::orchestrator::validator;
use crate::state::{AppState, ConfirmationAction, PendingPermission};
use crate::transport::{AgentStreamEvent, InvokeRequest, TokenUsage};

/// How long the confirmation gate waits before treating silence as a
/// confirm.
const CONFIRMATION_TIMEOUT_SECS: u64 = 3600;

/// Correlation key for one agent's calls within one run. Each run gets
/// its own agent sessions so concurrent runs cannot steal each other's
/// streams.
fn correlation_id(task_run_id: &str, agent_id: &str) -> String {
    format!("orch:{}:{}", task_run_id, agent_id)
}

/// In-memory mirror of one assignment while the driver owns the run.
struct AssignmentRuntime {
    assignment_id: String,
    planned: PlannedAssignment,
    agent_name: String,
    model: String,
    status: AssignmentStatus,
    output: Option<String>,
    usage: TokenUsage,
    duration_ms: i64,
    error: Option<String>,
}

impl AssignmentRuntime {
    fn failed_placeholder_output(&self) -> String {
        match &self.error {
            Some(e) => format!("(Agent failed: {})", e),
            None => "(Agent produced no output)".into(),
        }
    }
}

/// What an assignment executor reports back to the driver.
struct AssignmentOutcome {
    status: AssignmentStatus,
    output: Option<String>,
    usage: TokenUsage,
    duration_ms: i64,
    error: Option<String>,
}

enum RunEvent {
    Stream {
        agent_id: String,
        event: AgentStreamEvent,
    },
    A2aStarted {
        agent_id: String,
        target_agent_id: String,
        prompt: String,
    },
    A2aResolved {
        agent_id: String,
        target_agent_id: String,
        result: String,
    },
    Terminal {
        agent_id: String,
        outcome: AssignmentOutcome,
    },
}

/// Drive a task run to a terminal state. Errors are translated into the
/// `failed` status and an `error` event here; the caller only spawns.
pub async fn run_orchestration(
    state: AppState,
    task_run_id: String,
    user_prompt: String,
    workspace_id: Option<String>,
    require_confirmation: bool,
) {
    let run_token = {
        let active = state.active_task_runs.lock().await;
        match active.get(&task_run_id) {
            Some(run) => run.cancel_token.clone(),
            None => {
                log::error!("No active run entry for {}", task_run_id);
                return;
            }
        }
    };

    let result = run_orchestration_inner(
        &state,
        &task_run_id,
        &user_prompt,
        workspace_id.as_deref(),
        require_confirmation,
        &run_token,
    )
    .await;

    // Always release the run's registry entries so a new orchestration
    // can start, whatever the outcome.
    {
        let mut active = state.active_task_runs.lock().await;
        active.remove(&task_run_id);
    }
    {
        let mut agent_cancels = state.agent_cancellations.lock().await;
        agent_cancels.retain(|(trid, _), _| trid != &task_run_id);
    }
    {
        let mut confirmations = state.pending_confirmations.lock().await;
        confirmations.remove(&task_run_id);
    }
    {
        let mut perms = state.pending_permissions.lock().await;
        perms.retain(|(trid, _), _| trid != &task_run_id);
    }

    if let Err(e) = &result {
        if run_token.is_cancelled() {
            log::info!("Orchestration {} ended by cancellation: {}", task_run_id, e);
            return;
        }
        let error_msg = e.to_string();
        log::error!("Orchestration failed for {}: {}", task_run_id, error_msg);
        state.events.publish(OrchestrationEvent::Error {
            task_run_id: task_run_id.clone(),
            error: error_msg,
        });
        let id = task_run_id.clone();
        let _ = db_task(&state, move |s| {
            task_run_repo::transition_task_run_status(&s, &id, TaskRunStatus::Failed)
        })
        .await;
    }
}

async fn run_orchestration_inner(
    state: &AppState,
    task_run_id: &str,
    user_prompt: &str,
    workspace_id: Option<&str>,
    require_confirmation: bool,
    run_token: &CancellationToken,
) -> AppResult<()> {
    let start_time = Instant::now();

    if run_token.is_cancelled() {
        return Ok(());
    }

    // The control hub may have been unset between Start and the driver
    // actually running (scheduler path), so re-verify.
    let hub_agent: AgentConfig = {
        let ws_id = workspace_id.map(|s| s.to_string());
        db_task(state, move |s| agent_repo::get_control_hub(&s, ws_id.as_deref()))
            .await?
            .ok_or_else(|| {
                AppError::Configuration("No control hub agent configured for this workspace".into())
            })?
    };

    set_status(state, task_run_id, TaskRunStatus::Analyzing).await?;
    state.events.publish(OrchestrationEvent::Started {
        task_run_id: task_run_id.to_string(),
        workspace_id: workspace_id.map(|s| s.to_string()),
    });

    let all_agents: Vec<AgentConfig> = {
        let ws_id = workspace_id.map(|s| s.to_string());
        db_task(state, move |s| agent_repo::list_agents(&s, ws_id.as_deref())).await?
    };

    // Resume path: a persisted plan with assignment rows means this run
    // was interrupted mid-execution; pick up where it left off instead of
    // re-planning.
    let stored = {
        let id = task_run_id.to_string();
        db_task(state, move |s| task_run_repo::get_task_run(&s, &id)).await?
    };
    let existing_assignments = {
        let id = task_run_id.to_string();
        db_task(state, move |s| task_run_repo::list_assignments_for_run(&s, &id)).await?
    };

    let resuming = stored.task_plan_json.is_some() && !existing_assignments.is_empty();

    let task_plan: TaskPlan = if resuming {
        serde_json::from_str(stored.task_plan_json.as_deref().unwrap_or_default())
            .map_err(|e| AppError::Internal(format!("Stored plan is unreadable: {e}")))?
    } else {
        match acquire_plan(state, task_run_id, user_prompt, &hub_agent, &all_agents, run_token)
            .await
        {
            Ok(plan) => plan,
            Err(_) if run_token.is_cancelled() => return Ok(()),
            Err(e) => return Err(e),
        }
    };

    if run_token.is_cancelled() {
        return Ok(());
    }

    // Advisory validation; only a cycle is fatal since the eligibility
    // scan cannot terminate on one.
    let validation = validator::validate_plan(&task_plan, &all_agents);
    if validation.total_warnings > 0 {
        for av in &validation.assignment_validations {
            for warning in &av.warnings {
                log::warn!(
                    "Plan validation warning for agent '{}' ({}): {}",
                    av.agent_name,
                    av.agent_id,
                    warning
                );
            }
        }
    }
    state.events.publish(OrchestrationEvent::PlanValidated {
        task_run_id: task_run_id.to_string(),
        validation: validation.clone(),
    });

    if let Some(cycle) = &validation.cycle {
        let description = format!(
            "Dependency cycle between agents: {}",
            cycle.join(" -> ")
        );
        let id = task_run_id.to_string();
        let desc = description.clone();
        db_task(state, move |s| task_run_repo::update_task_run_summary(&s, &id, &desc)).await?;
        return Err(AppError::PlanCycle(description));
    }

    let mut runtimes = if resuming {
        build_resumed_runtimes(state, &task_plan, existing_assignments).await?
    } else {
        persist_plan_and_assignments(state, task_run_id, &task_plan, &all_agents).await?
    };

    set_status(state, task_run_id, TaskRunStatus::Running).await?;
    state.events.publish(OrchestrationEvent::PlanReady {
        task_run_id: task_run_id.to_string(),
        plan: task_plan.clone(),
    });

    let mut trackers: HashMap<String, AgentExecutionTracker> = HashMap::new();
    let completed = execute_assignments(
        state,
        task_run_id,
        &mut runtimes,
        &all_agents,
        &mut trackers,
        run_token,
        false,
    )
    .await?;
    if !completed {
        return Ok(());
    }

    // Confirmation gate + regeneration loop.
    if require_confirmation {
        loop {
            if run_token.is_cancelled() {
                return Ok(());
            }

            // Register the channel before the status flip so a caller
            // reacting to the status change always finds it.
            let (tx, rx) = tokio::sync::oneshot::channel::<ConfirmationAction>();
            {
                let mut confirmations = state.pending_confirmations.lock().await;
                confirmations.insert(task_run_id.to_string(), tx);
            }

            set_status(state, task_run_id, TaskRunStatus::AwaitingConfirmation).await?;
            state.events.publish(OrchestrationEvent::AwaitingConfirmation {
                task_run_id: task_run_id.to_string(),
                agent_outputs: collect_outputs(&runtimes),
            });

            let action = tokio::select! {
                _ = run_token.cancelled() => return Ok(()),
                outcome = tokio::time::timeout(
                    std::time::Duration::from_secs(CONFIRMATION_TIMEOUT_SECS),
                    rx,
                ) => match outcome {
                    Ok(Ok(action)) => action,
                    Ok(Err(_)) => ConfirmationAction::Confirm, // channel dropped
                    Err(_) => ConfirmationAction::Confirm,     // timeout
                },
            };

            match action {
                ConfirmationAction::Confirm => break,
                ConfirmationAction::RegenerateAgent(agent_id) => {
                    log::info!("Regenerating agent {} for task {}", agent_id, task_run_id);
                    reset_assignments(state, &mut runtimes, |rt| rt.planned.agent_id == agent_id)
                        .await?;
                }
                ConfirmationAction::RegenerateAll => {
                    log::info!("Regenerating all agents for task {}", task_run_id);
                    reset_assignments(state, &mut runtimes, |_| true).await?;
                }
            }

            set_status(state, task_run_id, TaskRunStatus::Running).await?;
            let completed = execute_assignments(
                state,
                task_run_id,
                &mut runtimes,
                &all_agents,
                &mut trackers,
                run_token,
                true,
            )
            .await?;
            if !completed {
                return Ok(());
            }
        }
    }

    // Finalize. The summary is the designated terminal step: its failure
    // fails the run, individual assignment failures do not.
    let outputs: Vec<(String, String)> = collect_outputs(&runtimes)
        .into_iter()
        .map(|o| (o.agent_name, o.output))
        .collect();
    let summary_prompt = plan::build_summary_prompt(user_prompt, &outputs);
    let (summary, summary_usage) = invoke_collect(
        state,
        task_run_id,
        &hub_agent,
        &summary_prompt,
        run_token,
    )
    .await
    .map_err(|e| {
        if run_token.is_cancelled() {
            e
        } else {
            AppError::Internal(format!("Result summary step failed: {e}"))
        }
    })?;

    if run_token.is_cancelled() {
        return Ok(());
    }

    let mut totals = summary_usage;
    for rt in &runtimes {
        totals.add(&rt.usage);
    }
    let total_duration_ms = start_time.elapsed().as_millis() as i64;

    {
        let id = task_run_id.to_string();
        let sum = summary.clone();
        db_task(state, move |s| task_run_repo::update_task_run_summary(&s, &id, &sum)).await?;
    }
    {
        let id = task_run_id.to_string();
        db_task(state, move |s| {
            task_run_repo::update_task_run_totals(
                &s,
                &id,
                totals.tokens_in,
                totals.tokens_out,
                totals.cache_creation_tokens,
                totals.cache_read_tokens,
                total_duration_ms,
            )
        })
        .await?;
    }
    set_status(state, task_run_id, TaskRunStatus::Completed).await?;

    state.events.publish(OrchestrationEvent::Completed {
        task_run_id: task_run_id.to_string(),
        summary,
        total_duration_ms,
        usage: totals,
    });

    Ok(())
}

async fn set_status(state: &AppState, task_run_id: &str, status: TaskRunStatus) -> AppResult<()> {
    let id = task_run_id.to_string();
    db_task(state, move |s| {
        task_run_repo::transition_task_run_status(&s, &id, status)
    })
    .await?;
    Ok(())
}

/// Ask the control hub for a plan and clean it up: parse with one
/// corrective retry, auto-correct matched skills, drop assignments to
/// unknown or disabled agents.
async fn acquire_plan(
    state: &AppState,
    task_run_id: &str,
    user_prompt: &str,
    hub_agent: &AgentConfig,
    all_agents: &[AgentConfig],
    run_token: &CancellationToken,
) -> AppResult<TaskPlan> {
    let enabled: Vec<&AgentConfig> = all_agents.iter().filter(|a| a.is_enabled).collect();
    let catalog = plan::build_agent_catalog(&enabled);
    let plan_prompt = plan::build_plan_prompt(&catalog, user_prompt);

    let (response, _) =
        invoke_collect(state, task_run_id, hub_agent, &plan_prompt, run_token).await?;

    let parsed = match plan::parse_task_plan(&response) {
        Ok(p) => p,
        Err(first_err) => {
            log::warn!(
                "First plan parse failed, retrying with correction prompt: {}",
                first_err
            );
            let retry_prompt = plan::build_plan_retry_prompt();
            let (retry_response, _) =
                invoke_collect(state, task_run_id, hub_agent, &retry_prompt, run_token).await?;
            plan::parse_task_plan(&retry_response).map_err(|_| first_err)?
        }
    };

    let corrected = plan::auto_correct_plan_skills(parsed, all_agents);

    let filtered = TaskPlan {
        analysis: corrected.analysis,
        assignments: corrected
            .assignments
            .into_iter()
            .filter(|a| match all_agents.iter().find(|ag| ag.id == a.agent_id) {
                Some(ag) => {
                    if !ag.is_enabled {
                        log::warn!(
                            "Dropping assignment to disabled agent '{}' ({})",
                            ag.name,
                            ag.id
                        );
                    }
                    ag.is_enabled
                }
                None => {
                    log::warn!(
                        "Dropping assignment to unknown agent '{}' (not in workspace)",
                        a.agent_id
                    );
                    false
                }
            })
            .collect(),
    };

    if filtered.assignments.is_empty() {
        return Err(AppError::Internal(
            "No valid assignments in plan — all referenced agents are outside this workspace or disabled".into(),
        ));
    }

    Ok(filtered)
}

/// Persist the accepted plan and bulk-create its assignments in
/// `pending`, ordered by `sequence_order`.
async fn persist_plan_and_assignments(
    state: &AppState,
    task_run_id: &str,
    task_plan: &TaskPlan,
    all_agents: &[AgentConfig],
) -> AppResult<Vec<AssignmentRuntime>> {
    {
        let plan_json = serde_json::to_string(task_plan)?;
        let id = task_run_id.to_string();
        db_task(state, move |s| task_run_repo::update_task_run_plan(&s, &id, &plan_json)).await?;
    }

    let mut ordered: Vec<&PlannedAssignment> = task_plan.assignments.iter().collect();
    ordered.sort_by_key(|a| a.sequence_order);

    let mut runtimes = Vec::with_capacity(ordered.len());
    for planned in ordered {
        let agent = all_agents.iter().find(|a| a.id == planned.agent_id);
        let agent_name = agent.map(|a| a.name.clone()).unwrap_or_else(|| "Unknown".into());
        let model = agent.map(|a| a.model.clone()).unwrap_or_default();

        let assignment_id = uuid::Uuid::new_v4().to_string();
        {
            let aid = assignment_id.clone();
            let trid = task_run_id.to_string();
            let agid = planned.agent_id.clone();
            let aname = agent_name.clone();
            let seq = planned.sequence_order;
            let desc = planned.task_description.clone();
            db_task(state, move |s| {
                task_run_repo::create_task_assignment(&s, &aid, &trid, &agid, &aname, seq, &desc)
            })
            .await?;
        }

        runtimes.push(AssignmentRuntime {
            assignment_id,
            planned: planned.clone(),
            agent_name,
            model,
            status: AssignmentStatus::Pending,
            output: None,
            usage: TokenUsage::default(),
            duration_ms: 0,
            error: None,
        });
    }

    Ok(runtimes)
}

/// Rebuild runtimes from persisted assignment rows after a restart.
/// Completed work keeps its outputs; interrupted rows go back to
/// `pending` and re-execute.
async fn build_resumed_runtimes(
    state: &AppState,
    task_plan: &TaskPlan,
    existing: Vec<crate::models::task_run::TaskAssignment>,
) -> AppResult<Vec<AssignmentRuntime>> {
    let mut runtimes = Vec::with_capacity(existing.len());
    for row in existing {
        let planned = task_plan
            .assignments
            .iter()
            .find(|p| p.agent_id == row.agent_id)
            .cloned()
            .unwrap_or(PlannedAssignment {
                agent_id: row.agent_id.clone(),
                task_description: row.input_text.clone(),
                sequence_order: row.sequence_order,
                depends_on: Vec::new(),
                matched_skills: Vec::new(),
                selection_reason: None,
            });

        let status = if row.status == AssignmentStatus::Running {
            let aid = row.id.clone();
            db_task(state, move |s| task_run_repo::reset_assignment(&s, &aid)).await?;
            AssignmentStatus::Pending
        } else {
            row.status
        };

        runtimes.push(AssignmentRuntime {
            assignment_id: row.id,
            planned,
            agent_name: row.agent_name,
            model: row.model_used.unwrap_or_default(),
            status,
            output: row.output_text,
            usage: TokenUsage {
                tokens_in: row.tokens_in,
                tokens_out: row.tokens_out,
                cache_creation_tokens: row.cache_creation_tokens,
                cache_read_tokens: row.cache_read_tokens,
            },
            duration_ms: row.duration_ms,
            error: row.error_message,
        });
    }
    Ok(runtimes)
}

async fn reset_assignments<F>(
    state: &AppState,
    runtimes: &mut [AssignmentRuntime],
    mut target: F,
) -> AppResult<()>
where
    F: FnMut(&AssignmentRuntime) -> bool,
{
    for rt in runtimes.iter_mut().filter(|rt| target(rt)) {
        let aid = rt.assignment_id.clone();
        db_task(state, move |s| task_run_repo::reset_assignment(&s, &aid)).await?;
        rt.status = AssignmentStatus::Pending;
        rt.output = None;
        rt.usage = TokenUsage::default();
        rt.duration_ms = 0;
        rt.error = None;
    }
    Ok(())
}

fn collect_outputs(runtimes: &[AssignmentRuntime]) -> Vec<AgentOutputSummary> {
    runtimes
        .iter()
        .filter_map(|rt| {
            let output = match rt.status {
                AssignmentStatus::Completed => rt.output.clone()?,
                AssignmentStatus::Failed => rt.failed_placeholder_output(),
                _ => return None,
            };
            Some(AgentOutputSummary {
                agent_id: rt.planned.agent_id.clone(),
                agent_name: rt.agent_name.clone(),
                output,
            })
        })
        .collect()
}

/// The dependency-respecting execution loop. Returns `false` when the
/// run was cancelled mid-flight, `true` when every assignment reached a
/// terminal status.
async fn execute_assignments(
    state: &AppState,
    task_run_id: &str,
    runtimes: &mut Vec<AssignmentRuntime>,
    all_agents: &[AgentConfig],
    trackers: &mut HashMap<String, AgentExecutionTracker>,
    run_token: &CancellationToken,
    is_regeneration: bool,
) -> AppResult<bool> {
    let (events_tx, mut events_rx) = mpsc::unbounded_channel::<RunEvent>();

    loop {
        if run_token.is_cancelled() {
            flush_cancelled(state, task_run_id, runtimes).await?;
            mirror_trackers(state, task_run_id, trackers).await;
            return Ok(false);
        }

        propagate_skips(state, task_run_id, runtimes).await?;
        start_eligible(
            state,
            task_run_id,
            runtimes,
            all_agents,
            trackers,
            run_token,
            &events_tx,
            is_regeneration,
        )
        .await?;
        mirror_trackers(state, task_run_id, trackers).await;

        if runtimes.iter().all(|rt| rt.status.is_terminal()) {
            return Ok(true);
        }

        let event = tokio::select! {
            _ = run_token.cancelled() => continue,
            event = events_rx.recv() => match event {
                Some(event) => event,
                None => return Err(AppError::Internal("run event channel closed".into())),
            },
        };

        handle_run_event(state, task_run_id, runtimes, trackers, event).await?;
    }
}

/// Mark every still-pending assignment `cancelled` and reflect running
/// ones as cancelled immediately; their executors are already being torn
/// down through the child tokens and any late terminal event loses to
/// the status recorded here.
async fn flush_cancelled(
    state: &AppState,
    task_run_id: &str,
    runtimes: &mut [AssignmentRuntime],
) -> AppResult<()> {
    for rt in runtimes.iter_mut() {
        if rt.status.is_terminal() {
            continue;
        }
        rt.status = AssignmentStatus::Cancelled;
        rt.error = Some("Task run cancelled".into());
        let aid = rt.assignment_id.clone();
        db_task(state, move |s| {
            task_run_repo::mark_assignment_terminal(
                &s,
                &aid,
                AssignmentStatus::Cancelled,
                None,
                None,
                0,
                0,
                0,
                0,
                0,
                Some("Task run cancelled"),
            )
        })
        .await?;
        state.events.publish(OrchestrationEvent::AgentCompleted {
            task_run_id: task_run_id.to_string(),
            assignment_id: rt.assignment_id.clone(),
            agent_id: rt.planned.agent_id.clone(),
            agent_name: rt.agent_name.clone(),
            status: AssignmentStatus::Cancelled,
            output: None,
            error: rt.error.clone(),
            usage: TokenUsage::default(),
            duration_ms: 0,
        });
    }
    Ok(())
}

/// A pending assignment whose dependency failed, was cancelled, was
/// skipped, or does not exist in the plan can never become eligible;
/// mark it `skipped` and let the scan run again so skips propagate
/// transitively.
async fn propagate_skips(
    state: &AppState,
    task_run_id: &str,
    runtimes: &mut [AssignmentRuntime],
) -> AppResult<()> {
    loop {
        let mut skip_idx: Option<(usize, String)> = None;

        'scan: for (i, rt) in runtimes.iter().enumerate() {
            if rt.status != AssignmentStatus::Pending {
                continue;
            }
            for dep in &rt.planned.depends_on {
                let dep_rt = runtimes.iter().find(|o| &o.planned.agent_id == dep);
                match dep_rt {
                    None => {
                        skip_idx = Some((i, format!("Dependency '{}' is not in the plan", dep)));
                        break 'scan;
                    }
                    Some(d) if matches!(
                        d.status,
                        AssignmentStatus::Failed
                            | AssignmentStatus::Cancelled
                            | AssignmentStatus::Skipped
                    ) =>
                    {
                        skip_idx = Some((
                            i,
                            format!("Dependency '{}' ended as {}", dep, d.status.as_str()),
                        ));
                        break 'scan;
                    }
                    Some(_) => {}
                }
            }
        }

        let Some((i, reason)) = skip_idx else {
            return Ok(());
        };

        let rt = &mut runtimes[i];
        rt.status = AssignmentStatus::Skipped;
        rt.error = Some(reason.clone());
        let aid = rt.assignment_id.clone();
        let msg = reason.clone();
        db_task(state, move |s| {
            task_run_repo::mark_assignment_terminal(
                &s,
                &aid,
                AssignmentStatus::Skipped,
                None,
                None,
                0,
                0,
                0,
                0,
                0,
                Some(&msg),
            )
        })
        .await?;
        state.events.publish(OrchestrationEvent::AgentCompleted {
            task_run_id: task_run_id.to_string(),
            assignment_id: rt.assignment_id.clone(),
            agent_id: rt.planned.agent_id.clone(),
            agent_name: rt.agent_name.clone(),
            status: AssignmentStatus::Skipped,
            output: None,
            error: Some(reason),
            usage: TokenUsage::default(),
            duration_ms: 0,
        });
    }
}

/// Start every dependency-eligible pending assignment, bounded only by
/// each agent's declared `max_concurrency`.
#[allow(clippy::too_many_arguments)]
async fn start_eligible(
    state: &AppState,
    task_run_id: &str,
    runtimes: &mut [AssignmentRuntime],
    all_agents: &[AgentConfig],
    trackers: &mut HashMap<String, AgentExecutionTracker>,
    run_token: &CancellationToken,
    events_tx: &mpsc::UnboundedSender<RunEvent>,
    is_regeneration: bool,
) -> AppResult<()> {
    loop {
        let mut running_per_agent: HashMap<&str, i64> = HashMap::new();
        for rt in runtimes.iter() {
            if rt.status == AssignmentStatus::Running {
                *running_per_agent.entry(rt.planned.agent_id.as_str()).or_insert(0) += 1;
            }
        }

        let eligible_idx = runtimes.iter().position(|rt| {
            if rt.status != AssignmentStatus::Pending {
                return false;
            }
            let deps_met = rt.planned.depends_on.iter().all(|dep| {
                runtimes
                    .iter()
                    .any(|o| &o.planned.agent_id == dep && o.status == AssignmentStatus::Completed)
            });
            if !deps_met {
                return false;
            }
            let max_conc = all_agents
                .iter()
                .find(|a| a.id == rt.planned.agent_id)
                .map(|a| a.max_concurrency.max(1))
                .unwrap_or(1);
            running_per_agent
                .get(rt.planned.agent_id.as_str())
                .copied()
                .unwrap_or(0)
                < max_conc
        });

        let Some(idx) = eligible_idx else {
            return Ok(());
        };

        // Compose the input before mutating: task description, then each
        // dependency's output, then the peer catalog for A2A discovery.
        let input_text = {
            let rt = &runtimes[idx];
            let mut parts = vec![rt.planned.task_description.clone()];
            for dep_id in &rt.planned.depends_on {
                if let Some(dep) = runtimes
                    .iter()
                    .find(|o| &o.planned.agent_id == dep_id && o.output.is_some())
                {
                    let dep_name = all_agents
                        .iter()
                        .find(|a| &a.id == dep_id)
                        .map(|a| a.name.clone())
                        .unwrap_or_else(|| "Previous agent".into());
                    parts.push(format!(
                        "\n--- Output from {dep_name} ---\n{}",
                        dep.output.as_deref().unwrap_or_default()
                    ));
                }
            }
            let peer_catalog =
                plan::build_peer_agent_section(all_agents, &runtimes[idx].planned.agent_id);
            if !peer_catalog.is_empty() {
                parts.push(peer_catalog);
            }
            parts.join("\n")
        };

        let agent_config = all_agents
            .iter()
            .find(|a| a.id == runtimes[idx].planned.agent_id)
            .ok_or_else(|| {
                AppError::NotFound(format!("Agent {} not found", runtimes[idx].planned.agent_id))
            })?
            .clone();

        let rt = &mut runtimes[idx];
        rt.status = AssignmentStatus::Running;
        {
            let aid = rt.assignment_id.clone();
            let input = input_text.clone();
            db_task(state, move |s| {
                task_run_repo::mark_assignment_running(&s, &aid, &input)
            })
            .await?;
        }

        let corr_id = correlation_id(task_run_id, &rt.planned.agent_id);
        trackers.insert(
            rt.planned.agent_id.clone(),
            AgentExecutionTracker::new(&rt.assignment_id, &rt.planned.agent_id, &rt.agent_name, &corr_id),
        );

        let agent_token = run_token.child_token();
        {
            let mut agent_cancels = state.agent_cancellations.lock().await;
            agent_cancels.insert(
                (task_run_id.to_string(), rt.planned.agent_id.clone()),
                agent_token.clone(),
            );
        }

        state.events.publish(OrchestrationEvent::AgentStarted {
            task_run_id: task_run_id.to_string(),
            assignment_id: rt.assignment_id.clone(),
            agent_id: rt.planned.agent_id.clone(),
            agent_name: rt.agent_name.clone(),
            model: agent_config.model.clone(),
            sequence_order: rt.planned.sequence_order,
            is_regeneration,
        });

        let state_clone = state.clone();
        let task_run_id_clone = task_run_id.to_string();
        let events_tx_clone = events_tx.clone();
        let all_agents_clone = all_agents.to_vec();
        tokio::spawn(async move {
            drive_assignment(
                state_clone,
                task_run_id_clone,
                agent_config,
                input_text,
                agent_token,
                events_tx_clone,
                all_agents_clone,
            )
            .await;
        });
    }
}

/// Apply one demultiplexed event to the run's state. Terminal events for
/// assignments that are already terminal are dropped: the recorded
/// status wins the cancellation race.
async fn handle_run_event(
    state: &AppState,
    task_run_id: &str,
    runtimes: &mut [AssignmentRuntime],
    trackers: &mut HashMap<String, AgentExecutionTracker>,
    event: RunEvent,
) -> AppResult<()> {
    match event {
        RunEvent::Stream { agent_id, event } => match event {
            AgentStreamEvent::Chunk { text } => {
                if let Some(tracker) = trackers.get_mut(&agent_id) {
                    tracker.append_chunk(&text);
                }
                state.events.publish(OrchestrationEvent::AgentChunk {
                    task_run_id: task_run_id.to_string(),
                    agent_id,
                    text,
                });
            }
            AgentStreamEvent::ToolCall(record) | AgentStreamEvent::ToolCallUpdate(record) => {
                if let Some(tracker) = trackers.get_mut(&agent_id) {
                    tracker.upsert_tool_call(record.clone());
                }
                state.events.publish(OrchestrationEvent::AgentToolCall {
                    task_run_id: task_run_id.to_string(),
                    agent_id,
                    tool_call: record,
                });
            }
            AgentStreamEvent::PermissionRequest(request) => {
                {
                    let mut perms = state.pending_permissions.lock().await;
                    perms.insert(
                        (task_run_id.to_string(), request.request_id.clone()),
                        PendingPermission {
                            agent_id: agent_id.clone(),
                            correlation_id: correlation_id(task_run_id, &agent_id),
                        },
                    );
                }
                state.events.publish(OrchestrationEvent::PermissionRequest {
                    task_run_id: task_run_id.to_string(),
                    agent_id,
                    request_id: request.request_id,
                    tool_call: request.tool_call,
                    options: request.options,
                });
            }
            // Terminal stream events arrive as RunEvent::Terminal.
            AgentStreamEvent::Completed { .. } | AgentStreamEvent::Failed { .. } => {}
        },
        RunEvent::A2aStarted {
            agent_id,
            target_agent_id,
            prompt,
        } => {
            if let Some(tracker) = trackers.get_mut(&agent_id) {
                tracker.record_a2a_call(&target_agent_id, &prompt);
            }
            state.events.publish(OrchestrationEvent::AgentA2aCall {
                task_run_id: task_run_id.to_string(),
                caller_agent_id: agent_id,
                target_agent_id,
                prompt,
            });
        }
        RunEvent::A2aResolved {
            agent_id,
            target_agent_id,
            result,
        } => {
            if let Some(tracker) = trackers.get_mut(&agent_id) {
                tracker.record_a2a_result(&target_agent_id, &result);
            }
        }
        RunEvent::Terminal { agent_id, outcome } => {
            let Some(rt) = runtimes
                .iter_mut()
                .find(|rt| rt.planned.agent_id == agent_id && rt.status == AssignmentStatus::Running)
            else {
                log::debug!(
                    "Dropping late terminal event for agent {} (assignment already terminal)",
                    agent_id
                );
                return Ok(());
            };

            rt.status = outcome.status;
            rt.output = outcome.output.clone();
            rt.usage = outcome.usage;
            rt.duration_ms = outcome.duration_ms;
            rt.error = outcome.error.clone();

            if let Some(tracker) = trackers.get_mut(&agent_id) {
                tracker.finish(
                    outcome.status,
                    outcome.usage,
                    outcome.duration_ms,
                    outcome.error.clone(),
                );
            }

            {
                let aid = rt.assignment_id.clone();
                let status = outcome.status;
                let output = outcome.output.clone();
                let model = rt.model.clone();
                let usage = outcome.usage;
                let duration = outcome.duration_ms;
                let error = outcome.error.clone();
                db_task(state, move |s| {
                    task_run_repo::mark_assignment_terminal(
                        &s,
                        &aid,
                        status,
                        output.as_deref(),
                        if model.is_empty() { None } else { Some(&model) },
                        usage.tokens_in,
                        usage.tokens_out,
                        usage.cache_creation_tokens,
                        usage.cache_read_tokens,
                        duration,
                        error.as_deref(),
                    )
                })
                .await?;
            }

            {
                let mut agent_cancels = state.agent_cancellations.lock().await;
                agent_cancels.remove(&(task_run_id.to_string(), agent_id.clone()));
            }

            if outcome.status == AssignmentStatus::Failed {
                log::warn!(
                    "Agent assignment failed for {}: {}",
                    rt.agent_name,
                    outcome.error.as_deref().unwrap_or("unknown error")
                );
            }

            state.events.publish(OrchestrationEvent::AgentCompleted {
                task_run_id: task_run_id.to_string(),
                assignment_id: rt.assignment_id.clone(),
                agent_id,
                agent_name: rt.agent_name.clone(),
                status: outcome.status,
                output: outcome.output,
                error: outcome.error,
                usage: outcome.usage,
                duration_ms: outcome.duration_ms,
            });
        }
    }

    mirror_trackers(state, task_run_id, trackers).await;
    Ok(())
}

async fn mirror_trackers(
    state: &AppState,
    task_run_id: &str,
    trackers: &HashMap<String, AgentExecutionTracker>,
) {
    let snapshots: Vec<_> = trackers.values().map(|t| t.snapshot()).collect();
    let mut mirror = state.tracker_snapshots.lock().await;
    mirror.insert(task_run_id.to_string(), snapshots);
}

enum CallEnd {
    Completed {
        output: String,
        usage: TokenUsage,
    },
    Failed(String),
    Cancelled,
}

/// Executor task for one assignment: pump the agent's stream into the
/// driver, following `<a2a_call>` delegations up to the iteration cap.
async fn drive_assignment(
    state: AppState,
    task_run_id: String,
    agent: AgentConfig,
    initial_input: String,
    cancel_token: CancellationToken,
    events_tx: mpsc::UnboundedSender<RunEvent>,
    all_agents: Vec<AgentConfig>,
) {
    let started = Instant::now();
    let corr_id = correlation_id(&task_run_id, &agent.id);
    let mut usage = TokenUsage::default();
    let mut accumulated = String::new();
    let mut input = initial_input;
    let mut iterations = 0usize;

    let outcome = loop {
        let request = InvokeRequest {
            correlation_id: corr_id.clone(),
            agent: agent.clone(),
            input_text: input.clone(),
        };
        let mut rx = match state.transport.invoke(request) {
            Ok(rx) => rx,
            Err(e) => {
                break AssignmentOutcome {
                    status: AssignmentStatus::Failed,
                    output: None,
                    usage,
                    duration_ms: started.elapsed().as_millis() as i64,
                    error: Some(e.to_string()),
                }
            }
        };

        let call_end = loop {
            let event = tokio::select! {
                _ = cancel_token.cancelled() => {
                    state.transport.cancel(&corr_id);
                    break CallEnd::Cancelled;
                }
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => break CallEnd::Failed(
                        "Agent stream ended without a terminal event".into(),
                    ),
                },
            };

            match event {
                AgentStreamEvent::Completed {
                    output,
                    usage,
                    duration_ms: _,
                } => {
                    break CallEnd::Completed { output, usage };
                }
                AgentStreamEvent::Failed { error } => break CallEnd::Failed(error),
                other => {
                    let _ = events_tx.send(RunEvent::Stream {
                        agent_id: agent.id.clone(),
                        event: other,
                    });
                }
            }
        };

        match call_end {
            CallEnd::Completed { output, usage: u } => {
                usage.add(&u);

                if iterations < plan::MAX_A2A_ITERATIONS {
                    if let Some(a2a) = plan::parse_a2a_call(&output) {
                        iterations += 1;
                        accumulated.push_str(&output);

                        let _ = events_tx.send(RunEvent::A2aStarted {
                            agent_id: agent.id.clone(),
                            target_agent_id: a2a.target_agent_id.clone(),
                            prompt: a2a.prompt.clone(),
                        });

                        let target = all_agents.iter().find(|a| a.id == a2a.target_agent_id);
                        let (target_name, response) = match target {
                            None => (
                                "Unknown".to_string(),
                                format!(
                                    "(A2A call failed: agent '{}' not found in this workspace)",
                                    a2a.target_agent_id
                                ),
                            ),
                            Some(target_agent) => {
                                let result = invoke_collect_inner(
                                    &state,
                                    target_agent,
                                    &a2a.prompt,
                                    &correlation_id(&task_run_id, &target_agent.id),
                                    &cancel_token,
                                )
                                .await;
                                let text = match result {
                                    Ok((text, target_usage)) => {
                                        usage.add(&target_usage);
                                        text
                                    }
                                    Err(e) => format!("(A2A call failed: {})", e),
                                };
                                (target_agent.name.clone(), text)
                            }
                        };

                        let _ = events_tx.send(RunEvent::A2aResolved {
                            agent_id: agent.id.clone(),
                            target_agent_id: a2a.target_agent_id.clone(),
                            result: response.clone(),
                        });

                        input = plan::build_a2a_followup(&target_name, &response);
                        continue;
                    }
                }

                accumulated.push_str(&output);
                break AssignmentOutcome {
                    status: AssignmentStatus::Completed,
                    output: Some(accumulated),
                    usage,
                    duration_ms: started.elapsed().as_millis() as i64,
                    error: None,
                };
            }
            CallEnd::Failed(error) => {
                break AssignmentOutcome {
                    status: AssignmentStatus::Failed,
                    output: None,
                    usage,
                    duration_ms: started.elapsed().as_millis() as i64,
                    error: Some(error),
                };
            }
            CallEnd::Cancelled => {
                break AssignmentOutcome {
                    status: AssignmentStatus::Cancelled,
                    output: None,
                    usage,
                    duration_ms: started.elapsed().as_millis() as i64,
                    error: Some("Agent cancelled".into()),
                };
            }
        }
    };

    let _ = events_tx.send(RunEvent::Terminal {
        agent_id: agent.id.clone(),
        outcome,
    });
}

/// Call an agent and collect its whole response, forwarding chunk and
/// tool-call progress outward. Used for the control hub's planning and
/// summary calls, where no assignment record exists.
async fn invoke_collect(
    state: &AppState,
    task_run_id: &str,
    agent: &AgentConfig,
    input: &str,
    cancel_token: &CancellationToken,
) -> AppResult<(String, TokenUsage)> {
    let corr_id = correlation_id(task_run_id, &agent.id);
    let mut rx = state.transport.invoke(InvokeRequest {
        correlation_id: corr_id.clone(),
        agent: agent.clone(),
        input_text: input.to_string(),
    })?;

    let mut collected = String::new();
    loop {
        let event = tokio::select! {
            _ = cancel_token.cancelled() => {
                state.transport.cancel(&corr_id);
                return Err(AppError::AgentCancelled(agent.id.clone()));
            }
            event = rx.recv() => match event {
                Some(event) => event,
                None => {
                    return Err(AppError::Transport(
                        "Agent stream ended without a terminal event".into(),
                    ))
                }
            },
        };

        match event {
            AgentStreamEvent::Chunk { text } => {
                collected.push_str(&text);
                state.events.publish(OrchestrationEvent::AgentChunk {
                    task_run_id: task_run_id.to_string(),
                    agent_id: agent.id.clone(),
                    text,
                });
            }
            AgentStreamEvent::ToolCall(record) | AgentStreamEvent::ToolCallUpdate(record) => {
                state.events.publish(OrchestrationEvent::AgentToolCall {
                    task_run_id: task_run_id.to_string(),
                    agent_id: agent.id.clone(),
                    tool_call: record,
                });
            }
            AgentStreamEvent::PermissionRequest(request) => {
                {
                    let mut perms = state.pending_permissions.lock().await;
                    perms.insert(
                        (task_run_id.to_string(), request.request_id.clone()),
                        PendingPermission {
                            agent_id: agent.id.clone(),
                            correlation_id: corr_id.clone(),
                        },
                    );
                }
                state.events.publish(OrchestrationEvent::PermissionRequest {
                    task_run_id: task_run_id.to_string(),
                    agent_id: agent.id.clone(),
                    request_id: request.request_id,
                    tool_call: request.tool_call,
                    options: request.options,
                });
            }
            AgentStreamEvent::Completed { output, usage, .. } => {
                let text = if output.is_empty() { collected } else { output };
                if text.is_empty() {
                    return Err(AppError::Transport(format!(
                        "Agent {} returned no response",
                        agent.id
                    )));
                }
                return Ok((text, usage));
            }
            AgentStreamEvent::Failed { error } => {
                return Err(AppError::Transport(error));
            }
        }
    }
}

/// Silent variant for A2A target calls: no outward chunk forwarding,
/// the caller folds the result into its own output.
async fn invoke_collect_inner(
    state: &AppState,
    agent: &AgentConfig,
    input: &str,
    corr_id: &str,
    cancel_token: &CancellationToken,
) -> AppResult<(String, TokenUsage)> {
    let mut rx = state.transport.invoke(InvokeRequest {
        correlation_id: corr_id.to_string(),
        agent: agent.clone(),
        input_text: input.to_string(),
    })?;

    let mut collected = String::new();
    loop {
        let event = tokio::select! {
            _ = cancel_token.cancelled() => {
                state.transport.cancel(corr_id);
                return Err(AppError::AgentCancelled(agent.id.clone()));
            }
            event = rx.recv() => match event {
                Some(event) => event,
                None => {
                    return Err(AppError::Transport(
                        "Agent stream ended without a terminal event".into(),
                    ))
                }
            },
        };

        match event {
            AgentStreamEvent::Chunk { text } => collected.push_str(&text),
            AgentStreamEvent::Completed { output, usage, .. } => {
                let text = if output.is_empty() { collected } else { output };
                return Ok((text, usage));
            }
            AgentStreamEvent::Failed { error } => return Err(AppError::Transport(error)),
            _ => {}
        }
    }
}
