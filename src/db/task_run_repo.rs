use rusqlite::params;

use crate::db::utc_now_string;
use crate::error::{AppError, AppResult};
use crate::models::task_run::{
    AssignmentStatus, ScheduleType, TaskAssignment, TaskRun, TaskRunStatus,
};
use crate::state::AppState;

fn parse_col<T>(idx: usize, raw: &str, parsed: Option<T>) -> rusqlite::Result<T> {
    parsed.ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            format!("unrecognized value '{raw}'").into(),
        )
    })
}

fn row_to_task_run(row: &rusqlite::Row) -> rusqlite::Result<TaskRun> {
    let status_raw: String = row.get(4)?;
    let schedule_raw: String = row.get(13)?;
    Ok(TaskRun {
        id: row.get(0)?,
        title: row.get(1)?,
        user_prompt: row.get(2)?,
        control_hub_agent_id: row.get(3)?,
        status: parse_col(4, &status_raw, TaskRunStatus::parse(&status_raw))?,
        task_plan_json: row.get(5)?,
        result_summary: row.get(6)?,
        total_tokens_in: row.get(7)?,
        total_tokens_out: row.get(8)?,
        total_cache_creation_tokens: row.get(9)?,
        total_cache_read_tokens: row.get(10)?,
        total_duration_ms: row.get(11)?,
        rating: row.get(12)?,
        schedule_type: parse_col(13, &schedule_raw, ScheduleType::parse(&schedule_raw))?,
        scheduled_time: row.get(14)?,
        recurrence_pattern_json: row.get(15)?,
        next_run_at: row.get(16)?,
        is_paused: row.get::<_, i64>(17)? != 0,
        workspace_id: row.get(18)?,
        created_at: row.get(19)?,
        updated_at: row.get(20)?,
    })
}

fn row_to_assignment(row: &rusqlite::Row) -> rusqlite::Result<TaskAssignment> {
    let status_raw: String = row.get(7)?;
    Ok(TaskAssignment {
        id: row.get(0)?,
        task_run_id: row.get(1)?,
        agent_id: row.get(2)?,
        agent_name: row.get(3)?,
        sequence_order: row.get(4)?,
        input_text: row.get(5)?,
        output_text: row.get(6)?,
        status: parse_col(7, &status_raw, AssignmentStatus::parse(&status_raw))?,
        model_used: row.get(8)?,
        tokens_in: row.get(9)?,
        tokens_out: row.get(10)?,
        cache_creation_tokens: row.get(11)?,
        cache_read_tokens: row.get(12)?,
        started_at: row.get(13)?,
        completed_at: row.get(14)?,
        duration_ms: row.get(15)?,
        error_message: row.get(16)?,
        created_at: row.get(17)?,
    })
}

const TASK_RUN_COLS: &str = "id, title, user_prompt, control_hub_agent_id, status, task_plan_json, result_summary, total_tokens_in, total_tokens_out, total_cache_creation_tokens, total_cache_read_tokens, total_duration_ms, rating, schedule_type, scheduled_time, recurrence_pattern, next_run_at, is_paused, workspace_id, created_at, updated_at";
const ASSIGNMENT_COLS: &str = "id, task_run_id, agent_id, agent_name, sequence_order, input_text, output_text, status, model_used, tokens_in, tokens_out, cache_creation_tokens, cache_read_tokens, started_at, completed_at, duration_ms, error_message, created_at";

pub fn create_task_run(
    state: &AppState,
    id: &str,
    title: &str,
    user_prompt: &str,
    control_hub_agent_id: &str,
    workspace_id: Option<&str>,
) -> AppResult<TaskRun> {
    let db = state.db.lock().map_err(|e| AppError::Database(e.to_string()))?;
    db.execute(
        "INSERT INTO task_runs (id, title, user_prompt, control_hub_agent_id, status, workspace_id) VALUES (?1, ?2, ?3, ?4, 'pending', ?5)",
        params![id, title, user_prompt, control_hub_agent_id, workspace_id],
    )
    .map_err(|e| AppError::Database(e.to_string()))?;

    db.query_row(
        &format!("SELECT {TASK_RUN_COLS} FROM task_runs WHERE id = ?1"),
        params![id],
        row_to_task_run,
    )
    .map_err(|e| AppError::Database(e.to_string()))
}

pub fn get_task_run(state: &AppState, id: &str) -> AppResult<TaskRun> {
    let db = state.db.lock().map_err(|e| AppError::Database(e.to_string()))?;
    db.query_row(
        &format!("SELECT {TASK_RUN_COLS} FROM task_runs WHERE id = ?1"),
        params![id],
        row_to_task_run,
    )
    .map_err(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => AppError::NotFound(format!("TaskRun {id} not found")),
        _ => AppError::Database(e.to_string()),
    })
}

pub fn list_task_runs(state: &AppState, workspace_id: Option<&str>) -> AppResult<Vec<TaskRun>> {
    let db = state.db.lock().map_err(|e| AppError::Database(e.to_string()))?;

    let runs = if let Some(ws_id) = workspace_id {
        let mut stmt = db
            .prepare(&format!(
                "SELECT {TASK_RUN_COLS} FROM task_runs WHERE workspace_id = ?1 ORDER BY created_at DESC"
            ))
            .map_err(|e| AppError::Database(e.to_string()))?;
        let rows = stmt
            .query_map(params![ws_id], row_to_task_run)
            .map_err(|e| AppError::Database(e.to_string()))?
            .collect::<Result<Vec<_>, _>>();
        rows
    } else {
        let mut stmt = db
            .prepare(&format!(
                "SELECT {TASK_RUN_COLS} FROM task_runs ORDER BY created_at DESC"
            ))
            .map_err(|e| AppError::Database(e.to_string()))?;
        let rows = stmt
            .query_map([], row_to_task_run)
            .map_err(|e| AppError::Database(e.to_string()))?
            .collect::<Result<Vec<_>, _>>();
        rows
    }
    .map_err(|e| AppError::Database(e.to_string()))?;

    Ok(runs)
}

/// Move a task run along a legal state-machine edge. Returns `false` when
/// the run is already in `next` (idempotent no-op). Any other illegal edge
/// is an `InvalidRequest`.
pub fn transition_task_run_status(
    state: &AppState,
    id: &str,
    next: TaskRunStatus,
) -> AppResult<bool> {
    let current = get_task_run(state, id)?.status;
    if current == next {
        return Ok(false);
    }
    if !current.can_transition_to(next) {
        return Err(AppError::InvalidRequest(format!(
            "Illegal task run transition {} -> {} for {}",
            current.as_str(),
            next.as_str(),
            id
        )));
    }

    let db = state.db.lock().map_err(|e| AppError::Database(e.to_string()))?;
    db.execute(
        "UPDATE task_runs SET status = ?1, updated_at = datetime('now') WHERE id = ?2",
        params![next.as_str(), id],
    )
    .map_err(|e| AppError::Database(e.to_string()))?;
    Ok(true)
}

/// Direct status write without the transition check. Only for restart
/// recovery and scheduled re-execution, where the row begins a new
/// lifecycle rather than following an edge of the current one.
pub fn force_task_run_status(state: &AppState, id: &str, status: TaskRunStatus) -> AppResult<()> {
    let db = state.db.lock().map_err(|e| AppError::Database(e.to_string()))?;
    db.execute(
        "UPDATE task_runs SET status = ?1, updated_at = datetime('now') WHERE id = ?2",
        params![status.as_str(), id],
    )
    .map_err(|e| AppError::Database(e.to_string()))?;
    Ok(())
}

pub fn update_task_run_plan(state: &AppState, id: &str, plan_json: &str) -> AppResult<()> {
    let db = state.db.lock().map_err(|e| AppError::Database(e.to_string()))?;
    db.execute(
        "UPDATE task_runs SET task_plan_json = ?1, updated_at = datetime('now') WHERE id = ?2",
        params![plan_json, id],
    )
    .map_err(|e| AppError::Database(e.to_string()))?;
    Ok(())
}

pub fn update_task_run_summary(state: &AppState, id: &str, summary: &str) -> AppResult<()> {
    let db = state.db.lock().map_err(|e| AppError::Database(e.to_string()))?;
    db.execute(
        "UPDATE task_runs SET result_summary = ?1, updated_at = datetime('now') WHERE id = ?2",
        params![summary, id],
    )
    .map_err(|e| AppError::Database(e.to_string()))?;
    Ok(())
}

pub fn update_task_run_totals(
    state: &AppState,
    id: &str,
    tokens_in: i64,
    tokens_out: i64,
    cache_creation_tokens: i64,
    cache_read_tokens: i64,
    duration_ms: i64,
) -> AppResult<()> {
    let db = state.db.lock().map_err(|e| AppError::Database(e.to_string()))?;
    db.execute(
        "UPDATE task_runs SET total_tokens_in = ?1, total_tokens_out = ?2, total_cache_creation_tokens = ?3, total_cache_read_tokens = ?4, total_duration_ms = ?5, updated_at = datetime('now') WHERE id = ?6",
        params![tokens_in, tokens_out, cache_creation_tokens, cache_read_tokens, duration_ms, id],
    )
    .map_err(|e| AppError::Database(e.to_string()))?;
    Ok(())
}

/// Rate a completed task run (1-5 stars).
pub fn rate_task_run(state: &AppState, id: &str, rating: i64) -> AppResult<()> {
    let db = state.db.lock().map_err(|e| AppError::Database(e.to_string()))?;
    db.execute(
        "UPDATE task_runs SET rating = ?1, updated_at = datetime('now') WHERE id = ?2",
        params![rating, id],
    )
    .map_err(|e| AppError::Database(e.to_string()))?;
    Ok(())
}

/// Explicit user deletion; assignments cascade with the run.
pub fn delete_task_run(state: &AppState, id: &str) -> AppResult<()> {
    let db = state.db.lock().map_err(|e| AppError::Database(e.to_string()))?;
    db.execute("DELETE FROM task_runs WHERE id = ?1", params![id])
        .map_err(|e| AppError::Database(e.to_string()))?;
    Ok(())
}

pub fn create_task_assignment(
    state: &AppState,
    id: &str,
    task_run_id: &str,
    agent_id: &str,
    agent_name: &str,
    sequence_order: i64,
    input_text: &str,
) -> AppResult<TaskAssignment> {
    let db = state.db.lock().map_err(|e| AppError::Database(e.to_string()))?;
    db.execute(
        "INSERT INTO task_assignments (id, task_run_id, agent_id, agent_name, sequence_order, input_text) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![id, task_run_id, agent_id, agent_name, sequence_order, input_text],
    )
    .map_err(|e| AppError::Database(e.to_string()))?;

    db.query_row(
        &format!("SELECT {ASSIGNMENT_COLS} FROM task_assignments WHERE id = ?1"),
        params![id],
        row_to_assignment,
    )
    .map_err(|e| AppError::Database(e.to_string()))
}

/// Mark an assignment running. `started_at` is only set on the first
/// start so a regenerated assignment keeps its original creation record
/// but gets a fresh start timestamp after `reset_assignment`.
pub fn mark_assignment_running(state: &AppState, id: &str, input_text: &str) -> AppResult<()> {
    let db = state.db.lock().map_err(|e| AppError::Database(e.to_string()))?;
    let now = utc_now_string();
    db.execute(
        "UPDATE task_assignments SET status = 'running', input_text = ?1, started_at = COALESCE(started_at, ?2) WHERE id = ?3",
        params![input_text, now, id],
    )
    .map_err(|e| AppError::Database(e.to_string()))?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
pub fn mark_assignment_terminal(
    state: &AppState,
    id: &str,
    status: AssignmentStatus,
    output_text: Option<&str>,
    model_used: Option<&str>,
    tokens_in: i64,
    tokens_out: i64,
    cache_creation_tokens: i64,
    cache_read_tokens: i64,
    duration_ms: i64,
    error_message: Option<&str>,
) -> AppResult<()> {
    if !status.is_terminal() {
        return Err(AppError::InvalidRequest(format!(
            "{} is not a terminal assignment status",
            status.as_str()
        )));
    }
    let db = state.db.lock().map_err(|e| AppError::Database(e.to_string()))?;
    let now = utc_now_string();
    db.execute(
        "UPDATE task_assignments SET status=?1, output_text=?2, model_used=?3, tokens_in=?4, tokens_out=?5, cache_creation_tokens=?6, cache_read_tokens=?7, duration_ms=?8, error_message=?9, completed_at=?10 WHERE id=?11",
        params![status.as_str(), output_text, model_used, tokens_in, tokens_out, cache_creation_tokens, cache_read_tokens, duration_ms, error_message, now, id],
    )
    .map_err(|e| AppError::Database(e.to_string()))?;
    Ok(())
}

/// Return an assignment to `pending` for regeneration, clearing prior
/// output, metrics and timestamps.
pub fn reset_assignment(state: &AppState, id: &str) -> AppResult<()> {
    let db = state.db.lock().map_err(|e| AppError::Database(e.to_string()))?;
    db.execute(
        "UPDATE task_assignments SET status='pending', output_text=NULL, model_used=NULL, tokens_in=0, tokens_out=0, cache_creation_tokens=0, cache_read_tokens=0, started_at=NULL, completed_at=NULL, duration_ms=0, error_message=NULL WHERE id=?1",
        params![id],
    )
    .map_err(|e| AppError::Database(e.to_string()))?;
    Ok(())
}

pub fn list_assignments_for_run(
    state: &AppState,
    task_run_id: &str,
) -> AppResult<Vec<TaskAssignment>> {
    let db = state.db.lock().map_err(|e| AppError::Database(e.to_string()))?;
    let mut stmt = db
        .prepare(&format!(
            "SELECT {ASSIGNMENT_COLS} FROM task_assignments WHERE task_run_id = ?1 ORDER BY sequence_order, created_at"
        ))
        .map_err(|e| AppError::Database(e.to_string()))?;

    let assignments = stmt
        .query_map(params![task_run_id], row_to_assignment)
        .map_err(|e| AppError::Database(e.to_string()))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| AppError::Database(e.to_string()))?;

    Ok(assignments)
}

/// Task runs left in a non-terminal state, oldest first. Used on startup
/// to find runs interrupted by a process restart.
pub fn list_incomplete_task_runs(state: &AppState) -> AppResult<Vec<TaskRun>> {
    let db = state.db.lock().map_err(|e| AppError::Database(e.to_string()))?;
    let mut stmt = db
        .prepare(&format!(
            "SELECT {TASK_RUN_COLS} FROM task_runs \
             WHERE status IN ('pending', 'analyzing', 'running', 'awaiting_confirmation') \
             ORDER BY created_at ASC"
        ))
        .map_err(|e| AppError::Database(e.to_string()))?;

    let runs = stmt
        .query_map([], row_to_task_run)
        .map_err(|e| AppError::Database(e.to_string()))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| AppError::Database(e.to_string()))?;

    Ok(runs)
}

// ============== Scheduling functions ==============

pub fn update_schedule(
    state: &AppState,
    task_run_id: &str,
    schedule_type: ScheduleType,
    scheduled_time: Option<&str>,
    recurrence_pattern_json: Option<&str>,
    next_run_at: Option<&str>,
) -> AppResult<TaskRun> {
    {
        let db = state.db.lock().map_err(|e| AppError::Database(e.to_string()))?;
        db.execute(
            "UPDATE task_runs SET schedule_type = ?1, scheduled_time = ?2, recurrence_pattern = ?3, next_run_at = ?4, is_paused = 0, updated_at = datetime('now') WHERE id = ?5",
            params![schedule_type.as_str(), scheduled_time, recurrence_pattern_json, next_run_at, task_run_id],
        )
        .map_err(|e| AppError::Database(e.to_string()))?;
    }
    get_task_run(state, task_run_id)
}

pub fn clear_schedule(state: &AppState, task_run_id: &str) -> AppResult<()> {
    let db = state.db.lock().map_err(|e| AppError::Database(e.to_string()))?;
    db.execute(
        "UPDATE task_runs SET schedule_type = 'none', scheduled_time = NULL, recurrence_pattern = NULL, next_run_at = NULL, is_paused = 0, updated_at = datetime('now') WHERE id = ?1",
        params![task_run_id],
    )
    .map_err(|e| AppError::Database(e.to_string()))?;
    Ok(())
}

pub fn set_next_run_at(state: &AppState, task_run_id: &str, next_run_at: Option<&str>) -> AppResult<()> {
    let db = state.db.lock().map_err(|e| AppError::Database(e.to_string()))?;
    db.execute(
        "UPDATE task_runs SET next_run_at = ?1, updated_at = datetime('now') WHERE id = ?2",
        params![next_run_at, task_run_id],
    )
    .map_err(|e| AppError::Database(e.to_string()))?;
    Ok(())
}

pub fn pause_scheduled_task(state: &AppState, task_run_id: &str) -> AppResult<()> {
    let db = state.db.lock().map_err(|e| AppError::Database(e.to_string()))?;
    db.execute(
        "UPDATE task_runs SET is_paused = 1, updated_at = datetime('now') WHERE id = ?1",
        params![task_run_id],
    )
    .map_err(|e| AppError::Database(e.to_string()))?;
    Ok(())
}

pub fn resume_scheduled_task(state: &AppState, task_run_id: &str) -> AppResult<()> {
    let db = state.db.lock().map_err(|e| AppError::Database(e.to_string()))?;
    db.execute(
        "UPDATE task_runs SET is_paused = 0, updated_at = datetime('now') WHERE id = ?1",
        params![task_run_id],
    )
    .map_err(|e| AppError::Database(e.to_string()))?;
    Ok(())
}

/// Scheduled runs whose `next_run_at` has elapsed and are not paused.
/// A run that was overdue while the process was down is simply due now;
/// there is no backfill of missed occurrences.
pub fn list_due_scheduled_tasks(state: &AppState, now: &str) -> AppResult<Vec<TaskRun>> {
    let db = state.db.lock().map_err(|e| AppError::Database(e.to_string()))?;
    let mut stmt = db
        .prepare(&format!(
            "SELECT {TASK_RUN_COLS} FROM task_runs \
             WHERE schedule_type != 'none' \
             AND is_paused = 0 \
             AND next_run_at IS NOT NULL \
             AND datetime(next_run_at) <= datetime(?1) \
             ORDER BY next_run_at ASC"
        ))
        .map_err(|e| AppError::Database(e.to_string()))?;

    let runs = stmt
        .query_map(params![now], row_to_task_run)
        .map_err(|e| AppError::Database(e.to_string()))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| AppError::Database(e.to_string()))?;

    Ok(runs)
}

/// Prepare a scheduled run for re-execution: drop the previous plan,
/// assignments, summary and totals, and return the status to `pending`.
pub fn reset_for_rerun(state: &AppState, task_run_id: &str) -> AppResult<()> {
    let db = state.db.lock().map_err(|e| AppError::Database(e.to_string()))?;
    db.execute(
        "DELETE FROM task_assignments WHERE task_run_id = ?1",
        params![task_run_id],
    )
    .map_err(|e| AppError::Database(e.to_string()))?;
    db.execute(
        "UPDATE task_runs SET status = 'pending', task_plan_json = NULL, result_summary = NULL, total_tokens_in = 0, total_tokens_out = 0, total_cache_creation_tokens = 0, total_cache_read_tokens = 0, total_duration_ms = 0, updated_at = datetime('now') WHERE id = ?1",
        params![task_run_id],
    )
    .map_err(|e| AppError::Database(e.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::db::migrations;
    use crate::transport::{AgentStreamEvent, AgentTransport, InvokeRequest};

    struct NullTransport;

    impl AgentTransport for NullTransport {
        fn invoke(
            &self,
            _request: InvokeRequest,
        ) -> AppResult<tokio::sync::mpsc::Receiver<AgentStreamEvent>> {
            Err(AppError::Transport("no transport in repo tests".into()))
        }
        fn cancel(&self, _correlation_id: &str) {}
        fn respond_permission(&self, _correlation_id: &str, _request_id: &str, _option_id: &str) {}
    }

    fn state() -> AppState {
        let conn = migrations::init_db_in_memory().unwrap();
        AppState::new(conn, Arc::new(NullTransport))
    }

    fn seed_run(state: &AppState, id: &str) -> TaskRun {
        create_task_run(state, id, "title", "prompt", "hub-1", None).unwrap()
    }

    #[test]
    fn task_run_round_trips() {
        let state = state();
        let created = seed_run(&state, "run-1");
        assert_eq!(created.status, TaskRunStatus::Pending);
        assert_eq!(created.schedule_type, ScheduleType::None);
        assert!(created.next_run_at.is_none());

        let fetched = get_task_run(&state, "run-1").unwrap();
        assert_eq!(fetched.user_prompt, "prompt");
        assert!(matches!(
            get_task_run(&state, "missing"),
            Err(AppError::NotFound(_))
        ));
    }

    #[test]
    fn transition_enforces_legal_edges() {
        let state = state();
        seed_run(&state, "run-1");

        assert!(transition_task_run_status(&state, "run-1", TaskRunStatus::Analyzing).unwrap());
        // Same-status transition is an idempotent no-op.
        assert!(!transition_task_run_status(&state, "run-1", TaskRunStatus::Analyzing).unwrap());
        // pending/analyzing cannot jump straight to completed.
        assert!(matches!(
            transition_task_run_status(&state, "run-1", TaskRunStatus::Completed),
            Err(AppError::InvalidRequest(_))
        ));

        transition_task_run_status(&state, "run-1", TaskRunStatus::Running).unwrap();
        transition_task_run_status(&state, "run-1", TaskRunStatus::Completed).unwrap();
        // Terminal states are absorbing.
        assert!(matches!(
            transition_task_run_status(&state, "run-1", TaskRunStatus::Running),
            Err(AppError::InvalidRequest(_))
        ));
    }

    #[test]
    fn schedule_fields_update_independently_of_status() {
        let state = state();
        seed_run(&state, "run-1");
        transition_task_run_status(&state, "run-1", TaskRunStatus::Analyzing).unwrap();

        let updated = update_schedule(
            &state,
            "run-1",
            ScheduleType::Once,
            Some("2030-05-01T09:00:00Z"),
            None,
            Some("2030-05-01T09:00:00Z"),
        )
        .unwrap();
        assert_eq!(updated.schedule_type, ScheduleType::Once);
        assert_eq!(updated.status, TaskRunStatus::Analyzing);

        clear_schedule(&state, "run-1").unwrap();
        let cleared = get_task_run(&state, "run-1").unwrap();
        assert_eq!(cleared.schedule_type, ScheduleType::None);
        assert!(cleared.scheduled_time.is_none());
        assert!(cleared.next_run_at.is_none());
        assert_eq!(cleared.status, TaskRunStatus::Analyzing);
    }

    #[test]
    fn due_listing_respects_pause_and_time() {
        let state = state();
        seed_run(&state, "past");
        seed_run(&state, "future");
        seed_run(&state, "paused");

        update_schedule(&state, "past", ScheduleType::Once, Some("2020-01-01T00:00:00Z"), None, Some("2020-01-01T00:00:00Z")).unwrap();
        update_schedule(&state, "future", ScheduleType::Once, Some("2099-01-01T00:00:00Z"), None, Some("2099-01-01T00:00:00Z")).unwrap();
        update_schedule(&state, "paused", ScheduleType::Once, Some("2020-01-01T00:00:00Z"), None, Some("2020-01-01T00:00:00Z")).unwrap();
        pause_scheduled_task(&state, "paused").unwrap();

        let due = list_due_scheduled_tasks(&state, "2025-06-01T12:00:00Z").unwrap();
        let ids: Vec<&str> = due.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["past"]);

        resume_scheduled_task(&state, "paused").unwrap();
        let due = list_due_scheduled_tasks(&state, "2025-06-01T12:00:00Z").unwrap();
        assert_eq!(due.len(), 2);
    }

    #[test]
    fn assignment_reset_clears_output_and_metrics() {
        let state = state();
        seed_run(&state, "run-1");
        create_task_assignment(&state, "as-1", "run-1", "agent-1", "Worker", 0, "do it").unwrap();
        mark_assignment_running(&state, "as-1", "do it now").unwrap();
        mark_assignment_terminal(
            &state,
            "as-1",
            AssignmentStatus::Completed,
            Some("done"),
            Some("gpt-4-turbo"),
            10,
            5,
            2,
            1,
            1200,
            None,
        )
        .unwrap();

        let rows = list_assignments_for_run(&state, "run-1").unwrap();
        assert_eq!(rows[0].status, AssignmentStatus::Completed);
        assert!(rows[0].started_at.is_some());
        assert!(rows[0].completed_at.is_some());

        reset_assignment(&state, "as-1").unwrap();
        let rows = list_assignments_for_run(&state, "run-1").unwrap();
        assert_eq!(rows[0].status, AssignmentStatus::Pending);
        assert!(rows[0].output_text.is_none());
        assert!(rows[0].started_at.is_none());
        assert_eq!(rows[0].tokens_in, 0);
    }

    #[test]
    fn marking_a_non_terminal_status_as_terminal_is_rejected() {
        let state = state();
        seed_run(&state, "run-1");
        create_task_assignment(&state, "as-1", "run-1", "agent-1", "Worker", 0, "do it").unwrap();
        assert!(matches!(
            mark_assignment_terminal(
                &state,
                "as-1",
                AssignmentStatus::Running,
                None,
                None,
                0,
                0,
                0,
                0,
                0,
                None
            ),
            Err(AppError::InvalidRequest(_))
        ));
    }

    #[test]
    fn deleting_a_run_cascades_its_assignments() {
        let state = state();
        seed_run(&state, "run-1");
        create_task_assignment(&state, "as-1", "run-1", "agent-1", "Worker", 0, "do it").unwrap();

        delete_task_run(&state, "run-1").unwrap();
        assert!(list_assignments_for_run(&state, "run-1").unwrap().is_empty());
    }

    #[test]
    fn reset_for_rerun_clears_previous_execution() {
        let state = state();
        seed_run(&state, "run-1");
        update_task_run_plan(&state, "run-1", "{\"analysis\":\"x\",\"assignments\":[]}").unwrap();
        update_task_run_summary(&state, "run-1", "old summary").unwrap();
        update_task_run_totals(&state, "run-1", 10, 5, 2, 1, 900).unwrap();
        create_task_assignment(&state, "as-1", "run-1", "agent-1", "Worker", 0, "do it").unwrap();
        transition_task_run_status(&state, "run-1", TaskRunStatus::Analyzing).unwrap();
        transition_task_run_status(&state, "run-1", TaskRunStatus::Running).unwrap();
        transition_task_run_status(&state, "run-1", TaskRunStatus::Completed).unwrap();

        reset_for_rerun(&state, "run-1").unwrap();
        let run = get_task_run(&state, "run-1").unwrap();
        assert_eq!(run.status, TaskRunStatus::Pending);
        assert!(run.task_plan_json.is_none());
        assert!(run.result_summary.is_none());
        assert_eq!(run.total_tokens_in, 0);
        assert!(list_assignments_for_run(&state, "run-1").unwrap().is_empty());
    }
}
