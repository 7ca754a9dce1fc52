use rusqlite::params;

use crate::error::{AppError, AppResult};
use crate::models::agent::{AgentConfig, CreateAgentRequest};
use crate::state::AppState;

fn row_to_agent(row: &rusqlite::Row) -> rusqlite::Result<AgentConfig> {
    Ok(AgentConfig {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        model: row.get(3)?,
        system_prompt: row.get(4)?,
        skills_json: row.get(5)?,
        is_control_hub: row.get::<_, i64>(6)? != 0,
        is_enabled: row.get::<_, i64>(7)? != 0,
        max_concurrency: row.get(8)?,
        workspace_id: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

const AGENT_COLS: &str = "id, name, description, model, system_prompt, skills_json, is_control_hub, is_enabled, max_concurrency, workspace_id, created_at, updated_at";

pub fn create_agent(state: &AppState, req: CreateAgentRequest) -> AppResult<AgentConfig> {
    let id = uuid::Uuid::new_v4().to_string();
    let db = state.db.lock().map_err(|e| AppError::Database(e.to_string()))?;
    db.execute(
        "INSERT INTO agents (id, name, description, model, system_prompt, skills_json, is_control_hub, max_concurrency, workspace_id) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            id,
            req.name,
            req.description,
            req.model,
            req.system_prompt,
            req.skills_json,
            req.is_control_hub as i64,
            req.max_concurrency,
            req.workspace_id
        ],
    )
    .map_err(|e| AppError::Database(e.to_string()))?;

    db.query_row(
        &format!("SELECT {AGENT_COLS} FROM agents WHERE id = ?1"),
        params![id],
        row_to_agent,
    )
    .map_err(|e| AppError::Database(e.to_string()))
}

pub fn get_agent(state: &AppState, id: &str) -> AppResult<AgentConfig> {
    let db = state.db.lock().map_err(|e| AppError::Database(e.to_string()))?;
    db.query_row(
        &format!("SELECT {AGENT_COLS} FROM agents WHERE id = ?1"),
        params![id],
        row_to_agent,
    )
    .map_err(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => AppError::NotFound(format!("Agent {id} not found")),
        _ => AppError::Database(e.to_string()),
    })
}

/// Agents visible to an orchestration: workspace-scoped when a workspace
/// is given, global otherwise.
pub fn list_agents(state: &AppState, workspace_id: Option<&str>) -> AppResult<Vec<AgentConfig>> {
    let db = state.db.lock().map_err(|e| AppError::Database(e.to_string()))?;

    let agents = if let Some(ws_id) = workspace_id {
        let mut stmt = db
            .prepare(&format!(
                "SELECT {AGENT_COLS} FROM agents WHERE workspace_id = ?1 ORDER BY created_at ASC"
            ))
            .map_err(|e| AppError::Database(e.to_string()))?;
        let rows = stmt
            .query_map(params![ws_id], row_to_agent)
            .map_err(|e| AppError::Database(e.to_string()))?
            .collect::<Result<Vec<_>, _>>();
        rows
    } else {
        let mut stmt = db
            .prepare(&format!("SELECT {AGENT_COLS} FROM agents ORDER BY created_at ASC"))
            .map_err(|e| AppError::Database(e.to_string()))?;
        let rows = stmt
            .query_map([], row_to_agent)
            .map_err(|e| AppError::Database(e.to_string()))?
            .collect::<Result<Vec<_>, _>>();
        rows
    }
    .map_err(|e| AppError::Database(e.to_string()))?;

    Ok(agents)
}

pub fn get_control_hub(
    state: &AppState,
    workspace_id: Option<&str>,
) -> AppResult<Option<AgentConfig>> {
    let db = state.db.lock().map_err(|e| AppError::Database(e.to_string()))?;

    let result = if let Some(ws_id) = workspace_id {
        db.query_row(
            &format!(
                "SELECT {AGENT_COLS} FROM agents WHERE is_control_hub = 1 AND is_enabled = 1 AND workspace_id = ?1 LIMIT 1"
            ),
            params![ws_id],
            row_to_agent,
        )
    } else {
        db.query_row(
            &format!(
                "SELECT {AGENT_COLS} FROM agents WHERE is_control_hub = 1 AND is_enabled = 1 LIMIT 1"
            ),
            [],
            row_to_agent,
        )
    };

    match result {
        Ok(agent) => Ok(Some(agent)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(AppError::Database(e.to_string())),
    }
}

/// Promote one agent to control hub, demoting any other hub in the same
/// workspace scope. An agent may be the hub for at most one scope.
pub fn set_control_hub(state: &AppState, agent_id: &str) -> AppResult<()> {
    let agent = get_agent(state, agent_id)?;
    let db = state.db.lock().map_err(|e| AppError::Database(e.to_string()))?;

    if let Some(ws_id) = &agent.workspace_id {
        db.execute(
            "UPDATE agents SET is_control_hub = 0, updated_at = datetime('now') WHERE workspace_id = ?1",
            params![ws_id],
        )
    } else {
        db.execute(
            "UPDATE agents SET is_control_hub = 0, updated_at = datetime('now') WHERE workspace_id IS NULL",
            [],
        )
    }
    .map_err(|e| AppError::Database(e.to_string()))?;

    db.execute(
        "UPDATE agents SET is_control_hub = 1, updated_at = datetime('now') WHERE id = ?1",
        params![agent_id],
    )
    .map_err(|e| AppError::Database(e.to_string()))?;
    Ok(())
}

pub fn set_agent_enabled(state: &AppState, agent_id: &str, enabled: bool) -> AppResult<()> {
    let db = state.db.lock().map_err(|e| AppError::Database(e.to_string()))?;
    db.execute(
        "UPDATE agents SET is_enabled = ?1, updated_at = datetime('now') WHERE id = ?2",
        params![enabled as i64, agent_id],
    )
    .map_err(|e| AppError::Database(e.to_string()))?;
    Ok(())
}

pub fn delete_agent(state: &AppState, agent_id: &str) -> AppResult<()> {
    let db = state.db.lock().map_err(|e| AppError::Database(e.to_string()))?;
    db.execute("DELETE FROM agents WHERE id = ?1", params![agent_id])
        .map_err(|e| AppError::Database(e.to_string()))?;
    Ok(())
}
