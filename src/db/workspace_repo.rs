use rusqlite::params;

use crate::error::{AppError, AppResult};
use crate::models::workspace::{CreateWorkspaceRequest, Workspace};
use crate::state::AppState;

fn row_to_workspace(row: &rusqlite::Row) -> rusqlite::Result<Workspace> {
    Ok(Workspace {
        id: row.get(0)?,
        name: row.get(1)?,
        working_directory: row.get(2)?,
        created_at: row.get(3)?,
        updated_at: row.get(4)?,
    })
}

const WORKSPACE_COLS: &str = "id, name, working_directory, created_at, updated_at";

pub fn list_workspaces(state: &AppState) -> AppResult<Vec<Workspace>> {
    let db = state.db.lock().map_err(|e| AppError::Database(e.to_string()))?;
    let mut stmt = db
        .prepare(&format!(
            "SELECT {WORKSPACE_COLS} FROM workspaces ORDER BY created_at ASC"
        ))
        .map_err(|e| AppError::Database(e.to_string()))?;

    let workspaces = stmt
        .query_map([], row_to_workspace)
        .map_err(|e| AppError::Database(e.to_string()))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| AppError::Database(e.to_string()))?;

    Ok(workspaces)
}

pub fn get_workspace(state: &AppState, id: &str) -> AppResult<Workspace> {
    let db = state.db.lock().map_err(|e| AppError::Database(e.to_string()))?;
    db.query_row(
        &format!("SELECT {WORKSPACE_COLS} FROM workspaces WHERE id = ?1"),
        params![id],
        row_to_workspace,
    )
    .map_err(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => {
            AppError::NotFound(format!("Workspace {id} not found"))
        }
        _ => AppError::Database(e.to_string()),
    })
}

pub fn create_workspace(state: &AppState, req: CreateWorkspaceRequest) -> AppResult<Workspace> {
    let id = uuid::Uuid::new_v4().to_string();
    {
        let db = state.db.lock().map_err(|e| AppError::Database(e.to_string()))?;
        db.execute(
            "INSERT INTO workspaces (id, name, working_directory) VALUES (?1, ?2, ?3)",
            params![id, req.name, req.working_directory],
        )
        .map_err(|e| AppError::Database(e.to_string()))?;
    }
    get_workspace(state, &id)
}

pub fn delete_workspace(state: &AppState, id: &str) -> AppResult<()> {
    let db = state.db.lock().map_err(|e| AppError::Database(e.to_string()))?;
    // Agents with this workspace_id are CASCADE-deleted by the FK.
    db.execute("DELETE FROM workspaces WHERE id = ?1", params![id])
        .map_err(|e| AppError::Database(e.to_string()))?;
    Ok(())
}
