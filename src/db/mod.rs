pub mod agent_repo;
pub mod migrations;
pub mod task_run_repo;
pub mod workspace_repo;

use crate::error::{AppError, AppResult};
use crate::state::AppState;

/// UTC wall-clock in the storage format used for all timestamp columns
/// that the code writes itself (`datetime('now')` covers the rest).
pub fn utc_now_string() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Run a blocking repo call off the async executor.
pub(crate) async fn db_task<T, F>(state: &AppState, f: F) -> AppResult<T>
where
    T: Send + 'static,
    F: FnOnce(AppState) -> AppResult<T> + Send + 'static,
{
    let state = state.clone();
    tokio::task::spawn_blocking(move || f(state))
        .await
        .map_err(|e| AppError::Internal(e.to_string()))?
}
