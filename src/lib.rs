pub mod db;
pub mod error;
pub mod events;
pub mod models;
pub mod orchestrator;
pub mod recurrence;
pub mod scheduler;
pub mod session_cache;
pub mod state;
pub mod transport;

pub use error::{AppError, AppResult};
pub use state::AppState;

/// Initialize env_logger once for embedding binaries and tests. Safe to
/// call repeatedly.
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .is_test(cfg!(test))
        .try_init();
}
