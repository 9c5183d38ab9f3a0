pub mod application {
    pub mod bootstrap;
    pub mod commands;
    pub mod scheduler;
    pub mod session;
    pub mod task_store;
}

pub mod domain {
    pub mod models;
}

pub mod infrastructure {
    pub mod api_client;
    pub mod config;
    pub mod credential_store;
    pub mod error;
    pub mod http_transport;
}

pub use application::commands::AppState;
pub use application::scheduler::DeferredActionScheduler;
pub use application::session::SessionManager;
pub use application::task_store::{TaskStore, ToggleCompletion, ToggleOutcome};
pub use domain::models::{NewTask, Task, TaskCounts, TaskFilter, TaskId, TaskUpdate};
pub use infrastructure::api_client::{AuthenticatedClient, RequestOptions};
pub use infrastructure::error::InfraError;
