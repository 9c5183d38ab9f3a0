use crate::application::bootstrap::bootstrap_workspace;
use crate::application::session::SessionManager;
use crate::application::task_store::{TaskStore, ToggleOutcome};
use crate::domain::models::{
    NewTask, Task, TaskCounts, TaskFilter, TaskId, TaskUpdate, UserProfile,
};
use crate::infrastructure::api_client::AuthenticatedClient;
use crate::infrastructure::config::ClientConfig;
use crate::infrastructure::credential_store::{KeyringSecureStore, SecureStore};
use crate::infrastructure::error::InfraError;
use crate::infrastructure::http_transport::{HttpTransport, ReqwestTransport};
use serde::Serialize;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info};

pub struct AppState<S = KeyringSecureStore, T = ReqwestTransport>
where
    S: SecureStore + 'static,
    T: HttpTransport + 'static,
{
    config: ClientConfig,
    session: SessionManager<S, T>,
    tasks: TaskStore<S, T>,
}

impl AppState {
    pub fn new(workspace_root: &Path) -> Result<Self, InfraError> {
        let bootstrap = bootstrap_workspace(workspace_root)?;
        let config = bootstrap.config;
        let store = Arc::new(KeyringSecureStore::new(config.credential_service.clone()));
        let transport = Arc::new(ReqwestTransport::with_timeout(config.request_timeout)?);
        Self::with_parts(config, store, transport)
    }
}

impl<S, T> AppState<S, T>
where
    S: SecureStore + 'static,
    T: HttpTransport + 'static,
{
    pub fn with_parts(config: ClientConfig, store: Arc<S>, transport: Arc<T>) -> Result<Self, InfraError> {
        let client = Arc::new(AuthenticatedClient::new(&config.api_base_url, store, transport)?);
        let session = SessionManager::new(Arc::clone(&client));
        let tasks = TaskStore::new(client)
            .with_undo_delay(config.undo_delay)
            .with_timezone(config.timezone);
        Ok(Self {
            config,
            session,
            tasks,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn session(&self) -> &SessionManager<S, T> {
        &self.session
    }

    pub fn tasks(&self) -> &TaskStore<S, T> {
        &self.tasks
    }

    pub fn command_error(&self, command: &str, error: &InfraError) -> String {
        error!(command, %error, "command failed");
        if error.requires_login() {
            format!("{error} (run `taskpad login`)")
        } else {
            error.to_string()
        }
    }

    pub fn dispose(&self) {
        self.tasks.dispose();
    }
}

#[derive(Debug, Serialize)]
pub struct TaskListResponse {
    pub filter: TaskFilter,
    pub tasks: Vec<Task>,
    pub counts: TaskCounts,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToggleResult {
    Committed,
    Undone,
    Cancelled,
    AlreadyCommitting,
}

impl From<ToggleOutcome> for ToggleResult {
    fn from(outcome: ToggleOutcome) -> Self {
        match outcome {
            ToggleOutcome::Committed => Self::Committed,
            ToggleOutcome::Undone => Self::Undone,
            ToggleOutcome::Cancelled => Self::Cancelled,
            ToggleOutcome::AlreadyCommitting => Self::AlreadyCommitting,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ToggleTaskResponse {
    pub task_id: TaskId,
    pub requested_completed: bool,
    pub result: ToggleResult,
    pub task: Option<Task>,
    pub error: Option<String>,
}

impl ToggleTaskResponse {
    /// Fails with the store's recorded message when the commit itself went wrong.
    pub fn into_result(self) -> Result<Self, InfraError> {
        match self.error {
            Some(message) => Err(InfraError::Recorded(message)),
            None => Ok(self),
        }
    }
}

pub async fn login_impl<S, T>(
    state: &AppState<S, T>,
    username: String,
    password: String,
) -> Result<UserProfile, InfraError>
where
    S: SecureStore + 'static,
    T: HttpTransport + 'static,
{
    state.session.login(&username, &password).await?;
    let profile = state.session.current_user().await?;
    state.tasks.init().await?;
    Ok(profile)
}

pub async fn logout_impl<S, T>(state: &AppState<S, T>) -> Result<(), InfraError>
where
    S: SecureStore + 'static,
    T: HttpTransport + 'static,
{
    state.tasks.clear_tasks()?;
    state.session.logout().await
}

pub async fn whoami_impl<S, T>(state: &AppState<S, T>) -> Result<UserProfile, InfraError>
where
    S: SecureStore + 'static,
    T: HttpTransport + 'static,
{
    if !state.session.restore().await? {
        return Err(InfraError::Authentication);
    }
    state.session.current_user().await
}

pub async fn list_tasks_impl<S, T>(
    state: &AppState<S, T>,
    filter: Option<String>,
) -> Result<TaskListResponse, InfraError>
where
    S: SecureStore + 'static,
    T: HttpTransport + 'static,
{
    let filter = match filter {
        Some(raw) => raw.parse::<TaskFilter>().map_err(InfraError::Validation)?,
        None => TaskFilter::All,
    };
    state.tasks.fetch_tasks().await?;
    state.tasks.set_filter(filter)?;
    Ok(TaskListResponse {
        filter,
        tasks: state.tasks.filtered_tasks()?,
        counts: state.tasks.task_counts()?,
    })
}

pub async fn create_task_impl<S, T>(
    state: &AppState<S, T>,
    description: String,
    due_date: String,
    expanded_description: Option<String>,
    recurrence: Option<u32>,
) -> Result<Task, InfraError>
where
    S: SecureStore + 'static,
    T: HttpTransport + 'static,
{
    let new_task = NewTask {
        description: description.trim().to_string(),
        expanded_description: expanded_description
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty()),
        due_date: due_date.trim().to_string(),
        recurrence,
    };
    state.tasks.create_new_task(new_task).await
}

pub async fn update_task_impl<S, T>(
    state: &AppState<S, T>,
    task_id: TaskId,
    update: TaskUpdate,
) -> Result<Task, InfraError>
where
    S: SecureStore + 'static,
    T: HttpTransport + 'static,
{
    state.tasks.update_task(task_id, update).await
}

pub async fn delete_task_impl<S, T>(state: &AppState<S, T>, task_id: TaskId) -> Result<bool, InfraError>
where
    S: SecureStore + 'static,
    T: HttpTransport + 'static,
{
    state.tasks.delete_task(task_id).await?;
    Ok(true)
}

/// Flips a task's completion behind the undo window. If `undo` resolves while the
/// window is still open, the toggle is taken back and nothing is sent. An undo that
/// arrives once the commit has started waits for that commit instead.
pub async fn toggle_task_impl<S, T, U>(
    state: &AppState<S, T>,
    task_id: TaskId,
    undo: U,
) -> Result<ToggleTaskResponse, InfraError>
where
    S: SecureStore + 'static,
    T: HttpTransport + 'static,
    U: Future<Output = ()>,
{
    let current = match state.tasks.task(task_id)? {
        Some(task) => task,
        None => state
            .tasks
            .fetch_tasks()
            .await?
            .into_iter()
            .find(|task| task.id == task_id)
            .ok_or_else(|| InfraError::Validation(format!("task {task_id} not found")))?,
    };
    let requested_completed = !current.completed;

    let completion = state.tasks.toggle_complete(task_id, requested_completed).wait();
    tokio::pin!(completion);
    let finished = tokio::select! {
        outcome = &mut completion => Some(outcome),
        () = undo => None,
    };

    let outcome = match finished {
        Some(outcome) => outcome,
        None if state.tasks.undo_toggle(task_id) => ToggleOutcome::Undone,
        None => {
            info!(task_id, "undo requested after the window closed; waiting for commit");
            completion.await
        }
    };

    Ok(ToggleTaskResponse {
        task_id,
        requested_completed,
        result: outcome.into(),
        task: state.tasks.task(task_id)?,
        error: state.tasks.error()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::api_client::tests::{BASE_URL, CountingStore, FakeTransport};
    use std::time::Duration;

    fn app_state(
        transport: &Arc<FakeTransport>,
        store: CountingStore,
    ) -> AppState<CountingStore, FakeTransport> {
        let config = ClientConfig {
            api_base_url: BASE_URL.to_string(),
            undo_delay: Duration::from_millis(200),
            ..ClientConfig::default()
        };
        AppState::with_parts(config, Arc::new(store), Arc::clone(transport)).expect("app state")
    }

    fn task_json(id: TaskId, completed: bool) -> serde_json::Value {
        serde_json::json!({
            "id": id,
            "description": format!("task {id}"),
            "due_date": "2026-02-16",
            "completed": completed,
            "completed_at": null
        })
    }

    #[tokio::test]
    async fn login_stores_tokens_and_loads_tasks() {
        let transport = Arc::new(FakeTransport::default());
        transport.push_json(200, serde_json::json!({ "access": "a", "refresh": "r" }));
        transport.push_json(200, serde_json::json!({ "username": "kim", "email": null }));
        transport.push_json(200, serde_json::json!([task_json(1, false)]));
        let state = app_state(&transport, CountingStore::default());

        let profile = login_impl(&state, "kim".to_string(), "pw".to_string())
            .await
            .expect("login");

        assert_eq!(profile.username, "kim");
        assert_eq!(state.tasks().tasks().expect("tasks").len(), 1);
        assert!(state.session().is_authenticated().await.expect("authenticated"));
    }

    #[tokio::test]
    async fn whoami_without_session_requires_login() {
        let transport = Arc::new(FakeTransport::default());
        let state = app_state(&transport, CountingStore::default());

        let error = whoami_impl(&state).await.expect_err("should fail");
        assert!(matches!(error, InfraError::Authentication));
        assert!(state.command_error("whoami", &error).contains("taskpad login"));
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn list_rejects_unknown_filter_before_fetching() {
        let transport = Arc::new(FakeTransport::default());
        let state = app_state(&transport, CountingStore::with_tokens(Some("a"), None));

        let result = list_tasks_impl(&state, Some("someday".to_string())).await;
        assert!(matches!(result, Err(InfraError::Validation(_))));
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn list_applies_filter() {
        let transport = Arc::new(FakeTransport::default());
        transport.push_json(200, serde_json::json!([task_json(1, false), task_json(2, true)]));
        let state = app_state(&transport, CountingStore::with_tokens(Some("a"), None));

        let response = list_tasks_impl(&state, Some("completed".to_string()))
            .await
            .expect("list");
        assert_eq!(response.filter, TaskFilter::Completed);
        assert_eq!(response.tasks.len(), 1);
        assert_eq!(response.tasks[0].id, 2);
        assert_eq!(response.counts.all, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn toggle_undo_signal_prevents_commit() {
        let transport = Arc::new(FakeTransport::default());
        transport.push_json(200, serde_json::json!([task_json(3, false)]));
        let state = app_state(&transport, CountingStore::with_tokens(Some("a"), None));

        let response = toggle_task_impl(&state, 3, tokio::time::sleep(Duration::from_millis(50)))
            .await
            .expect("toggle");

        assert_eq!(response.result, ToggleResult::Undone);
        assert!(response.requested_completed);
        assert!(!state.tasks().is_pending(3));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(transport.request_paths(), vec!["GET /api/tasks/"]);
    }

    #[tokio::test(start_paused = true)]
    async fn toggle_without_undo_commits() {
        let transport = Arc::new(FakeTransport::default());
        transport.push_json(200, serde_json::json!([task_json(3, true)]));
        transport.push_json(200, task_json(3, false));
        transport.push_json(200, serde_json::json!([task_json(3, false)]));
        let state = app_state(&transport, CountingStore::with_tokens(Some("a"), None));

        let response = toggle_task_impl(&state, 3, std::future::pending::<()>())
            .await
            .expect("toggle");

        assert_eq!(response.result, ToggleResult::Committed);
        assert!(!response.requested_completed);
        let task = response.task.expect("task");
        assert!(!task.completed);
        assert_eq!(task.completed_at, None);
        assert_eq!(response.error, None);
    }

    #[tokio::test(start_paused = true)]
    async fn undo_after_window_waits_for_commit_and_sends_nothing_more() {
        let transport = Arc::new(
            FakeTransport::default().with_latency("toggle_complete", Duration::from_millis(1_000)),
        );
        transport.push_json(200, serde_json::json!([task_json(3, false)]));
        transport.push_json(200, task_json(3, true));
        transport.push_json(200, serde_json::json!([task_json(3, true)]));
        let state = app_state(&transport, CountingStore::with_tokens(Some("a"), None));

        // Window is 200ms; the undo arrives while the PATCH is still in flight.
        let response = toggle_task_impl(&state, 3, tokio::time::sleep(Duration::from_millis(500)))
            .await
            .expect("toggle");

        assert_eq!(response.result, ToggleResult::Committed);
        assert!(response.requested_completed);
        assert!(response.task.expect("task").completed);
        assert_eq!(
            transport.request_paths(),
            vec!["GET /api/tasks/", "PATCH /api/tasks/3/toggle_complete/", "GET /api/tasks/"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failed_commit_surfaces_recorded_message() {
        let transport = Arc::new(FakeTransport::default());
        transport.push_json(200, serde_json::json!([task_json(3, false)]));
        transport.push_response(404, "{\"detail\":\"Not found.\"}");
        let state = app_state(&transport, CountingStore::with_tokens(Some("a"), None));

        let response = toggle_task_impl(&state, 3, std::future::pending::<()>())
            .await
            .expect("toggle");
        assert_eq!(response.result, ToggleResult::Committed);

        match response.into_result() {
            Err(InfraError::Recorded(message)) => {
                assert!(message.starts_with("Unable to update task: Request failed: 404"));
                assert_eq!(
                    state.command_error("toggle", &InfraError::Recorded(message.clone())),
                    message
                );
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
