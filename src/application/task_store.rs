use crate::application::scheduler::{CancelOutcome, DeferredActionScheduler};
use crate::domain::models::{
    NewTask, Task, TaskCounts, TaskFilter, TaskId, TaskUpdate, filter_and_sort_tasks,
};
use crate::infrastructure::api_client::{AuthenticatedClient, RequestOptions};
use crate::infrastructure::credential_store::SecureStore;
use crate::infrastructure::error::InfraError;
use crate::infrastructure::http_transport::HttpTransport;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{error, info, warn};

const TASKS_ENDPOINT: &str = "/tasks/";

pub type NowProvider = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// How the undo window of a completion toggle closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToggleOutcome {
    /// The window elapsed and the commit ran. Failures are recorded in the store's error.
    Committed,
    /// This toggle was undone, replaced, or cleared before its window elapsed.
    Cancelled,
    /// This call undid a toggle that was still pending.
    Undone,
    /// The earlier toggle's commit was already running; it was left to finish and
    /// nothing new was scheduled.
    AlreadyCommitting,
}

#[derive(Debug)]
enum CompletionState {
    Ready(ToggleOutcome),
    Waiting(oneshot::Receiver<ToggleOutcome>),
}

#[derive(Debug)]
pub struct ToggleCompletion {
    state: CompletionState,
}

impl ToggleCompletion {
    fn ready(outcome: ToggleOutcome) -> Self {
        Self {
            state: CompletionState::Ready(outcome),
        }
    }

    pub async fn wait(self) -> ToggleOutcome {
        match self.state {
            CompletionState::Ready(outcome) => outcome,
            // The effect (and its sender) is dropped when the pending toggle is cancelled.
            CompletionState::Waiting(receiver) => receiver.await.unwrap_or(ToggleOutcome::Cancelled),
        }
    }
}

#[derive(Debug, Default)]
struct TaskStoreState {
    tasks: Vec<Task>,
    filter: TaskFilter,
    loading: bool,
    error: Option<String>,
}

struct SharedState<S, T>
where
    S: SecureStore + ?Sized,
    T: HttpTransport + ?Sized,
{
    client: Arc<AuthenticatedClient<S, T>>,
    state: Mutex<TaskStoreState>,
}

impl<S, T> SharedState<S, T>
where
    S: SecureStore + ?Sized,
    T: HttpTransport + ?Sized,
{
    fn lock(&self) -> Result<MutexGuard<'_, TaskStoreState>, InfraError> {
        self.state
            .lock()
            .map_err(|error| InfraError::InvalidConfig(format!("task store lock poisoned: {error}")))
    }

    fn record_error(&self, message: String) {
        if let Ok(mut state) = self.lock() {
            state.error = Some(message);
        }
    }

    async fn fetch_tasks(&self) -> Result<Vec<Task>, InfraError> {
        {
            let mut state = self.lock()?;
            state.loading = true;
            state.error = None;
        }

        let result = self
            .client
            .request_json::<Vec<Task>>(TASKS_ENDPOINT, RequestOptions::get())
            .await;

        let mut state = self.lock()?;
        state.loading = false;
        match result {
            Ok(tasks) => {
                info!(count = tasks.len(), "tasks fetched");
                state.tasks = tasks.clone();
                Ok(tasks)
            }
            Err(error) => {
                error!(%error, "fetching tasks failed");
                state.error = Some(format!("Failed to fetch tasks: {error}"));
                Err(error)
            }
        }
    }

    async fn commit_toggle(&self, task_id: TaskId, completed: bool, now_provider: &NowProvider) {
        let endpoint = format!("/tasks/{task_id}/toggle_complete/");
        if let Err(error) = self.client.request(&endpoint, RequestOptions::patch(None)).await {
            error!(task_id, %error, "toggle commit failed");
            self.record_error(format!("Unable to update task: {error}"));
            return;
        }

        if let Err(error) = self.fetch_tasks().await {
            warn!(task_id, %error, "refetch after toggle failed; patching local copy only");
        }

        // The refetch may predate the server applying the toggle; keep the requested value.
        let now = now_provider();
        match self.lock() {
            Ok(mut state) => {
                if let Some(task) = state.tasks.iter_mut().find(|task| task.id == task_id) {
                    task.mark_completed(completed, now);
                }
                info!(task_id, completed, "toggle committed");
            }
            Err(error) => error!(task_id, %error, "could not apply toggle locally"),
        }
    }
}

/// In-memory task collection backed by the remote API, with undoable completion toggles.
pub struct TaskStore<S, T>
where
    S: SecureStore + ?Sized + 'static,
    T: HttpTransport + ?Sized + 'static,
{
    shared: Arc<SharedState<S, T>>,
    scheduler: DeferredActionScheduler<TaskId>,
    timezone: Tz,
    now_provider: NowProvider,
}

impl<S, T> TaskStore<S, T>
where
    S: SecureStore + ?Sized + 'static,
    T: HttpTransport + ?Sized + 'static,
{
    pub fn new(client: Arc<AuthenticatedClient<S, T>>) -> Self {
        Self {
            shared: Arc::new(SharedState {
                client,
                state: Mutex::new(TaskStoreState::default()),
            }),
            scheduler: DeferredActionScheduler::new(),
            timezone: Tz::UTC,
            now_provider: Arc::new(Utc::now),
        }
    }

    pub fn with_undo_delay(mut self, undo_delay: Duration) -> Self {
        self.scheduler = DeferredActionScheduler::with_default_delay(undo_delay);
        self
    }

    pub fn with_timezone(mut self, timezone: Tz) -> Self {
        self.timezone = timezone;
        self
    }

    pub fn with_now_provider(mut self, now_provider: NowProvider) -> Self {
        self.now_provider = now_provider;
        self
    }

    pub fn undo_delay(&self) -> Duration {
        self.scheduler.default_delay()
    }

    pub async fn init(&self) -> Result<(), InfraError> {
        self.fetch_tasks().await.map(|_| ())
    }

    pub fn dispose(&self) {
        self.scheduler.clear_all();
    }

    pub async fn fetch_tasks(&self) -> Result<Vec<Task>, InfraError> {
        self.shared.fetch_tasks().await
    }

    /// Schedules a completion toggle behind the undo window. Calling again for a task
    /// whose toggle is still pending undoes it instead, with no request sent. Once the
    /// commit is under way the call changes nothing and reports `AlreadyCommitting`.
    pub fn toggle_complete(&self, task_id: TaskId, completed: bool) -> ToggleCompletion {
        match self.scheduler.try_cancel(&task_id) {
            CancelOutcome::Cancelled => {
                info!(task_id, "pending toggle undone");
                return ToggleCompletion::ready(ToggleOutcome::Undone);
            }
            CancelOutcome::InFlight => {
                info!(task_id, "toggle commit already in flight; nothing to undo");
                return ToggleCompletion::ready(ToggleOutcome::AlreadyCommitting);
            }
            CancelOutcome::NotPending => {}
        }

        let (sender, receiver) = oneshot::channel();
        let shared = Arc::clone(&self.shared);
        let now_provider = Arc::clone(&self.now_provider);
        self.scheduler.start(task_id, async move {
            shared.commit_toggle(task_id, completed, &now_provider).await;
            let _ = sender.send(ToggleOutcome::Committed);
        });
        info!(task_id, completed, delay = ?self.undo_delay(), "toggle scheduled");

        ToggleCompletion {
            state: CompletionState::Waiting(receiver),
        }
    }

    /// Takes back a toggle whose window is still open. Never schedules anything;
    /// false means there was nothing left to undo.
    pub fn undo_toggle(&self, task_id: TaskId) -> bool {
        let undone = self.scheduler.cancel(&task_id);
        if undone {
            info!(task_id, "pending toggle undone");
        }
        undone
    }

    pub async fn create_new_task(&self, new_task: NewTask) -> Result<Task, InfraError> {
        let result = self.create_task_request(&new_task).await;
        match result {
            Ok(task) => {
                info!(task_id = task.id, "task created");
                self.shared.lock()?.tasks.push(task.clone());
                Ok(task)
            }
            Err(error) => {
                error!(%error, "create task failed");
                self.shared.record_error(format!("Unable to create task: {error}"));
                Err(error)
            }
        }
    }

    async fn create_task_request(&self, new_task: &NewTask) -> Result<Task, InfraError> {
        new_task.validate().map_err(InfraError::Validation)?;
        let mut body = serde_json::to_value(new_task)?;
        if let Some(object) = body.as_object_mut() {
            object.insert("completed".to_string(), serde_json::Value::Bool(false));
        }
        self.shared
            .client
            .request_json(TASKS_ENDPOINT, RequestOptions::post(body))
            .await
    }

    pub async fn update_task(&self, task_id: TaskId, update: TaskUpdate) -> Result<Task, InfraError> {
        let result = match update.validate() {
            Ok(()) => {
                let body = serde_json::to_value(&update)?;
                self.shared
                    .client
                    .request_json::<Task>(&task_endpoint(task_id), RequestOptions::patch(Some(body)))
                    .await
            }
            Err(message) => Err(InfraError::Validation(message)),
        };

        match result {
            Ok(updated) => {
                info!(task_id, "task updated");
                let mut state = self.shared.lock()?;
                if let Some(task) = state.tasks.iter_mut().find(|task| task.id == task_id) {
                    *task = updated.clone();
                }
                Ok(updated)
            }
            Err(error) => {
                error!(task_id, %error, "update task failed");
                self.shared.record_error(format!("Unable to update task: {error}"));
                Err(error)
            }
        }
    }

    pub async fn delete_task(&self, task_id: TaskId) -> Result<(), InfraError> {
        let result = self
            .shared
            .client
            .request(&task_endpoint(task_id), RequestOptions::delete())
            .await;

        match result {
            Ok(_) => {
                info!(task_id, "task deleted");
                self.scheduler.cancel(&task_id);
                self.shared.lock()?.tasks.retain(|task| task.id != task_id);
                Ok(())
            }
            Err(error) => {
                error!(task_id, %error, "delete task failed");
                self.shared.record_error(format!("Unable to delete task: {error}"));
                Err(error)
            }
        }
    }

    pub fn clear_tasks(&self) -> Result<(), InfraError> {
        self.scheduler.clear_all();
        let mut state = self.shared.lock()?;
        state.tasks.clear();
        state.error = None;
        Ok(())
    }

    pub fn set_filter(&self, filter: TaskFilter) -> Result<(), InfraError> {
        self.shared.lock()?.filter = filter;
        Ok(())
    }

    pub fn filter(&self) -> Result<TaskFilter, InfraError> {
        Ok(self.shared.lock()?.filter)
    }

    pub fn tasks(&self) -> Result<Vec<Task>, InfraError> {
        Ok(self.shared.lock()?.tasks.clone())
    }

    pub fn task(&self, task_id: TaskId) -> Result<Option<Task>, InfraError> {
        Ok(self
            .shared
            .lock()?
            .tasks
            .iter()
            .find(|task| task.id == task_id)
            .cloned())
    }

    /// The current filter's view, recomputed from the collection on every read.
    pub fn filtered_tasks(&self) -> Result<Vec<Task>, InfraError> {
        let state = self.shared.lock()?;
        Ok(filter_and_sort_tasks(
            &state.tasks,
            state.filter,
            (self.now_provider)(),
            self.timezone,
        ))
    }

    pub fn task_counts(&self) -> Result<TaskCounts, InfraError> {
        let state = self.shared.lock()?;
        Ok(TaskCounts::from_tasks(
            &state.tasks,
            (self.now_provider)(),
            self.timezone,
        ))
    }

    pub fn error(&self) -> Result<Option<String>, InfraError> {
        Ok(self.shared.lock()?.error.clone())
    }

    pub fn is_loading(&self) -> Result<bool, InfraError> {
        Ok(self.shared.lock()?.loading)
    }

    /// True from the toggle until its commit has finished.
    pub fn is_pending(&self, task_id: TaskId) -> bool {
        self.scheduler.is_pending(&task_id)
    }

    pub fn is_committing(&self, task_id: TaskId) -> bool {
        self.scheduler.is_running(&task_id)
    }

    pub fn remaining_time(&self, task_id: TaskId) -> Option<Duration> {
        self.scheduler.remaining_time(&task_id)
    }

    pub fn pending_task_ids(&self) -> Vec<TaskId> {
        let mut ids = self.scheduler.pending_keys();
        ids.sort_unstable();
        ids
    }
}

fn task_endpoint(task_id: TaskId) -> String {
    format!("{TASKS_ENDPOINT}{task_id}/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::api_client::tests::{BASE_URL, CountingStore, FakeTransport};

    fn fixed_now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-02-16T12:00:00Z")
            .expect("valid datetime")
            .with_timezone(&Utc)
    }

    fn task_json(id: TaskId, description: &str, due_date: &str, completed: bool) -> serde_json::Value {
        serde_json::json!({
            "id": id,
            "description": description,
            "expanded_description": null,
            "due_date": due_date,
            "completed": completed,
            "completed_at": null,
            "recurrence": null
        })
    }

    fn store_with(transport: &Arc<FakeTransport>) -> TaskStore<CountingStore, FakeTransport> {
        let tokens = Arc::new(CountingStore::with_tokens(Some("access"), Some("refresh")));
        let client = AuthenticatedClient::new(BASE_URL, tokens, Arc::clone(transport)).expect("client");
        TaskStore::new(Arc::new(client)).with_now_provider(Arc::new(fixed_now))
    }

    async fn settle() {
        for _ in 0..16 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn fetch_populates_collection_and_filtered_view() {
        let transport = Arc::new(FakeTransport::default());
        transport.push_json(
            200,
            serde_json::json!([
                task_json(1, "later", "2026-03-01", false),
                task_json(2, "done", "2026-01-01", true),
                task_json(3, "late", "2026-02-01", false),
            ]),
        );
        let store = store_with(&transport);

        store.init().await.expect("init");

        let ids: Vec<TaskId> = store
            .filtered_tasks()
            .expect("filtered")
            .into_iter()
            .map(|task| task.id)
            .collect();
        assert_eq!(ids, vec![3, 1, 2]);

        store.set_filter(TaskFilter::Overdue).expect("set filter");
        let overdue = store.filtered_tasks().expect("filtered");
        assert_eq!(overdue.len(), 1);
        assert_eq!(overdue[0].id, 3);

        let counts = store.task_counts().expect("counts");
        assert_eq!(counts.all, 3);
        assert_eq!(counts.completed, 1);
        assert_eq!(counts.upcoming, 1);
        assert!(!store.is_loading().expect("loading"));
        assert_eq!(store.error().expect("error"), None);
    }

    #[tokio::test]
    async fn failed_fetch_records_error_and_keeps_collection() {
        let transport = Arc::new(FakeTransport::default());
        transport.push_json(200, serde_json::json!([task_json(1, "a", "2026-03-01", false)]));
        transport.push_response(500, "boom");
        let store = store_with(&transport);

        store.fetch_tasks().await.expect("first fetch");
        assert!(store.fetch_tasks().await.is_err());

        assert_eq!(store.tasks().expect("tasks").len(), 1);
        let error = store.error().expect("error").expect("error recorded");
        assert!(error.starts_with("Failed to fetch tasks"));
    }

    #[tokio::test(start_paused = true)]
    async fn toggle_commits_after_undo_window() {
        let transport = Arc::new(FakeTransport::default());
        transport.push_json(200, serde_json::json!([task_json(42, "water plants", "2026-02-16", false)]));
        let store = store_with(&transport);
        store.init().await.expect("init");

        transport.push_json(200, task_json(42, "water plants", "2026-02-16", true));
        // Server view lags behind the toggle; the local patch still reflects the request.
        transport.push_json(200, serde_json::json!([task_json(42, "water plants", "2026-02-16", false)]));

        let completion = store.toggle_complete(42, true);
        assert!(store.is_pending(42));
        assert_eq!(store.pending_task_ids(), vec![42]);
        assert_eq!(store.remaining_time(42), Some(Duration::from_millis(2_000)));
        assert_eq!(transport.requests().len(), 1);

        tokio::time::advance(Duration::from_millis(2_000)).await;
        assert_eq!(completion.wait().await, ToggleOutcome::Committed);

        assert_eq!(
            transport.request_paths(),
            vec![
                "GET /api/tasks/",
                "PATCH /api/tasks/42/toggle_complete/",
                "GET /api/tasks/",
            ]
        );
        let task = store.task(42).expect("task").expect("task present");
        assert!(task.completed);
        assert_eq!(task.completed_at, Some(fixed_now()));
        settle().await;
        assert!(!store.is_pending(42));
    }

    #[tokio::test(start_paused = true)]
    async fn second_toggle_within_window_is_undo() {
        let transport = Arc::new(FakeTransport::default());
        transport.push_json(200, serde_json::json!([task_json(42, "water plants", "2026-02-16", false)]));
        let store = store_with(&transport);
        store.init().await.expect("init");

        let first = store.toggle_complete(42, true);
        tokio::time::advance(Duration::from_millis(500)).await;
        let second = store.toggle_complete(42, true);

        assert_eq!(second.wait().await, ToggleOutcome::Undone);
        assert_eq!(first.wait().await, ToggleOutcome::Cancelled);
        assert!(!store.is_pending(42));

        tokio::time::advance(Duration::from_secs(5)).await;
        settle().await;
        assert_eq!(transport.requests().len(), 1);
        assert!(!store.task(42).expect("task").expect("present").completed);
    }

    #[tokio::test(start_paused = true)]
    async fn toggle_during_in_flight_commit_sends_nothing() {
        let transport = Arc::new(
            FakeTransport::default().with_latency("toggle_complete", Duration::from_millis(1_000)),
        );
        transport.push_json(200, serde_json::json!([task_json(42, "water plants", "2026-02-16", false)]));
        let store = store_with(&transport);
        store.init().await.expect("init");

        transport.push_json(200, task_json(42, "water plants", "2026-02-16", true));
        transport.push_json(200, serde_json::json!([task_json(42, "water plants", "2026-02-16", true)]));

        let first = store.toggle_complete(42, true);
        tokio::time::advance(Duration::from_millis(2_100)).await;
        settle().await;

        assert_eq!(transport.requests().len(), 2);
        assert!(store.is_pending(42));
        assert!(store.is_committing(42));
        assert_eq!(store.remaining_time(42), Some(Duration::ZERO));

        let second = store.toggle_complete(42, true);
        assert_eq!(second.wait().await, ToggleOutcome::AlreadyCommitting);
        assert!(!store.undo_toggle(42));

        tokio::time::advance(Duration::from_millis(1_000)).await;
        assert_eq!(first.wait().await, ToggleOutcome::Committed);
        settle().await;

        assert_eq!(
            transport.request_paths(),
            vec![
                "GET /api/tasks/",
                "PATCH /api/tasks/42/toggle_complete/",
                "GET /api/tasks/",
            ]
        );
        assert!(store.task(42).expect("task").expect("present").completed);
        assert!(!store.is_pending(42));
    }

    #[tokio::test(start_paused = true)]
    async fn undo_toggle_only_cancels() {
        let transport = Arc::new(FakeTransport::default());
        let store = store_with(&transport);

        assert!(!store.undo_toggle(9));
        assert!(!store.is_pending(9));

        let completion = store.toggle_complete(9, true);
        assert!(store.undo_toggle(9));
        assert_eq!(completion.wait().await, ToggleOutcome::Cancelled);

        tokio::time::advance(Duration::from_secs(5)).await;
        settle().await;
        assert!(transport.requests().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_commit_records_error_and_clears_pending() {
        let transport = Arc::new(FakeTransport::default());
        transport.push_json(200, serde_json::json!([task_json(5, "call bank", "2026-02-16", false)]));
        transport.push_response(404, "{\"detail\":\"Not found.\"}");
        let store = store_with(&transport).with_undo_delay(Duration::from_millis(100));
        store.init().await.expect("init");

        let completion = store.toggle_complete(5, true);
        tokio::time::advance(Duration::from_millis(100)).await;

        assert_eq!(completion.wait().await, ToggleOutcome::Committed);
        settle().await;
        assert!(!store.is_pending(5));
        assert!(!store.task(5).expect("task").expect("present").completed);
        let error = store.error().expect("error").expect("error recorded");
        assert!(error.contains("404"));
    }

    #[tokio::test(start_paused = true)]
    async fn dispose_cancels_pending_toggles() {
        let transport = Arc::new(FakeTransport::default());
        let store = store_with(&transport);

        let completion = store.toggle_complete(8, true);
        store.dispose();

        assert_eq!(completion.wait().await, ToggleOutcome::Cancelled);
        tokio::time::advance(Duration::from_secs(5)).await;
        settle().await;
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn create_then_refetch_shows_server_assigned_task() {
        let transport = Arc::new(FakeTransport::default());
        transport.push_json(201, task_json(101, "x", "2025-01-01", false));
        transport.push_json(200, serde_json::json!([task_json(101, "x", "2025-01-01", false)]));
        let store = store_with(&transport);

        let created = store
            .create_new_task(NewTask::new("x", "2025-01-01"))
            .await
            .expect("create");
        assert_eq!(created.id, 101);
        assert_eq!(store.tasks().expect("tasks").len(), 1);

        let body: serde_json::Value = serde_json::from_str(
            transport.requests()[0].body.as_deref().expect("body"),
        )
        .expect("json body");
        assert_eq!(
            body,
            serde_json::json!({
                "description": "x",
                "expanded_description": null,
                "due_date": "2025-01-01",
                "recurrence": null,
                "completed": false
            })
        );

        let fetched = store.fetch_tasks().await.expect("refetch");
        let matching: Vec<&Task> = fetched.iter().filter(|task| task.description == "x").collect();
        assert_eq!(matching.len(), 1);
        assert_eq!(matching[0].id, 101);
    }

    #[tokio::test]
    async fn failed_create_leaves_collection_unchanged() {
        let transport = Arc::new(FakeTransport::default());
        transport.push_response(400, "{\"description\":[\"required\"]}");
        let store = store_with(&transport);

        assert!(store.create_new_task(NewTask::new("x", "2025-01-01")).await.is_err());
        assert!(store.create_new_task(NewTask::new(" ", "2025-01-01")).await.is_err());

        assert!(store.tasks().expect("tasks").is_empty());
        assert_eq!(transport.requests().len(), 1);
        assert!(store.error().expect("error").is_some());
    }

    #[tokio::test]
    async fn update_and_delete_apply_to_collection() {
        let transport = Arc::new(FakeTransport::default());
        transport.push_json(
            200,
            serde_json::json!([
                task_json(1, "old", "2026-03-01", false),
                task_json(2, "keep", "2026-03-02", false),
            ]),
        );
        transport.push_json(200, task_json(1, "new", "2026-03-05", false));
        transport.push_response(204, "");
        let store = store_with(&transport);
        store.init().await.expect("init");

        let updated = store
            .update_task(
                1,
                TaskUpdate {
                    description: Some("new".to_string()),
                    due_date: Some("2026-03-05".to_string()),
                    ..TaskUpdate::default()
                },
            )
            .await
            .expect("update");
        assert_eq!(updated.description, "new");
        assert_eq!(store.task(1).expect("task").expect("present").description, "new");

        store.delete_task(2).await.expect("delete");
        let ids: Vec<TaskId> = store.tasks().expect("tasks").iter().map(|task| task.id).collect();
        assert_eq!(ids, vec![1]);
        assert_eq!(
            transport.request_paths(),
            vec!["GET /api/tasks/", "PATCH /api/tasks/1/", "DELETE /api/tasks/2/"]
        );
    }

    #[tokio::test]
    async fn failed_delete_keeps_task_and_records_error() {
        let transport = Arc::new(FakeTransport::default());
        transport.push_json(200, serde_json::json!([task_json(1, "a", "2026-03-01", false)]));
        transport.push_response(403, "forbidden");
        let store = store_with(&transport);
        store.init().await.expect("init");

        assert!(store.delete_task(1).await.is_err());
        assert_eq!(store.tasks().expect("tasks").len(), 1);
        assert!(store.error().expect("error").expect("recorded").contains("403"));
    }
}
