use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

pub type TaskId = i64;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Task {
    pub id: TaskId,
    pub description: String,
    #[serde(default)]
    pub expanded_description: Option<String>,
    pub due_date: String,
    #[serde(default)]
    pub completed: bool,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub recurrence: Option<u32>,
}

impl Task {
    pub fn validate(&self) -> Result<(), String> {
        validate_non_empty(&self.description, "task.description")?;
        validate_due_date(&self.due_date, "task.due_date")?;
        if !self.completed && self.completed_at.is_some() {
            return Err("task.completed_at must be empty while task is incomplete".to_string());
        }
        Ok(())
    }

    pub fn due_at(&self, timezone: Tz) -> Option<DateTime<Utc>> {
        parse_due_date(&self.due_date, timezone)
    }

    /// Local patch applied after a completion toggle, ahead of the server's own view.
    pub fn mark_completed(&mut self, completed: bool, now: DateTime<Utc>) {
        self.completed = completed;
        self.completed_at = completed.then_some(now);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewTask {
    pub description: String,
    pub expanded_description: Option<String>,
    pub due_date: String,
    pub recurrence: Option<u32>,
}

impl NewTask {
    pub fn new(description: impl Into<String>, due_date: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            expanded_description: None,
            due_date: due_date.into(),
            recurrence: None,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        validate_non_empty(&self.description, "task.description")?;
        validate_due_date(&self.due_date, "task.due_date")
    }
}

/// Partial update sent as a PATCH body; `None` fields are left untouched by the server.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expanded_description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub due_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recurrence: Option<u32>,
}

impl TaskUpdate {
    pub fn is_empty(&self) -> bool {
        self.description.is_none()
            && self.expanded_description.is_none()
            && self.due_date.is_none()
            && self.recurrence.is_none()
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.is_empty() {
            return Err("task update must change at least one field".to_string());
        }
        if let Some(description) = self.description.as_deref() {
            validate_non_empty(description, "task.description")?;
        }
        if let Some(due_date) = self.due_date.as_deref() {
            validate_due_date(due_date, "task.due_date")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskFilter {
    #[default]
    All,
    Today,
    Upcoming,
    Completed,
    Incomplete,
    Overdue,
}

impl TaskFilter {
    pub const ALL: [TaskFilter; 6] = [
        TaskFilter::All,
        TaskFilter::Today,
        TaskFilter::Upcoming,
        TaskFilter::Completed,
        TaskFilter::Incomplete,
        TaskFilter::Overdue,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::All => "all",
            Self::Today => "today",
            Self::Upcoming => "upcoming",
            Self::Completed => "completed",
            Self::Incomplete => "incomplete",
            Self::Overdue => "overdue",
        }
    }

    pub fn matches(self, task: &Task, now: DateTime<Utc>, timezone: Tz) -> bool {
        match self {
            Self::All => true,
            Self::Completed => task.completed,
            Self::Incomplete => !task.completed,
            Self::Today => task
                .due_at(timezone)
                .is_some_and(|due| {
                    due.with_timezone(&timezone).date_naive()
                        == now.with_timezone(&timezone).date_naive()
                }),
            Self::Upcoming => {
                !task.completed && task.due_at(timezone).is_some_and(|due| due > now)
            }
            Self::Overdue => {
                !task.completed && task.due_at(timezone).is_some_and(|due| due < now)
            }
        }
    }
}

impl fmt::Display for TaskFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskFilter {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|filter| filter.as_str() == normalized)
            .ok_or_else(|| {
                format!(
                    "unknown task filter `{value}` (expected one of: all, today, upcoming, completed, incomplete, overdue)"
                )
            })
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskCounts {
    pub all: usize,
    pub today: usize,
    pub upcoming: usize,
    pub completed: usize,
    pub incomplete: usize,
    pub overdue: usize,
}

impl TaskCounts {
    pub fn from_tasks(tasks: &[Task], now: DateTime<Utc>, timezone: Tz) -> Self {
        let count = |filter: TaskFilter| {
            tasks
                .iter()
                .filter(|task| filter.matches(task, now, timezone))
                .count()
        };
        Self {
            all: tasks.len(),
            today: count(TaskFilter::Today),
            upcoming: count(TaskFilter::Upcoming),
            completed: count(TaskFilter::Completed),
            incomplete: count(TaskFilter::Incomplete),
            overdue: count(TaskFilter::Overdue),
        }
    }

    pub fn get(&self, filter: TaskFilter) -> usize {
        match filter {
            TaskFilter::All => self.all,
            TaskFilter::Today => self.today,
            TaskFilter::Upcoming => self.upcoming,
            TaskFilter::Completed => self.completed,
            TaskFilter::Incomplete => self.incomplete,
            TaskFilter::Overdue => self.overdue,
        }
    }
}

/// Incomplete tasks first, then ascending due date. Unparseable due dates sort last.
pub fn filter_and_sort_tasks(
    tasks: &[Task],
    filter: TaskFilter,
    now: DateTime<Utc>,
    timezone: Tz,
) -> Vec<Task> {
    let mut filtered: Vec<Task> = tasks
        .iter()
        .filter(|task| filter.matches(task, now, timezone))
        .cloned()
        .collect();
    filtered.sort_by(|left, right| compare_for_display(left, right, timezone));
    filtered
}

fn compare_for_display(left: &Task, right: &Task, timezone: Tz) -> Ordering {
    left.completed.cmp(&right.completed).then_with(|| {
        match (left.due_at(timezone), right.due_at(timezone)) {
            (Some(left_due), Some(right_due)) => left_due.cmp(&right_due),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        }
    })
}

/// Accepts RFC 3339, a naive date-time, or a plain date. Naive values are read in `timezone`.
pub fn parse_due_date(value: &str, timezone: Tz) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.with_timezone(&Utc));
    }
    let naive = NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M"))
        .ok()
        .or_else(|| {
            NaiveDate::parse_from_str(value, "%Y-%m-%d")
                .ok()
                .and_then(|date| date.and_hms_opt(0, 0, 0))
        })?;
    timezone
        .from_local_datetime(&naive)
        .earliest()
        .map(|local| local.with_timezone(&Utc))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserProfile {
    pub username: String,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTokens {
    pub access_token: String,
    pub refresh_token: Option<String>,
}

fn validate_non_empty(value: &str, field_name: &str) -> Result<(), String> {
    if value.trim().is_empty() {
        return Err(format!("{field_name} must not be empty"));
    }
    Ok(())
}

fn validate_due_date(value: &str, field_name: &str) -> Result<(), String> {
    parse_due_date(value, Tz::UTC)
        .map(|_| ())
        .ok_or_else(|| format!("{field_name} must be YYYY-MM-DD or an ISO-8601 timestamp"))
}
