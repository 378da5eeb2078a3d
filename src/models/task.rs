use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Todo,
    InProgress,
    Review,
    Completed,
    Blocked,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Todo => "todo",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Review => "review",
            TaskStatus::Completed => "completed",
            TaskStatus::Blocked => "blocked",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    Medium,
    High,
    Urgent,
}

impl TaskPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskPriority::Low => "low",
            TaskPriority::Medium => "medium",
            TaskPriority::High => "high",
            TaskPriority::Urgent => "urgent",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subtask {
    pub id: String,
    pub title: String,
    pub completed: bool,
    #[serde(default, with = "crate::models::timestamp::option")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(with = "crate::models::timestamp")]
    pub created_at: DateTime<Utc>,
}

impl Subtask {
    pub fn new(title: &str) -> Self {
        Subtask {
            id: Uuid::new_v4().to_string(),
            title: title.trim().to_string(),
            completed: false,
            completed_at: None,
            created_at: Utc::now(),
        }
    }

    pub fn set_completed(&mut self, completed: bool, now: DateTime<Utc>) {
        self.completed = completed;
        self.completed_at = if completed { Some(now) } else { None };
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Comment {
    pub id: String,
    pub author: String,
    pub content: String,
    #[serde(with = "crate::models::timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(default, with = "crate::models::timestamp::option")]
    pub edited_at: Option<DateTime<Utc>>,
}

impl Comment {
    pub fn new(author: &str, content: &str) -> Self {
        Comment {
            id: Uuid::new_v4().to_string(),
            author: author.to_string(),
            content: content.trim().to_string(),
            created_at: Utc::now(),
            edited_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityAction {
    Created,
    Updated,
    StatusChanged,
    Assigned,
    Commented,
    CommentRemoved,
    SubtaskAdded,
    SubtaskUpdated,
    SubtaskRemoved,
    WatcherAdded,
    WatcherRemoved,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub action: ActivityAction,
    pub user: String,
    pub details: Option<String>,
    #[serde(with = "crate::models::timestamp")]
    pub timestamp: DateTime<Utc>,
}

impl ActivityEntry {
    pub fn new(action: ActivityAction, user: &str, details: Option<String>) -> Self {
        ActivityEntry { action, user: user.to_string(), details, timestamp: Utc::now() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    #[serde(rename = "_id")]
    pub id: String,
    pub title: String,
    pub description: Option<String>,
    pub project: String,
    pub assignee: Option<String>,
    pub created_by: String,
    pub status: TaskStatus,
    pub priority: TaskPriority,
    #[serde(default, with = "crate::models::timestamp::option")]
    pub due_date: Option<DateTime<Utc>>,
    pub estimated_hours: Option<f64>,
    pub actual_hours: Option<f64>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub subtasks: Vec<Subtask>,
    #[serde(default)]
    pub comments: Vec<Comment>,
    #[serde(default)]
    pub attachments: Vec<String>,
    /// Ids of tasks in the same project this one waits on.
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub watchers: Vec<String>,
    #[serde(default)]
    pub activity: Vec<ActivityEntry>,
    #[serde(default, with = "crate::models::timestamp::option")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub position: i64,
    #[serde(with = "crate::models::timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "crate::models::timestamp")]
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub const COLLECTION: &'static str = "tasks";

    pub fn new(project: &str, title: &str, created_by: &str) -> Self {
        let now = Utc::now();
        Task {
            id: Uuid::new_v4().to_string(),
            title: title.trim().to_string(),
            description: None,
            project: project.to_string(),
            assignee: None,
            created_by: created_by.to_string(),
            status: TaskStatus::Todo,
            priority: TaskPriority::Medium,
            due_date: None,
            estimated_hours: None,
            actual_hours: None,
            tags: Vec::new(),
            subtasks: Vec::new(),
            comments: Vec::new(),
            attachments: Vec::new(),
            dependencies: Vec::new(),
            watchers: vec![created_by.to_string()],
            activity: vec![ActivityEntry::new(ActivityAction::Created, created_by, None)],
            completed_at: None,
            position: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Any status may follow any other. Only `completed_at` tracks the change.
    pub fn set_status(&mut self, status: TaskStatus, now: DateTime<Utc>) -> TaskStatus {
        let previous = self.status;
        self.status = status;
        if status == TaskStatus::Completed {
            if previous != TaskStatus::Completed || self.completed_at.is_none() {
                self.completed_at = Some(now);
            }
        } else {
            self.completed_at = None;
        }
        self.updated_at = now;
        previous
    }

    pub fn record(&mut self, action: ActivityAction, user: &str, details: Option<String>) {
        self.activity.push(ActivityEntry::new(action, user, details));
    }

    pub fn subtask_progress(&self) -> u8 {
        let done = self.subtasks.iter().filter(|s| s.completed).count() as u64;
        super::project::progress_percent(self.subtasks.len() as u64, done)
    }

    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        match self.due_date {
            Some(due) => due < now && self.status != TaskStatus::Completed,
            None => false,
        }
    }

    /// Everyone who hears about changes to this task, deduplicated.
    pub fn interested_users(&self) -> Vec<String> {
        let mut users: Vec<String> = Vec::new();
        let candidates = std::iter::once(&self.created_by)
            .chain(self.assignee.iter())
            .chain(self.watchers.iter());
        for user in candidates {
            if !users.contains(user) {
                users.push(user.clone());
            }
        }
        users
    }

    /// Returns true when the caller is now watching.
    pub fn toggle_watcher(&mut self, user: &str) -> bool {
        if let Some(pos) = self.watchers.iter().position(|w| w == user) {
            self.watchers.remove(pos);
            false
        } else {
            self.watchers.push(user.to_string());
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn new_task_is_watched_by_creator() {
        let task = Task::new("p1", " Write docs ", "u1");
        assert_eq!(task.title, "Write docs");
        assert_eq!(task.status, TaskStatus::Todo);
        assert_eq!(task.watchers, vec!["u1".to_string()]);
        assert_eq!(task.activity.len(), 1);
        assert_eq!(task.activity[0].action, ActivityAction::Created);
    }

    #[test]
    fn status_transitions_are_unguarded() {
        let now = Utc::now();
        let mut task = Task::new("p1", "t", "u1");
        assert_eq!(task.set_status(TaskStatus::Completed, now), TaskStatus::Todo);
        assert_eq!(task.completed_at, Some(now));
        assert_eq!(task.set_status(TaskStatus::Blocked, now), TaskStatus::Completed);
        assert!(task.completed_at.is_none());
        task.set_status(TaskStatus::Review, now);
        assert_eq!(task.status, TaskStatus::Review);
    }

    #[test]
    fn completing_twice_keeps_first_timestamp() {
        let first = Utc::now();
        let mut task = Task::new("p1", "t", "u1");
        task.set_status(TaskStatus::Completed, first);
        task.set_status(TaskStatus::Completed, first + Duration::hours(1));
        assert_eq!(task.completed_at, Some(first));
    }

    #[test]
    fn subtask_progress_counts_completed() {
        let now = Utc::now();
        let mut task = Task::new("p1", "t", "u1");
        assert_eq!(task.subtask_progress(), 0);
        task.subtasks.push(Subtask::new("a"));
        task.subtasks.push(Subtask::new("b"));
        task.subtasks[0].set_completed(true, now);
        assert_eq!(task.subtask_progress(), 50);
        assert_eq!(task.subtasks[0].completed_at, Some(now));
    }

    #[test]
    fn overdue_ignores_completed_tasks() {
        let now = Utc::now();
        let mut task = Task::new("p1", "t", "u1");
        assert!(!task.is_overdue(now));
        task.due_date = Some(now - Duration::days(1));
        assert!(task.is_overdue(now));
        task.set_status(TaskStatus::Completed, now);
        assert!(!task.is_overdue(now));
    }

    #[test]
    fn interested_users_are_unique() {
        let mut task = Task::new("p1", "t", "creator");
        task.assignee = Some("dev".into());
        task.watchers.push("dev".into());
        task.watchers.push("qa".into());
        assert_eq!(task.interested_users(), vec!["creator", "dev", "qa"]);
    }

    #[test]
    fn watcher_toggle() {
        let mut task = Task::new("p1", "t", "creator");
        assert!(task.toggle_watcher("dev"));
        assert!(!task.toggle_watcher("dev"));
        assert!(!task.toggle_watcher("creator"));
        assert!(task.watchers.is_empty());
    }
}
