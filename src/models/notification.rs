use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    TaskAssigned,
    TaskUpdated,
    TaskCompleted,
    TaskComment,
    ProjectInvite,
    ProjectUpdate,
    MemberRemoved,
    Mention,
    MessageReply,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    #[serde(rename = "_id")]
    pub id: String,
    pub recipient: String,
    pub sender: Option<String>,
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
    pub project: Option<String>,
    pub task: Option<String>,
    pub message_ref: Option<String>,
    pub link: Option<String>,
    #[serde(default)]
    pub is_read: bool,
    #[serde(default, with = "crate::models::timestamp::option")]
    pub read_at: Option<DateTime<Utc>>,
    #[serde(with = "crate::models::timestamp")]
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub const COLLECTION: &'static str = "notifications";
}

/// Everything a caller supplies; ids and timestamps are filled in on store.
#[derive(Debug, Clone)]
pub struct NewNotification {
    pub recipient: String,
    pub sender: Option<String>,
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
    pub project: Option<String>,
    pub task: Option<String>,
    pub message_ref: Option<String>,
}

impl NewNotification {
    pub fn new(recipient: &str, kind: NotificationKind, title: &str, message: String) -> Self {
        NewNotification {
            recipient: recipient.to_string(),
            sender: None,
            kind,
            title: title.to_string(),
            message,
            project: None,
            task: None,
            message_ref: None,
        }
    }

    pub fn from_user(mut self, sender: &str) -> Self {
        self.sender = Some(sender.to_string());
        self
    }

    pub fn in_project(mut self, project: &str) -> Self {
        self.project = Some(project.to_string());
        self
    }

    pub fn about_task(mut self, task: &str) -> Self {
        self.task = Some(task.to_string());
        self
    }

    pub fn about_message(mut self, message: &str) -> Self {
        self.message_ref = Some(message.to_string());
        self
    }

    /// Client-side route the notification should open.
    fn link(&self) -> Option<String> {
        match (&self.project, &self.task) {
            (Some(project), Some(task)) => Some(format!("/projects/{}/tasks/{}", project, task)),
            (Some(project), None) if self.message_ref.is_some() => {
                Some(format!("/projects/{}/chat", project))
            }
            (Some(project), None) => Some(format!("/projects/{}", project)),
            _ => None,
        }
    }

    pub fn into_notification(self) -> Notification {
        let link = self.link();
        Notification {
            id: Uuid::new_v4().to_string(),
            recipient: self.recipient,
            sender: self.sender,
            kind: self.kind,
            title: self.title,
            message: self.message,
            project: self.project,
            task: self.task,
            message_ref: self.message_ref,
            link,
            is_read: false,
            read_at: None,
            created_at: Utc::now(),
        }
    }

    pub fn is_self_notification(&self) -> bool {
        self.sender.as_deref() == Some(self.recipient.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn links_point_at_the_most_specific_target() {
        let n = NewNotification::new("u2", NotificationKind::TaskAssigned, "Assigned", "x".into())
            .in_project("p1")
            .about_task("t1")
            .into_notification();
        assert_eq!(n.link.as_deref(), Some("/projects/p1/tasks/t1"));
        assert!(!n.is_read);

        let n = NewNotification::new("u2", NotificationKind::Mention, "Mention", "x".into())
            .in_project("p1")
            .about_message("m1")
            .into_notification();
        assert_eq!(n.link.as_deref(), Some("/projects/p1/chat"));
    }

    #[test]
    fn self_notifications_are_detected() {
        let n = NewNotification::new("u1", NotificationKind::TaskUpdated, "t", "m".into())
            .from_user("u1");
        assert!(n.is_self_notification());
        let n = n.from_user("u2");
        assert!(!n.is_self_notification());
    }

    #[test]
    fn kind_serializes_snake_case() {
        assert_eq!(
            serde_json::to_value(NotificationKind::MessageReply).unwrap(),
            "message_reply"
        );
    }
}
