use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const DELETED_PLACEHOLDER: &str = "This message was deleted";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Text,
    File,
    System,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reaction {
    pub emoji: String,
    pub users: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadReceipt {
    pub user: String,
    #[serde(with = "crate::models::timestamp")]
    pub read_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "_id")]
    pub id: String,
    pub project: String,
    pub sender: String,
    pub content: String,
    pub message_type: MessageType,
    /// User ids resolved from `@username` handles in the content.
    #[serde(default)]
    pub mentions: Vec<String>,
    #[serde(default)]
    pub reactions: Vec<Reaction>,
    pub reply_to: Option<String>,
    #[serde(default)]
    pub attachments: Vec<String>,
    #[serde(default)]
    pub is_pinned: bool,
    pub pinned_by: Option<String>,
    #[serde(default, with = "crate::models::timestamp::option")]
    pub pinned_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_edited: bool,
    #[serde(default, with = "crate::models::timestamp::option")]
    pub edited_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_deleted: bool,
    #[serde(default, with = "crate::models::timestamp::option")]
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub read_by: Vec<ReadReceipt>,
    #[serde(with = "crate::models::timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "crate::models::timestamp")]
    pub updated_at: DateTime<Utc>,
}

impl Message {
    pub const COLLECTION: &'static str = "messages";

    pub fn new(project: &str, sender: &str, content: &str) -> Self {
        let now = Utc::now();
        Message {
            id: Uuid::new_v4().to_string(),
            project: project.to_string(),
            sender: sender.to_string(),
            content: content.trim().to_string(),
            message_type: MessageType::Text,
            mentions: Vec::new(),
            reactions: Vec::new(),
            reply_to: None,
            attachments: Vec::new(),
            is_pinned: false,
            pinned_by: None,
            pinned_at: None,
            is_edited: false,
            edited_at: None,
            is_deleted: false,
            deleted_at: None,
            // The sender has trivially read their own message.
            read_by: vec![ReadReceipt { user: sender.to_string(), read_at: now }],
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns true when the user's reaction is now present.
    pub fn toggle_reaction(&mut self, emoji: &str, user: &str) -> bool {
        let added = match self.reactions.iter_mut().find(|r| r.emoji == emoji) {
            Some(reaction) => match reaction.users.iter().position(|u| u == user) {
                Some(pos) => {
                    reaction.users.remove(pos);
                    false
                }
                None => {
                    reaction.users.push(user.to_string());
                    true
                }
            },
            None => {
                self.reactions.push(Reaction {
                    emoji: emoji.to_string(),
                    users: vec![user.to_string()],
                });
                true
            }
        };
        self.reactions.retain(|r| !r.users.is_empty());
        added
    }

    pub fn toggle_pin(&mut self, user: &str, now: DateTime<Utc>) -> bool {
        self.is_pinned = !self.is_pinned;
        if self.is_pinned {
            self.pinned_by = Some(user.to_string());
            self.pinned_at = Some(now);
        } else {
            self.pinned_by = None;
            self.pinned_at = None;
        }
        self.is_pinned
    }

    pub fn edit(&mut self, content: &str, mentions: Vec<String>, now: DateTime<Utc>) {
        self.content = content.trim().to_string();
        self.mentions = mentions;
        self.is_edited = true;
        self.edited_at = Some(now);
        self.updated_at = now;
    }

    /// Soft delete: the document stays so threads and receipts keep resolving.
    pub fn soft_delete(&mut self, now: DateTime<Utc>) {
        self.is_deleted = true;
        self.deleted_at = Some(now);
        self.content = DELETED_PLACEHOLDER.to_string();
        self.attachments.clear();
        self.mentions.clear();
        self.reactions.clear();
        self.is_pinned = false;
        self.pinned_by = None;
        self.pinned_at = None;
        self.updated_at = now;
    }
}

fn mention_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?:^|[^A-Za-z0-9_])@([A-Za-z0-9_]{3,30})").expect("static regex"))
}

/// `@handle` usernames in order of first appearance.
pub fn extract_mentions(content: &str) -> Vec<String> {
    let mut handles: Vec<String> = Vec::new();
    for caps in mention_re().captures_iter(content) {
        let handle = caps[1].to_string();
        if !handles.contains(&handle) {
            handles.push(handle);
        }
    }
    handles
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mentions_are_deduplicated_in_order() {
        let handles = extract_mentions("@bob can you sync with @alice? cc @bob");
        assert_eq!(handles, vec!["bob", "alice"]);
    }

    #[test]
    fn email_addresses_are_not_mentions() {
        assert!(extract_mentions("mail me at jane@example.com").is_empty());
        assert_eq!(extract_mentions("(@dev_team) ping"), vec!["dev_team"]);
    }

    #[test]
    fn reactions_toggle_and_prune() {
        let mut msg = Message::new("p1", "u1", "hello");
        assert!(msg.toggle_reaction("👍", "u2"));
        assert!(msg.toggle_reaction("👍", "u3"));
        assert_eq!(msg.reactions[0].users, vec!["u2", "u3"]);
        assert!(!msg.toggle_reaction("👍", "u2"));
        assert!(!msg.toggle_reaction("👍", "u3"));
        assert!(msg.reactions.is_empty());
    }

    #[test]
    fn pin_toggle_tracks_who() {
        let now = Utc::now();
        let mut msg = Message::new("p1", "u1", "hello");
        assert!(msg.toggle_pin("owner", now));
        assert_eq!(msg.pinned_by.as_deref(), Some("owner"));
        assert!(!msg.toggle_pin("owner", now));
        assert!(msg.pinned_by.is_none());
    }

    #[test]
    fn soft_delete_blanks_content() {
        let now = Utc::now();
        let mut msg = Message::new("p1", "u1", "secret plans");
        msg.toggle_reaction("🎉", "u2");
        msg.soft_delete(now);
        assert!(msg.is_deleted);
        assert_eq!(msg.content, DELETED_PLACEHOLDER);
        assert!(msg.reactions.is_empty());
        assert_eq!(msg.deleted_at, Some(now));
    }

    #[test]
    fn sender_has_read_own_message() {
        let msg = Message::new("p1", "u1", "hello");
        assert_eq!(msg.read_by.len(), 1);
        assert_eq!(msg.read_by[0].user, "u1");
    }
}
