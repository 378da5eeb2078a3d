// src/messages.rs

use actix_web::{web, HttpResponse};
use chrono::{DateTime, Utc};
use futures::stream::TryStreamExt;
use futures_util::StreamExt;
use log::{info, warn};
use mongodb::bson::{doc, to_bson, Bson, Document};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::app_state::AppState;
use crate::auth::AuthUser;
use crate::error::AppError;
use crate::event_hub::{project_topic, EventKind};
use crate::models::message::{extract_mentions, Message, MessageType, ReadReceipt};
use crate::models::notification::{NewNotification, NotificationKind};
use crate::models::project::Project;
use crate::models::timestamp;
use crate::models::user::User;
use crate::notifications::notify_all;
use crate::projects::project_for_member;
use crate::response;
use crate::validation::{parse_id, require_len};

const DEFAULT_PAGE: u64 = 50;
const MAX_PAGE: u64 = 100;

#[derive(Debug, Deserialize)]
pub struct MessageListQuery {
    /// Only messages created strictly before this instant.
    pub before: Option<DateTime<Utc>>,
    pub limit: Option<u64>,
    /// Parent message id; lists its replies instead of top-level messages.
    pub thread: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateMessageRequest {
    pub content: String,
    pub reply_to: Option<String>,
    #[serde(default)]
    pub attachments: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct EditMessageRequest {
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct ReactionRequest {
    pub emoji: String,
}

#[derive(Debug, Serialize)]
pub struct ThreadView {
    pub parent: Message,
    pub replies: Vec<Message>,
}

fn page_limit(limit: Option<u64>) -> i64 {
    limit.unwrap_or(DEFAULT_PAGE).clamp(1, MAX_PAGE) as i64
}

/// Maps `@handle`s in `content` to the ids of project members with that
/// username. Unknown handles and non-members are dropped.
pub async fn resolve_mentions(
    data: &AppState,
    project: &Project,
    content: &str,
) -> Result<Vec<String>, AppError> {
    let handles = extract_mentions(content);
    if handles.is_empty() {
        return Ok(Vec::new());
    }
    let users: Vec<User> = data
        .mongodb
        .users()
        .find(doc! { "username": { "$in": handles } })
        .await?
        .try_collect()
        .await?;
    Ok(users
        .into_iter()
        .map(|u| u.id)
        .filter(|id| project.is_member(id))
        .collect())
}

/// Mentioned users hear about a message once; the replied-to author gets a
/// reply notification unless they were already mentioned.
fn message_notifications(
    message: &Message,
    mentioned: &[String],
    reply_author: Option<&str>,
) -> Vec<NewNotification> {
    let mut batch: Vec<NewNotification> = mentioned
        .iter()
        .map(|u| {
            NewNotification::new(
                u,
                NotificationKind::Mention,
                "You were mentioned",
                preview(&message.content),
            )
            .from_user(&message.sender)
            .in_project(&message.project)
            .about_message(&message.id)
        })
        .collect();
    if let Some(author) = reply_author {
        if !mentioned.iter().any(|m| m == author) {
            batch.push(
                NewNotification::new(
                    author,
                    NotificationKind::MessageReply,
                    "New reply",
                    preview(&message.content),
                )
                .from_user(&message.sender)
                .in_project(&message.project)
                .about_message(&message.id),
            );
        }
    }
    batch
}

fn preview(content: &str) -> String {
    const MAX: usize = 100;
    if content.chars().count() <= MAX {
        content.to_string()
    } else {
        let cut: String = content.chars().take(MAX).collect();
        format!("{}...", cut)
    }
}

fn unread_filter(project_id: &str, user_id: &str) -> Document {
    doc! {
        "project": project_id,
        "is_deleted": false,
        "read_by.user": { "$ne": user_id },
    }
}

async fn message_for_member(
    data: &AppState,
    message_id: &str,
    user_id: &str,
) -> Result<(Message, Project), AppError> {
    let message = data
        .mongodb
        .messages()
        .find_one(doc! { "_id": message_id })
        .await?
        .ok_or_else(|| AppError::not_found("Message"))?;
    let project = project_for_member(data, &message.project, user_id).await?;
    Ok((message, project))
}

fn ensure_not_deleted(message: &Message, action: &str) -> Result<(), AppError> {
    if message.is_deleted {
        Err(AppError::validation(format!("Cannot {} a deleted message", action)))
    } else {
        Ok(())
    }
}

/// GET /api/projects/{id}/messages
fn history_filter(project_id: &str, query: &MessageListQuery) -> Result<Document, AppError> {
    let mut filter = doc! { "project": project_id };
    match query.thread.as_deref() {
        Some(parent) => filter.insert("reply_to", parse_id(parent)?),
        None => filter.insert("reply_to", Bson::Null),
    };
    if let Some(before) = &query.before {
        filter.insert("created_at", doc! { "$lt": timestamp::bson(before) });
    }
    Ok(filter)
}

pub async fn list_messages(
    user: AuthUser,
    data: web::Data<AppState>,
    path: web::Path<String>,
    query: web::Query<MessageListQuery>,
) -> Result<HttpResponse, AppError> {
    let project_id = parse_id(&path.into_inner())?;
    project_for_member(&data, &project_id, &user.id).await?;

    let filter = history_filter(&project_id, &query)?;
    let messages: Vec<Message> = data
        .mongodb
        .messages()
        .find(filter)
        .sort(doc! { "created_at": -1 })
        .limit(page_limit(query.limit))
        .await?
        .try_collect()
        .await?;
    Ok(response::ok("Messages retrieved", messages))
}

/// POST /api/projects/{id}/messages
pub async fn create_message(
    user: AuthUser,
    data: web::Data<AppState>,
    path: web::Path<String>,
    payload: web::Json<CreateMessageRequest>,
) -> Result<HttpResponse, AppError> {
    let project_id = parse_id(&path.into_inner())?;
    let project = project_for_member(&data, &project_id, &user.id).await?;
    require_len("Message", &payload.content, 1, 5000)?;

    let payload = payload.into_inner();
    let mut message = Message::new(&project_id, &user.id, &payload.content);
    if !payload.attachments.is_empty() {
        message.message_type = MessageType::File;
        message.attachments = payload.attachments;
    }

    let mut reply_author: Option<String> = None;
    if let Some(raw) = payload.reply_to.as_deref() {
        let parent_id = parse_id(raw)?;
        let parent = data
            .mongodb
            .messages()
            .find_one(doc! { "_id": &parent_id, "project": &project_id })
            .await?
            .ok_or_else(|| AppError::validation("Reply target must be a message in this project"))?;
        reply_author = Some(parent.sender);
        message.reply_to = Some(parent_id);
    }

    message.mentions = resolve_mentions(&data, &project, &message.content).await?;
    data.mongodb.messages().insert_one(&message).await?;
    info!("Message {} posted to project {}", message.id, project_id);

    notify_all(
        &data,
        message_notifications(&message, &message.mentions, reply_author.as_deref()),
    )
    .await;
    data.emit(project_topic(&project_id), EventKind::NewMessage, &message);
    Ok(response::created("Message sent", message))
}

/// GET /api/projects/{id}/messages/pinned
pub async fn pinned_messages(
    user: AuthUser,
    data: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let project_id = parse_id(&path.into_inner())?;
    project_for_member(&data, &project_id, &user.id).await?;

    let messages: Vec<Message> = data
        .mongodb
        .messages()
        .find(doc! { "project": &project_id, "is_pinned": true, "is_deleted": false })
        .sort(doc! { "pinned_at": -1 })
        .await?
        .try_collect()
        .await?;
    Ok(response::ok("Pinned messages retrieved", messages))
}

/// POST /api/projects/{id}/messages/read
pub async fn mark_read(
    user: AuthUser,
    data: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let project_id = parse_id(&path.into_inner())?;
    project_for_member(&data, &project_id, &user.id).await?;

    let receipt = ReadReceipt { user: user.id.clone(), read_at: Utc::now() };
    let result = data
        .mongodb
        .messages()
        .update_many(
            unread_filter(&project_id, &user.id),
            doc! { "$push": { "read_by": to_bson(&receipt)? } },
        )
        .await?;

    if result.modified_count > 0 {
        data.emit(
            project_topic(&project_id),
            EventKind::MessagesRead,
            &json!({ "user_id": user.id, "project_id": project_id, "read_at": receipt.read_at }),
        );
    }
    Ok(response::ok("Messages marked as read", json!({ "updated": result.modified_count })))
}

/// GET /api/projects/{id}/messages/unread-count
pub async fn unread_count(
    user: AuthUser,
    data: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let project_id = parse_id(&path.into_inner())?;
    project_for_member(&data, &project_id, &user.id).await?;
    let count = data
        .mongodb
        .messages()
        .count_documents(unread_filter(&project_id, &user.id))
        .await?;
    Ok(response::ok("Unread count", json!({ "unread_count": count })))
}

/// GET /api/messages/{id}/thread
pub async fn get_thread(
    user: AuthUser,
    data: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let message_id = parse_id(&path.into_inner())?;
    let (parent, _) = message_for_member(&data, &message_id, &user.id).await?;

    let mut cursor = data
        .mongodb
        .messages()
        .find(doc! { "reply_to": &message_id })
        .sort(doc! { "created_at": 1 })
        .await?;
    let mut replies: Vec<Message> = Vec::new();
    while let Some(reply) = cursor.next().await {
        match reply {
            Ok(reply) => replies.push(reply),
            Err(e) => warn!("Skipping unreadable reply in thread {}: {}", message_id, e),
        }
    }
    Ok(response::ok("Thread retrieved", ThreadView { parent, replies }))
}

/// PUT /api/messages/{id}
pub async fn edit_message(
    user: AuthUser,
    data: web::Data<AppState>,
    path: web::Path<String>,
    payload: web::Json<EditMessageRequest>,
) -> Result<HttpResponse, AppError> {
    let message_id = parse_id(&path.into_inner())?;
    let (mut message, project) = message_for_member(&data, &message_id, &user.id).await?;
    if message.sender != user.id {
        return Err(AppError::forbidden("You can only edit your own messages"));
    }
    ensure_not_deleted(&message, "edit")?;
    require_len("Message", &payload.content, 1, 5000)?;

    let previous = message.mentions.clone();
    let mentions = resolve_mentions(&data, &project, &payload.content).await?;
    message.edit(&payload.content, mentions, Utc::now());

    data.mongodb
        .messages()
        .update_one(
            doc! { "_id": &message_id },
            doc! { "$set": {
                "content": &message.content,
                "mentions": message.mentions.clone(),
                "is_edited": true,
                "edited_at": timestamp::bson_opt(message.edited_at.as_ref()),
                "updated_at": timestamp::bson(&message.updated_at),
            } },
        )
        .await?;

    let fresh: Vec<String> =
        message.mentions.iter().filter(|m| !previous.contains(*m)).cloned().collect();
    notify_all(&data, message_notifications(&message, &fresh, None)).await;

    data.emit(project_topic(&message.project), EventKind::MessageUpdated, &message);
    Ok(response::ok("Message updated", message))
}

/// DELETE /api/messages/{id}
pub async fn delete_message(
    user: AuthUser,
    data: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let message_id = parse_id(&path.into_inner())?;
    let (mut message, project) = message_for_member(&data, &message_id, &user.id).await?;
    if message.sender != user.id && !project.can_manage_project(&user.id) {
        return Err(AppError::forbidden("You cannot delete this message"));
    }
    if message.is_deleted {
        return Ok(response::message_only("Message already deleted"));
    }

    message.soft_delete(Utc::now());
    data.mongodb.messages().replace_one(doc! { "_id": &message_id }, &message).await?;

    data.emit(
        project_topic(&message.project),
        EventKind::MessageDeleted,
        &json!({ "message_id": message.id, "project_id": message.project }),
    );
    Ok(response::message_only("Message deleted"))
}

/// POST /api/messages/{id}/reactions
pub async fn toggle_reaction(
    user: AuthUser,
    data: web::Data<AppState>,
    path: web::Path<String>,
    payload: web::Json<ReactionRequest>,
) -> Result<HttpResponse, AppError> {
    let message_id = parse_id(&path.into_inner())?;
    let (mut message, _) = message_for_member(&data, &message_id, &user.id).await?;
    ensure_not_deleted(&message, "react to")?;
    require_len("Emoji", &payload.emoji, 1, 32)?;

    let added = message.toggle_reaction(payload.emoji.trim(), &user.id);
    data.mongodb
        .messages()
        .update_one(
            doc! { "_id": &message_id },
            doc! { "$set": { "reactions": to_bson(&message.reactions)? } },
        )
        .await?;

    let body = json!({
        "message_id": message.id,
        "reactions": message.reactions,
        "user_id": user.id,
        "added": added,
    });
    data.emit(project_topic(&message.project), EventKind::MessageReaction, &body);
    Ok(response::ok("Reaction updated", body))
}

/// POST /api/messages/{id}/pin
pub async fn toggle_pin(
    user: AuthUser,
    data: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let message_id = parse_id(&path.into_inner())?;
    let (mut message, project) = message_for_member(&data, &message_id, &user.id).await?;
    if !project.can_manage_project(&user.id) {
        return Err(AppError::forbidden("Only project owners and admins can pin messages"));
    }
    ensure_not_deleted(&message, "pin")?;

    let pinned = message.toggle_pin(&user.id, Utc::now());
    data.mongodb
        .messages()
        .update_one(
            doc! { "_id": &message_id },
            doc! { "$set": {
                "is_pinned": pinned,
                "pinned_by": to_bson(&message.pinned_by)?,
                "pinned_at": timestamp::bson_opt(message.pinned_at.as_ref()),
            } },
        )
        .await?;

    data.emit(
        project_topic(&message.project),
        EventKind::MessagePinned,
        &json!({
            "message_id": message.id,
            "is_pinned": pinned,
            "pinned_by": message.pinned_by,
        }),
    );
    let text = if pinned { "Message pinned" } else { "Message unpinned" };
    Ok(response::ok(text, message))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_cursor_compares_stored_timestamps() {
        let q: MessageListQuery =
            serde_json::from_str(r#"{"before":"2024-05-01T12:00:00Z"}"#).unwrap();
        let filter = history_filter("p1", &q).unwrap();
        assert_eq!(filter.get("reply_to"), Some(&Bson::Null));
        let cursor = filter.get_document("created_at").unwrap().get_str("$lt").unwrap();
        assert_eq!(cursor, "2024-05-01T12:00:00.000000000Z");

        // A message stamped half a second later must not pass the cursor.
        let mut later = Message::new("p1", "u1", "hi");
        later.created_at = q.before.unwrap() + chrono::Duration::milliseconds(500);
        let stored = to_bson(&later).unwrap();
        let stored = stored.as_document().unwrap().get_str("created_at").unwrap().to_string();
        assert!(stored.as_str() > cursor);
    }

    #[test]
    fn page_limit_is_clamped() {
        assert_eq!(page_limit(None), 50);
        assert_eq!(page_limit(Some(0)), 1);
        assert_eq!(page_limit(Some(500)), 100);
        assert_eq!(page_limit(Some(20)), 20);
    }

    #[test]
    fn reply_author_is_not_notified_twice() {
        let mut msg = Message::new("p1", "alice", "@bob thoughts?");
        msg.reply_to = Some("parent".into());
        let mentioned = vec!["bob".to_string()];

        let batch = message_notifications(&msg, &mentioned, Some("bob"));
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].kind, NotificationKind::Mention);

        let batch = message_notifications(&msg, &mentioned, Some("carol"));
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[1].recipient, "carol");
        assert_eq!(batch[1].kind, NotificationKind::MessageReply);
        assert_eq!(batch[1].message_ref.as_deref(), Some(msg.id.as_str()));
        assert_eq!(batch[1].sender.as_deref(), Some("alice"));
    }

    #[test]
    fn previews_are_truncated() {
        assert_eq!(preview("short"), "short");
        let long = "x".repeat(150);
        let p = preview(&long);
        assert_eq!(p.chars().count(), 103);
        assert!(p.ends_with("..."));
    }

    #[test]
    fn deleted_messages_reject_changes() {
        let mut msg = Message::new("p1", "alice", "hi");
        assert!(ensure_not_deleted(&msg, "edit").is_ok());
        msg.soft_delete(Utc::now());
        let err = ensure_not_deleted(&msg, "edit").unwrap_err();
        assert_eq!(err.client_message(), "Cannot edit a deleted message");
    }

    #[test]
    fn list_query_parses_before() {
        let q: MessageListQuery =
            serde_json::from_str(r#"{"before":"2024-05-01T12:00:00Z","limit":10}"#).unwrap();
        assert!(q.before.is_some());
        assert_eq!(q.limit, Some(10));
        assert!(q.thread.is_none());
    }
}
