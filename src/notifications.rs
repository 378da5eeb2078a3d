// src/notifications.rs

use actix_web::{web, HttpResponse};
use futures::stream::TryStreamExt;
use log::{debug, error};
use mongodb::bson::{doc, Document};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::app_state::AppState;
use crate::auth::AuthUser;
use crate::error::AppError;
use crate::event_hub::{user_topic, EventKind};
use crate::models::notification::{NewNotification, Notification};
use crate::models::now_bson;
use crate::response::{self, PageQuery, Paginated};
use crate::validation::parse_id;

/// Stores a notification and pushes it to the recipient's live sessions.
///
/// Delivery is best effort: a failed insert is logged and swallowed so the
/// request that triggered it still succeeds. Users are never notified about
/// their own actions.
pub async fn notify(data: &AppState, new: NewNotification) -> Option<Notification> {
    if new.is_self_notification() {
        return None;
    }
    let notification = new.into_notification();
    if let Err(e) = data.mongodb.notifications().insert_one(&notification).await {
        error!("Error storing notification for {}: {}", notification.recipient, e);
        return None;
    }
    debug!("Notification {} -> {}", notification.id, notification.recipient);
    data.emit(user_topic(&notification.recipient), EventKind::Notification, &notification);
    Some(notification)
}

pub async fn notify_all(data: &AppState, batch: Vec<NewNotification>) {
    for new in batch {
        notify(data, new).await;
    }
}

#[derive(Debug, Deserialize)]
pub struct NotificationQuery {
    #[serde(default)]
    pub unread_only: bool,
    pub page: Option<u64>,
    pub limit: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct NotificationPage {
    #[serde(flatten)]
    pub page: Paginated<Notification>,
    pub unread_count: u64,
}

async fn unread_count(data: &AppState, user_id: &str) -> Result<u64, AppError> {
    Ok(data
        .mongodb
        .notifications()
        .count_documents(doc! { "recipient": user_id, "is_read": false })
        .await?)
}

/// GET /api/notifications
pub async fn list_notifications(
    user: AuthUser,
    data: web::Data<AppState>,
    query: web::Query<NotificationQuery>,
) -> Result<HttpResponse, AppError> {
    let paging = PageQuery { page: query.page, limit: query.limit };
    let mut filter: Document = doc! { "recipient": &user.id };
    if query.unread_only {
        filter.insert("is_read", false);
    }

    let coll = data.mongodb.notifications();
    let total = coll.count_documents(filter.clone()).await?;
    let items: Vec<Notification> = coll
        .find(filter)
        .sort(doc! { "created_at": -1 })
        .skip(paging.skip())
        .limit(paging.limit() as i64)
        .await?
        .try_collect()
        .await?;

    let unread_count = unread_count(&data, &user.id).await?;
    Ok(response::ok(
        "Notifications retrieved",
        NotificationPage {
            page: Paginated { items, page: paging.page(), limit: paging.limit(), total },
            unread_count,
        },
    ))
}

/// GET /api/notifications/unread-count
pub async fn get_unread_count(
    user: AuthUser,
    data: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let count = unread_count(&data, &user.id).await?;
    Ok(response::ok("Unread count", json!({ "unread_count": count })))
}

/// PUT /api/notifications/{id}/read
pub async fn mark_read(
    user: AuthUser,
    data: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let id = parse_id(&path.into_inner())?;
    let result = data
        .mongodb
        .notifications()
        .update_one(
            doc! { "_id": &id, "recipient": &user.id },
            doc! { "$set": { "is_read": true, "read_at": now_bson() } },
        )
        .await?;
    if result.matched_count == 0 {
        return Err(AppError::not_found("Notification"));
    }

    let unread = unread_count(&data, &user.id).await?;
    data.emit(
        user_topic(&user.id),
        EventKind::NotificationRead,
        &json!({ "notification_id": id, "unread_count": unread }),
    );
    Ok(response::ok("Notification marked as read", json!({ "unread_count": unread })))
}

/// PUT /api/notifications/read-all
pub async fn mark_all_read(
    user: AuthUser,
    data: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let result = data
        .mongodb
        .notifications()
        .update_many(
            doc! { "recipient": &user.id, "is_read": false },
            doc! { "$set": { "is_read": true, "read_at": now_bson() } },
        )
        .await?;

    data.emit(
        user_topic(&user.id),
        EventKind::NotificationRead,
        &json!({ "all": true, "unread_count": 0 }),
    );
    Ok(response::ok(
        "All notifications marked as read",
        json!({ "updated": result.modified_count }),
    ))
}

/// DELETE /api/notifications/{id}
pub async fn delete_notification(
    user: AuthUser,
    data: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let id = parse_id(&path.into_inner())?;
    let result = data
        .mongodb
        .notifications()
        .delete_one(doc! { "_id": &id, "recipient": &user.id })
        .await?;
    if result.deleted_count == 0 {
        return Err(AppError::not_found("Notification"));
    }
    Ok(response::message_only("Notification deleted"))
}

/// DELETE /api/notifications clears notifications already read.
pub async fn clear_read(
    user: AuthUser,
    data: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let result = data
        .mongodb
        .notifications()
        .delete_many(doc! { "recipient": &user.id, "is_read": true })
        .await?;
    Ok(response::ok("Read notifications cleared", json!({ "deleted": result.deleted_count })))
}
