// src/tasks.rs

use actix_web::{web, HttpResponse};
use chrono::{DateTime, Utc};
use futures::stream::TryStreamExt;
use log::{debug, error, info};
use mongodb::bson::{doc, to_bson, Bson, Document};
use mongodb::options::ReturnDocument;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::app_state::AppState;
use crate::auth::AuthUser;
use crate::error::AppError;
use crate::event_hub::{project_topic, EventKind};
use crate::messages::resolve_mentions;
use crate::models::notification::{NewNotification, NotificationKind};
use crate::models::project::{Permission, Project};
use crate::models::task::{
    ActivityAction, ActivityEntry, Comment, Subtask, Task, TaskPriority, TaskStatus,
};
use crate::models::{now_bson, timestamp};
use crate::notifications::{notify, notify_all};
use crate::projects::{project_for_member, require_permission};
use crate::response;
use crate::validation::{parse_id, require_len};

#[derive(Debug, Deserialize)]
pub struct CreateTaskRequest {
    pub title: String,
    pub description: Option<String>,
    pub assignee: Option<String>,
    pub status: Option<TaskStatus>,
    pub priority: Option<TaskPriority>,
    pub due_date: Option<DateTime<Utc>>,
    pub estimated_hours: Option<f64>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    pub position: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateTaskRequest {
    pub title: Option<String>,
    pub description: Option<String>,
    /// An empty string unassigns the task.
    pub assignee: Option<String>,
    pub status: Option<TaskStatus>,
    pub priority: Option<TaskPriority>,
    pub due_date: Option<DateTime<Utc>>,
    pub estimated_hours: Option<f64>,
    pub actual_hours: Option<f64>,
    pub tags: Option<Vec<String>>,
    pub dependencies: Option<Vec<String>>,
    pub position: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct StatusRequest {
    pub status: TaskStatus,
}

#[derive(Debug, Deserialize)]
pub struct CommentRequest {
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct SubtaskRequest {
    pub title: String,
}

#[derive(Debug, Deserialize)]
pub struct UpdateSubtaskRequest {
    pub title: Option<String>,
    pub completed: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct TaskListQuery {
    pub status: Option<TaskStatus>,
    /// A user id, `me`, or `unassigned`.
    pub assignee: Option<String>,
    pub priority: Option<TaskPriority>,
    pub search: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct MyTasksQuery {
    #[serde(default)]
    pub include_completed: bool,
}

/// A task with fields derived at read time.
#[derive(Debug, Serialize)]
pub struct TaskView {
    #[serde(flatten)]
    pub task: Task,
    pub subtask_progress: u8,
    pub is_overdue: bool,
}

impl From<Task> for TaskView {
    fn from(task: Task) -> Self {
        let subtask_progress = task.subtask_progress();
        let is_overdue = task.is_overdue(Utc::now());
        TaskView { task, subtask_progress, is_overdue }
    }
}

fn can_edit_task(project: &Project, task: &Task, user_id: &str) -> bool {
    project.has_permission(user_id, Permission::EditTasks)
        || task.created_by == user_id
        || task.assignee.as_deref() == Some(user_id)
}

fn validate_hours(field: &str, hours: Option<f64>) -> Result<(), AppError> {
    match hours {
        Some(h) if !h.is_finite() || h < 0.0 => {
            Err(AppError::validation(format!("{} must be a non-negative number", field)))
        }
        _ => Ok(()),
    }
}

fn ensure_assignable(project: &Project, assignee: &str) -> Result<(), AppError> {
    if project.is_member(assignee) {
        Ok(())
    } else {
        Err(AppError::validation("Assignee must be a member of this project"))
    }
}

/// Dependencies must be other tasks of the same project.
async fn validate_dependencies(
    data: &AppState,
    project_id: &str,
    task_id: Option<&str>,
    raw: &[String],
) -> Result<Vec<String>, AppError> {
    let mut ids: Vec<String> = Vec::with_capacity(raw.len());
    for id in raw {
        let id = parse_id(id)?;
        if Some(id.as_str()) == task_id {
            return Err(AppError::validation("A task cannot depend on itself"));
        }
        if !ids.contains(&id) {
            ids.push(id);
        }
    }
    if ids.is_empty() {
        return Ok(ids);
    }
    let found = data
        .mongodb
        .tasks()
        .count_documents(doc! { "_id": { "$in": ids.clone() }, "project": project_id })
        .await?;
    if found != ids.len() as u64 {
        return Err(AppError::validation("Dependencies must be tasks in the same project"));
    }
    Ok(ids)
}

/// `$set` body for a project's task counters after [`Project::apply_task_counts`].
fn task_counts_update(project: &Project) -> Document {
    doc! { "$set": {
        "task_count": project.task_count as i64,
        "completed_task_count": project.completed_task_count as i64,
        "progress": project.progress as i32,
    } }
}

/// Filter and update that drop a deleted task from its siblings' dependency lists.
fn dependency_cleanup(project_id: &str, task_id: &str) -> (Document, Document) {
    (
        doc! { "project": project_id, "dependencies": task_id },
        doc! { "$pull": { "dependencies": task_id } },
    )
}

/// Recomputes the project's denormalized task counters and progress.
///
/// Runs as its own write after the task change; a failure is logged and the
/// counters stay stale until the next task write.
pub async fn sync_project_progress(data: &AppState, project_id: &str) -> Option<u8> {
    let tasks = data.mongodb.tasks();
    let counts = async {
        let total = tasks.count_documents(doc! { "project": project_id }).await?;
        let completed = tasks
            .count_documents(doc! { "project": project_id, "status": TaskStatus::Completed.as_str() })
            .await?;
        let project = data.mongodb.projects().find_one(doc! { "_id": project_id }).await?;
        Ok::<_, mongodb::error::Error>((project, total, completed))
    }
    .await;

    let (mut project, total, completed) = match counts {
        Ok((Some(project), total, completed)) => (project, total, completed),
        Ok((None, _, _)) => {
            debug!("Project {} is gone; skipping progress", project_id);
            return None;
        }
        Err(e) => {
            error!("Error counting tasks of project {}: {}", project_id, e);
            return None;
        }
    };
    project.apply_task_counts(total, completed);
    let update = task_counts_update(&project);
    if let Err(e) = data.mongodb.projects().update_one(doc! { "_id": project_id }, update).await {
        error!("Error updating progress of project {}: {}", project_id, e);
        return None;
    }
    debug!("Project {} progress {}% ({}/{})", project_id, project.progress, completed, total);
    Some(project.progress)
}

async fn task_for_member(
    data: &AppState,
    task_id: &str,
    user_id: &str,
) -> Result<(Task, Project), AppError> {
    let task = data
        .mongodb
        .tasks()
        .find_one(doc! { "_id": task_id })
        .await?
        .ok_or_else(|| AppError::not_found("Task"))?;
    let project = project_for_member(data, &task.project, user_id).await?;
    Ok((task, project))
}

async fn save_task(data: &AppState, task: &Task) -> Result<(), AppError> {
    let result = data.mongodb.tasks().replace_one(doc! { "_id": &task.id }, task).await?;
    if result.matched_count == 0 {
        return Err(AppError::not_found("Task"));
    }
    Ok(())
}

fn status_notifications(task: &Task, actor: &str) -> Vec<NewNotification> {
    let (kind, title) = if task.status == TaskStatus::Completed {
        (NotificationKind::TaskCompleted, "Task completed")
    } else {
        (NotificationKind::TaskUpdated, "Task status changed")
    };
    task.interested_users()
        .iter()
        .filter(|u| u.as_str() != actor)
        .map(|u| {
            NewNotification::new(
                u,
                kind,
                title,
                format!("{} is now {}", task.title, task.status.as_str()),
            )
            .from_user(actor)
            .in_project(&task.project)
            .about_task(&task.id)
        })
        .collect()
}

fn assignment_notification(task: &Task, assignee: &str, actor: &str) -> NewNotification {
    NewNotification::new(
        assignee,
        NotificationKind::TaskAssigned,
        "Task assigned",
        format!("You were assigned to {}", task.title),
    )
    .from_user(actor)
    .in_project(&task.project)
    .about_task(&task.id)
}

/// GET /api/projects/{id}/tasks
pub async fn list_tasks(
    user: AuthUser,
    data: web::Data<AppState>,
    path: web::Path<String>,
    query: web::Query<TaskListQuery>,
) -> Result<HttpResponse, AppError> {
    let project_id = parse_id(&path.into_inner())?;
    project_for_member(&data, &project_id, &user.id).await?;

    let mut filter = doc! { "project": &project_id };
    if let Some(status) = query.status {
        filter.insert("status", status.as_str());
    }
    if let Some(priority) = query.priority {
        filter.insert("priority", priority.as_str());
    }
    match query.assignee.as_deref() {
        Some("me") => {
            filter.insert("assignee", user.id.as_str());
        }
        Some("unassigned") => {
            filter.insert("assignee", Bson::Null);
        }
        Some(other) => {
            filter.insert("assignee", parse_id(other)?);
        }
        None => {}
    }
    if let Some(search) = query.search.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        let pattern = regex::escape(search);
        filter.insert(
            "$or",
            vec![
                doc! { "title": { "$regex": &pattern, "$options": "i" } },
                doc! { "description": { "$regex": &pattern, "$options": "i" } },
            ],
        );
    }

    let tasks: Vec<Task> = data
        .mongodb
        .tasks()
        .find(filter)
        .sort(doc! { "position": 1, "created_at": 1 })
        .await?
        .try_collect()
        .await?;
    let views: Vec<TaskView> = tasks.into_iter().map(TaskView::from).collect();
    Ok(response::ok("Tasks retrieved", views))
}

/// POST /api/projects/{id}/tasks
pub async fn create_task(
    user: AuthUser,
    data: web::Data<AppState>,
    path: web::Path<String>,
    payload: web::Json<CreateTaskRequest>,
) -> Result<HttpResponse, AppError> {
    let project_id = parse_id(&path.into_inner())?;
    let project = project_for_member(&data, &project_id, &user.id).await?;
    require_permission(&project, &user.id, Permission::CreateTasks)?;

    require_len("Task title", &payload.title, 1, 200)?;
    if let Some(desc) = &payload.description {
        require_len("Description", desc, 0, 5000)?;
    }
    validate_hours("Estimated hours", payload.estimated_hours)?;

    let payload = payload.into_inner();
    let assignee = match payload.assignee.as_deref().filter(|a| !a.is_empty()) {
        Some(raw) => {
            let id = parse_id(raw)?;
            ensure_assignable(&project, &id)?;
            Some(id)
        }
        None => None,
    };
    let dependencies = validate_dependencies(&data, &project_id, None, &payload.dependencies).await?;

    let now = Utc::now();
    let mut task = Task::new(&project_id, &payload.title, &user.id);
    task.description = payload.description;
    task.priority = payload.priority.unwrap_or(TaskPriority::Medium);
    task.due_date = payload.due_date;
    task.estimated_hours = payload.estimated_hours;
    task.tags = payload.tags;
    task.dependencies = dependencies;
    if let Some(status) = payload.status {
        task.set_status(status, now);
    }
    task.position = match payload.position {
        Some(position) => position,
        None => data.mongodb.tasks().count_documents(doc! { "project": &project_id }).await? as i64,
    };
    if let Some(assignee) = &assignee {
        task.assignee = Some(assignee.clone());
        task.record(ActivityAction::Assigned, &user.id, Some(assignee.clone()));
    }

    data.mongodb.tasks().insert_one(&task).await?;
    info!("Task created {} in project {}", task.id, project_id);
    sync_project_progress(&data, &project_id).await;

    if let Some(assignee) = &task.assignee {
        notify(&data, assignment_notification(&task, assignee, &user.id)).await;
    }
    data.emit(project_topic(&project_id), EventKind::TaskCreated, &task);
    Ok(response::created("Task created successfully", TaskView::from(task)))
}

/// GET /api/tasks/mine
pub async fn my_tasks(
    user: AuthUser,
    data: web::Data<AppState>,
    query: web::Query<MyTasksQuery>,
) -> Result<HttpResponse, AppError> {
    let mut filter = doc! { "assignee": &user.id };
    if !query.include_completed {
        filter.insert("status", doc! { "$ne": TaskStatus::Completed.as_str() });
    }
    let tasks: Vec<Task> = data
        .mongodb
        .tasks()
        .find(filter)
        .sort(doc! { "due_date": 1, "created_at": -1 })
        .await?
        .try_collect()
        .await?;
    let views: Vec<TaskView> = tasks.into_iter().map(TaskView::from).collect();
    Ok(response::ok("Tasks retrieved", views))
}

/// GET /api/tasks/{id}
pub async fn get_task(
    user: AuthUser,
    data: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let task_id = parse_id(&path.into_inner())?;
    let (task, _) = task_for_member(&data, &task_id, &user.id).await?;
    Ok(response::ok("Task retrieved", TaskView::from(task)))
}

/// PUT /api/tasks/{id}
pub async fn update_task(
    user: AuthUser,
    data: web::Data<AppState>,
    path: web::Path<String>,
    payload: web::Json<UpdateTaskRequest>,
) -> Result<HttpResponse, AppError> {
    let task_id = parse_id(&path.into_inner())?;
    let (task, project) = task_for_member(&data, &task_id, &user.id).await?;
    if !can_edit_task(&project, &task, &user.id) {
        return Err(AppError::forbidden("You do not have permission to edit this task"));
    }

    let now = Utc::now();
    let mut set_doc = Document::new();
    let mut activity: Vec<ActivityEntry> = Vec::new();
    let mut changed: Vec<&str> = Vec::new();

    if let Some(title) = &payload.title {
        require_len("Task title", title, 1, 200)?;
        set_doc.insert("title", title.trim());
        changed.push("title");
    }
    if let Some(desc) = &payload.description {
        require_len("Description", desc, 0, 5000)?;
        set_doc.insert("description", desc.trim());
        changed.push("description");
    }
    if let Some(priority) = payload.priority {
        set_doc.insert("priority", priority.as_str());
        changed.push("priority");
    }
    if let Some(due) = &payload.due_date {
        set_doc.insert("due_date", timestamp::bson(due));
        changed.push("due_date");
    }
    validate_hours("Estimated hours", payload.estimated_hours)?;
    validate_hours("Actual hours", payload.actual_hours)?;
    if let Some(hours) = payload.estimated_hours {
        set_doc.insert("estimated_hours", hours);
        changed.push("estimated_hours");
    }
    if let Some(hours) = payload.actual_hours {
        set_doc.insert("actual_hours", hours);
        changed.push("actual_hours");
    }
    if let Some(tags) = &payload.tags {
        set_doc.insert("tags", tags.clone());
        changed.push("tags");
    }
    if let Some(position) = payload.position {
        set_doc.insert("position", position);
    }
    if let Some(deps) = &payload.dependencies {
        let deps = validate_dependencies(&data, &task.project, Some(&task.id), deps).await?;
        set_doc.insert("dependencies", deps);
        changed.push("dependencies");
    }

    let mut new_assignee: Option<String> = None;
    if let Some(raw) = payload.assignee.as_deref() {
        if raw.is_empty() {
            set_doc.insert("assignee", Bson::Null);
            activity.push(ActivityEntry::new(ActivityAction::Assigned, &user.id, None));
        } else {
            let id = parse_id(raw)?;
            ensure_assignable(&project, &id)?;
            if task.assignee.as_deref() != Some(id.as_str()) {
                activity.push(ActivityEntry::new(ActivityAction::Assigned, &user.id, Some(id.clone())));
                new_assignee = Some(id.clone());
            }
            set_doc.insert("assignee", id);
        }
    }

    let status_changed = payload.status.filter(|s| *s != task.status);
    if let Some(status) = status_changed {
        let mut scratch = task.clone();
        scratch.set_status(status, now);
        set_doc.insert("status", status.as_str());
        set_doc.insert("completed_at", timestamp::bson_opt(scratch.completed_at.as_ref()));
        activity.push(ActivityEntry::new(
            ActivityAction::StatusChanged,
            &user.id,
            Some(format!("{} -> {}", task.status.as_str(), status.as_str())),
        ));
    }

    if set_doc.is_empty() {
        return Err(AppError::validation("No fields to update"));
    }
    if !changed.is_empty() {
        activity.push(ActivityEntry::new(ActivityAction::Updated, &user.id, Some(changed.join(", "))));
    }
    set_doc.insert("updated_at", timestamp::bson(&now));

    let mut update = doc! { "$set": set_doc };
    if !activity.is_empty() {
        update.insert("$push", doc! { "activity": { "$each": to_bson(&activity)? } });
    }
    let updated = data
        .mongodb
        .tasks()
        .find_one_and_update(doc! { "_id": &task_id }, update)
        .return_document(ReturnDocument::After)
        .await?
        .ok_or_else(|| AppError::not_found("Task"))?;

    if status_changed.is_some() {
        sync_project_progress(&data, &updated.project).await;
        notify_all(&data, status_notifications(&updated, &user.id)).await;
    }
    if let Some(assignee) = &new_assignee {
        notify(&data, assignment_notification(&updated, assignee, &user.id)).await;
    }

    data.emit(project_topic(&updated.project), EventKind::TaskUpdated, &updated);
    Ok(response::ok("Task updated", TaskView::from(updated)))
}

/// PATCH /api/tasks/{id}/status
///
/// Any project member may move a task to any status.
pub async fn update_status(
    user: AuthUser,
    data: web::Data<AppState>,
    path: web::Path<String>,
    payload: web::Json<StatusRequest>,
) -> Result<HttpResponse, AppError> {
    let task_id = parse_id(&path.into_inner())?;
    let (mut task, _) = task_for_member(&data, &task_id, &user.id).await?;

    let previous = task.set_status(payload.status, Utc::now());
    if previous == task.status {
        return Ok(response::ok("Task status unchanged", TaskView::from(task)));
    }
    let entry = ActivityEntry::new(
        ActivityAction::StatusChanged,
        &user.id,
        Some(format!("{} -> {}", previous.as_str(), task.status.as_str())),
    );

    data.mongodb
        .tasks()
        .update_one(
            doc! { "_id": &task_id },
            doc! {
                "$set": {
                    "status": task.status.as_str(),
                    "completed_at": timestamp::bson_opt(task.completed_at.as_ref()),
                    "updated_at": timestamp::bson(&task.updated_at),
                },
                "$push": { "activity": to_bson(&entry)? },
            },
        )
        .await?;
    task.activity.push(entry);

    let progress = sync_project_progress(&data, &task.project).await;
    notify_all(&data, status_notifications(&task, &user.id)).await;

    data.emit(
        project_topic(&task.project),
        EventKind::TaskStatusChanged,
        &json!({
            "task_id": task.id,
            "status": task.status,
            "previous_status": previous,
            "changed_by": user.id,
            "project_progress": progress,
        }),
    );
    Ok(response::ok("Task status updated", TaskView::from(task)))
}

/// DELETE /api/tasks/{id}
///
/// The task is removed first; pulling it from other tasks' dependency lists
/// and recomputing progress are separate, non-atomic follow-up writes.
pub async fn delete_task(
    user: AuthUser,
    data: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let task_id = parse_id(&path.into_inner())?;
    let (task, project) = task_for_member(&data, &task_id, &user.id).await?;
    if !(project.has_permission(&user.id, Permission::DeleteTasks) || task.created_by == user.id) {
        return Err(AppError::forbidden("You do not have permission to delete this task"));
    }

    let result = data.mongodb.tasks().delete_one(doc! { "_id": &task_id }).await?;
    if result.deleted_count == 0 {
        return Err(AppError::not_found("Task"));
    }

    let (filter, pull) = dependency_cleanup(&task.project, &task_id);
    match data.mongodb.tasks().update_many(filter, pull).await {
        Ok(res) => debug!("Removed task {} from {} dependency lists", task_id, res.modified_count),
        Err(e) => error!("Error removing task {} from dependency lists: {}", task_id, e),
    }
    sync_project_progress(&data, &task.project).await;
    info!("Task deleted {}", task_id);

    data.emit(
        project_topic(&task.project),
        EventKind::TaskDeleted,
        &json!({ "task_id": task_id, "project_id": task.project }),
    );
    Ok(response::message_only("Task deleted"))
}

/// POST /api/tasks/{id}/comments
pub async fn add_comment(
    user: AuthUser,
    data: web::Data<AppState>,
    path: web::Path<String>,
    payload: web::Json<CommentRequest>,
) -> Result<HttpResponse, AppError> {
    let task_id = parse_id(&path.into_inner())?;
    let (task, project) = task_for_member(&data, &task_id, &user.id).await?;
    require_len("Comment", &payload.content, 1, 2000)?;

    let comment = Comment::new(&user.id, &payload.content);
    let entry = ActivityEntry::new(ActivityAction::Commented, &user.id, None);
    data.mongodb
        .tasks()
        .update_one(
            doc! { "_id": &task_id },
            doc! {
                "$push": { "comments": to_bson(&comment)?, "activity": to_bson(&entry)? },
                "$set": { "updated_at": now_bson() },
            },
        )
        .await?;

    let mentioned = resolve_mentions(&data, &project, &comment.content).await?;
    let mut batch: Vec<NewNotification> = task
        .interested_users()
        .iter()
        .filter(|u| u.as_str() != user.id && !mentioned.contains(*u))
        .map(|u| {
            NewNotification::new(
                u,
                NotificationKind::TaskComment,
                "New comment",
                format!("New comment on {}", task.title),
            )
            .from_user(&user.id)
            .in_project(&task.project)
            .about_task(&task.id)
        })
        .collect();
    batch.extend(mentioned.iter().map(|u| {
        NewNotification::new(
            u,
            NotificationKind::Mention,
            "You were mentioned",
            format!("You were mentioned in a comment on {}", task.title),
        )
        .from_user(&user.id)
        .in_project(&task.project)
        .about_task(&task.id)
    }));
    notify_all(&data, batch).await;

    data.emit(
        project_topic(&task.project),
        EventKind::TaskCommentAdded,
        &json!({ "task_id": task.id, "comment": comment }),
    );
    Ok(response::created("Comment added", comment))
}

/// DELETE /api/tasks/{id}/comments/{comment_id}
pub async fn delete_comment(
    user: AuthUser,
    data: web::Data<AppState>,
    path: web::Path<(String, String)>,
) -> Result<HttpResponse, AppError> {
    let (task_id, comment_id) = path.into_inner();
    let task_id = parse_id(&task_id)?;
    let comment_id = parse_id(&comment_id)?;
    let (task, project) = task_for_member(&data, &task_id, &user.id).await?;

    let comment = task
        .comments
        .iter()
        .find(|c| c.id == comment_id)
        .ok_or_else(|| AppError::not_found("Comment"))?;
    if comment.author != user.id && !project.has_permission(&user.id, Permission::EditTasks) {
        return Err(AppError::forbidden("You can only delete your own comments"));
    }

    let entry = ActivityEntry::new(ActivityAction::CommentRemoved, &user.id, None);
    data.mongodb
        .tasks()
        .update_one(
            doc! { "_id": &task_id },
            doc! {
                "$pull": { "comments": { "id": &comment_id } },
                "$push": { "activity": to_bson(&entry)? },
                "$set": { "updated_at": now_bson() },
            },
        )
        .await?;

    data.emit(
        project_topic(&task.project),
        EventKind::TaskCommentDeleted,
        &json!({ "task_id": task.id, "comment_id": comment_id }),
    );
    Ok(response::message_only("Comment deleted"))
}

/// POST /api/tasks/{id}/subtasks
pub async fn add_subtask(
    user: AuthUser,
    data: web::Data<AppState>,
    path: web::Path<String>,
    payload: web::Json<SubtaskRequest>,
) -> Result<HttpResponse, AppError> {
    let task_id = parse_id(&path.into_inner())?;
    let (mut task, project) = task_for_member(&data, &task_id, &user.id).await?;
    if !can_edit_task(&project, &task, &user.id) {
        return Err(AppError::forbidden("You do not have permission to edit this task"));
    }
    require_len("Subtask title", &payload.title, 1, 200)?;

    let subtask = Subtask::new(&payload.title);
    task.record(ActivityAction::SubtaskAdded, &user.id, Some(subtask.title.clone()));
    task.subtasks.push(subtask);
    task.updated_at = Utc::now();
    save_task(&data, &task).await?;

    data.emit(project_topic(&task.project), EventKind::TaskUpdated, &task);
    Ok(response::created("Subtask added", TaskView::from(task)))
}

/// PATCH /api/tasks/{id}/subtasks/{subtask_id}
pub async fn update_subtask(
    user: AuthUser,
    data: web::Data<AppState>,
    path: web::Path<(String, String)>,
    payload: web::Json<UpdateSubtaskRequest>,
) -> Result<HttpResponse, AppError> {
    let (task_id, subtask_id) = path.into_inner();
    let task_id = parse_id(&task_id)?;
    let subtask_id = parse_id(&subtask_id)?;
    let (mut task, project) = task_for_member(&data, &task_id, &user.id).await?;
    if !can_edit_task(&project, &task, &user.id) {
        return Err(AppError::forbidden("You do not have permission to edit this task"));
    }
    if let Some(title) = &payload.title {
        require_len("Subtask title", title, 1, 200)?;
    }

    let now = Utc::now();
    let subtask = task
        .subtasks
        .iter_mut()
        .find(|s| s.id == subtask_id)
        .ok_or_else(|| AppError::not_found("Subtask"))?;
    if let Some(title) = &payload.title {
        subtask.title = title.trim().to_string();
    }
    if let Some(completed) = payload.completed {
        subtask.set_completed(completed, now);
    }
    let label = subtask.title.clone();
    task.record(ActivityAction::SubtaskUpdated, &user.id, Some(label));
    task.updated_at = now;
    save_task(&data, &task).await?;

    data.emit(project_topic(&task.project), EventKind::TaskUpdated, &task);
    Ok(response::ok("Subtask updated", TaskView::from(task)))
}

/// DELETE /api/tasks/{id}/subtasks/{subtask_id}
pub async fn delete_subtask(
    user: AuthUser,
    data: web::Data<AppState>,
    path: web::Path<(String, String)>,
) -> Result<HttpResponse, AppError> {
    let (task_id, subtask_id) = path.into_inner();
    let task_id = parse_id(&task_id)?;
    let subtask_id = parse_id(&subtask_id)?;
    let (mut task, project) = task_for_member(&data, &task_id, &user.id).await?;
    if !can_edit_task(&project, &task, &user.id) {
        return Err(AppError::forbidden("You do not have permission to edit this task"));
    }

    let pos = task
        .subtasks
        .iter()
        .position(|s| s.id == subtask_id)
        .ok_or_else(|| AppError::not_found("Subtask"))?;
    let removed = task.subtasks.remove(pos);
    task.record(ActivityAction::SubtaskRemoved, &user.id, Some(removed.title));
    task.updated_at = Utc::now();
    save_task(&data, &task).await?;

    data.emit(project_topic(&task.project), EventKind::TaskUpdated, &task);
    Ok(response::ok("Subtask removed", TaskView::from(task)))
}

/// POST /api/tasks/{id}/watch toggles the caller in the watcher list.
pub async fn toggle_watch(
    user: AuthUser,
    data: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let task_id = parse_id(&path.into_inner())?;
    let (mut task, _) = task_for_member(&data, &task_id, &user.id).await?;

    let watching = task.toggle_watcher(&user.id);
    let action = if watching { ActivityAction::WatcherAdded } else { ActivityAction::WatcherRemoved };
    task.record(action, &user.id, None);
    save_task(&data, &task).await?;

    let message = if watching { "Watching task" } else { "Stopped watching task" };
    Ok(response::ok(message, json!({ "watching": watching, "watchers": task.watchers })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::project::{MemberRole, ProjectMember};
    use chrono::Duration;

    fn project_with_team() -> Project {
        let mut project = Project::new("Apollo", "owner");
        project.members.push(ProjectMember::new("dev", MemberRole::Member));
        project.members.push(ProjectMember::new("viewer", MemberRole::Viewer));
        project
    }

    #[test]
    fn creator_and_assignee_may_edit_without_permission() {
        let project = project_with_team();
        let mut task = Task::new(&project.id, "t", "viewer");
        assert!(can_edit_task(&project, &task, "viewer"));
        task.created_by = "owner".into();
        assert!(!can_edit_task(&project, &task, "viewer"));
        task.assignee = Some("viewer".into());
        assert!(can_edit_task(&project, &task, "viewer"));
        assert!(can_edit_task(&project, &task, "dev"));
    }

    #[test]
    fn assignees_must_be_members() {
        let project = project_with_team();
        assert!(ensure_assignable(&project, "dev").is_ok());
        assert!(ensure_assignable(&project, "owner").is_ok());
        assert!(ensure_assignable(&project, "stranger").is_err());
    }

    #[test]
    fn hours_must_be_non_negative() {
        assert!(validate_hours("Estimated hours", Some(3.5)).is_ok());
        assert!(validate_hours("Estimated hours", None).is_ok());
        assert!(validate_hours("Estimated hours", Some(-1.0)).is_err());
        assert!(validate_hours("Estimated hours", Some(f64::NAN)).is_err());
    }

    #[test]
    fn status_notifications_skip_actor() {
        let mut task = Task::new("p1", "Ship it", "creator");
        task.assignee = Some("dev".into());
        task.watchers.push("qa".into());
        task.set_status(TaskStatus::Completed, Utc::now());

        let batch = status_notifications(&task, "dev");
        let recipients: Vec<&str> = batch.iter().map(|n| n.recipient.as_str()).collect();
        assert_eq!(recipients, vec!["creator", "qa"]);
        assert!(batch.iter().all(|n| n.kind == NotificationKind::TaskCompleted));
        assert!(batch.iter().all(|n| n.task.as_deref() == Some(task.id.as_str())));

        task.set_status(TaskStatus::Review, Utc::now());
        let batch = status_notifications(&task, "dev");
        assert!(batch.iter().all(|n| n.kind == NotificationKind::TaskUpdated));
    }

    #[test]
    fn completing_every_task_reaches_full_progress() {
        let now = Utc::now();
        let mut tasks: Vec<Task> = (0..4).map(|i| Task::new("p1", &format!("t{}", i), "u")).collect();
        tasks[0].set_status(TaskStatus::Completed, now);

        let mut project = project_with_team();
        let completed = |tasks: &[Task]| {
            tasks.iter().filter(|t| t.status == TaskStatus::Completed).count() as u64
        };
        project.apply_task_counts(tasks.len() as u64, completed(&tasks));
        assert_eq!(project.progress, 25);

        for task in tasks.iter_mut() {
            task.set_status(TaskStatus::Completed, now);
        }
        project.apply_task_counts(tasks.len() as u64, completed(&tasks));
        let set = task_counts_update(&project);
        let set = set.get_document("$set").unwrap();
        assert_eq!(set.get_i32("progress").unwrap(), 100);
        assert_eq!(set.get_i64("task_count").unwrap(), 4);
        assert_eq!(set.get_i64("completed_task_count").unwrap(), 4);

        // Counting matches the stored status string.
        assert_eq!(
            to_bson(&TaskStatus::Completed).unwrap(),
            Bson::from(TaskStatus::Completed.as_str())
        );
    }

    #[test]
    fn deleted_task_is_pulled_from_sibling_dependencies() {
        let (filter, update) = dependency_cleanup("p1", "t9");
        assert_eq!(filter, doc! { "project": "p1", "dependencies": "t9" });
        assert_eq!(update, doc! { "$pull": { "dependencies": "t9" } });
    }

    #[test]
    fn task_view_derives_fields() {
        let mut task = Task::new("p1", "t", "u");
        task.due_date = Some(Utc::now() - Duration::days(2));
        task.subtasks.push(Subtask::new("a"));
        task.subtasks[0].set_completed(true, Utc::now());
        let view = TaskView::from(task);
        assert!(view.is_overdue);
        assert_eq!(view.subtask_progress, 100);
        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["title"], "t");
        assert_eq!(json["subtask_progress"], 100);
    }

    #[test]
    fn update_request_distinguishes_unassign() {
        let req: UpdateTaskRequest = serde_json::from_str(r#"{"assignee":""}"#).unwrap();
        assert_eq!(req.assignee.as_deref(), Some(""));
        let req: UpdateTaskRequest = serde_json::from_str(r#"{"status":"in_progress"}"#).unwrap();
        assert_eq!(req.status, Some(TaskStatus::InProgress));
        assert!(req.assignee.is_none());
    }
}
