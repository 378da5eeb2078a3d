// src/projects.rs

use std::collections::HashMap;

use actix_web::{web, HttpResponse};
use chrono::{DateTime, Utc};
use futures::stream::TryStreamExt;
use log::{debug, error, info};
use mongodb::bson::{doc, to_bson, Document};
use mongodb::options::ReturnDocument;
use serde::{Deserialize, Serialize};

use crate::app_state::AppState;
use crate::auth::AuthUser;
use crate::error::AppError;
use crate::event_hub::{project_topic, CloseTopic, EventKind, LeaveUserTopic};
use crate::models::notification::{NewNotification, NotificationKind};
use crate::models::{now_bson, timestamp};
use crate::models::project::{
    MemberPermissions, MemberRole, Permission, Project, ProjectMember, ProjectPriority,
    ProjectStatus,
};
use crate::models::user::{PublicUser, User};
use crate::notifications::{notify, notify_all};
use crate::response;
use crate::validation::{normalize_email, parse_id, require_len};

#[derive(Debug, Deserialize)]
pub struct CreateProjectRequest {
    pub name: String,
    pub description: Option<String>,
    pub status: Option<ProjectStatus>,
    pub priority: Option<ProjectPriority>,
    pub start_date: Option<DateTime<Utc>>,
    pub due_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub color: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateProjectRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub status: Option<ProjectStatus>,
    pub priority: Option<ProjectPriority>,
    pub start_date: Option<DateTime<Utc>>,
    pub due_date: Option<DateTime<Utc>>,
    pub tags: Option<Vec<String>>,
    pub color: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ProjectListQuery {
    pub status: Option<ProjectStatus>,
    pub archived: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct ArchiveRequest {
    pub archived: bool,
}

#[derive(Debug, Deserialize)]
pub struct AddMemberRequest {
    pub user_id: Option<String>,
    pub email: Option<String>,
    pub role: Option<MemberRole>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateMemberRequest {
    pub role: Option<MemberRole>,
    pub permissions: Option<MemberPermissions>,
}

/// A member entry joined with the user's public profile.
#[derive(Debug, Serialize)]
pub struct MemberView {
    pub user: Option<PublicUser>,
    pub user_id: String,
    pub role: MemberRole,
    pub permissions: MemberPermissions,
    #[serde(with = "crate::models::timestamp")]
    pub joined_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct ProjectDetails {
    #[serde(flatten)]
    pub project: Project,
    pub member_profiles: Vec<MemberView>,
}

pub async fn find_project(data: &AppState, project_id: &str) -> Result<Project, AppError> {
    data.mongodb
        .projects()
        .find_one(doc! { "_id": project_id })
        .await?
        .ok_or_else(|| AppError::not_found("Project"))
}

/// Loads a project the caller belongs to: 404 when missing, 403 for outsiders.
pub async fn project_for_member(
    data: &AppState,
    project_id: &str,
    user_id: &str,
) -> Result<Project, AppError> {
    let project = find_project(data, project_id).await?;
    ensure_member(&project, user_id)?;
    Ok(project)
}

pub fn ensure_member(project: &Project, user_id: &str) -> Result<(), AppError> {
    if project.is_member(user_id) {
        Ok(())
    } else {
        Err(AppError::forbidden("You are not a member of this project"))
    }
}

pub fn require_permission(
    project: &Project,
    user_id: &str,
    permission: Permission,
) -> Result<(), AppError> {
    if project.has_permission(user_id, permission) {
        Ok(())
    } else {
        Err(AppError::forbidden(match permission {
            Permission::CreateTasks => "You do not have permission to create tasks",
            Permission::EditTasks => "You do not have permission to edit tasks",
            Permission::DeleteTasks => "You do not have permission to delete tasks",
            Permission::ManageMembers => "You do not have permission to manage members",
        }))
    }
}

fn validate_dates(
    start: Option<DateTime<Utc>>,
    due: Option<DateTime<Utc>>,
) -> Result<(), AppError> {
    match (start, due) {
        (Some(start), Some(due)) if due < start => {
            Err(AppError::validation("Due date must be after the start date"))
        }
        _ => Ok(()),
    }
}

async fn member_profiles(data: &AppState, project: &Project) -> Result<Vec<MemberView>, AppError> {
    let ids = project.member_ids();
    let users: Vec<User> = data
        .mongodb
        .users()
        .find(doc! { "_id": { "$in": ids } })
        .await?
        .try_collect()
        .await?;
    let mut by_id: HashMap<String, PublicUser> =
        users.into_iter().map(|u| (u.id.clone(), PublicUser::from(u))).collect();

    Ok(project
        .members
        .iter()
        .map(|m| MemberView {
            user: by_id.remove(&m.user),
            user_id: m.user.clone(),
            role: m.role,
            permissions: m.permissions,
            joined_at: m.joined_at,
        })
        .collect())
}

/// POST /api/projects
pub async fn create_project(
    user: AuthUser,
    data: web::Data<AppState>,
    payload: web::Json<CreateProjectRequest>,
) -> Result<HttpResponse, AppError> {
    debug!("Received create_project from {} with payload: {:?}", user.id, payload);
    require_len("Project name", &payload.name, 1, 100)?;
    if let Some(desc) = &payload.description {
        require_len("Description", desc, 0, 1000)?;
    }
    validate_dates(payload.start_date, payload.due_date)?;

    let payload = payload.into_inner();
    let mut project = Project::new(&payload.name, &user.id);
    project.description = payload.description;
    project.status = payload.status.unwrap_or(ProjectStatus::Planning);
    project.priority = payload.priority.unwrap_or(ProjectPriority::Medium);
    project.start_date = payload.start_date;
    project.due_date = payload.due_date;
    project.tags = payload.tags;
    project.color = payload.color;

    data.mongodb.projects().insert_one(&project).await?;
    info!("Project created {}", project.id);
    Ok(response::created("Project created successfully", project))
}

/// GET /api/projects
pub async fn list_projects(
    user: AuthUser,
    data: web::Data<AppState>,
    query: web::Query<ProjectListQuery>,
) -> Result<HttpResponse, AppError> {
    let mut filter = doc! {
        "$or": [ { "owner": &user.id }, { "members.user": &user.id } ],
        "is_archived": query.archived.unwrap_or(false),
    };
    if let Some(status) = query.status {
        filter.insert("status", status.as_str());
    }

    let projects: Vec<Project> = data
        .mongodb
        .projects()
        .find(filter)
        .sort(doc! { "updated_at": -1 })
        .await?
        .try_collect()
        .await?;
    Ok(response::ok("Projects retrieved", projects))
}

/// GET /api/projects/{id}
pub async fn get_project(
    user: AuthUser,
    data: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let project_id = parse_id(&path.into_inner())?;
    let project = project_for_member(&data, &project_id, &user.id).await?;
    let member_profiles = member_profiles(&data, &project).await?;
    Ok(response::ok("Project retrieved", ProjectDetails { project, member_profiles }))
}

/// PUT /api/projects/{id}
pub async fn update_project(
    user: AuthUser,
    data: web::Data<AppState>,
    path: web::Path<String>,
    payload: web::Json<UpdateProjectRequest>,
) -> Result<HttpResponse, AppError> {
    let project_id = parse_id(&path.into_inner())?;
    let project = project_for_member(&data, &project_id, &user.id).await?;
    if !project.can_manage_project(&user.id) {
        return Err(AppError::forbidden("Only the project owner or an admin can update it"));
    }

    let mut set_doc = Document::new();
    if let Some(name) = &payload.name {
        require_len("Project name", name, 1, 100)?;
        set_doc.insert("name", name.trim());
    }
    if let Some(desc) = &payload.description {
        require_len("Description", desc, 0, 1000)?;
        set_doc.insert("description", desc.trim());
    }
    if let Some(status) = payload.status {
        set_doc.insert("status", status.as_str());
    }
    if let Some(priority) = payload.priority {
        set_doc.insert("priority", to_bson(&priority)?);
    }
    validate_dates(
        payload.start_date.or(project.start_date),
        payload.due_date.or(project.due_date),
    )?;
    if let Some(start) = &payload.start_date {
        set_doc.insert("start_date", timestamp::bson(start));
    }
    if let Some(due) = &payload.due_date {
        set_doc.insert("due_date", timestamp::bson(due));
    }
    if let Some(tags) = &payload.tags {
        set_doc.insert("tags", tags.clone());
    }
    if let Some(color) = &payload.color {
        set_doc.insert("color", color.clone());
    }
    if set_doc.is_empty() {
        return Err(AppError::validation("No fields to update"));
    }
    set_doc.insert("updated_at", now_bson());

    let updated = data
        .mongodb
        .projects()
        .find_one_and_update(doc! { "_id": &project_id }, doc! { "$set": set_doc })
        .return_document(ReturnDocument::After)
        .await?
        .ok_or_else(|| AppError::not_found("Project"))?;

    if let Some(status) = payload.status.filter(|s| *s != project.status) {
        let batch = updated
            .member_ids()
            .iter()
            .map(|member| {
                NewNotification::new(
                    member,
                    NotificationKind::ProjectUpdate,
                    "Project status changed",
                    format!("{} is now {}", updated.name, status.as_str()),
                )
                .from_user(&user.id)
                .in_project(&updated.id)
            })
            .collect();
        notify_all(&data, batch).await;
    }

    data.emit(project_topic(&updated.id), EventKind::ProjectUpdated, &updated);
    Ok(response::ok("Project updated", updated))
}

/// DELETE /api/projects/{id}
///
/// Tasks, messages, and notifications are removed after the project in
/// separate writes; a failure there leaves orphans but the project is gone.
pub async fn delete_project(
    user: AuthUser,
    data: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let project_id = parse_id(&path.into_inner())?;
    let project = project_for_member(&data, &project_id, &user.id).await?;
    if !project.is_owner(&user.id) {
        return Err(AppError::forbidden("Only the project owner can delete it"));
    }

    let result = data.mongodb.projects().delete_one(doc! { "_id": &project_id }).await?;
    if result.deleted_count == 0 {
        return Err(AppError::not_found("Project"));
    }

    let filter = doc! { "project": &project_id };
    if let Err(e) = data.mongodb.tasks().delete_many(filter.clone()).await {
        error!("Error deleting tasks of project {}: {}", project_id, e);
    }
    if let Err(e) = data.mongodb.messages().delete_many(filter.clone()).await {
        error!("Error deleting messages of project {}: {}", project_id, e);
    }
    if let Err(e) = data.mongodb.notifications().delete_many(filter).await {
        error!("Error deleting notifications of project {}: {}", project_id, e);
    }

    info!("Project deleted {}", project_id);
    data.emit(
        project_topic(&project_id),
        EventKind::ProjectDeleted,
        &serde_json::json!({ "project_id": project_id }),
    );
    data.events.do_send(CloseTopic { topic: project_topic(&project_id) });
    Ok(response::message_only("Project deleted"))
}

/// PUT /api/projects/{id}/archive
pub async fn archive_project(
    user: AuthUser,
    data: web::Data<AppState>,
    path: web::Path<String>,
    payload: web::Json<ArchiveRequest>,
) -> Result<HttpResponse, AppError> {
    let project_id = parse_id(&path.into_inner())?;
    let project = project_for_member(&data, &project_id, &user.id).await?;
    if !project.can_manage_project(&user.id) {
        return Err(AppError::forbidden("Only the project owner or an admin can archive it"));
    }

    let updated = data
        .mongodb
        .projects()
        .find_one_and_update(
            doc! { "_id": &project_id },
            doc! { "$set": { "is_archived": payload.archived, "updated_at": now_bson() } },
        )
        .return_document(ReturnDocument::After)
        .await?
        .ok_or_else(|| AppError::not_found("Project"))?;

    data.emit(project_topic(&updated.id), EventKind::ProjectUpdated, &updated);
    let message = if payload.archived { "Project archived" } else { "Project restored" };
    Ok(response::ok(message, updated))
}

/// POST /api/projects/{id}/members
pub async fn add_member(
    user: AuthUser,
    data: web::Data<AppState>,
    path: web::Path<String>,
    payload: web::Json<AddMemberRequest>,
) -> Result<HttpResponse, AppError> {
    let project_id = parse_id(&path.into_inner())?;
    let project = project_for_member(&data, &project_id, &user.id).await?;
    require_permission(&project, &user.id, Permission::ManageMembers)?;

    let role = payload.role.unwrap_or(MemberRole::Member);
    if role == MemberRole::Owner {
        return Err(AppError::validation("A project has exactly one owner"));
    }

    let filter = match (&payload.user_id, &payload.email) {
        (Some(id), _) => doc! { "_id": parse_id(id)? },
        (None, Some(email)) => doc! { "email": normalize_email(email) },
        (None, None) => return Err(AppError::validation("Provide a user_id or an email")),
    };
    let invitee = data
        .mongodb
        .users()
        .find_one(filter)
        .await?
        .ok_or_else(|| AppError::not_found("User"))?;

    if project.is_member(&invitee.id) {
        return Err(AppError::Conflict("User is already a member of this project".to_string()));
    }

    let member = ProjectMember::new(&invitee.id, role);
    // The $ne guard keeps a concurrent add from producing a duplicate entry.
    let result = data
        .mongodb
        .projects()
        .update_one(
            doc! { "_id": &project_id, "members.user": { "$ne": &invitee.id } },
            doc! {
                "$push": { "members": to_bson(&member)? },
                "$set": { "updated_at": now_bson() },
            },
        )
        .await?;
    if result.matched_count == 0 {
        return Err(AppError::Conflict("User is already a member of this project".to_string()));
    }
    info!("Added {} to project {}", invitee.id, project_id);

    notify(
        &data,
        NewNotification::new(
            &invitee.id,
            NotificationKind::ProjectInvite,
            "Added to project",
            format!("You were added to {} as {}", project.name, role.as_str()),
        )
        .from_user(&user.id)
        .in_project(&project_id),
    )
    .await;

    let view = MemberView {
        user: Some(PublicUser::from(invitee)),
        user_id: member.user.clone(),
        role: member.role,
        permissions: member.permissions,
        joined_at: member.joined_at,
    };
    data.emit(project_topic(&project_id), EventKind::MemberAdded, &view);
    Ok(response::created("Member added", view))
}

/// PUT /api/projects/{id}/members/{user_id}
pub async fn update_member(
    user: AuthUser,
    data: web::Data<AppState>,
    path: web::Path<(String, String)>,
    payload: web::Json<UpdateMemberRequest>,
) -> Result<HttpResponse, AppError> {
    let (project_id, member_id) = path.into_inner();
    let project_id = parse_id(&project_id)?;
    let member_id = parse_id(&member_id)?;
    let project = project_for_member(&data, &project_id, &user.id).await?;
    require_permission(&project, &user.id, Permission::ManageMembers)?;

    if project.is_owner(&member_id) {
        return Err(AppError::forbidden("The project owner's membership cannot be changed"));
    }
    let current = project
        .member(&member_id)
        .ok_or_else(|| AppError::not_found("Member"))?;

    let role = payload.role.unwrap_or(current.role);
    if role == MemberRole::Owner {
        return Err(AppError::validation("A project has exactly one owner"));
    }
    let permissions = match (payload.permissions, payload.role) {
        (Some(permissions), _) => permissions,
        (None, Some(role)) => MemberPermissions::for_role(role),
        (None, None) => return Err(AppError::validation("No fields to update")),
    };

    let updated = data
        .mongodb
        .projects()
        .find_one_and_update(
            doc! { "_id": &project_id, "members.user": &member_id },
            doc! { "$set": {
                "members.$.role": role.as_str(),
                "members.$.permissions": to_bson(&permissions)?,
                "updated_at": now_bson(),
            } },
        )
        .return_document(ReturnDocument::After)
        .await?
        .ok_or_else(|| AppError::not_found("Member"))?;

    data.emit(project_topic(&project_id), EventKind::ProjectUpdated, &updated);
    Ok(response::ok("Member updated", updated))
}

/// DELETE /api/projects/{id}/members/{user_id}
///
/// Members may remove themselves; otherwise `can_manage_members` is needed.
pub async fn remove_member(
    user: AuthUser,
    data: web::Data<AppState>,
    path: web::Path<(String, String)>,
) -> Result<HttpResponse, AppError> {
    let (project_id, member_id) = path.into_inner();
    let project_id = parse_id(&project_id)?;
    let member_id = parse_id(&member_id)?;
    let project = project_for_member(&data, &project_id, &user.id).await?;

    let leaving = member_id == user.id;
    if !leaving {
        require_permission(&project, &user.id, Permission::ManageMembers)?;
    }
    if project.is_owner(&member_id) {
        return Err(AppError::forbidden("The project owner cannot be removed"));
    }
    if project.member(&member_id).is_none() {
        return Err(AppError::not_found("Member"));
    }

    data.mongodb
        .projects()
        .update_one(
            doc! { "_id": &project_id },
            doc! {
                "$pull": { "members": { "user": &member_id } },
                "$set": { "updated_at": now_bson() },
            },
        )
        .await?;

    if let Err(e) = data
        .mongodb
        .tasks()
        .update_many(
            doc! { "project": &project_id, "assignee": &member_id },
            doc! { "$set": { "assignee": null } },
        )
        .await
    {
        error!("Error unassigning tasks of {} in {}: {}", member_id, project_id, e);
    }
    info!("Removed {} from project {}", member_id, project_id);

    if !leaving {
        notify(
            &data,
            NewNotification::new(
                &member_id,
                NotificationKind::MemberRemoved,
                "Removed from project",
                format!("You were removed from {}", project.name),
            )
            .from_user(&user.id)
            .in_project(&project_id),
        )
        .await;
    }

    data.emit(
        project_topic(&project_id),
        EventKind::MemberRemoved,
        &serde_json::json!({ "project_id": project_id, "user_id": member_id }),
    );
    data.events.do_send(LeaveUserTopic { user_id: member_id, topic: project_topic(&project_id) });
    Ok(response::message_only(if leaving { "Left project" } else { "Member removed" }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn due_date_must_follow_start() {
        let now = Utc::now();
        assert!(validate_dates(Some(now), Some(now + Duration::days(1))).is_ok());
        assert!(validate_dates(Some(now), Some(now - Duration::days(1))).is_err());
        assert!(validate_dates(None, Some(now)).is_ok());
    }

    #[test]
    fn require_permission_messages() {
        let mut project = Project::new("Apollo", "owner");
        project.members.push(ProjectMember::new("viewer", MemberRole::Viewer));
        assert!(require_permission(&project, "owner", Permission::DeleteTasks).is_ok());
        let err = require_permission(&project, "viewer", Permission::CreateTasks).unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));
        assert_eq!(err.to_string(), "You do not have permission to create tasks");
    }

    #[test]
    fn outsiders_are_forbidden() {
        use actix_web::{http::StatusCode, ResponseError};

        let mut project = Project::new("Apollo", "owner");
        project.members.push(ProjectMember::new("viewer", MemberRole::Viewer));
        assert!(ensure_member(&project, "owner").is_ok());
        assert!(ensure_member(&project, "viewer").is_ok());

        let err = ensure_member(&project, "stranger").unwrap_err();
        assert_eq!(err.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(err.to_string(), "You are not a member of this project");
    }

    #[test]
    fn member_request_accepts_email_or_id() {
        let req: AddMemberRequest =
            serde_json::from_str(r#"{"email":"dev@example.com","role":"admin"}"#).unwrap();
        assert_eq!(req.role, Some(MemberRole::Admin));
        assert!(req.user_id.is_none());
    }
}
