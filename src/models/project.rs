use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Roles a user can hold within a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberRole {
    Owner,
    Admin,
    Member,
    Viewer,
}

impl MemberRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemberRole::Owner => "owner",
            MemberRole::Admin => "admin",
            MemberRole::Member => "member",
            MemberRole::Viewer => "viewer",
        }
    }
}

/// Flat per-member capability flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberPermissions {
    pub can_create_tasks: bool,
    pub can_edit_tasks: bool,
    pub can_delete_tasks: bool,
    pub can_manage_members: bool,
}

impl MemberPermissions {
    pub fn for_role(role: MemberRole) -> Self {
        match role {
            MemberRole::Owner | MemberRole::Admin => MemberPermissions {
                can_create_tasks: true,
                can_edit_tasks: true,
                can_delete_tasks: true,
                can_manage_members: true,
            },
            MemberRole::Member => MemberPermissions {
                can_create_tasks: true,
                can_edit_tasks: true,
                can_delete_tasks: false,
                can_manage_members: false,
            },
            MemberRole::Viewer => MemberPermissions {
                can_create_tasks: false,
                can_edit_tasks: false,
                can_delete_tasks: false,
                can_manage_members: false,
            },
        }
    }

    pub fn allows(&self, permission: Permission) -> bool {
        match permission {
            Permission::CreateTasks => self.can_create_tasks,
            Permission::EditTasks => self.can_edit_tasks,
            Permission::DeleteTasks => self.can_delete_tasks,
            Permission::ManageMembers => self.can_manage_members,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    CreateTasks,
    EditTasks,
    DeleteTasks,
    ManageMembers,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectMember {
    pub user: String,
    pub role: MemberRole,
    pub permissions: MemberPermissions,
    #[serde(with = "crate::models::timestamp")]
    pub joined_at: DateTime<Utc>,
}

impl ProjectMember {
    pub fn new(user: &str, role: MemberRole) -> Self {
        ProjectMember {
            user: user.to_string(),
            role,
            permissions: MemberPermissions::for_role(role),
            joined_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Planning,
    Active,
    OnHold,
    Completed,
    Cancelled,
}

impl ProjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectStatus::Planning => "planning",
            ProjectStatus::Active => "active",
            ProjectStatus::OnHold => "on_hold",
            ProjectStatus::Completed => "completed",
            ProjectStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectPriority {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    #[serde(rename = "_id")]
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub owner: String,
    pub members: Vec<ProjectMember>,
    pub status: ProjectStatus,
    pub priority: ProjectPriority,
    #[serde(default, with = "crate::models::timestamp::option")]
    pub start_date: Option<DateTime<Utc>>,
    #[serde(default, with = "crate::models::timestamp::option")]
    pub due_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub color: Option<String>,
    /// Derived from task counts; see [`progress_percent`].
    #[serde(default)]
    pub progress: u8,
    #[serde(default)]
    pub task_count: u64,
    #[serde(default)]
    pub completed_task_count: u64,
    #[serde(default)]
    pub is_archived: bool,
    #[serde(with = "crate::models::timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "crate::models::timestamp")]
    pub updated_at: DateTime<Utc>,
}

impl Project {
    pub const COLLECTION: &'static str = "projects";

    pub fn new(name: &str, owner: &str) -> Self {
        let now = Utc::now();
        Project {
            id: Uuid::new_v4().to_string(),
            name: name.trim().to_string(),
            description: None,
            owner: owner.to_string(),
            members: vec![ProjectMember::new(owner, MemberRole::Owner)],
            status: ProjectStatus::Planning,
            priority: ProjectPriority::Medium,
            start_date: None,
            due_date: None,
            tags: Vec::new(),
            color: None,
            progress: 0,
            task_count: 0,
            completed_task_count: 0,
            is_archived: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn member(&self, user_id: &str) -> Option<&ProjectMember> {
        self.members.iter().find(|m| m.user == user_id)
    }

    pub fn is_owner(&self, user_id: &str) -> bool {
        self.owner == user_id
    }

    pub fn is_member(&self, user_id: &str) -> bool {
        self.is_owner(user_id) || self.member(user_id).is_some()
    }

    pub fn has_permission(&self, user_id: &str, permission: Permission) -> bool {
        if self.is_owner(user_id) {
            return true;
        }
        self.member(user_id)
            .map(|m| m.permissions.allows(permission))
            .unwrap_or(false)
    }

    /// Owners and admins may edit project settings, pin messages, and moderate chat.
    pub fn can_manage_project(&self, user_id: &str) -> bool {
        self.is_owner(user_id)
            || self
                .member(user_id)
                .map(|m| matches!(m.role, MemberRole::Owner | MemberRole::Admin))
                .unwrap_or(false)
    }

    /// Refreshes the denormalized task counters and the progress derived from them.
    pub fn apply_task_counts(&mut self, total: u64, completed: u64) {
        self.task_count = total;
        self.completed_task_count = completed.min(total);
        self.progress = progress_percent(total, completed);
    }

    pub fn member_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.members.iter().map(|m| m.user.clone()).collect();
        if !ids.contains(&self.owner) {
            ids.push(self.owner.clone());
        }
        ids
    }
}

/// Rounded completion percentage; a project with no tasks is at 0.
pub fn progress_percent(total: u64, completed: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    let completed = completed.min(total);
    ((completed as f64 / total as f64) * 100.0).round() as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creator_is_owner_with_full_permissions() {
        let project = Project::new("Apollo", "u1");
        assert!(project.is_owner("u1"));
        assert!(project.is_member("u1"));
        assert!(project.has_permission("u1", Permission::ManageMembers));
        assert!(project.can_manage_project("u1"));
        assert!(!project.is_member("u2"));
    }

    #[test]
    fn permission_bag_is_consulted_for_members() {
        let mut project = Project::new("Apollo", "owner");
        project.members.push(ProjectMember::new("dev", MemberRole::Member));
        project.members.push(ProjectMember::new("guest", MemberRole::Viewer));

        assert!(project.has_permission("dev", Permission::CreateTasks));
        assert!(!project.has_permission("dev", Permission::DeleteTasks));
        assert!(!project.has_permission("guest", Permission::CreateTasks));
        assert!(!project.has_permission("stranger", Permission::CreateTasks));
        assert!(!project.can_manage_project("dev"));

        project.members[1].permissions.can_delete_tasks = true;
        assert!(project.has_permission("dev", Permission::DeleteTasks));
    }

    #[test]
    fn admins_manage_project() {
        let mut project = Project::new("Apollo", "owner");
        project.members.push(ProjectMember::new("lead", MemberRole::Admin));
        assert!(project.can_manage_project("lead"));
        assert!(project.has_permission("lead", Permission::ManageMembers));
    }

    #[test]
    fn progress_is_rounded_percentage() {
        assert_eq!(progress_percent(0, 0), 0);
        assert_eq!(progress_percent(3, 1), 33);
        assert_eq!(progress_percent(3, 2), 67);
        assert_eq!(progress_percent(4, 4), 100);
        assert_eq!(progress_percent(2, 5), 100);
    }

    #[test]
    fn task_counts_drive_progress() {
        let mut project = Project::new("Apollo", "owner");
        project.apply_task_counts(4, 1);
        assert_eq!(project.task_count, 4);
        assert_eq!(project.completed_task_count, 1);
        assert_eq!(project.progress, 25);

        project.apply_task_counts(4, 4);
        assert_eq!(project.progress, 100);

        project.apply_task_counts(0, 0);
        assert_eq!((project.task_count, project.progress), (0, 0));
    }

    #[test]
    fn member_ids_include_owner_once() {
        let mut project = Project::new("Apollo", "owner");
        project.members.push(ProjectMember::new("dev", MemberRole::Member));
        assert_eq!(project.member_ids(), vec!["owner".to_string(), "dev".to_string()]);
    }

    #[test]
    fn status_serializes_snake_case() {
        assert_eq!(serde_json::to_value(ProjectStatus::OnHold).unwrap(), "on_hold");
        assert_eq!(ProjectStatus::OnHold.as_str(), "on_hold");
    }
}
