// src/users.rs

use actix_web::{web, HttpResponse};
use futures::stream::TryStreamExt;
use log::info;
use mongodb::bson::{doc, Document};
use mongodb::options::ReturnDocument;
use serde::Deserialize;

use crate::app_state::AppState;
use crate::auth::{hash_password, verify_password, AuthUser};
use crate::error::AppError;
use crate::models::now_bson;
use crate::models::user::{PublicUser, User};
use crate::response;
use crate::validation::{parse_id, require_len, validate_password};

const SEARCH_LIMIT: i64 = 20;

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    pub q: String,
}

#[derive(Debug, Deserialize)]
pub struct UpdateProfileRequest {
    pub full_name: Option<String>,
    pub avatar: Option<String>,
    pub bio: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ChangePasswordRequest {
    pub current_password: String,
    pub new_password: String,
}

fn search_filter(term: &str, exclude: &str) -> Document {
    let pattern = regex::escape(term);
    doc! {
        "_id": { "$ne": exclude },
        "is_active": true,
        "$or": [
            { "username": { "$regex": &pattern, "$options": "i" } },
            { "email": { "$regex": &pattern, "$options": "i" } },
            { "full_name": { "$regex": &pattern, "$options": "i" } },
        ],
    }
}

/// GET /api/users/search?q=
pub async fn search_users(
    user: AuthUser,
    data: web::Data<AppState>,
    query: web::Query<SearchQuery>,
) -> Result<HttpResponse, AppError> {
    let term = query.q.trim();
    require_len("Search query", term, 1, 100)?;

    let users: Vec<User> = data
        .mongodb
        .users()
        .find(search_filter(term, &user.id))
        .sort(doc! { "username": 1 })
        .limit(SEARCH_LIMIT)
        .await?
        .try_collect()
        .await?;
    let users: Vec<PublicUser> = users.into_iter().map(PublicUser::from).collect();
    Ok(response::ok("Users retrieved", users))
}

/// GET /api/users/{id}
pub async fn get_user(
    _user: AuthUser,
    data: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let id = parse_id(&path.into_inner())?;
    let found = data
        .mongodb
        .users()
        .find_one(doc! { "_id": &id })
        .await?
        .ok_or_else(|| AppError::not_found("User"))?;
    Ok(response::ok("User retrieved", PublicUser::from(found)))
}

/// PUT /api/users/me
pub async fn update_profile(
    user: AuthUser,
    data: web::Data<AppState>,
    payload: web::Json<UpdateProfileRequest>,
) -> Result<HttpResponse, AppError> {
    let mut set_doc = Document::new();
    if let Some(name) = &payload.full_name {
        require_len("Full name", name, 1, 100)?;
        set_doc.insert("full_name", name.trim());
    }
    if let Some(avatar) = &payload.avatar {
        require_len("Avatar", avatar, 0, 500)?;
        set_doc.insert("avatar", avatar.trim());
    }
    if let Some(bio) = &payload.bio {
        require_len("Bio", bio, 0, 500)?;
        set_doc.insert("bio", bio.trim());
    }
    if set_doc.is_empty() {
        return Err(AppError::validation("No fields to update"));
    }
    set_doc.insert("updated_at", now_bson());

    let updated = data
        .mongodb
        .users()
        .find_one_and_update(doc! { "_id": &user.id }, doc! { "$set": set_doc })
        .return_document(ReturnDocument::After)
        .await?
        .ok_or_else(|| AppError::not_found("User"))?;
    Ok(response::ok("Profile updated", PublicUser::from(updated)))
}

/// PUT /api/users/me/password
///
/// Signs the user out everywhere by dropping all stored refresh tokens.
pub async fn change_password(
    user: AuthUser,
    data: web::Data<AppState>,
    payload: web::Json<ChangePasswordRequest>,
) -> Result<HttpResponse, AppError> {
    validate_password(&payload.new_password)?;
    if payload.current_password == payload.new_password {
        return Err(AppError::validation("New password must differ from the current password"));
    }

    let users = data.mongodb.users();
    let found = users
        .find_one(doc! { "_id": &user.id })
        .await?
        .ok_or_else(|| AppError::not_found("User"))?;
    if !verify_password(payload.current_password.clone(), found.password_hash).await? {
        return Err(AppError::Unauthorized("Current password is incorrect".to_string()));
    }

    let password_hash = hash_password(payload.new_password.clone(), data.config.bcrypt_cost).await?;
    users
        .update_one(
            doc! { "_id": &user.id },
            doc! { "$set": {
                "password_hash": password_hash,
                "refresh_tokens": [],
                "updated_at": now_bson(),
            } },
        )
        .await?;
    info!("Password changed for {}", user.id);
    Ok(response::message_only("Password changed. Please log in again."))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_filter_escapes_the_term() {
        let filter = search_filter("a.b*", "me");
        let clauses = filter.get_array("$or").unwrap();
        assert_eq!(clauses.len(), 3);
        let username = clauses[0].as_document().unwrap().get_document("username").unwrap();
        assert_eq!(username.get_str("$regex").unwrap(), r"a\.b\*");
        assert_eq!(username.get_str("$options").unwrap(), "i");
        assert_eq!(filter.get_document("_id").unwrap().get_str("$ne").unwrap(), "me");
    }

    #[test]
    fn profile_update_fields_are_optional() {
        let req: UpdateProfileRequest = serde_json::from_str(r#"{"bio":"hi"}"#).unwrap();
        assert!(req.full_name.is_none());
        assert_eq!(req.bio.as_deref(), Some("hi"));
    }
}
