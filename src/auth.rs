use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use actix_web::{
    body::{BoxBody, MessageBody},
    dev::{Payload, Service, ServiceRequest, ServiceResponse, Transform},
    http::{self, Method},
    web, Error, FromRequest, HttpMessage, HttpRequest, HttpResponse, ResponseError,
};
use bcrypt::{hash, verify};
use chrono::{Duration, Utc};
use futures::future::{ok, ready, Ready};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use log::{info, warn};
use mongodb::bson::{doc, Document};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::app_state::AppState;
use crate::config::Config;
use crate::error::AppError;
use crate::models::{now_bson, timestamp};
use crate::models::user::{PublicUser, User};
use crate::response;
use crate::validation::{
    normalize_email, require_len, validate_email, validate_password, validate_username,
};

/// Refresh tokens kept per user; older ones fall off as new sessions log in.
const MAX_REFRESH_TOKENS: i32 = 10;

/// Paths reachable without an access token.
const PUBLIC_PATHS: &[&str] = &[
    "/health",
    "/ws",
    "/api/auth/register",
    "/api/auth/login",
    "/api/auth/refresh",
    "/api/auth/forgot-password",
    "/api/auth/reset-password",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    Access,
    Refresh,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: usize,
    pub iat: usize,
    pub kind: TokenKind,
    pub jti: String,
}

pub fn create_jwt(
    user_id: &str,
    kind: TokenKind,
    ttl: Duration,
    secret: &str,
) -> Result<String, AppError> {
    let now = Utc::now();
    let claims = Claims {
        sub: user_id.to_string(),
        exp: (now + ttl).timestamp() as usize,
        iat: now.timestamp() as usize,
        kind,
        jti: Uuid::new_v4().to_string(),
    };
    Ok(encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_ref()))?)
}

pub fn validate_jwt(token: &str, kind: TokenKind, secret: &str) -> Result<Claims, AppError> {
    let token_data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_ref()),
        &Validation::default(),
    )?;
    if token_data.claims.kind != kind {
        return Err(AppError::InvalidToken);
    }
    Ok(token_data.claims)
}

pub fn access_token(user_id: &str, config: &Config) -> Result<String, AppError> {
    create_jwt(
        user_id,
        TokenKind::Access,
        Duration::hours(config.jwt_expiry_hours),
        &config.jwt_secret,
    )
}

pub fn refresh_token(user_id: &str, config: &Config) -> Result<String, AppError> {
    create_jwt(
        user_id,
        TokenKind::Refresh,
        Duration::days(config.refresh_expiry_days),
        &config.jwt_secret,
    )
}

pub fn hash_reset_token(token: &str) -> String {
    format!("{:x}", Sha256::digest(token.as_bytes()))
}

pub async fn hash_password(password: String, cost: u32) -> Result<String, AppError> {
    web::block(move || hash(password, cost))
        .await
        .map_err(|e| AppError::Internal(e.to_string()))?
        .map_err(AppError::from)
}

pub async fn verify_password(password: String, password_hash: String) -> Result<bool, AppError> {
    web::block(move || verify(password, &password_hash))
        .await
        .map_err(|e| AppError::Internal(e.to_string()))?
        .map_err(AppError::from)
}

/// The authenticated caller, placed in request extensions by [`Authentication`].
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub id: String,
}

impl FromRequest for AuthUser {
    type Error = AppError;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        ready(
            req.extensions()
                .get::<AuthUser>()
                .cloned()
                .ok_or_else(|| AppError::Unauthorized("Authentication required".to_string())),
        )
    }
}

#[derive(Debug)]
pub struct Authentication;

impl<S, B> Transform<S, ServiceRequest> for Authentication
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: MessageBody + 'static,
{
    type Response = ServiceResponse<BoxBody>;
    type Error = Error;
    type Transform = AuthMiddleware<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ok(AuthMiddleware { service })
    }
}

pub struct AuthMiddleware<S> {
    service: S,
}

fn is_public(method: &Method, path: &str) -> bool {
    *method == Method::OPTIONS || PUBLIC_PATHS.contains(&path.trim_end_matches('/'))
}

fn authenticate(req: &ServiceRequest) -> Result<AuthUser, AppError> {
    let secret = req
        .app_data::<web::Data<AppState>>()
        .map(|state| state.config.jwt_secret.clone())
        .ok_or_else(|| AppError::Internal("application state missing".to_string()))?;

    let header = req
        .headers()
        .get(http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| AppError::Unauthorized("Authentication required".to_string()))?;

    let token = header
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| AppError::Unauthorized("Authentication required".to_string()))?;

    let claims = validate_jwt(token, TokenKind::Access, &secret)?;
    Ok(AuthUser { id: claims.sub })
}

impl<S, B> Service<ServiceRequest> for AuthMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: MessageBody + 'static,
{
    type Response = ServiceResponse<BoxBody>;
    type Error = Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>>>>;

    fn poll_ready(&self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.service.poll_ready(cx)
    }

    fn call(&self, req: ServiceRequest) -> Self::Future {
        if !is_public(req.method(), req.path()) {
            match authenticate(&req) {
                Ok(user) => {
                    req.extensions_mut().insert(user);
                }
                Err(e) => {
                    warn!("Rejected {} {}: {}", req.method(), req.path(), e);
                    let (req_parts, _payload) = req.into_parts();
                    let srv_resp = ServiceResponse::new(req_parts, e.error_response());
                    return Box::pin(async move { Ok(srv_resp) });
                }
            }
        }

        let fut = self.service.call(req);
        Box::pin(async move {
            let res = fut.await?;
            Ok(res.map_into_boxed_body())
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub email: String,
    pub password: String,
    pub full_name: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    /// Email address or username.
    #[serde(alias = "email", alias = "username")]
    pub identifier: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Debug, Deserialize)]
pub struct LogoutRequest {
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub all: bool,
}

#[derive(Debug, Deserialize)]
pub struct ForgotPasswordRequest {
    pub email: String,
}

#[derive(Debug, Deserialize)]
pub struct ResetPasswordRequest {
    pub token: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct AuthPayload {
    pub user: PublicUser,
    pub token: String,
    pub refresh_token: String,
}

/// Filter and update that remove `token` from the user's list only if it is
/// still there.
fn consume_refresh_token(user_id: &str, token: &str) -> (Document, Document) {
    (
        doc! { "_id": user_id, "refresh_tokens": token },
        doc! { "$pull": { "refresh_tokens": token } },
    )
}

async fn remember_refresh_token(
    data: &AppState,
    user_id: &str,
    token: &str,
) -> Result<(), AppError> {
    data.mongodb
        .users()
        .update_one(
            doc! { "_id": user_id },
            doc! { "$push": { "refresh_tokens": { "$each": [token], "$slice": -MAX_REFRESH_TOKENS } } },
        )
        .await?;
    Ok(())
}

/// POST /api/auth/register
pub async fn register(
    data: web::Data<AppState>,
    payload: web::Json<RegisterRequest>,
) -> Result<HttpResponse, AppError> {
    validate_username(&payload.username)?;
    validate_email(&payload.email)?;
    validate_password(&payload.password)?;
    require_len("Full name", &payload.full_name, 1, 100)?;

    let email = normalize_email(&payload.email);
    let users = data.mongodb.users();
    if let Some(existing) = users
        .find_one(doc! { "$or": [ { "email": &email }, { "username": payload.username.trim() } ] })
        .await?
    {
        let field = if existing.email == email { "Email" } else { "Username" };
        return Err(AppError::Conflict(format!("{} is already taken", field)));
    }

    let password_hash = hash_password(payload.password.clone(), data.config.bcrypt_cost).await?;
    let mut user = User::new(&payload.username, &email, &payload.full_name, password_hash);
    let token = access_token(&user.id, &data.config)?;
    let refresh = refresh_token(&user.id, &data.config)?;
    user.refresh_tokens.push(refresh.clone());

    users.insert_one(&user).await?;
    info!("User registered {}", user.id);

    Ok(response::created(
        "User registered successfully",
        AuthPayload { user: user.into(), token, refresh_token: refresh },
    ))
}

/// POST /api/auth/login
pub async fn login(
    data: web::Data<AppState>,
    payload: web::Json<LoginRequest>,
) -> Result<HttpResponse, AppError> {
    require_len("Email or username", &payload.identifier, 1, 254)?;
    require_len("Password", &payload.password, 1, 128)?;

    let identifier = payload.identifier.trim();
    let users = data.mongodb.users();
    let user = users
        .find_one(doc! { "$or": [
            { "email": normalize_email(identifier) },
            { "username": identifier },
        ] })
        .await?
        .ok_or_else(|| AppError::Unauthorized("Invalid credentials".to_string()))?;

    if !verify_password(payload.password.clone(), user.password_hash.clone()).await? {
        return Err(AppError::Unauthorized("Invalid credentials".to_string()));
    }
    if !user.is_active {
        return Err(AppError::forbidden("Account is deactivated"));
    }

    let token = access_token(&user.id, &data.config)?;
    let refresh = refresh_token(&user.id, &data.config)?;
    users
        .update_one(doc! { "_id": &user.id }, doc! { "$set": { "last_login": now_bson() } })
        .await?;
    remember_refresh_token(&data, &user.id, &refresh).await?;
    info!("User logged in {}", user.id);

    let mut user = user;
    user.last_login = Some(Utc::now());
    Ok(response::ok(
        "Login successful",
        AuthPayload { user: user.into(), token, refresh_token: refresh },
    ))
}

/// POST /api/auth/refresh
pub async fn refresh(
    data: web::Data<AppState>,
    payload: web::Json<RefreshRequest>,
) -> Result<HttpResponse, AppError> {
    let claims = validate_jwt(&payload.refresh_token, TokenKind::Refresh, &data.config.jwt_secret)?;
    // One write consumes the token; a concurrent replay finds nothing to pull.
    let (filter, consume) = consume_refresh_token(&claims.sub, &payload.refresh_token);
    let user = data
        .mongodb
        .users()
        .find_one_and_update(filter, consume)
        .await?
        .ok_or_else(|| AppError::Unauthorized("Refresh token has been revoked".to_string()))?;
    if !user.is_active {
        return Err(AppError::forbidden("Account is deactivated"));
    }

    let token = access_token(&user.id, &data.config)?;
    let rotated = refresh_token(&user.id, &data.config)?;
    remember_refresh_token(&data, &user.id, &rotated).await?;

    Ok(response::ok(
        "Token refreshed",
        json!({ "token": token, "refresh_token": rotated }),
    ))
}

/// POST /api/auth/logout
pub async fn logout(
    user: AuthUser,
    data: web::Data<AppState>,
    payload: Option<web::Json<LogoutRequest>>,
) -> Result<HttpResponse, AppError> {
    let update = match payload.map(|p| p.into_inner()) {
        Some(LogoutRequest { all: true, .. }) => doc! { "$set": { "refresh_tokens": [] } },
        Some(LogoutRequest { refresh_token: Some(token), .. }) => {
            doc! { "$pull": { "refresh_tokens": token } }
        }
        _ => return Ok(response::message_only("Logged out")),
    };
    data.mongodb.users().update_one(doc! { "_id": &user.id }, update).await?;
    info!("User logged out {}", user.id);
    Ok(response::message_only("Logged out"))
}

/// POST /api/auth/forgot-password
pub async fn forgot_password(
    data: web::Data<AppState>,
    payload: web::Json<ForgotPasswordRequest>,
) -> Result<HttpResponse, AppError> {
    validate_email(&payload.email)?;
    let message = "If that email is registered, a password reset token has been issued";

    let users = data.mongodb.users();
    let Some(user) = users.find_one(doc! { "email": normalize_email(&payload.email) }).await? else {
        return Ok(response::message_only(message));
    };

    let token = Uuid::new_v4().simple().to_string();
    let expires = Utc::now() + Duration::minutes(data.config.reset_token_ttl_minutes);
    users
        .update_one(
            doc! { "_id": &user.id },
            doc! { "$set": {
                "reset_token_hash": hash_reset_token(&token),
                "reset_token_expires": timestamp::bson(&expires),
            } },
        )
        .await?;
    info!("Password reset issued for {}", user.id);

    if data.config.expose_reset_token {
        Ok(response::ok(message, json!({ "reset_token": token })))
    } else {
        Ok(response::message_only(message))
    }
}

/// POST /api/auth/reset-password
pub async fn reset_password(
    data: web::Data<AppState>,
    payload: web::Json<ResetPasswordRequest>,
) -> Result<HttpResponse, AppError> {
    validate_password(&payload.password)?;
    let token_hash = hash_reset_token(payload.token.trim());

    let users = data.mongodb.users();
    let user = users
        .find_one(doc! { "reset_token_hash": &token_hash })
        .await?
        .filter(|u| u.reset_token_valid(&token_hash, Utc::now()))
        .ok_or_else(|| AppError::validation("Reset token is invalid or has expired"))?;

    let password_hash = hash_password(payload.password.clone(), data.config.bcrypt_cost).await?;
    users
        .update_one(
            doc! { "_id": &user.id },
            doc! {
                "$set": {
                    "password_hash": password_hash,
                    "refresh_tokens": [],
                    "updated_at": now_bson(),
                },
                "$unset": { "reset_token_hash": "", "reset_token_expires": "" },
            },
        )
        .await?;
    info!("Password reset completed for {}", user.id);
    Ok(response::message_only("Password has been reset"))
}

/// GET /api/auth/me
pub async fn me(user: AuthUser, data: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let found = data
        .mongodb
        .users()
        .find_one(doc! { "_id": &user.id })
        .await?
        .ok_or_else(|| AppError::not_found("User"))?;
    Ok(response::ok("Current user", PublicUser::from(found)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{test as actix_test, App};

    const SECRET: &str = "test-secret";

    async fn whoami(user: AuthUser) -> HttpResponse {
        HttpResponse::Ok().body(user.id)
    }

    async fn open() -> HttpResponse {
        HttpResponse::Ok().finish()
    }

    #[test]
    fn jwt_round_trip_checks_kind() {
        let token = create_jwt("u1", TokenKind::Access, Duration::hours(1), SECRET).unwrap();
        let claims = validate_jwt(&token, TokenKind::Access, SECRET).unwrap();
        assert_eq!(claims.sub, "u1");
        assert!(matches!(
            validate_jwt(&token, TokenKind::Refresh, SECRET),
            Err(AppError::InvalidToken)
        ));
        assert!(matches!(
            validate_jwt(&token, TokenKind::Access, "other-secret"),
            Err(AppError::InvalidToken)
        ));
    }

    #[test]
    fn expired_jwt_is_rejected() {
        let token = create_jwt("u1", TokenKind::Access, Duration::hours(-2), SECRET).unwrap();
        assert!(matches!(
            validate_jwt(&token, TokenKind::Access, SECRET),
            Err(AppError::TokenExpired)
        ));
    }

    #[test]
    fn tokens_issued_together_differ() {
        let a = create_jwt("u1", TokenKind::Refresh, Duration::days(1), SECRET).unwrap();
        let b = create_jwt("u1", TokenKind::Refresh, Duration::days(1), SECRET).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn reset_token_hash_is_stable_hex() {
        let h = hash_reset_token("abc");
        assert_eq!(h, "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad");
        assert_eq!(h, hash_reset_token("abc"));
    }

    #[test]
    fn refresh_token_is_consumed_only_if_stored() {
        let (filter, update) = consume_refresh_token("u1", "r1");
        assert_eq!(filter, doc! { "_id": "u1", "refresh_tokens": "r1" });
        assert_eq!(update, doc! { "$pull": { "refresh_tokens": "r1" } });
    }

    #[test]
    fn public_paths() {
        assert!(is_public(&Method::POST, "/api/auth/login"));
        assert!(is_public(&Method::POST, "/api/auth/register/"));
        assert!(is_public(&Method::OPTIONS, "/api/projects"));
        assert!(!is_public(&Method::GET, "/api/auth/me"));
        assert!(!is_public(&Method::POST, "/api/auth/logout"));
    }

    #[actix_web::test]
    async fn bcrypt_helpers_round_trip() {
        let hashed = hash_password("hunter22".to_string(), 4).await.unwrap();
        assert!(verify_password("hunter22".to_string(), hashed.clone()).await.unwrap());
        assert!(!verify_password("hunter23".to_string(), hashed).await.unwrap());
    }

    #[actix_web::test]
    async fn middleware_guards_protected_routes() {
        let state = AppState::for_tests().await;
        let app = actix_test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .wrap(Authentication)
                .route("/api/auth/me", web::get().to(whoami))
                .route("/api/auth/login", web::post().to(open)),
        )
        .await;

        let req = actix_test::TestRequest::get().uri("/api/auth/me").to_request();
        let resp = actix_test::call_service(&app, req).await;
        assert_eq!(resp.status(), http::StatusCode::UNAUTHORIZED);

        let req = actix_test::TestRequest::get()
            .uri("/api/auth/me")
            .insert_header((http::header::AUTHORIZATION, "Bearer not-a-jwt"))
            .to_request();
        let resp = actix_test::call_service(&app, req).await;
        assert_eq!(resp.status(), http::StatusCode::UNAUTHORIZED);
        let body: serde_json::Value = actix_test::read_body_json(resp).await;
        assert_eq!(body["success"], false);
        assert_eq!(body["error"], "invalid_token");

        let expired = create_jwt("u1", TokenKind::Access, Duration::hours(-2), SECRET).unwrap();
        let req = actix_test::TestRequest::get()
            .uri("/api/auth/me")
            .insert_header((http::header::AUTHORIZATION, format!("Bearer {}", expired)))
            .to_request();
        let resp = actix_test::call_service(&app, req).await;
        assert_eq!(resp.status(), http::StatusCode::UNAUTHORIZED);
        let body: serde_json::Value = actix_test::read_body_json(resp).await;
        assert_eq!(body["error"], "token_expired");

        let refresh = create_jwt("u1", TokenKind::Refresh, Duration::hours(1), SECRET).unwrap();
        let req = actix_test::TestRequest::get()
            .uri("/api/auth/me")
            .insert_header((http::header::AUTHORIZATION, format!("Bearer {}", refresh)))
            .to_request();
        let resp = actix_test::call_service(&app, req).await;
        assert_eq!(resp.status(), http::StatusCode::UNAUTHORIZED);

        let valid = create_jwt("u1", TokenKind::Access, Duration::hours(1), SECRET).unwrap();
        let req = actix_test::TestRequest::get()
            .uri("/api/auth/me")
            .insert_header((http::header::AUTHORIZATION, format!("Bearer {}", valid)))
            .to_request();
        let resp = actix_test::call_service(&app, req).await;
        assert_eq!(resp.status(), http::StatusCode::OK);
        assert_eq!(actix_test::read_body(resp).await, "u1");

        let req = actix_test::TestRequest::post().uri("/api/auth/login").to_request();
        let resp = actix_test::call_service(&app, req).await;
        assert_eq!(resp.status(), http::StatusCode::OK);
    }
}
