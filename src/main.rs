// src/main.rs

mod app_state;
mod auth;
mod config;
mod db;
mod error;
mod event_hub;
mod messages;
mod models;
mod notifications;
mod projects;
mod response;
mod tasks;
mod users;
mod validation;
mod ws_session;

use std::io;
use std::sync::Arc;

use actix::Actor;
use actix_cors::Cors;
use actix_web::dev::ServiceRequest;
use actix_web::{http, middleware::Logger, web, App, HttpResponse, HttpServer};
use env_logger::Env;
use log::{error, info, warn};
use mongodb::bson::doc;
use serde_json::json;

use crate::app_state::AppState;
use crate::auth::Authentication;
use crate::config::Config;
use crate::db::MongoDB;
use crate::error::AppError;
use crate::event_hub::EventHub;
use crate::ws_session::ws_index;

/// Access log line. The request line is replaced by method and path so the
/// `/ws?token=` query never reaches the log.
const ACCESS_LOG_FORMAT: &str = r#"%a "%{request}xi" %s %b "%{Referer}i" "%{User-Agent}i" %T"#;

fn request_line(req: &ServiceRequest) -> String {
    format!("{} {}", req.method(), req.path())
}

fn access_logger() -> Logger {
    Logger::new(ACCESS_LOG_FORMAT).custom_request_replace("request", request_line)
}

async fn health(data: web::Data<AppState>) -> HttpResponse {
    let database = match data.mongodb.db.run_command(doc! { "ping": 1 }).await {
        Ok(_) => "up",
        Err(e) => {
            warn!("Health check ping failed: {}", e);
            "down"
        }
    };
    HttpResponse::Ok().json(json!({
        "success": true,
        "message": "Server is running",
        "data": { "status": "ok", "database": database },
    }))
}

fn api_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/auth")
            .route("/register", web::post().to(auth::register))
            .route("/login", web::post().to(auth::login))
            .route("/refresh", web::post().to(auth::refresh))
            .route("/logout", web::post().to(auth::logout))
            .route("/forgot-password", web::post().to(auth::forgot_password))
            .route("/reset-password", web::post().to(auth::reset_password))
            .route("/me", web::get().to(auth::me)),
    )
    // USERS
    .service(
        web::scope("/users")
            .route("/search", web::get().to(users::search_users))
            .route("/me", web::put().to(users::update_profile))
            .route("/me/password", web::put().to(users::change_password))
            .route("/{id}", web::get().to(users::get_user)),
    )
    // PROJECTS, with their tasks and chat
    .service(
        web::scope("/projects")
            .route("", web::post().to(projects::create_project))
            .route("", web::get().to(projects::list_projects))
            .route("/{id}", web::get().to(projects::get_project))
            .route("/{id}", web::put().to(projects::update_project))
            .route("/{id}", web::delete().to(projects::delete_project))
            .route("/{id}/archive", web::put().to(projects::archive_project))
            .route("/{id}/members", web::post().to(projects::add_member))
            .route("/{id}/members/{user_id}", web::put().to(projects::update_member))
            .route("/{id}/members/{user_id}", web::delete().to(projects::remove_member))
            .route("/{id}/tasks", web::get().to(tasks::list_tasks))
            .route("/{id}/tasks", web::post().to(tasks::create_task))
            .route("/{id}/messages", web::get().to(messages::list_messages))
            .route("/{id}/messages", web::post().to(messages::create_message))
            .route("/{id}/messages/pinned", web::get().to(messages::pinned_messages))
            .route("/{id}/messages/read", web::post().to(messages::mark_read))
            .route("/{id}/messages/unread-count", web::get().to(messages::unread_count)),
    )
    // TASKS
    .service(
        web::scope("/tasks")
            .route("/mine", web::get().to(tasks::my_tasks))
            .route("/{id}", web::get().to(tasks::get_task))
            .route("/{id}", web::put().to(tasks::update_task))
            .route("/{id}", web::delete().to(tasks::delete_task))
            .route("/{id}/status", web::patch().to(tasks::update_status))
            .route("/{id}/comments", web::post().to(tasks::add_comment))
            .route("/{id}/comments/{comment_id}", web::delete().to(tasks::delete_comment))
            .route("/{id}/subtasks", web::post().to(tasks::add_subtask))
            .route("/{id}/subtasks/{subtask_id}", web::patch().to(tasks::update_subtask))
            .route("/{id}/subtasks/{subtask_id}", web::delete().to(tasks::delete_subtask))
            .route("/{id}/watch", web::post().to(tasks::toggle_watch)),
    )
    // MESSAGES
    .service(
        web::scope("/messages")
            .route("/{id}/thread", web::get().to(messages::get_thread))
            .route("/{id}", web::put().to(messages::edit_message))
            .route("/{id}", web::delete().to(messages::delete_message))
            .route("/{id}/reactions", web::post().to(messages::toggle_reaction))
            .route("/{id}/pin", web::post().to(messages::toggle_pin)),
    )
    // NOTIFICATIONS
    .service(
        web::scope("/notifications")
            .route("", web::get().to(notifications::list_notifications))
            .route("", web::delete().to(notifications::clear_read))
            .route("/unread-count", web::get().to(notifications::get_unread_count))
            .route("/read-all", web::put().to(notifications::mark_all_read))
            .route("/{id}/read", web::put().to(notifications::mark_read))
            .route("/{id}", web::delete().to(notifications::delete_notification)),
    );
}

/// Malformed bodies, queries, and paths get the same envelope as handler errors.
fn extractor_config(cfg: &mut web::ServiceConfig) {
    cfg.app_data(
        web::JsonConfig::default()
            .limit(1 << 20)
            .error_handler(|err, _| AppError::validation(err.to_string()).into()),
    )
    .app_data(
        web::QueryConfig::default()
            .error_handler(|err, _| AppError::validation(err.to_string()).into()),
    )
    .app_data(
        web::PathConfig::default()
            .error_handler(|err, _| AppError::validation(err.to_string()).into()),
    );
}

#[actix_web::main]
async fn main() -> io::Result<()> {
    dotenv::dotenv().ok();
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let config = Config::from_env().map_err(|e| {
        error!("Invalid configuration: {}", e);
        io::Error::new(io::ErrorKind::InvalidInput, e)
    })?;

    let mongodb = MongoDB::init(&config.mongo_uri, &config.database_name)
        .await
        .map_err(|e| {
            error!("Could not set up MongoDB client: {}", e);
            io::Error::new(io::ErrorKind::Other, e)
        })?;
    if let Err(e) = mongodb.ensure_indexes().await {
        error!("Failed to ensure indexes: {}", e);
    }
    let mongodb = Arc::new(mongodb);
    let events = EventHub::new().start();

    let bind_addr = config.bind_addr.clone();
    info!("Server running at http://{}", bind_addr);
    info!("Allowed CORS Origin: {}", config.frontend_origin);

    HttpServer::new(move || {
        let cors = Cors::default()
            .allowed_origin(&config.frontend_origin)
            .allowed_methods(vec!["GET", "POST", "PUT", "PATCH", "DELETE", "OPTIONS"])
            .allowed_headers(vec![
                http::header::CONTENT_TYPE,
                http::header::ACCEPT,
                http::header::AUTHORIZATION,
            ])
            .supports_credentials()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(AppState {
                events: events.clone(),
                mongodb: mongodb.clone(),
                config: config.clone(),
            }))
            .configure(extractor_config)
            .wrap(Authentication)
            .wrap(cors)
            .wrap(access_logger())
            .service(web::scope("/api").configure(api_routes))
            .service(web::resource("/ws").route(web::get().to(ws_index)))
            .route("/health", web::get().to(health))
    })
    .bind(bind_addr)?
    .run()
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{http::StatusCode, test as actix_test};

    #[test]
    fn access_log_drops_query_strings() {
        assert!(!ACCESS_LOG_FORMAT.contains("%r"));
        assert!(!ACCESS_LOG_FORMAT.contains("%q"));
        let req = actix_test::TestRequest::get()
            .uri("/ws?token=secret-access-token")
            .to_srv_request();
        assert_eq!(request_line(&req), "GET /ws");
    }

    #[actix_web::test]
    async fn logged_app_still_serves_requests() {
        let app = actix_test::init_service(
            App::new()
                .wrap(access_logger())
                .route("/ping", web::get().to(|| async { HttpResponse::Ok().finish() })),
        )
        .await;
        let req = actix_test::TestRequest::get().uri("/ping?token=abc").to_request();
        let resp = actix_test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[actix_web::test]
    async fn malformed_json_uses_error_envelope() {
        let app = actix_test::init_service(
            App::new()
                .app_data(web::Data::new(AppState::for_tests().await))
                .configure(extractor_config)
                .service(web::scope("/api").configure(api_routes)),
        )
        .await;

        let req = actix_test::TestRequest::post()
            .uri("/api/auth/login")
            .insert_header((http::header::CONTENT_TYPE, "application/json"))
            .set_payload("{not json")
            .to_request();
        let resp = actix_test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: serde_json::Value = actix_test::read_body_json(resp).await;
        assert_eq!(body["success"], false);
        assert_eq!(body["error"], "validation_error");
    }

    #[actix_web::test]
    async fn protected_routes_need_a_token() {
        let app = actix_test::init_service(
            App::new()
                .app_data(web::Data::new(AppState::for_tests().await))
                .configure(extractor_config)
                .wrap(Authentication)
                .service(web::scope("/api").configure(api_routes)),
        )
        .await;

        for uri in ["/api/projects", "/api/tasks/mine", "/api/notifications"] {
            let req = actix_test::TestRequest::get().uri(uri).to_request();
            let resp = actix_test::call_service(&app, req).await;
            assert_eq!(resp.status(), StatusCode::UNAUTHORIZED, "{}", uri);
        }
    }
}
