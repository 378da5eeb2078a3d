// src/ws_session.rs

use std::collections::HashSet;
use std::time::{Duration, Instant};

use actix::prelude::*;
use actix_web::{web, Error, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use log::{debug, warn};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::auth::{validate_jwt, TokenKind};
use crate::error::AppError;
use crate::event_hub::{
    project_topic, Broadcast, Connect, Disconnect, EventHub, EventKind, JoinTopic, LeaveTopic,
    ServerEvent, TopicSize,
};
use crate::projects::project_for_member;
use crate::validation::parse_id;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
pub struct WsAuth {
    pub token: Option<String>,
}

/// Frames a client may send.
#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "action", rename_all = "snake_case")]
enum ClientAction {
    JoinProject {
        project_id: String,
    },
    LeaveProject {
        project_id: String,
    },
    Typing {
        project_id: String,
        #[serde(default)]
        is_typing: bool,
    },
}

pub struct WsSession {
    pub id: Uuid,
    pub user_id: String,
    pub hb: Instant,
    pub hub: Addr<EventHub>,
    state: web::Data<AppState>,
    projects: HashSet<String>,
}

impl WsSession {
    pub fn new(user_id: String, state: web::Data<AppState>) -> Self {
        WsSession {
            id: Uuid::new_v4(),
            user_id,
            hb: Instant::now(),
            hub: state.events.clone(),
            state,
            projects: HashSet::new(),
        }
    }

    fn hb(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.hb) > CLIENT_TIMEOUT {
                debug!("WS session {} heartbeat timed out", act.id);
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }

    fn send(&self, ctx: &mut ws::WebsocketContext<Self>, event: &str, data: serde_json::Value) {
        let frame = ServerEvent { event: event.to_string(), data };
        match serde_json::to_string(&frame) {
            Ok(text) => ctx.text(text),
            Err(e) => warn!("Failed to encode WS frame for {}: {}", self.id, e),
        }
    }

    fn send_error(&self, ctx: &mut ws::WebsocketContext<Self>, message: String) {
        self.send(ctx, "error", json!({ "message": message }));
    }

    fn handle_action(&mut self, action: ClientAction, ctx: &mut ws::WebsocketContext<Self>) {
        match action {
            ClientAction::JoinProject { project_id } => self.join_project(project_id, ctx),
            ClientAction::LeaveProject { project_id } => {
                let project_id = match parse_id(&project_id) {
                    Ok(id) => id,
                    Err(e) => return self.send_error(ctx, e.client_message()),
                };
                if self.projects.remove(&project_id) {
                    self.hub.do_send(LeaveTopic {
                        session_id: self.id,
                        topic: project_topic(&project_id),
                    });
                }
                self.send(ctx, "left_project", json!({ "project_id": project_id }));
            }
            ClientAction::Typing { project_id, is_typing } => {
                let project_id = match self.joined_project(&project_id) {
                    Ok(id) => id,
                    Err(e) => return self.send_error(ctx, e.client_message()),
                };
                self.hub.do_send(Broadcast {
                    topic: project_topic(&project_id),
                    event: EventKind::UserTyping,
                    data: json!({
                        "user_id": self.user_id,
                        "project_id": project_id,
                        "is_typing": is_typing,
                    }),
                    skip: Some(self.id),
                });
            }
        }
    }

    /// Canonical id of a project this session has joined.
    fn joined_project(&self, raw_id: &str) -> Result<String, AppError> {
        let project_id = parse_id(raw_id)?;
        if self.projects.contains(&project_id) {
            Ok(project_id)
        } else {
            Err(AppError::validation("Join the project before sending typing updates"))
        }
    }

    /// Subscribes to a project topic once membership is confirmed.
    fn join_project(&mut self, raw_id: String, ctx: &mut ws::WebsocketContext<Self>) {
        let project_id = match parse_id(&raw_id) {
            Ok(id) => id,
            Err(e) => return self.send_error(ctx, e.client_message()),
        };
        let state = self.state.clone();
        let user_id = self.user_id.clone();
        let check = async move {
            project_for_member(&state, &project_id, &user_id).await.map(|_| project_id)
        };

        ctx.spawn(fut::wrap_future::<_, Self>(check).map(|res, act, ctx| match res {
            Ok(project_id) => {
                let topic = project_topic(&project_id);
                act.hub.do_send(JoinTopic { session_id: act.id, topic: topic.clone() });
                act.projects.insert(project_id.clone());
                ctx.spawn(act.hub.send(TopicSize { topic }).into_actor(act).map(
                    move |online, act, ctx| {
                        let online = online.unwrap_or(0);
                        let data = json!({ "project_id": project_id, "online": online });
                        act.send(ctx, "joined_project", data);
                    },
                ));
            }
            Err(e) => act.send_error(ctx, e.client_message()),
        }));
    }
}

impl Actor for WsSession {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        self.hb(ctx);

        let addr = ctx.address();
        self.hub
            .send(Connect {
                session_id: self.id,
                user_id: self.user_id.clone(),
                addr: addr.recipient(),
            })
            .into_actor(self)
            .then(|res, act, ctx| {
                if res.is_err() {
                    warn!("WS session {} could not register with the event hub", act.id);
                    ctx.stop();
                }
                fut::ready(())
            })
            .wait(ctx);
    }

    fn stopped(&mut self, _: &mut Self::Context) {
        self.hub.do_send(Disconnect { session_id: self.id });
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for WsSession {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Ping(msg)) => {
                self.hb = Instant::now();
                ctx.pong(&msg);
            }
            Ok(ws::Message::Pong(_)) => {
                self.hb = Instant::now();
            }
            Ok(ws::Message::Text(text)) => {
                self.hb = Instant::now();
                match serde_json::from_str::<ClientAction>(&text) {
                    Ok(action) => self.handle_action(action, ctx),
                    Err(e) => {
                        debug!("Unparseable WS frame from {}: {}", self.user_id, e);
                        self.send_error(ctx, format!("Invalid frame: {}", e));
                    }
                }
            }
            Ok(ws::Message::Close(reason)) => {
                ctx.close(reason);
                ctx.stop();
            }
            Err(e) => {
                warn!("WebSocket error for {}: {}", self.user_id, e);
                ctx.stop();
            }
            _ => {}
        }
    }
}

impl Handler<ServerEvent> for WsSession {
    type Result = ();

    fn handle(&mut self, msg: ServerEvent, ctx: &mut Self::Context) {
        match serde_json::to_string(&msg) {
            Ok(text) => ctx.text(text),
            Err(e) => warn!("Failed to encode {} for {}: {}", msg.event, self.id, e),
        }
    }
}

/// GET /ws?token=<access token>
///
/// Browsers cannot set headers on a WebSocket handshake, so the access token
/// travels in the query string instead of the Authorization header.
pub async fn ws_index(
    req: HttpRequest,
    stream: web::Payload,
    data: web::Data<AppState>,
    query: web::Query<WsAuth>,
) -> Result<HttpResponse, Error> {
    let token = query
        .token
        .as_deref()
        .filter(|t| !t.is_empty())
        .ok_or_else(|| AppError::Unauthorized("Missing token".to_string()))?;
    let claims = validate_jwt(token, TokenKind::Access, &data.config.jwt_secret)?;
    ws::start(WsSession::new(claims.sub, data.clone()), &req, stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{http::StatusCode, test as actix_test, App};

    #[test]
    fn client_actions_parse() {
        let action: ClientAction =
            serde_json::from_str(r#"{"action":"join_project","project_id":"p1"}"#).unwrap();
        assert_eq!(action, ClientAction::JoinProject { project_id: "p1".into() });

        let action: ClientAction =
            serde_json::from_str(r#"{"action":"typing","project_id":"p1","is_typing":true}"#)
                .unwrap();
        assert_eq!(action, ClientAction::Typing { project_id: "p1".into(), is_typing: true });

        let action: ClientAction =
            serde_json::from_str(r#"{"action":"typing","project_id":"p1"}"#).unwrap();
        assert_eq!(action, ClientAction::Typing { project_id: "p1".into(), is_typing: false });

        assert!(serde_json::from_str::<ClientAction>(r#"{"action":"shout"}"#).is_err());
    }

    #[actix_web::test]
    async fn joined_projects_match_any_id_casing() {
        let state = web::Data::new(AppState::for_tests().await);
        let mut session = WsSession::new("u1".into(), state);
        let id = Uuid::new_v4().to_string();
        session.projects.insert(id.clone());

        assert_eq!(session.joined_project(&id.to_uppercase()).unwrap(), id);
        assert_eq!(session.joined_project(&id.replace('-', "")).unwrap(), id);
        assert!(session.joined_project(&Uuid::new_v4().to_string()).is_err());
        assert!(matches!(session.joined_project("nope"), Err(AppError::InvalidId(_))));
    }

    #[actix_web::test]
    async fn handshake_requires_access_token() {
        let state = AppState::for_tests().await;
        let app = actix_test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/ws", web::get().to(ws_index)),
        )
        .await;

        let req = actix_test::TestRequest::get().uri("/ws").to_request();
        let resp = actix_test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let req = actix_test::TestRequest::get().uri("/ws?token=garbage").to_request();
        let resp = actix_test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }
}
