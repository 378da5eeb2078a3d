use std::collections::{HashMap, HashSet};

use actix::prelude::*;
use log::{debug, info};
use serde::Serialize;
use uuid::Uuid;

/// Named events pushed to connected clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    TaskCreated,
    TaskUpdated,
    TaskStatusChanged,
    TaskDeleted,
    TaskCommentAdded,
    TaskCommentDeleted,
    NewMessage,
    MessageUpdated,
    MessageDeleted,
    MessageReaction,
    MessagePinned,
    MessagesRead,
    Notification,
    NotificationRead,
    ProjectUpdated,
    ProjectDeleted,
    MemberAdded,
    MemberRemoved,
    UserTyping,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::TaskCreated => "task_created",
            EventKind::TaskUpdated => "task_updated",
            EventKind::TaskStatusChanged => "task_status_changed",
            EventKind::TaskDeleted => "task_deleted",
            EventKind::TaskCommentAdded => "task_comment_added",
            EventKind::TaskCommentDeleted => "task_comment_deleted",
            EventKind::NewMessage => "new_message",
            EventKind::MessageUpdated => "message_updated",
            EventKind::MessageDeleted => "message_deleted",
            EventKind::MessageReaction => "message_reaction",
            EventKind::MessagePinned => "message_pinned",
            EventKind::MessagesRead => "messages_read",
            EventKind::Notification => "notification",
            EventKind::NotificationRead => "notification_read",
            EventKind::ProjectUpdated => "project_updated",
            EventKind::ProjectDeleted => "project_deleted",
            EventKind::MemberAdded => "member_added",
            EventKind::MemberRemoved => "member_removed",
            EventKind::UserTyping => "user_typing",
        }
    }
}

pub fn project_topic(project_id: &str) -> String {
    format!("project:{}", project_id)
}

pub fn user_topic(user_id: &str) -> String {
    format!("user:{}", user_id)
}

/// Frame delivered to a session, serialized as `{"event": .., "data": ..}`.
#[derive(Message, Debug, Clone, Serialize)]
#[rtype(result = "()")]
pub struct ServerEvent {
    pub event: String,
    pub data: serde_json::Value,
}

#[derive(Message)]
#[rtype(result = "()")]
pub struct Connect {
    pub session_id: Uuid,
    pub user_id: String,
    pub addr: Recipient<ServerEvent>,
}

#[derive(Message)]
#[rtype(result = "()")]
pub struct Disconnect {
    pub session_id: Uuid,
}

#[derive(Message)]
#[rtype(result = "()")]
pub struct JoinTopic {
    pub session_id: Uuid,
    pub topic: String,
}

#[derive(Message)]
#[rtype(result = "()")]
pub struct LeaveTopic {
    pub session_id: Uuid,
    pub topic: String,
}

/// Drops every session of one user from a topic, e.g. after they lose
/// project membership.
#[derive(Message)]
#[rtype(result = "()")]
pub struct LeaveUserTopic {
    pub user_id: String,
    pub topic: String,
}

/// Forgets a topic entirely, unsubscribing all of its sessions.
#[derive(Message)]
#[rtype(result = "()")]
pub struct CloseTopic {
    pub topic: String,
}

#[derive(Message, Debug, Clone)]
#[rtype(result = "()")]
pub struct Broadcast {
    pub topic: String,
    pub event: EventKind,
    pub data: serde_json::Value,
    /// Session that caused the event and should not receive it back. When
    /// set, that session must itself be subscribed or nothing is sent.
    pub skip: Option<Uuid>,
}

#[derive(Message)]
#[rtype(result = "usize")]
pub struct TopicSize {
    pub topic: String,
}

struct Session {
    user_id: String,
    addr: Recipient<ServerEvent>,
    topics: HashSet<String>,
}

/// Topic-based fan-out. Delivery is fire-and-forget: no ordering across
/// topics, no acknowledgements, nothing is replayed after a reconnect.
#[derive(Default)]
pub struct EventHub {
    sessions: HashMap<Uuid, Session>,
    topics: HashMap<String, HashSet<Uuid>>,
}

impl EventHub {
    pub fn new() -> Self {
        EventHub::default()
    }

    fn join(&mut self, session_id: Uuid, topic: String) {
        if let Some(session) = self.sessions.get_mut(&session_id) {
            session.topics.insert(topic.clone());
            self.topics.entry(topic).or_default().insert(session_id);
        }
    }

    fn leave(&mut self, session_id: Uuid, topic: &str) {
        if let Some(session) = self.sessions.get_mut(&session_id) {
            session.topics.remove(topic);
        }
        if let Some(members) = self.topics.get_mut(topic) {
            members.remove(&session_id);
            if members.is_empty() {
                self.topics.remove(topic);
            }
        }
    }
}

impl Actor for EventHub {
    type Context = Context<Self>;
}

impl Handler<Connect> for EventHub {
    type Result = ();

    fn handle(&mut self, msg: Connect, _: &mut Context<Self>) {
        info!("User {} connected (WS session {})", msg.user_id, msg.session_id);
        let topic = user_topic(&msg.user_id);
        self.sessions.insert(
            msg.session_id,
            Session { user_id: msg.user_id, addr: msg.addr, topics: HashSet::new() },
        );
        self.join(msg.session_id, topic);
    }
}

impl Handler<Disconnect> for EventHub {
    type Result = ();

    fn handle(&mut self, msg: Disconnect, _: &mut Context<Self>) {
        if let Some(session) = self.sessions.remove(&msg.session_id) {
            info!("User {} disconnected (WS session {})", session.user_id, msg.session_id);
            for topic in session.topics {
                if let Some(members) = self.topics.get_mut(&topic) {
                    members.remove(&msg.session_id);
                    if members.is_empty() {
                        self.topics.remove(&topic);
                    }
                }
            }
        }
    }
}

impl Handler<JoinTopic> for EventHub {
    type Result = ();

    fn handle(&mut self, msg: JoinTopic, _: &mut Context<Self>) {
        debug!("Session {} joined {}", msg.session_id, msg.topic);
        self.join(msg.session_id, msg.topic);
    }
}

impl Handler<LeaveTopic> for EventHub {
    type Result = ();

    fn handle(&mut self, msg: LeaveTopic, _: &mut Context<Self>) {
        debug!("Session {} left {}", msg.session_id, msg.topic);
        self.leave(msg.session_id, &msg.topic);
    }
}

impl Handler<LeaveUserTopic> for EventHub {
    type Result = ();

    fn handle(&mut self, msg: LeaveUserTopic, _: &mut Context<Self>) {
        let leaving: Vec<Uuid> = self
            .topics
            .get(&msg.topic)
            .map(|members| {
                members
                    .iter()
                    .filter(|id| {
                        self.sessions.get(*id).map_or(false, |s| s.user_id == msg.user_id)
                    })
                    .copied()
                    .collect()
            })
            .unwrap_or_default();
        for session_id in leaving {
            debug!("Session {} removed from {}", session_id, msg.topic);
            self.leave(session_id, &msg.topic);
        }
    }
}

impl Handler<CloseTopic> for EventHub {
    type Result = ();

    fn handle(&mut self, msg: CloseTopic, _: &mut Context<Self>) {
        if let Some(members) = self.topics.remove(&msg.topic) {
            debug!("Closing {} ({} sessions)", msg.topic, members.len());
            for session_id in members {
                if let Some(session) = self.sessions.get_mut(&session_id) {
                    session.topics.remove(&msg.topic);
                }
            }
        }
    }
}

impl Handler<Broadcast> for EventHub {
    type Result = ();

    fn handle(&mut self, msg: Broadcast, _: &mut Context<Self>) {
        let Some(members) = self.topics.get(&msg.topic) else {
            return;
        };
        if let Some(origin) = msg.skip {
            if !members.contains(&origin) {
                debug!(
                    "Dropping {} from {}: not subscribed to {}",
                    msg.event.as_str(),
                    origin,
                    msg.topic
                );
                return;
            }
        }
        let frame = ServerEvent { event: msg.event.as_str().to_string(), data: msg.data };
        for session_id in members {
            if Some(*session_id) == msg.skip {
                continue;
            }
            if let Some(session) = self.sessions.get(session_id) {
                session.addr.do_send(frame.clone());
            }
        }
    }
}

impl Handler<TopicSize> for EventHub {
    type Result = usize;

    fn handle(&mut self, msg: TopicSize, _: &mut Context<Self>) -> usize {
        self.topics.get(&msg.topic).map(|m| m.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct Collector {
        seen: Arc<Mutex<Vec<ServerEvent>>>,
    }

    impl Actor for Collector {
        type Context = Context<Self>;
    }

    impl Handler<ServerEvent> for Collector {
        type Result = ();

        fn handle(&mut self, msg: ServerEvent, _: &mut Context<Self>) {
            self.seen.lock().unwrap().push(msg);
        }
    }

    fn collector() -> (Recipient<ServerEvent>, Arc<Mutex<Vec<ServerEvent>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let addr = Collector { seen: seen.clone() }.start();
        (addr.recipient(), seen)
    }

    async fn settle(hub: &Addr<EventHub>) {
        // A round trip through the hub, then a yield so collectors drain their mailboxes.
        hub.send(TopicSize { topic: String::new() }).await.unwrap();
        actix_web::rt::time::sleep(std::time::Duration::from_millis(20)).await;
    }

    #[actix_web::test]
    async fn broadcast_reaches_only_topic_members() {
        let hub = EventHub::new().start();
        let (alice, alice_seen) = collector();
        let (bob, bob_seen) = collector();
        let alice_session = Uuid::new_v4();
        let bob_session = Uuid::new_v4();

        hub.send(Connect { session_id: alice_session, user_id: "alice".into(), addr: alice })
            .await
            .unwrap();
        hub.send(Connect { session_id: bob_session, user_id: "bob".into(), addr: bob })
            .await
            .unwrap();
        hub.send(JoinTopic { session_id: alice_session, topic: project_topic("p1") })
            .await
            .unwrap();

        hub.do_send(Broadcast {
            topic: project_topic("p1"),
            event: EventKind::TaskCreated,
            data: serde_json::json!({ "id": "t1" }),
            skip: None,
        });
        hub.do_send(Broadcast {
            topic: user_topic("bob"),
            event: EventKind::Notification,
            data: serde_json::json!({ "title": "hi" }),
            skip: None,
        });
        settle(&hub).await;

        let alice_seen = alice_seen.lock().unwrap();
        assert_eq!(alice_seen.len(), 1);
        assert_eq!(alice_seen[0].event, "task_created");
        let bob_seen = bob_seen.lock().unwrap();
        assert_eq!(bob_seen.len(), 1);
        assert_eq!(bob_seen[0].event, "notification");
    }

    #[actix_web::test]
    async fn skip_excludes_origin_session() {
        let hub = EventHub::new().start();
        let (a, a_seen) = collector();
        let (b, b_seen) = collector();
        let a_session = Uuid::new_v4();
        let b_session = Uuid::new_v4();
        for (session_id, user, addr) in [(a_session, "a", a), (b_session, "b", b)] {
            hub.send(Connect { session_id, user_id: user.into(), addr }).await.unwrap();
            hub.send(JoinTopic { session_id, topic: project_topic("p1") }).await.unwrap();
        }

        hub.do_send(Broadcast {
            topic: project_topic("p1"),
            event: EventKind::UserTyping,
            data: serde_json::json!({ "user": "a" }),
            skip: Some(a_session),
        });
        settle(&hub).await;

        assert!(a_seen.lock().unwrap().is_empty());
        assert_eq!(b_seen.lock().unwrap().len(), 1);
    }

    #[actix_web::test]
    async fn disconnect_cleans_up_topics() {
        let hub = EventHub::new().start();
        let (a, _) = collector();
        let session_id = Uuid::new_v4();
        hub.send(Connect { session_id, user_id: "a".into(), addr: a }).await.unwrap();
        hub.send(JoinTopic { session_id, topic: project_topic("p1") }).await.unwrap();
        assert_eq!(hub.send(TopicSize { topic: project_topic("p1") }).await.unwrap(), 1);
        assert_eq!(hub.send(TopicSize { topic: user_topic("a") }).await.unwrap(), 1);

        hub.send(LeaveTopic { session_id, topic: project_topic("p1") }).await.unwrap();
        assert_eq!(hub.send(TopicSize { topic: project_topic("p1") }).await.unwrap(), 0);

        hub.send(Disconnect { session_id }).await.unwrap();
        assert_eq!(hub.send(TopicSize { topic: user_topic("a") }).await.unwrap(), 0);
    }

    #[actix_web::test]
    async fn removed_user_stops_receiving_project_events() {
        let hub = EventHub::new().start();
        let (a, a_seen) = collector();
        let (a2, a2_seen) = collector();
        let (b, b_seen) = collector();
        let sessions = [
            (Uuid::new_v4(), "a", a),
            (Uuid::new_v4(), "a", a2),
            (Uuid::new_v4(), "b", b),
        ];
        let a_session = sessions[0].0;
        for (session_id, user, addr) in sessions {
            hub.send(Connect { session_id, user_id: user.into(), addr }).await.unwrap();
            hub.send(JoinTopic { session_id, topic: project_topic("p1") }).await.unwrap();
        }

        hub.send(LeaveUserTopic { user_id: "a".into(), topic: project_topic("p1") })
            .await
            .unwrap();
        assert_eq!(hub.send(TopicSize { topic: project_topic("p1") }).await.unwrap(), 1);

        hub.do_send(Broadcast {
            topic: project_topic("p1"),
            event: EventKind::TaskCreated,
            data: serde_json::json!({ "id": "t1" }),
            skip: None,
        });
        // A stale session can no longer publish into the project either.
        hub.do_send(Broadcast {
            topic: project_topic("p1"),
            event: EventKind::UserTyping,
            data: serde_json::json!({ "user_id": "a" }),
            skip: Some(a_session),
        });
        settle(&hub).await;

        assert!(a_seen.lock().unwrap().is_empty());
        assert!(a2_seen.lock().unwrap().is_empty());
        let b_seen = b_seen.lock().unwrap();
        assert_eq!(b_seen.len(), 1);
        assert_eq!(b_seen[0].event, "task_created");
    }

    #[actix_web::test]
    async fn closed_topic_has_no_subscribers() {
        let hub = EventHub::new().start();
        let (a, a_seen) = collector();
        let session_id = Uuid::new_v4();
        hub.send(Connect { session_id, user_id: "a".into(), addr: a }).await.unwrap();
        hub.send(JoinTopic { session_id, topic: project_topic("p1") }).await.unwrap();

        hub.send(CloseTopic { topic: project_topic("p1") }).await.unwrap();
        assert_eq!(hub.send(TopicSize { topic: project_topic("p1") }).await.unwrap(), 0);
        assert_eq!(hub.send(TopicSize { topic: user_topic("a") }).await.unwrap(), 1);

        hub.do_send(Broadcast {
            topic: project_topic("p1"),
            event: EventKind::TaskCreated,
            data: serde_json::json!({}),
            skip: None,
        });
        settle(&hub).await;
        assert!(a_seen.lock().unwrap().is_empty());

        // Disconnecting afterwards must not trip over the closed topic.
        hub.send(Disconnect { session_id }).await.unwrap();
        assert_eq!(hub.send(TopicSize { topic: user_topic("a") }).await.unwrap(), 0);
    }
}
