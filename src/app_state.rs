use crate::config::Config;
use crate::db::MongoDB;
use crate::event_hub::{Broadcast, EventHub, EventKind};
use actix::Addr;
use log::warn;
use serde::Serialize;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub events: Addr<EventHub>,
    pub mongodb: Arc<MongoDB>,
    pub config: Config,
}

impl AppState {
    /// Pushes `data` to every session subscribed to `topic`.
    pub fn emit<T: Serialize>(&self, topic: String, event: EventKind, data: &T) {
        match serde_json::to_value(data) {
            Ok(data) => self.events.do_send(Broadcast { topic, event, data, skip: None }),
            Err(e) => warn!("Dropping {} event for {}: {}", event.as_str(), topic, e),
        }
    }
}

#[cfg(test)]
impl AppState {
    /// State backed by a client that never connects unless a handler touches
    /// the database.
    pub async fn for_tests() -> Self {
        use actix::Actor;

        let config = Config::for_tests();
        let mongodb = MongoDB::init(&config.mongo_uri, &config.database_name)
            .await
            .expect("test mongo uri");
        AppState { events: EventHub::new().start(), mongodb: Arc::new(mongodb), config }
    }
}
