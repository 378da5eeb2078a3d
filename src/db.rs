use mongodb::bson::doc;
use mongodb::options::{ClientOptions, IndexOptions};
use mongodb::{Client, Collection, Database, IndexModel};
use log::info;

use crate::models::message::Message;
use crate::models::notification::Notification;
use crate::models::project::Project;
use crate::models::task::Task;
use crate::models::user::User;

/// Handle to the application database. The driver's `Client` is shared
/// internally by `Database`, so only the latter is kept.
pub struct MongoDB {
    pub db: Database,
}

impl MongoDB {
    /// The driver connects lazily, so this only fails on a malformed URI.
    pub async fn init(uri: &str, db_name: &str) -> mongodb::error::Result<Self> {
        let client_options = ClientOptions::parse(uri).await?;
        let db = Client::with_options(client_options)?.database(db_name);
        Ok(MongoDB { db })
    }

    pub fn users(&self) -> Collection<User> {
        self.db.collection(User::COLLECTION)
    }

    pub fn projects(&self) -> Collection<Project> {
        self.db.collection(Project::COLLECTION)
    }

    pub fn tasks(&self) -> Collection<Task> {
        self.db.collection(Task::COLLECTION)
    }

    pub fn messages(&self) -> Collection<Message> {
        self.db.collection(Message::COLLECTION)
    }

    pub fn notifications(&self) -> Collection<Notification> {
        self.db.collection(Notification::COLLECTION)
    }

    pub async fn ensure_indexes(&self) -> mongodb::error::Result<()> {
        let unique = || IndexOptions::builder().unique(true).build();

        self.users()
            .create_index(IndexModel::builder().keys(doc! { "email": 1 }).options(unique()).build())
            .await?;
        self.users()
            .create_index(IndexModel::builder().keys(doc! { "username": 1 }).options(unique()).build())
            .await?;
        self.projects()
            .create_index(IndexModel::builder().keys(doc! { "members.user": 1 }).build())
            .await?;
        self.tasks()
            .create_index(IndexModel::builder().keys(doc! { "project": 1, "position": 1 }).build())
            .await?;
        self.messages()
            .create_index(IndexModel::builder().keys(doc! { "project": 1, "created_at": -1 }).build())
            .await?;
        self.notifications()
            .create_index(IndexModel::builder().keys(doc! { "recipient": 1, "created_at": -1 }).build())
            .await?;

        info!("Database indexes ensured on {}", self.db.name());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[actix_web::test]
    async fn init_selects_the_named_database() {
        let mongodb = MongoDB::init("mongodb://127.0.0.1:27017", "collab_test").await.unwrap();
        assert_eq!(mongodb.db.name(), "collab_test");
        assert_eq!(mongodb.tasks().name(), Task::COLLECTION);

        assert!(MongoDB::init("not-a-uri", "collab_test").await.is_err());
    }
}
