use std::sync::Arc;

use actix::Addr;

use crate::auth::{JwtVerifier, TokenVerifier};
use crate::chat_db::{MongoDB, MongoMessageStore, MongoNotificationStore};
use crate::chat_server::ChatServer;
use crate::clock::Clock;
use crate::config::{ChatLimits, Config};
use crate::delivery::ChatDelivery;
use crate::directory::{Directory, MongoDirectory};
use crate::notifications::Notifications;
use crate::store::{MemoryMessageStore, MemoryNotificationStore, MessageStore, NotificationStore};

/// The storage-facing collaborators of one deployment.
#[derive(Clone)]
pub struct Stores {
    pub messages: Arc<dyn MessageStore>,
    pub notifications: Arc<dyn NotificationStore>,
    pub directory: Arc<dyn Directory>,
}

impl Stores {
    pub fn mongo(db: &MongoDB, clock: Arc<dyn Clock>, limits: &ChatLimits) -> Self {
        Stores {
            messages: Arc::new(MongoMessageStore::new(&db.db, clock.clone(), limits.max_body_len)),
            notifications: Arc::new(MongoNotificationStore::new(&db.db, clock)),
            directory: Arc::new(MongoDirectory::new(&db.db)),
        }
    }

    pub fn in_memory(
        clock: Arc<dyn Clock>,
        limits: &ChatLimits,
        directory: Arc<dyn Directory>,
    ) -> Self {
        Stores {
            messages: Arc::new(MemoryMessageStore::new(clock.clone(), limits.max_body_len)),
            notifications: Arc::new(MemoryNotificationStore::new(clock)),
            directory,
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub chat_server: Addr<ChatServer>,
    pub delivery: Arc<ChatDelivery>,
    pub notifications: Arc<Notifications>,
    pub verifier: Arc<dyn TokenVerifier>,
    pub clock: Arc<dyn Clock>,
    pub config: Config,
}

impl AppState {
    pub fn new(
        config: Config,
        chat_server: Addr<ChatServer>,
        stores: Stores,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let fanout = Arc::new(chat_server.clone());
        let notifications = Arc::new(Notifications::new(
            stores.notifications,
            stores.directory.clone(),
            fanout.clone(),
            clock.clone(),
        ));
        let delivery = Arc::new(ChatDelivery::new(
            stores.messages,
            notifications.clone(),
            stores.directory,
            fanout,
            clock.clone(),
            config.limits.clone(),
        ));
        AppState {
            chat_server,
            delivery,
            notifications,
            verifier: Arc::new(JwtVerifier::new(&config.jwt_secret)),
            clock,
            config,
        }
    }
}
