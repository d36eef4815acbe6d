// libs/conversation-cell/src/services/store.rs
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use deadpool_redis::{Config, Connection, Pool, Runtime};
use redis::AsyncCommands;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::StoreError;
use crate::models::Conversation;

/// Session persistence keyed by caller phone.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn load(&self, phone: &str) -> Result<Option<Conversation>, StoreError>;
    async fn save(&self, conversation: &Conversation) -> Result<(), StoreError>;
    async fn delete(&self, phone: &str) -> Result<(), StoreError>;
}

#[derive(Default, Clone)]
pub struct InMemoryConversationStore {
    sessions: Arc<RwLock<HashMap<String, Conversation>>>,
}

impl InMemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }
}

#[async_trait]
impl ConversationStore for InMemoryConversationStore {
    async fn load(&self, phone: &str) -> Result<Option<Conversation>, StoreError> {
        Ok(self.sessions.read().await.get(phone).cloned())
    }

    async fn save(&self, conversation: &Conversation) -> Result<(), StoreError> {
        self.sessions
            .write()
            .await
            .insert(conversation.phone.clone(), conversation.clone());
        Ok(())
    }

    async fn delete(&self, phone: &str) -> Result<(), StoreError> {
        self.sessions.write().await.remove(phone);
        Ok(())
    }
}

// ==============================================================================
// REDIS STORE
// ==============================================================================

/// Sessions as JSON strings under `conversation:{phone}`. The key TTL equals the
/// idle timeout, so abandoned sessions vanish on their own.
pub struct RedisConversationStore {
    pool: Pool,
    ttl_seconds: u64,
}

impl RedisConversationStore {
    pub async fn new(redis_url: &str, ttl_seconds: u64) -> Result<Self, StoreError> {
        let pool = Config::from_url(redis_url)
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| StoreError::PoolError(format!("Pool creation error: {}", e)))?;

        let mut conn = pool
            .get()
            .await
            .map_err(|e| StoreError::PoolError(format!("Connection error: {}", e)))?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        info!("Redis conversation store initialized");

        Ok(Self { pool, ttl_seconds })
    }

    fn key(phone: &str) -> String {
        format!("conversation:{}", phone)
    }

    async fn get_connection(&self) -> Result<Connection, StoreError> {
        self.pool
            .get()
            .await
            .map_err(|e| StoreError::PoolError(format!("Connection error: {}", e)))
    }
}

#[async_trait]
impl ConversationStore for RedisConversationStore {
    async fn load(&self, phone: &str) -> Result<Option<Conversation>, StoreError> {
        let mut conn = self.get_connection().await?;
        let raw: Option<String> = conn.get(Self::key(phone)).await?;

        match raw {
            Some(data) => Ok(Some(serde_json::from_str(&data)?)),
            None => Ok(None),
        }
    }

    async fn save(&self, conversation: &Conversation) -> Result<(), StoreError> {
        let mut conn = self.get_connection().await?;
        let data = serde_json::to_string(conversation)?;

        let _: () = redis::cmd("SET")
            .arg(Self::key(&conversation.phone))
            .arg(data)
            .arg("EX")
            .arg(self.ttl_seconds)
            .query_async(&mut conn)
            .await?;
        debug!("Conversation of {} saved in {}", conversation.phone, conversation.state.name());
        Ok(())
    }

    async fn delete(&self, phone: &str) -> Result<(), StoreError> {
        let mut conn = self.get_connection().await?;
        let _: () = conn.del(Self::key(phone)).await?;
        Ok(())
    }
}
