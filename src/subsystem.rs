//! Facade wiring the rate limiter, memory manager, and storage engine into
//! the single object the streaming client holds.

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::Config;
use crate::error::EmberError;
use crate::interfaces::ConversationMemory;
use crate::memory::{LearnOutcome, MemoryManager};
use crate::rate_limit::RateLimiter;
use crate::store::{FactSource, Role, StorageEngine, StoredMessage};
use crate::Result;

pub struct MemorySubsystem {
    engine: Arc<StorageEngine>,
    manager: MemoryManager,
    limiter: RateLimiter,
}

impl MemorySubsystem {
    /// Opens the storage engine at the configured path and assembles the
    /// subsystem around it.
    pub async fn open(cfg: Config) -> Result<Self> {
        let engine = Arc::new(StorageEngine::open(cfg.store).await?);
        Ok(Self::with_engine(engine, cfg.memory, cfg.rate_limit))
    }

    pub fn with_engine(
        engine: Arc<StorageEngine>,
        memory_cfg: crate::config::MemoryConfig,
        rate_cfg: crate::config::RateLimitConfig,
    ) -> Self {
        let manager = MemoryManager::new(engine.clone(), memory_cfg);
        let limiter = RateLimiter::from_config(&rate_cfg);
        Self {
            engine,
            manager,
            limiter,
        }
    }

    /// Session, message, integrity, and backup operations live on the engine.
    pub fn engine(&self) -> &Arc<StorageEngine> {
        &self.engine
    }

    pub fn manager(&self) -> &MemoryManager {
        &self.manager
    }
}

#[async_trait]
impl ConversationMemory for MemorySubsystem {
    fn admit(&self, actor: &str) -> bool {
        // non-consuming preview; the write-class calls below do the admitting
        self.limiter.remaining(actor) > 0
    }

    async fn record_message(
        &self,
        actor: &str,
        session_id: i64,
        role: Role,
        content: &str,
    ) -> Result<StoredMessage> {
        // assistant turns are responses, not requests; only user turns spend
        // a window slot
        if role == Role::User && !self.limiter.admit(actor) {
            return Err(EmberError::RateLimited);
        }
        self.engine.append_message(session_id, role, content).await
    }

    async fn context_summary(&self) -> Result<String> {
        self.manager.summary().await
    }

    async fn learn_from_text(
        &self,
        actor: &str,
        text: &str,
        source: FactSource,
    ) -> Result<Vec<LearnOutcome>> {
        if !self.limiter.admit(actor) {
            return Err(EmberError::RateLimited);
        }
        Ok(self.manager.learn_from_text(text, source).await)
    }
}
