//! Seam consumed by the streaming client. The assistant's outer layers talk
//! to persistence and memory exclusively through this trait.

use async_trait::async_trait;

use crate::memory::LearnOutcome;
use crate::store::{FactSource, Role, StoredMessage};
use crate::Result;

#[async_trait]
pub trait ConversationMemory: Send + Sync {
    /// Whether a write-class request from `actor` would currently be
    /// admitted. Does not consume a window slot: [`record_message`] and
    /// [`learn_from_text`] are the admission points, so check-then-persist
    /// spends exactly one slot per turn.
    ///
    /// [`record_message`]: Self::record_message
    /// [`learn_from_text`]: Self::learn_from_text
    fn admit(&self, actor: &str) -> bool;

    /// Appends one chat turn to a session. User turns count against the
    /// actor's rate window and come back [`EmberError::RateLimited`] when it
    /// is full.
    ///
    /// [`EmberError::RateLimited`]: crate::EmberError::RateLimited
    async fn record_message(
        &self,
        actor: &str,
        session_id: i64,
        role: Role,
        content: &str,
    ) -> Result<StoredMessage>;

    /// Budgeted summary of everything known about the user, for prompt
    /// assembly.
    async fn context_summary(&self) -> Result<String>;

    /// Best-effort fact learning from one piece of chat text.
    async fn learn_from_text(
        &self,
        actor: &str,
        text: &str,
        source: FactSource,
    ) -> Result<Vec<LearnOutcome>>;
}
