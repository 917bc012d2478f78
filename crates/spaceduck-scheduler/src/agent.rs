use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use tokio_util::sync::CancellationToken;

use spaceduck_types::{Conversation, MemoryWriteInput, MemoryWriteResult, TokenUsage};

/// One tagged chunk from the agent loop's stream.
#[derive(Debug, Clone)]
pub enum AgentChunk {
    Text { text: String },
    ToolCall,
    Usage { usage: TokenUsage },
}

pub type AgentStream = Pin<Box<dyn Stream<Item = anyhow::Result<AgentChunk>> + Send>>;

#[derive(Debug, Clone, Default)]
pub struct AgentRunOptions {
    pub system_prompt: Option<String>,
    pub allowed_tools: Option<Vec<String>>,
    pub denied_tools: Option<Vec<String>>,
    pub cancel: CancellationToken,
}

/// The agent loop the scheduler drives. The implementation honors the
/// cancellation token at chunk boundaries.
#[async_trait]
pub trait AgentLoop: Send + Sync {
    async fn run(
        &self,
        conversation_id: &str,
        user_message: &str,
        opts: AgentRunOptions,
    ) -> anyhow::Result<AgentStream>;
}

#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn load(&self, id: &str) -> anyhow::Result<Option<Conversation>>;
    async fn create(&self, id: &str, title: &str) -> anyhow::Result<Conversation>;
}

#[async_trait]
pub trait MemoryStore: Send + Sync {
    async fn store(&self, input: MemoryWriteInput) -> anyhow::Result<MemoryWriteResult>;
    async fn supersede(
        &self,
        old_id: &str,
        input: MemoryWriteInput,
    ) -> anyhow::Result<MemoryWriteResult>;
}
