use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::json;
use tracing::Level;
use uuid::Uuid;

use spaceduck_observability::{emit_event, redact_text, ObservabilityEvent, ProcessKind};
use spaceduck_types::{
    BudgetSnapshot, MemoryKind, MemoryScope, MemorySource, MemoryWriteInput, MemoryWriteResult,
    ResultRoute, Task,
};

use crate::agent::{AgentChunk, AgentLoop, AgentRunOptions, ConversationStore, MemoryStore};
use crate::budget::{resolve_budget, BudgetDefaults, BudgetGuard};
use crate::error::RunError;
use crate::event_bus::EventBus;
use crate::pricing::PricingLookup;

/// Follow-up requested by a `chain_next` result route; applied by the queue.
#[derive(Debug, Clone)]
pub struct ChainDirective {
    pub task_definition_id: String,
    pub context: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub response: String,
    pub snapshot: BudgetSnapshot,
    pub chain: Option<ChainDirective>,
}

/// Drives one task through the agent stream under a budget guard and routes
/// the result.
pub struct TaskRunner {
    agent: Arc<dyn AgentLoop>,
    conversations: Arc<dyn ConversationStore>,
    memory: Option<Arc<dyn MemoryStore>>,
    pricing: Arc<PricingLookup>,
    bus: EventBus,
    defaults: BudgetDefaults,
    model_id: String,
}

impl TaskRunner {
    pub fn new(
        agent: Arc<dyn AgentLoop>,
        conversations: Arc<dyn ConversationStore>,
        memory: Option<Arc<dyn MemoryStore>>,
        pricing: Arc<PricingLookup>,
        bus: EventBus,
        defaults: BudgetDefaults,
        model_id: String,
    ) -> Self {
        Self {
            agent,
            conversations,
            memory,
            pricing,
            bus,
            defaults,
            model_id,
        }
    }

    pub async fn run(
        &self,
        task: &Task,
        chained_context: Option<String>,
    ) -> Result<RunOutcome, RunError> {
        let limits = resolve_budget(&task.budget, &self.defaults);
        let guard = BudgetGuard::new(task.clone(), limits, self.bus.clone());
        let result = self.run_guarded(task, chained_context, &guard).await;
        guard.dispose();
        result
    }

    async fn run_guarded(
        &self,
        task: &Task,
        chained_context: Option<String>,
        guard: &BudgetGuard,
    ) -> Result<RunOutcome, RunError> {
        let conversation_id = match &task.definition.conversation_id {
            Some(id) => id.clone(),
            None => synthesized_conversation_id(&task.id),
        };
        if self.conversations.load(&conversation_id).await?.is_none() {
            self.conversations
                .create(&conversation_id, &task.definition.name)
                .await?;
        }

        let mut user_message = task.definition.prompt.clone();
        if let Some(context) = &chained_context {
            user_message.push_str(&format!(
                "\n\n<previous_task_output>\n{}\n</previous_task_output>",
                context
            ));
        }

        emit_event(
            Level::INFO,
            ProcessKind::Scheduler,
            ObservabilityEvent {
                event: "task.run.start",
                component: "scheduler.runner",
                task_id: Some(&task.id),
                run_id: None,
                conversation_id: Some(&conversation_id),
                model_id: Some(&self.model_id),
                status: Some("start"),
                error_code: None,
                detail: None,
            },
        );

        let cancel = guard.signal();
        let mut stream = self
            .agent
            .run(
                &conversation_id,
                &user_message,
                AgentRunOptions {
                    system_prompt: task.definition.system_prompt.clone(),
                    allowed_tools: task.definition.allowed_tools.clone(),
                    denied_tools: task.definition.denied_tools.clone(),
                    cancel: cancel.clone(),
                },
            )
            .await?;

        let mut response = String::new();
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                chunk = stream.next() => {
                    let Some(chunk) = chunk else { break };
                    match chunk {
                        Ok(AgentChunk::Text { text }) => {
                            guard.track_chars(text.len());
                            response.push_str(&text);
                        }
                        Ok(AgentChunk::ToolCall) => guard.track_tool_call(),
                        Ok(AgentChunk::Usage { usage }) => {
                            let cost = self.pricing.estimate(&self.model_id, &usage);
                            guard.replace_with_exact_usage(&usage, Some(cost));
                        }
                        Err(err) => return Err(RunError::Agent(err)),
                    }
                }
            }
        }

        let snapshot = guard.snapshot();
        if let Some(limit) = guard.aborted_reason() {
            emit_event(
                Level::WARN,
                ProcessKind::Scheduler,
                ObservabilityEvent {
                    event: "task.run.finish",
                    component: "scheduler.runner",
                    task_id: Some(&task.id),
                    run_id: None,
                    conversation_id: Some(&conversation_id),
                    model_id: Some(&self.model_id),
                    status: Some("budget_exceeded"),
                    error_code: Some(limit.as_str()),
                    detail: None,
                },
            );
            return Err(RunError::BudgetExceeded {
                limit,
                snapshot,
                partial_response: response,
            });
        }

        let chain = self.route_result(task, &response, &snapshot, guard).await;
        let redacted = redact_text(&response);
        emit_event(
            Level::INFO,
            ProcessKind::Scheduler,
            ObservabilityEvent {
                event: "task.run.finish",
                component: "scheduler.runner",
                task_id: Some(&task.id),
                run_id: None,
                conversation_id: Some(&conversation_id),
                model_id: Some(&self.model_id),
                status: Some("completed"),
                error_code: None,
                detail: Some(&redacted),
            },
        );
        Ok(RunOutcome {
            response,
            snapshot,
            chain,
        })
    }

    async fn route_result(
        &self,
        task: &Task,
        response: &str,
        snapshot: &BudgetSnapshot,
        guard: &BudgetGuard,
    ) -> Option<ChainDirective> {
        match &task.definition.result_route {
            ResultRoute::Silent => None,
            ResultRoute::Notify => {
                self.bus.emit(
                    "task:notify",
                    json!({
                        "task": task,
                        "snapshot": snapshot,
                        "response": response,
                    }),
                );
                None
            }
            ResultRoute::MemoryUpdate => {
                let Some(memory) = &self.memory else {
                    tracing::warn!(task_id = %task.id, "memory_update route with no memory store");
                    return None;
                };
                let counting = CountingMemoryStore {
                    inner: memory.clone(),
                    guard: guard.clone(),
                };
                let input = MemoryWriteInput {
                    kind: MemoryKind::Episode,
                    title: task.definition.name.clone(),
                    content: response.to_string(),
                    scope: MemoryScope::Global,
                    source: MemorySource::system_task(task.id.clone()),
                    tags: vec!["scheduled-task".to_string()],
                    occurred_at: chrono::Utc::now(),
                };
                if let Err(err) = counting.store(input).await {
                    tracing::warn!(task_id = %task.id, error = %err, "memory write skipped");
                }
                None
            }
            ResultRoute::ChainNext {
                task_definition_id,
                context_from_result,
            } => Some(ChainDirective {
                task_definition_id: task_definition_id.clone(),
                context: context_from_result.then(|| response.to_string()),
            }),
        }
    }
}

fn synthesized_conversation_id(task_id: &str) -> String {
    let rand: String = Uuid::new_v4().simple().to_string().chars().take(8).collect();
    format!("task-{}-{}", task_id, rand)
}

/// Wraps the memory store for one run: refuses writes once the per-run
/// write budget is exhausted, and counts successful writes on the guard.
pub struct CountingMemoryStore {
    inner: Arc<dyn MemoryStore>,
    guard: BudgetGuard,
}

impl CountingMemoryStore {
    pub fn new(inner: Arc<dyn MemoryStore>, guard: BudgetGuard) -> Self {
        Self { inner, guard }
    }
}

#[async_trait]
impl MemoryStore for CountingMemoryStore {
    async fn store(&self, input: MemoryWriteInput) -> anyhow::Result<MemoryWriteResult> {
        if self.guard.memory_writes_budget_exhausted() {
            anyhow::bail!("memory write budget exhausted");
        }
        let result = self.inner.store(input).await?;
        self.guard.track_memory_write();
        Ok(result)
    }

    async fn supersede(
        &self,
        old_id: &str,
        input: MemoryWriteInput,
    ) -> anyhow::Result<MemoryWriteResult> {
        if self.guard.memory_writes_budget_exhausted() {
            anyhow::bail!("memory write budget exhausted");
        }
        let result = self.inner.supersede(old_id, input).await?;
        self.guard.track_memory_write();
        Ok(result)
    }
}
