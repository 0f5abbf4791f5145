//! Conversation orchestrator
//!
//! Drives the function-calling loop: the model decides which of the three
//! tools to invoke, every tool reply is fed back, and the final text turn is
//! the user-visible answer. The agent holds no per-conversation state; chat
//! history arrives from the caller on every request, so concurrent turns are
//! independent.

use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::error::AgentError;
use crate::gemini::{Content, FunctionDeclaration, GeminiClient, LlmTurn, Part};
use crate::models::ChatMessage;
use crate::tools::ToolRegistry;
use crate::Result;

/// Hard cap on tool round trips within a single chat turn.
const MAX_TOOL_ROUNDS: usize = 4;

const SYSTEM_PROMPT: &str = r#"You are a financial assistant that helps users manage their transactions.

Your job is to understand user requests and determine the appropriate action:

1. If the user is describing a transaction they want to record (e.g., "I spent $50 on groceries"),
   use the insert_transaction tool to store it.

2. If the user is asking about their transactions (e.g., "How much did I spend on food?"),
   use the query_transactions tool to retrieve information.

3. If the user asks you to extract transaction details from text,
   use the extract_transaction tool.

Always be helpful and provide clear responses about what you're doing."#;

/// The seam the orchestrator drives. Lets tests script model turns.
#[async_trait::async_trait]
pub trait ChatModel: Send + Sync {
    async fn generate_turn(
        &self,
        system: &str,
        contents: Vec<Content>,
        declarations: &[FunctionDeclaration],
    ) -> Result<LlmTurn>;
}

#[async_trait::async_trait]
impl ChatModel for GeminiClient {
    async fn generate_turn(
        &self,
        system: &str,
        contents: Vec<Content>,
        declarations: &[FunctionDeclaration],
    ) -> Result<LlmTurn> {
        GeminiClient::generate_turn(self, system, contents, declarations).await
    }
}

/// A piece of a streamed reply.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplyChunk {
    Content(String),
    Error(String),
    Done,
}

pub struct FinancialAgent {
    llm: Arc<dyn ChatModel>,
    registry: ToolRegistry,
}

impl FinancialAgent {
    pub fn new(llm: Arc<dyn ChatModel>, registry: ToolRegistry) -> Self {
        Self { llm, registry }
    }

    /// Process one chat turn and return the final reply text.
    pub async fn chat(&self, message: &str, history: &[ChatMessage]) -> Result<String> {
        let declarations = self.registry.declarations();

        let mut contents = Content::from_history(history);
        contents.push(Content::user_text(message));

        for round in 0..MAX_TOOL_ROUNDS {
            let turn = self
                .llm
                .generate_turn(SYSTEM_PROMPT, contents.clone(), &declarations)
                .await?;

            if turn.tool_calls.is_empty() {
                return Ok(turn
                    .text
                    .unwrap_or_else(|| "I'm not sure how to help with that.".to_string()));
            }

            info!(
                round,
                tool_count = turn.tool_calls.len(),
                "Model requested tool calls"
            );

            let mut result_parts = Vec::with_capacity(turn.tool_calls.len());
            for call in &turn.tool_calls {
                let reply = self.run_tool(&call.name, &call.args).await;
                result_parts.push(Part::function_response(&call.name, reply));
            }

            contents.push(turn.content);
            contents.push(Content::tool_results(result_parts));
        }

        Err(AgentError::ToolInvocation(format!(
            "exceeded {} tool rounds without a final answer",
            MAX_TOOL_ROUNDS
        )))
    }

    /// Execute one tool call. Failures are converted to reply strings so the
    /// conversation continues instead of terminating on a tool error.
    async fn run_tool(&self, name: &str, args: &Value) -> String {
        match self.registry.get(name) {
            Some(tool) => match tool.execute(args).await {
                Ok(reply) => reply,
                Err(error) => {
                    warn!(tool = name, error = %error, "Tool execution failed");
                    format!("Error executing {}: {}", name, error)
                }
            },
            None => {
                warn!(tool = name, "Model requested an unknown tool");
                format!("Error: unknown tool '{}'", name)
            }
        }
    }

    /// Streaming variant: the finished reply is re-chunked at word
    /// boundaries onto the channel; failures become an error chunk. `Done`
    /// is always the final chunk.
    pub async fn chat_stream(
        &self,
        message: &str,
        history: &[ChatMessage],
        sender: mpsc::Sender<ReplyChunk>,
    ) {
        match self.chat(message, history).await {
            Ok(reply) => {
                for chunk in chunk_reply(&reply) {
                    if sender.send(ReplyChunk::Content(chunk)).await.is_err() {
                        return;
                    }
                }
            }
            Err(error) => {
                let _ = sender.send(ReplyChunk::Error(error.to_string())).await;
            }
        }

        let _ = sender.send(ReplyChunk::Done).await;
    }
}

/// Split a reply into word-boundary chunks of roughly this size.
const CHUNK_TARGET_BYTES: usize = 48;

fn chunk_reply(reply: &str) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();

    for word in reply.split_inclusive(char::is_whitespace) {
        current.push_str(word);
        if current.len() >= CHUNK_TARGET_BYTES {
            chunks.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }

    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gemini::FunctionCall;
    use crate::interpreter::{QueryInterpreter, QueryStrategy};
    use crate::store::TransactionStore;
    use crate::tools::{InsertTransactionTool, QueryTransactionsTool};
    use serde_json::json;
    use std::collections::VecDeque;
    use tokio::sync::Mutex;

    /// Scripted model: pops one prepared turn per call.
    struct ScriptedModel {
        turns: Mutex<VecDeque<LlmTurn>>,
    }

    impl ScriptedModel {
        fn new(turns: Vec<LlmTurn>) -> Self {
            Self {
                turns: Mutex::new(turns.into()),
            }
        }
    }

    #[async_trait::async_trait]
    impl ChatModel for ScriptedModel {
        async fn generate_turn(
            &self,
            _system: &str,
            _contents: Vec<Content>,
            _declarations: &[FunctionDeclaration],
        ) -> Result<LlmTurn> {
            self.turns
                .lock()
                .await
                .pop_front()
                .ok_or_else(|| AgentError::Llm("script exhausted".to_string()))
        }
    }

    fn text_turn(text: &str) -> LlmTurn {
        LlmTurn {
            content: Content {
                role: "model".to_string(),
                parts: vec![Part::text(text)],
            },
            text: Some(text.to_string()),
            tool_calls: vec![],
        }
    }

    fn tool_turn(name: &str, args: Value) -> LlmTurn {
        let call = FunctionCall {
            name: name.to_string(),
            args,
        };
        LlmTurn {
            content: Content {
                role: "model".to_string(),
                parts: vec![Part {
                    function_call: Some(call.clone()),
                    ..Default::default()
                }],
            },
            text: None,
            tool_calls: vec![call],
        }
    }

    fn registry_with_store(store: Arc<TransactionStore>) -> ToolRegistry {
        let interpreter = Arc::new(QueryInterpreter::new(QueryStrategy::Keyword, None));
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(InsertTransactionTool::new(store.clone())));
        registry.register(Arc::new(QueryTransactionsTool::new(store, interpreter)));
        registry
    }

    #[tokio::test]
    async fn test_chat_insert_flow() {
        let store = Arc::new(TransactionStore::in_memory());
        let model = Arc::new(ScriptedModel::new(vec![
            tool_turn(
                "insert_transaction",
                json!({
                    "amount": 50.0,
                    "description": "Groceries",
                    "category": "groceries",
                    "transaction_type": "expense"
                }),
            ),
            text_turn("Recorded your $50.00 groceries expense."),
        ]));

        let agent = FinancialAgent::new(model, registry_with_store(store.clone()));
        let reply = agent.chat("I spent $50 on groceries", &[]).await.unwrap();

        assert_eq!(reply, "Recorded your $50.00 groceries expense.");
        let stored = agent_store_rows(&store).await;
        assert_eq!(stored, 1);
    }

    async fn agent_store_rows(store: &TransactionStore) -> usize {
        store.query(&Default::default()).await.unwrap().len()
    }

    #[tokio::test]
    async fn test_chat_plain_text_turn_needs_no_tools() {
        let model = Arc::new(ScriptedModel::new(vec![text_turn("Hello! How can I help?")]));
        let agent = FinancialAgent::new(
            model,
            registry_with_store(Arc::new(TransactionStore::in_memory())),
        );

        let reply = agent.chat("hi", &[]).await.unwrap();
        assert_eq!(reply, "Hello! How can I help?");
    }

    #[tokio::test]
    async fn test_tool_failure_becomes_reply_string() {
        let store = Arc::new(TransactionStore::in_memory());
        let model = Arc::new(ScriptedModel::new(vec![
            tool_turn(
                "insert_transaction",
                json!({
                    "amount": -5.0,
                    "description": "Bad",
                    "category": "misc",
                    "transaction_type": "expense"
                }),
            ),
            text_turn("That amount looks invalid."),
        ]));

        let agent = FinancialAgent::new(model, registry_with_store(store.clone()));
        let reply = agent.chat("record -5 dollars", &[]).await.unwrap();

        // Conversation survived the tool failure and nothing was written.
        assert_eq!(reply, "That amount looks invalid.");
        assert_eq!(agent_store_rows(&store).await, 0);
    }

    #[tokio::test]
    async fn test_unknown_tool_is_softened() {
        let model = Arc::new(ScriptedModel::new(vec![
            tool_turn("send_wire_transfer", json!({})),
            text_turn("I cannot do that."),
        ]));
        let agent = FinancialAgent::new(
            model,
            registry_with_store(Arc::new(TransactionStore::in_memory())),
        );

        let reply = agent.chat("wire money", &[]).await.unwrap();
        assert_eq!(reply, "I cannot do that.");
    }

    #[tokio::test]
    async fn test_runaway_tool_loop_is_bounded() {
        let turns: Vec<LlmTurn> = (0..MAX_TOOL_ROUNDS + 1)
            .map(|_| tool_turn("query_transactions", json!({"query": "everything"})))
            .collect();
        let model = Arc::new(ScriptedModel::new(turns));
        let agent = FinancialAgent::new(
            model,
            registry_with_store(Arc::new(TransactionStore::in_memory())),
        );

        let result = agent.chat("loop forever", &[]).await;
        assert!(matches!(result, Err(AgentError::ToolInvocation(_))));
    }

    #[tokio::test]
    async fn test_chat_stream_ends_with_done() {
        let model = Arc::new(ScriptedModel::new(vec![text_turn(
            "A reply long enough to be split into more than one content chunk for the stream.",
        )]));
        let agent = FinancialAgent::new(
            model,
            registry_with_store(Arc::new(TransactionStore::in_memory())),
        );

        let (sender, mut receiver) = mpsc::channel(16);
        agent.chat_stream("hello", &[], sender).await;

        let mut chunks = Vec::new();
        while let Some(chunk) = receiver.recv().await {
            chunks.push(chunk);
        }

        assert!(chunks.len() > 2);
        assert_eq!(chunks.last(), Some(&ReplyChunk::Done));
        let reassembled: String = chunks
            .iter()
            .filter_map(|chunk| match chunk {
                ReplyChunk::Content(text) => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(
            reassembled,
            "A reply long enough to be split into more than one content chunk for the stream."
        );
    }

    #[tokio::test]
    async fn test_chat_stream_error_chunk() {
        let model = Arc::new(ScriptedModel::new(vec![]));
        let agent = FinancialAgent::new(
            model,
            registry_with_store(Arc::new(TransactionStore::in_memory())),
        );

        let (sender, mut receiver) = mpsc::channel(16);
        agent.chat_stream("hello", &[], sender).await;

        let first = receiver.recv().await.unwrap();
        assert!(matches!(first, ReplyChunk::Error(_)));
        assert_eq!(receiver.recv().await.unwrap(), ReplyChunk::Done);
    }

    #[test]
    fn test_chunk_reply_reassembles() {
        let text = "one two three four five six seven eight nine ten eleven twelve";
        let chunks = chunk_reply(text);
        assert!(chunks.len() > 1);
        assert_eq!(chunks.concat(), text);

        assert!(chunk_reply("").is_empty());
    }
}
