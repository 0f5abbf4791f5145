//! Tool trait and registry
//!
//! The three callable tools the conversation orchestrator exposes to the
//! model: record a transaction, query the ledger, extract transaction
//! fields from free text. Each tool returns the reply string that is fed
//! back to the model.

use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

use crate::currency;
use crate::error::AgentError;
use crate::gemini::{FunctionDeclaration, GeminiClient};
use crate::interpreter::{InterpretedQuery, QueryInterpreter};
use crate::models::{
    parse_date_input, AggregateResult, NewTransaction, Transaction, TransactionType,
    KNOWN_CATEGORIES,
};
use crate::store::TransactionStore;
use crate::Result;

/// A single callable tool.
#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    /// OpenAPI-style schema for the tool's arguments.
    fn parameters(&self) -> Value;
    async fn execute(&self, args: &Value) -> Result<String>;
}

/// Tool registry for looking up and executing tools
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn list(&self) -> Vec<&str> {
        self.tools.keys().map(|s| s.as_str()).collect()
    }

    /// Declarations advertised to the model on every turn.
    pub fn declarations(&self) -> Vec<FunctionDeclaration> {
        self.tools
            .values()
            .map(|tool| FunctionDeclaration {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                parameters: tool.parameters(),
            })
            .collect()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

//
// ================= Reply formatting =================
//

pub fn format_insert_reply(tx: &Transaction) -> String {
    format!(
        "Successfully recorded {} of {} for {} in category '{}'. Transaction ID: {}.",
        tx.kind,
        currency::format_currency(tx.amount),
        tx.description,
        tx.category,
        tx.id
    )
}

pub fn format_aggregate_reply(result: &AggregateResult) -> String {
    let mut parts = Vec::new();

    if let Some(sum) = &result.sum_dollars {
        parts.push(format!("Total: ${}", sum));
    }
    if let Some(count) = result.count {
        parts.push(format!("Count: {} transactions", count));
    }
    if let Some(average) = &result.average_dollars {
        parts.push(format!("Average: ${}", average));
    }

    format!("Query results: {}", parts.join(" | "))
}

pub fn format_transaction_list(transactions: &[Transaction]) -> String {
    if transactions.is_empty() {
        return "No transactions found matching your query.".to_string();
    }

    let mut lines = vec![format!("Found {} transactions:", transactions.len())];
    for (i, tx) in transactions.iter().take(5).enumerate() {
        lines.push(format!(
            "{}. {} - {} ({})",
            i + 1,
            currency::format_currency(tx.amount),
            tx.description,
            tx.category
        ));
    }
    if transactions.len() > 5 {
        lines.push(format!(
            "... and {} more transactions",
            transactions.len() - 5
        ));
    }

    lines.join("\n")
}

fn format_raw_rows(rows: &[Map<String, Value>]) -> String {
    if rows.is_empty() {
        return "No transactions found matching your query.".to_string();
    }

    let shown: Vec<&Map<String, Value>> = rows.iter().take(10).collect();
    let rendered = serde_json::to_string_pretty(&shown)
        .unwrap_or_else(|_| "<unrenderable rows>".to_string());

    let mut reply = format!("Found {} rows:\n{}", rows.len(), rendered);
    if rows.len() > 10 {
        reply.push_str(&format!("\n... and {} more rows", rows.len() - 10));
    }
    reply
}

//
// ================= Argument helpers =================
//

fn require_str<'a>(args: &'a Value, key: &str) -> Result<&'a str> {
    args.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| AgentError::Validation(format!("'{}' is required", key)))
}

/// Amount argument in dollars, as a JSON number or string.
fn amount_to_minor_units(args: &Value) -> Result<i64> {
    match args.get("amount") {
        Some(Value::Number(n)) => {
            let dollars = n
                .as_f64()
                .ok_or_else(|| AgentError::InvalidAmount(format!("'{}' is out of range", n)))?;
            currency::f64_to_minor_units(dollars)
        }
        Some(Value::String(s)) => currency::parse_amount_string(s),
        _ => Err(AgentError::Validation("'amount' is required".to_string())),
    }
}

//
// ================= Insert tool =================
//

pub struct InsertTransactionTool {
    store: Arc<TransactionStore>,
}

impl InsertTransactionTool {
    pub fn new(store: Arc<TransactionStore>) -> Self {
        Self { store }
    }
}

#[async_trait::async_trait]
impl Tool for InsertTransactionTool {
    fn name(&self) -> &'static str {
        "insert_transaction"
    }

    fn description(&self) -> &'static str {
        "Record a new financial transaction in the ledger"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "OBJECT",
            "properties": {
                "amount": {
                    "type": "NUMBER",
                    "description": "Transaction amount in dollars, e.g. 50.00"
                },
                "description": {
                    "type": "STRING",
                    "description": "What the transaction was for"
                },
                "category": {
                    "type": "STRING",
                    "description": format!("Category, e.g. one of: {}", KNOWN_CATEGORIES.join(", "))
                },
                "transaction_type": {
                    "type": "STRING",
                    "enum": ["expense", "income"]
                },
                "date": {
                    "type": "STRING",
                    "description": "Optional transaction date, YYYY-MM-DD"
                }
            },
            "required": ["amount", "description", "category", "transaction_type"]
        })
    }

    async fn execute(&self, args: &Value) -> Result<String> {
        let amount = amount_to_minor_units(args)?;
        currency::validate_minor_units(amount)?;

        let description = require_str(args, "description")?;
        let category = require_str(args, "category")?;

        // Some models name this field "type" despite the declaration.
        let kind: TransactionType = args
            .get("transaction_type")
            .or_else(|| args.get("type"))
            .and_then(Value::as_str)
            .ok_or_else(|| AgentError::Validation("'transaction_type' is required".to_string()))?
            .parse()?;

        let date = match args.get("date").and_then(Value::as_str) {
            Some(text) if !text.trim().is_empty() => Some(parse_date_input(text)?),
            _ => None,
        };

        let transaction = self
            .store
            .insert(NewTransaction {
                amount,
                description: description.to_string(),
                category: category.to_string(),
                kind,
                date,
            })
            .await?;

        Ok(format_insert_reply(&transaction))
    }
}

//
// ================= Query tool =================
//

pub struct QueryTransactionsTool {
    store: Arc<TransactionStore>,
    interpreter: Arc<QueryInterpreter>,
}

impl QueryTransactionsTool {
    pub fn new(store: Arc<TransactionStore>, interpreter: Arc<QueryInterpreter>) -> Self {
        Self { store, interpreter }
    }
}

#[async_trait::async_trait]
impl Tool for QueryTransactionsTool {
    fn name(&self) -> &'static str {
        "query_transactions"
    }

    fn description(&self) -> &'static str {
        "Query recorded transactions using natural language"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "OBJECT",
            "properties": {
                "query": {
                    "type": "STRING",
                    "description": "The user's question about their transactions"
                }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, args: &Value) -> Result<String> {
        let query = require_str(args, "query")
            .map_err(|_| AgentError::ToolInvocation("Expected 'query' for this tool".to_string()))?;

        match self.interpreter.interpret(query).await? {
            InterpretedQuery::Structured(spec) => {
                if spec.aggregations.is_empty() {
                    let transactions = self.store.query(&spec).await?;
                    Ok(format_transaction_list(&transactions))
                } else {
                    let result = self.store.aggregate(&spec).await?;
                    Ok(format_aggregate_reply(&result))
                }
            }
            InterpretedQuery::RawSql(sql) => {
                let rows = self.store.execute_raw(&sql).await?;
                Ok(format_raw_rows(&rows))
            }
        }
    }
}

//
// ================= Extract tool =================
//

pub struct ExtractTransactionTool {
    llm: Arc<GeminiClient>,
}

impl ExtractTransactionTool {
    pub fn new(llm: Arc<GeminiClient>) -> Self {
        Self { llm }
    }
}

#[async_trait::async_trait]
impl Tool for ExtractTransactionTool {
    fn name(&self) -> &'static str {
        "extract_transaction"
    }

    fn description(&self) -> &'static str {
        "Extract structured transaction details from free text"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "OBJECT",
            "properties": {
                "text": {
                    "type": "STRING",
                    "description": "The text to extract transaction details from"
                }
            },
            "required": ["text"]
        })
    }

    async fn execute(&self, args: &Value) -> Result<String> {
        let text = require_str(args, "text")
            .map_err(|_| AgentError::ToolInvocation("Expected 'text' for this tool".to_string()))?;

        let prompt = format!(
            r#"Extract transaction details from the following text: "{}"

Return a JSON object with these fields:
- amount: number (the transaction amount in dollars)
- description: string (what the transaction was for)
- category: string (one of: {})
- type: string (either "expense" or "income")

If any information is missing, make reasonable assumptions.
Return ONLY the JSON object."#,
            text,
            KNOWN_CATEGORIES.join(", ")
        );

        let response = self.llm.generate(&prompt, None).await?;

        match extract_json_object(&response) {
            Some(details) => Ok(format!(
                "Extracted transaction: {}",
                serde_json::to_string_pretty(&details)?
            )),
            None => Ok(format!(
                "Could not extract transaction details from: {}",
                text
            )),
        }
    }
}

/// Pull a JSON object out of a model response: a ```json fenced block first,
/// then the widest `{ ... }` span.
fn extract_json_object(text: &str) -> Option<Value> {
    if let Some(start) = text.find("```json") {
        let after = &text[start + 7..];
        if let Some(end) = after.find("```") {
            if let Ok(parsed) = serde_json::from_str::<Value>(after[..end].trim()) {
                if parsed.is_object() {
                    return Some(parsed);
                }
            }
        }
    }

    let brace_start = text.find('{')?;
    let brace_end = text.rfind('}')?;
    if brace_end <= brace_start {
        return None;
    }

    serde_json::from_str::<Value>(&text[brace_start..=brace_end])
        .ok()
        .filter(|parsed| parsed.is_object())
}

/// Wire the default tool set against shared collaborators.
pub fn create_registry(
    store: Arc<TransactionStore>,
    interpreter: Arc<QueryInterpreter>,
    llm: Arc<GeminiClient>,
) -> ToolRegistry {
    let mut registry = ToolRegistry::new();

    registry.register(Arc::new(InsertTransactionTool::new(store.clone())));
    registry.register(Arc::new(QueryTransactionsTool::new(store, interpreter)));
    registry.register(Arc::new(ExtractTransactionTool::new(llm)));

    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interpreter::QueryStrategy;
    use chrono::Utc;

    fn sample_tx(id: i64, amount: i64, description: &str, category: &str) -> Transaction {
        Transaction {
            id,
            amount,
            description: description.to_string(),
            category: category.to_string(),
            kind: TransactionType::Expense,
            date: Utc::now(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_insert_reply_mentions_every_field() {
        let reply = format_insert_reply(&sample_tx(42, 5000, "Groceries", "groceries"));

        assert!(reply.contains("expense"));
        assert!(reply.contains("$50.00"));
        assert!(reply.contains("Groceries"));
        assert!(reply.contains("'groceries'"));
        assert!(reply.contains("42"));
    }

    #[test]
    fn test_aggregate_reply_joins_requested_parts() {
        let result = AggregateResult {
            sum: Some(3500),
            sum_dollars: Some(currency::to_major_units(3500)),
            count: Some(2),
            ..Default::default()
        };

        assert_eq!(
            format_aggregate_reply(&result),
            "Query results: Total: $35.00 | Count: 2 transactions"
        );
    }

    #[test]
    fn test_transaction_list_caps_at_five() {
        let transactions: Vec<Transaction> = (1..=7)
            .map(|i| sample_tx(i, i * 100, "Coffee", "food"))
            .collect();

        let reply = format_transaction_list(&transactions);
        assert!(reply.starts_with("Found 7 transactions:"));
        assert!(reply.contains("5. $5.00 - Coffee (food)"));
        assert!(!reply.contains("6. "));
        assert!(reply.contains("... and 2 more transactions"));

        assert_eq!(
            format_transaction_list(&[]),
            "No transactions found matching your query."
        );
    }

    #[test]
    fn test_extract_json_object() {
        let fenced = "Here you go:\n```json\n{\"amount\": 12.5}\n```";
        assert_eq!(extract_json_object(fenced).unwrap()["amount"], 12.5);

        let bare = "result {\"amount\": 3} done";
        assert_eq!(extract_json_object(bare).unwrap()["amount"], 3);

        assert!(extract_json_object("no json here").is_none());
    }

    #[tokio::test]
    async fn test_insert_tool_round_trip() {
        let store = Arc::new(TransactionStore::in_memory());
        let tool = InsertTransactionTool::new(store.clone());

        let reply = tool
            .execute(&json!({
                "amount": 50.0,
                "description": "Groceries",
                "category": "groceries",
                "transaction_type": "expense"
            }))
            .await
            .unwrap();

        assert!(reply.contains("$50.00"));
        assert!(reply.contains("Transaction ID: 1"));

        let stored = store.query(&Default::default()).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].amount, 5000);
    }

    #[tokio::test]
    async fn test_insert_tool_accepts_string_amount_and_date() {
        let store = Arc::new(TransactionStore::in_memory());
        let tool = InsertTransactionTool::new(store);

        let reply = tool
            .execute(&json!({
                "amount": "$1,050.25",
                "description": "Laptop",
                "category": "technology",
                "transaction_type": "expense",
                "date": "2025-03-01"
            }))
            .await
            .unwrap();

        assert!(reply.contains("$1050.25"));
    }

    #[tokio::test]
    async fn test_insert_tool_rejects_bad_type() {
        let store = Arc::new(TransactionStore::in_memory());
        let tool = InsertTransactionTool::new(store);

        let result = tool
            .execute(&json!({
                "amount": 10.0,
                "description": "Mystery",
                "category": "misc",
                "transaction_type": "transfer"
            }))
            .await;

        assert!(matches!(result, Err(AgentError::Validation(_))));
    }

    #[tokio::test]
    async fn test_query_tool_aggregation_path() {
        let store = Arc::new(TransactionStore::in_memory());
        store
            .insert(NewTransaction {
                amount: 5000,
                description: "Groceries".to_string(),
                category: "food".to_string(),
                kind: TransactionType::Expense,
                date: None,
            })
            .await
            .unwrap();

        let interpreter = Arc::new(QueryInterpreter::new(QueryStrategy::Keyword, None));
        let tool = QueryTransactionsTool::new(store, interpreter);

        let reply = tool
            .execute(&json!({"query": "How much did I spend on food this month?"}))
            .await
            .unwrap();

        assert_eq!(reply, "Query results: Total: $50.00");
    }

    #[tokio::test]
    async fn test_query_tool_listing_path() {
        let store = Arc::new(TransactionStore::in_memory());
        store
            .insert(NewTransaction {
                amount: 1200,
                description: "Lunch".to_string(),
                category: "food".to_string(),
                kind: TransactionType::Expense,
                date: None,
            })
            .await
            .unwrap();

        let interpreter = Arc::new(QueryInterpreter::new(QueryStrategy::Keyword, None));
        let tool = QueryTransactionsTool::new(store, interpreter);

        let reply = tool
            .execute(&json!({"query": "show my food transactions"}))
            .await
            .unwrap();

        assert!(reply.contains("1. $12.00 - Lunch (food)"));
    }
}
