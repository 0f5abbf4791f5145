//! Query interpreter
//!
//! Turns a free-text request into something the store can execute: either a
//! structured `QuerySpec` from deterministic keyword rules, or (when the
//! model strategy is configured) a model-generated SELECT that only ever
//! reaches the store through the read-only guard. Read-only by construction.

use std::sync::Arc;
use tracing::warn;

use crate::gemini::GeminiClient;
use crate::models::{Aggregation, DateRange, QuerySpec, TransactionType};
use crate::store;
use crate::Result;

/// Which translation strategy to run. Keyword rules are the default; the
/// model strategy is an explicit opt-in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStrategy {
    Keyword,
    Model,
}

impl QueryStrategy {
    pub fn from_config(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "model" | "llm" | "sql" => QueryStrategy::Model,
            _ => QueryStrategy::Keyword,
        }
    }
}

/// What an utterance compiled to.
#[derive(Debug, Clone)]
pub enum InterpretedQuery {
    Structured(QuerySpec),
    RawSql(String),
}

/// Category keyword groups, scanned in this fixed priority order; the first
/// matching group wins.
const CATEGORY_KEYWORDS: &[(&str, &[&str])] = &[
    ("technology", &["tech", "computer", "laptop", "software", "technology"]),
    (
        "food",
        &["food", "restaurant", "coffee", "lunch", "dinner", "breakfast", "groceries"],
    ),
    ("shopping", &["shopping", "clothes", "amazon", "store", "purchase"]),
    (
        "transportation",
        &["uber", "lyft", "gas", "fuel", "transportation", "car"],
    ),
    ("entertainment", &["movie", "netflix", "spotify", "entertainment"]),
    ("health", &["medical", "doctor", "pharmacy", "health"]),
    ("utilities", &["electricity", "water", "internet", "phone", "utilities"]),
];

const EXPENSE_CUES: &[&str] = &["spent", "spend", "expense", "cost"];
const INCOME_CUES: &[&str] = &["earned", "income", "salary", "revenue"];

const SUM_CUES: &[&str] = &["total", "sum", "how much"];
const AVERAGE_CUES: &[&str] = &["average", "avg"];
const COUNT_CUES: &[&str] = &["count", "how many"];

const THIS_MONTH_CUES: &[&str] = &["this month", "current month", "month"];

/// Deterministic keyword-rule translation. Fields without a cue stay unset.
pub fn interpret_keywords(utterance: &str) -> QuerySpec {
    let lowered = utterance.to_lowercase();
    let has_any = |cues: &[&str]| cues.iter().any(|cue| lowered.contains(cue));

    let mut spec = QuerySpec::default();

    for (category, keywords) in CATEGORY_KEYWORDS {
        if has_any(keywords) {
            spec.filters.category = Some((*category).to_string());
            break;
        }
    }

    if has_any(EXPENSE_CUES) {
        spec.filters.kind = Some(TransactionType::Expense);
    } else if has_any(INCOME_CUES) {
        spec.filters.kind = Some(TransactionType::Income);
    }

    // One aggregation at most, first cue wins.
    if has_any(SUM_CUES) {
        spec.aggregations.push(Aggregation::Sum);
    } else if has_any(AVERAGE_CUES) {
        spec.aggregations.push(Aggregation::Average);
    } else if has_any(COUNT_CUES) {
        spec.aggregations.push(Aggregation::Count);
    }

    if has_any(THIS_MONTH_CUES) {
        spec.filters.date_range = Some(DateRange::ThisMonth);
    }

    spec
}

/// Interpreter with a configured strategy and keyword fallback.
pub struct QueryInterpreter {
    strategy: QueryStrategy,
    llm: Option<Arc<GeminiClient>>,
}

impl QueryInterpreter {
    pub fn new(strategy: QueryStrategy, llm: Option<Arc<GeminiClient>>) -> Self {
        Self { strategy, llm }
    }

    pub async fn interpret(&self, utterance: &str) -> Result<InterpretedQuery> {
        if self.strategy == QueryStrategy::Model {
            if let Some(llm) = &self.llm {
                match generate_sql(llm, utterance).await {
                    Ok(sql) => return Ok(InterpretedQuery::RawSql(sql)),
                    Err(error) => {
                        warn!(
                            "Model query generation failed, falling back to keyword rules: {}",
                            error
                        );
                    }
                }
            }
        }

        Ok(InterpretedQuery::Structured(interpret_keywords(utterance)))
    }
}

async fn generate_sql(llm: &GeminiClient, utterance: &str) -> Result<String> {
    let prompt = build_sql_prompt(utterance);
    let response = llm.generate(&prompt, None).await?;
    let sql = strip_formatting(&response);

    // Validate here so a bad generation is reported as the interpreter's
    // failure, not the store's.
    store::ensure_read_only(&sql)
}

fn build_sql_prompt(utterance: &str) -> String {
    format!(
        r#"Translate this natural language query to SQL: "{}"

The transactions table has these columns:
- id (BIGSERIAL PRIMARY KEY)
- amount (BIGINT, stored in cents)
- description (TEXT)
- category (TEXT)
- type (TEXT, either 'expense' or 'income')
- date (TIMESTAMP WITH TIME ZONE)
- created_at (TIMESTAMP WITH TIME ZONE)
- updated_at (TIMESTAMP WITH TIME ZONE)

Rules:
- Return exactly one SELECT statement
- Amounts are integer cents; divide by 100.0 for dollar output
- No INSERT, UPDATE, DELETE or DDL of any kind
- Return ONLY the SQL, no explanation, no code fences"#,
        utterance
    )
}

/// Strip code fences and surrounding decoration from a model response.
fn strip_formatting(response: &str) -> String {
    response
        .trim()
        .trim_start_matches("```sql")
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim()
        .to_string()
}
