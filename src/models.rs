//! Core data models for the financial assistant

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::currency;
use crate::error::AgentError;

/// Categories suggested to the model. The stored column stays open text.
pub const KNOWN_CATEGORIES: &[&str] = &[
    "technology",
    "subscriptions",
    "food",
    "shopping",
    "groceries",
    "transportation",
    "entertainment",
    "health",
    "utilities",
    "taxes",
];

//
// ================= Enums =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransactionType {
    Expense,
    Income,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Expense => "expense",
            TransactionType::Income => "income",
        }
    }
}

impl FromStr for TransactionType {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "expense" => Ok(TransactionType::Expense),
            "income" => Ok(TransactionType::Income),
            other => Err(AgentError::Validation(format!(
                "transaction type must be 'expense' or 'income', got '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DateRange {
    ThisMonth,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Aggregation {
    Sum,
    Count,
    Average,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    Desc,
}

/// Sortable columns. Keeping this closed keeps ORDER BY clauses out of
/// caller hands.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SortField {
    Date,
    Amount,
    CreatedAt,
}

impl SortField {
    pub fn column(&self) -> &'static str {
        match self {
            SortField::Date => "date",
            SortField::Amount => "amount",
            SortField::CreatedAt => "created_at",
        }
    }
}

//
// ================= Transaction =================
//

/// A stored ledger row. `amount` is integer cents.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Transaction {
    pub id: i64,
    pub amount: i64,
    pub description: String,
    pub category: String,
    #[serde(rename = "type")]
    pub kind: TransactionType,
    pub date: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Transaction {
    /// Derived major-unit display amount.
    pub fn amount_dollars(&self) -> Decimal {
        currency::to_major_units(self.amount)
    }

    /// API representation: the stored row plus the derived dollar amount
    /// and ISO-8601 timestamps.
    pub fn to_api_json(&self) -> serde_json::Value {
        serde_json::json!({
            "id": self.id,
            "amount": self.amount,
            "amount_dollars": self.amount_dollars(),
            "description": self.description,
            "category": self.category,
            "type": self.kind,
            "date": self.date.to_rfc3339(),
            "created_at": self.created_at.to_rfc3339(),
            "updated_at": self.updated_at.to_rfc3339(),
        })
    }
}

/// Insert payload. The store assigns the id and both system timestamps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTransaction {
    pub amount: i64,
    pub description: String,
    pub category: String,
    pub kind: TransactionType,
    pub date: Option<DateTime<Utc>>,
}

//
// ================= QuerySpec =================
//

/// Filters applied to a ledger read.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct QueryFilters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<TransactionType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_range: Option<DateRange>,
}

/// Ephemeral structured query derived from a natural-language utterance.
/// Never persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QuerySpec {
    #[serde(default)]
    pub filters: QueryFilters,
    #[serde(default)]
    pub aggregations: Vec<Aggregation>,
    #[serde(default = "QuerySpec::default_sort_by")]
    pub sort_by: SortField,
    #[serde(default = "QuerySpec::default_sort_order")]
    pub sort_order: SortOrder,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

impl QuerySpec {
    fn default_sort_by() -> SortField {
        SortField::Date
    }

    fn default_sort_order() -> SortOrder {
        SortOrder::Desc
    }
}

impl Default for QuerySpec {
    fn default() -> Self {
        Self {
            filters: QueryFilters::default(),
            aggregations: Vec::new(),
            sort_by: Self::default_sort_by(),
            sort_order: Self::default_sort_order(),
            limit: None,
        }
    }
}

//
// ================= Aggregates =================
//

/// Results for the requested aggregations. Only requested entries are set;
/// an empty filtered set yields zeros, never missing values.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AggregateResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sum: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sum_dollars: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub average: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub average_dollars: Option<Decimal>,
}

//
// ================= Chat =================
//

/// A single prior turn, passed through from the caller on every request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// Parse a user-supplied transaction date: `YYYY-MM-DD`, RFC 3339, or a
/// naive `YYYY-MM-DDTHH:MM:SS`.
pub fn parse_date_input(text: &str) -> crate::Result<DateTime<Utc>> {
    let trimmed = text.trim();

    if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        let midnight = date.and_hms_opt(0, 0, 0).expect("midnight is a valid time");
        return Ok(Utc.from_utc_datetime(&midnight));
    }
    if let Ok(stamped) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(stamped.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S") {
        return Ok(Utc.from_utc_datetime(&naive));
    }

    Err(AgentError::Validation(format!(
        "Invalid date '{}'. Use ISO format (YYYY-MM-DD or YYYY-MM-DDTHH:MM:SS)",
        text
    )))
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
