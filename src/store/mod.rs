//! Transaction store
//!
//! One store type, two backends selected at construction: Postgres for real
//! deployments, in-memory for development and tests. The schema is created
//! lazily on first use of the Postgres backend.

use chrono::{DateTime, Datelike, TimeZone, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde_json::{Map, Value};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Column, Row};
use sqlx::TypeInfo;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::{OnceCell, RwLock};
use tracing::{info, warn};

use crate::currency;
use crate::error::AgentError;
use crate::models::{
    AggregateResult, Aggregation, DateRange, NewTransaction, QueryFilters, QuerySpec, SortField,
    SortOrder, Transaction, TransactionType,
};
use crate::Result;

enum StoreBackend {
    Memory {
        rows: Arc<RwLock<Vec<Transaction>>>,
        next_id: AtomicI64,
    },
    Postgres {
        pool: PgPool,
        schema_ready: Arc<OnceCell<()>>,
    },
}

/// Persistence for the transaction ledger.
pub struct TransactionStore {
    backend: StoreBackend,
}

impl TransactionStore {
    pub fn in_memory() -> Self {
        Self {
            backend: StoreBackend::Memory {
                rows: Arc::new(RwLock::new(Vec::new())),
                next_id: AtomicI64::new(1),
            },
        }
    }

    pub fn postgres(pool: PgPool) -> Self {
        Self {
            backend: StoreBackend::Postgres {
                pool,
                schema_ready: Arc::new(OnceCell::new()),
            },
        }
    }

    /// Pick a backend from configuration. A bad database URL degrades to the
    /// in-memory backend with a warning rather than failing startup.
    pub fn from_config(database_url: Option<&str>) -> Self {
        if let Some(url) = database_url {
            match PgPoolOptions::new().max_connections(5).connect_lazy(url) {
                Ok(pool) => {
                    info!("Transaction store backend: postgres");
                    return Self::postgres(pool);
                }
                Err(error) => {
                    warn!(
                        "Failed to initialize postgres store, falling back to in-memory: {}",
                        error
                    );
                }
            }
        }

        info!("Transaction store backend: in-memory");
        Self::in_memory()
    }

    async fn ensure_schema_if_needed(&self) -> Result<()> {
        let StoreBackend::Postgres { pool, schema_ready } = &self.backend else {
            return Ok(());
        };

        schema_ready
            .get_or_try_init(|| async {
                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS transactions (
                      id BIGSERIAL PRIMARY KEY,
                      amount BIGINT NOT NULL,
                      description TEXT NOT NULL,
                      category TEXT NOT NULL,
                      type TEXT NOT NULL CHECK (type IN ('expense', 'income')),
                      date TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                      created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                      updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                    );
                    "#,
                )
                .execute(pool)
                .await?;

                for statement in [
                    "CREATE INDEX IF NOT EXISTS idx_transactions_type ON transactions(type);",
                    "CREATE INDEX IF NOT EXISTS idx_transactions_category ON transactions(category);",
                    "CREATE INDEX IF NOT EXISTS idx_transactions_date ON transactions(date);",
                    "CREATE INDEX IF NOT EXISTS idx_transactions_created_at ON transactions(created_at);",
                ] {
                    sqlx::query(statement).execute(pool).await?;
                }

                Ok::<(), sqlx::Error>(())
            })
            .await
            .map_err(|e| {
                AgentError::Database(format!("Failed to initialize transactions schema: {}", e))
            })?;

        Ok(())
    }

    /// Insert one transaction. The store assigns the id and stamps both
    /// system timestamps; `date` defaults to the insert time.
    pub async fn insert(&self, new: NewTransaction) -> Result<Transaction> {
        validate_new(&new)?;

        match &self.backend {
            StoreBackend::Memory { rows, next_id } => {
                let now = Utc::now();
                let transaction = Transaction {
                    id: next_id.fetch_add(1, Ordering::SeqCst),
                    amount: new.amount,
                    description: new.description,
                    category: new.category,
                    kind: new.kind,
                    date: new.date.unwrap_or(now),
                    created_at: now,
                    updated_at: now,
                };

                let mut locked = rows.write().await;
                locked.push(transaction.clone());
                Ok(transaction)
            }
            StoreBackend::Postgres { pool, .. } => {
                self.ensure_schema_if_needed().await?;

                let row = sqlx::query(
                    r#"
                    INSERT INTO transactions (amount, description, category, type, date)
                    VALUES ($1, $2, $3, $4, COALESCE($5, NOW()))
                    RETURNING id, amount, description, category, type, date, created_at, updated_at
                    "#,
                )
                .bind(new.amount)
                .bind(&new.description)
                .bind(&new.category)
                .bind(new.kind.as_str())
                .bind(new.date)
                .fetch_one(pool)
                .await
                .map_err(|e| AgentError::Database(format!("Failed to insert transaction: {}", e)))?;

                transaction_from_row(&row)
            }
        }
    }

    /// Filtered read. Ordering defaults to `date DESC`; `this_month` binds
    /// the first day of the current month through the first day of the next.
    pub async fn query(&self, spec: &QuerySpec) -> Result<Vec<Transaction>> {
        let (start, end) = date_bounds(&spec.filters);

        match &self.backend {
            StoreBackend::Memory { rows, .. } => {
                let locked = rows.read().await;
                let mut matched: Vec<Transaction> = locked
                    .iter()
                    .filter(|tx| matches_filters(tx, &spec.filters, start, end))
                    .cloned()
                    .collect();

                matched.sort_by(|a, b| {
                    let ordering = match spec.sort_by {
                        SortField::Amount => a.amount.cmp(&b.amount),
                        SortField::CreatedAt => a.created_at.cmp(&b.created_at),
                        SortField::Date => a.date.cmp(&b.date),
                    };
                    match spec.sort_order {
                        SortOrder::Asc => ordering,
                        SortOrder::Desc => ordering.reverse(),
                    }
                });

                if let Some(limit) = spec.limit {
                    matched.truncate(limit as usize);
                }

                Ok(matched)
            }
            StoreBackend::Postgres { pool, .. } => {
                self.ensure_schema_if_needed().await?;

                // Sort column comes from a closed enum, never from input.
                let direction = match spec.sort_order {
                    SortOrder::Asc => "ASC",
                    SortOrder::Desc => "DESC",
                };
                let sql = format!(
                    r#"
                    SELECT id, amount, description, category, type, date, created_at, updated_at
                    FROM transactions
                    WHERE ($1::TEXT IS NULL OR category = $1)
                      AND ($2::TEXT IS NULL OR type = $2)
                      AND ($3::TIMESTAMPTZ IS NULL OR date >= $3)
                      AND ($4::TIMESTAMPTZ IS NULL OR date < $4)
                    ORDER BY {} {}
                    LIMIT $5
                    "#,
                    spec.sort_by.column(),
                    direction
                );

                let rows = sqlx::query(&sql)
                    .bind(spec.filters.category.as_deref())
                    .bind(spec.filters.kind.map(|k| k.as_str()))
                    .bind(start)
                    .bind(end)
                    .bind(spec.limit.map(|l| l as i64))
                    .fetch_all(pool)
                    .await
                    .map_err(|e| {
                        AgentError::Database(format!("Failed to query transactions: {}", e))
                    })?;

                rows.iter().map(transaction_from_row).collect()
            }
        }
    }

    /// Aggregate `amount` over the filtered set. Empty sets yield zeros for
    /// every requested aggregation.
    pub async fn aggregate(&self, spec: &QuerySpec) -> Result<AggregateResult> {
        let (start, end) = date_bounds(&spec.filters);

        let (sum, count) = match &self.backend {
            StoreBackend::Memory { rows, .. } => {
                let locked = rows.read().await;
                let matched: Vec<&Transaction> = locked
                    .iter()
                    .filter(|tx| matches_filters(tx, &spec.filters, start, end))
                    .collect();
                let sum: i64 = matched.iter().map(|tx| tx.amount).sum();
                (sum, matched.len() as i64)
            }
            StoreBackend::Postgres { pool, .. } => {
                self.ensure_schema_if_needed().await?;

                let row = sqlx::query(
                    r#"
                    SELECT COALESCE(SUM(amount), 0)::BIGINT AS total, COUNT(*) AS matched
                    FROM transactions
                    WHERE ($1::TEXT IS NULL OR category = $1)
                      AND ($2::TEXT IS NULL OR type = $2)
                      AND ($3::TIMESTAMPTZ IS NULL OR date >= $3)
                      AND ($4::TIMESTAMPTZ IS NULL OR date < $4)
                    "#,
                )
                .bind(spec.filters.category.as_deref())
                .bind(spec.filters.kind.map(|k| k.as_str()))
                .bind(start)
                .bind(end)
                .fetch_one(pool)
                .await
                .map_err(|e| {
                    AgentError::Database(format!("Failed to aggregate transactions: {}", e))
                })?;

                let sum: i64 = row
                    .try_get("total")
                    .map_err(|e| AgentError::Database(format!("Bad aggregate row: {}", e)))?;
                let count: i64 = row
                    .try_get("matched")
                    .map_err(|e| AgentError::Database(format!("Bad aggregate row: {}", e)))?;
                (sum, count)
            }
        };

        Ok(build_aggregate(&spec.aggregations, sum, count))
    }

    /// Escape hatch for model-generated queries: executes a single read-only
    /// statement verbatim. The text is untrusted; anything that is not a
    /// lone SELECT is rejected before it reaches the database.
    pub async fn execute_raw(&self, sql: &str) -> Result<Vec<Map<String, Value>>> {
        let checked = ensure_read_only(sql)?;

        match &self.backend {
            StoreBackend::Memory { .. } => Err(AgentError::QueryExecution(
                "raw SQL queries require the postgres backend".to_string(),
            )),
            StoreBackend::Postgres { pool, .. } => {
                self.ensure_schema_if_needed().await?;

                let rows = sqlx::query(&checked).fetch_all(pool).await.map_err(|e| {
                    AgentError::QueryExecution(format!("Failed to execute query: {}", e))
                })?;

                Ok(rows.iter().map(row_to_json).collect())
            }
        }
    }
}

fn validate_new(new: &NewTransaction) -> Result<()> {
    if new.description.trim().is_empty() {
        return Err(AgentError::Validation("description is required".to_string()));
    }
    if new.category.trim().is_empty() {
        return Err(AgentError::Validation("category is required".to_string()));
    }
    currency::validate_minor_units(new.amount)
}

fn matches_filters(
    tx: &Transaction,
    filters: &QueryFilters,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
) -> bool {
    if let Some(category) = &filters.category {
        if tx.category != *category {
            return false;
        }
    }
    if let Some(kind) = filters.kind {
        if tx.kind != kind {
            return false;
        }
    }
    if let Some(start) = start {
        if tx.date < start {
            return false;
        }
    }
    if let Some(end) = end {
        if tx.date >= end {
            return false;
        }
    }
    true
}

fn date_bounds(filters: &QueryFilters) -> (Option<DateTime<Utc>>, Option<DateTime<Utc>>) {
    match filters.date_range {
        Some(DateRange::ThisMonth) => {
            let (start, end) = month_bounds(Utc::now());
            (Some(start), Some(end))
        }
        None => (None, None),
    }
}

/// [first day of the month, first day of the next month) around `now`.
pub fn month_bounds(now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let (year, month) = (now.year(), now.month());
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };

    let start = Utc
        .with_ymd_and_hms(year, month, 1, 0, 0, 0)
        .single()
        .expect("first of month is a valid instant");
    let end = Utc
        .with_ymd_and_hms(next_year, next_month, 1, 0, 0, 0)
        .single()
        .expect("first of month is a valid instant");

    (start, end)
}

fn build_aggregate(requested: &[Aggregation], sum: i64, count: i64) -> AggregateResult {
    let mut result = AggregateResult::default();

    for aggregation in requested {
        match aggregation {
            Aggregation::Sum => {
                result.sum = Some(sum);
                result.sum_dollars = Some(currency::to_major_units(sum));
            }
            Aggregation::Count => {
                result.count = Some(count);
            }
            Aggregation::Average => {
                let average = derive_average(sum, count);
                result.average = Some(average);
                result.average_dollars = Some(currency::to_major_units(average));
            }
        }
    }

    result
}

/// Average in cents, rounded half-away-from-zero, derived from sum/count so
/// the division stays in decimal space.
fn derive_average(sum: i64, count: i64) -> i64 {
    if count == 0 {
        return 0;
    }

    (Decimal::from(sum) / Decimal::from(count))
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
        .unwrap_or(0)
}

/// Reject anything other than a single SELECT statement. Returns the
/// trimmed statement on success.
pub fn ensure_read_only(sql: &str) -> Result<String> {
    let trimmed = sql.trim().trim_end_matches(';').trim();

    if trimmed.is_empty() {
        return Err(AgentError::QueryExecution("empty query".to_string()));
    }
    if trimmed.contains(';') {
        return Err(AgentError::QueryExecution(
            "only a single statement is allowed".to_string(),
        ));
    }

    let lowered = trimmed.to_lowercase();
    if !(lowered.starts_with("select") || lowered.starts_with("with")) {
        return Err(AgentError::QueryExecution(
            "only SELECT queries are allowed".to_string(),
        ));
    }

    const FORBIDDEN: &[&str] = &[
        "insert", "update", "delete", "drop", "alter", "truncate", "create", "grant", "revoke",
        "copy",
    ];
    for word in lowered.split(|c: char| !c.is_ascii_alphanumeric() && c != '_') {
        if FORBIDDEN.contains(&word) {
            return Err(AgentError::QueryExecution(format!(
                "'{}' is not allowed in a read-only query",
                word
            )));
        }
    }

    Ok(trimmed.to_string())
}

fn transaction_from_row(row: &PgRow) -> Result<Transaction> {
    let kind: String = row
        .try_get("type")
        .map_err(|e| AgentError::Database(format!("Bad transaction row: {}", e)))?;

    Ok(Transaction {
        id: row
            .try_get("id")
            .map_err(|e| AgentError::Database(format!("Bad transaction row: {}", e)))?,
        amount: row
            .try_get("amount")
            .map_err(|e| AgentError::Database(format!("Bad transaction row: {}", e)))?,
        description: row
            .try_get("description")
            .map_err(|e| AgentError::Database(format!("Bad transaction row: {}", e)))?,
        category: row
            .try_get("category")
            .map_err(|e| AgentError::Database(format!("Bad transaction row: {}", e)))?,
        kind: kind.parse::<TransactionType>()?,
        date: row
            .try_get("date")
            .map_err(|e| AgentError::Database(format!("Bad transaction row: {}", e)))?,
        created_at: row
            .try_get("created_at")
            .map_err(|e| AgentError::Database(format!("Bad transaction row: {}", e)))?,
        updated_at: row
            .try_get("updated_at")
            .map_err(|e| AgentError::Database(format!("Bad transaction row: {}", e)))?,
    })
}

/// Decode an arbitrary row into field → JSON value, by column type.
fn row_to_json(row: &PgRow) -> Map<String, Value> {
    let mut map = Map::new();

    for column in row.columns() {
        let idx = column.ordinal();
        let value = match column.type_info().name() {
            "INT2" => row
                .try_get::<Option<i16>, _>(idx)
                .ok()
                .flatten()
                .map(Value::from),
            "INT4" => row
                .try_get::<Option<i32>, _>(idx)
                .ok()
                .flatten()
                .map(Value::from),
            "INT8" => row
                .try_get::<Option<i64>, _>(idx)
                .ok()
                .flatten()
                .map(Value::from),
            "FLOAT4" => row
                .try_get::<Option<f32>, _>(idx)
                .ok()
                .flatten()
                .map(Value::from),
            "FLOAT8" => row
                .try_get::<Option<f64>, _>(idx)
                .ok()
                .flatten()
                .map(Value::from),
            "NUMERIC" => row
                .try_get::<Option<Decimal>, _>(idx)
                .ok()
                .flatten()
                .and_then(|d| serde_json::to_value(d).ok()),
            "BOOL" => row
                .try_get::<Option<bool>, _>(idx)
                .ok()
                .flatten()
                .map(Value::from),
            "TIMESTAMPTZ" => row
                .try_get::<Option<DateTime<Utc>>, _>(idx)
                .ok()
                .flatten()
                .map(|t| Value::from(t.to_rfc3339())),
            _ => row
                .try_get::<Option<String>, _>(idx)
                .ok()
                .flatten()
                .map(Value::from),
        };

        map.insert(column.name().to_string(), value.unwrap_or(Value::Null));
    }

    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SortField;
    use rust_decimal::Decimal;

    fn new_tx(amount: i64, description: &str, category: &str, kind: TransactionType) -> NewTransaction {
        NewTransaction {
            amount,
            description: description.to_string(),
            category: category.to_string(),
            kind,
            date: None,
        }
    }

    #[tokio::test]
    async fn test_insert_assigns_ids_and_timestamps() {
        let store = TransactionStore::in_memory();

        let first = store
            .insert(new_tx(5000, "Groceries", "groceries", TransactionType::Expense))
            .await
            .unwrap();
        let second = store
            .insert(new_tx(1200, "Lunch", "food", TransactionType::Expense))
            .await
            .unwrap();

        assert_eq!(first.id, 1);
        assert_eq!(second.id, 2);
        assert_eq!(first.created_at, first.updated_at);
    }

    #[tokio::test]
    async fn test_insert_validation() {
        let store = TransactionStore::in_memory();

        let missing_description =
            store.insert(new_tx(100, "  ", "food", TransactionType::Expense)).await;
        assert!(matches!(
            missing_description,
            Err(AgentError::Validation(_))
        ));

        let missing_category =
            store.insert(new_tx(100, "Lunch", "", TransactionType::Expense)).await;
        assert!(matches!(missing_category, Err(AgentError::Validation(_))));

        let negative = store.insert(new_tx(-1, "Lunch", "food", TransactionType::Expense)).await;
        assert!(matches!(negative, Err(AgentError::InvalidAmount(_))));
    }

    #[tokio::test]
    async fn test_insert_then_query_round_trip() {
        let store = TransactionStore::in_memory();
        store
            .insert(new_tx(5000, "Groceries", "groceries", TransactionType::Expense))
            .await
            .unwrap();
        store
            .insert(new_tx(900, "Bus pass", "transportation", TransactionType::Expense))
            .await
            .unwrap();

        let spec = QuerySpec {
            filters: QueryFilters {
                category: Some("groceries".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };

        let results = store.query(&spec).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].description, "Groceries");
        assert_eq!(results[0].amount_dollars(), Decimal::new(5000, 2));
    }

    #[tokio::test]
    async fn test_query_default_order_and_limit() {
        let store = TransactionStore::in_memory();
        let old = Utc.with_ymd_and_hms(2024, 1, 15, 12, 0, 0).single().unwrap();

        store
            .insert(NewTransaction {
                date: Some(old),
                ..new_tx(100, "Old", "food", TransactionType::Expense)
            })
            .await
            .unwrap();
        store
            .insert(new_tx(200, "Recent", "food", TransactionType::Expense))
            .await
            .unwrap();

        let results = store.query(&QuerySpec::default()).await.unwrap();
        assert_eq!(results[0].description, "Recent");
        assert_eq!(results[1].description, "Old");

        let limited = store
            .query(&QuerySpec {
                limit: Some(1),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);

        let by_amount_asc = store
            .query(&QuerySpec {
                sort_by: SortField::Amount,
                sort_order: SortOrder::Asc,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(by_amount_asc[0].amount, 100);
    }

    #[tokio::test]
    async fn test_this_month_filter() {
        let store = TransactionStore::in_memory();
        let last_year = Utc.with_ymd_and_hms(2023, 6, 1, 0, 0, 0).single().unwrap();

        store
            .insert(NewTransaction {
                date: Some(last_year),
                ..new_tx(100, "Old", "food", TransactionType::Expense)
            })
            .await
            .unwrap();
        store
            .insert(new_tx(200, "Current", "food", TransactionType::Expense))
            .await
            .unwrap();

        let spec = QuerySpec {
            filters: QueryFilters {
                date_range: Some(DateRange::ThisMonth),
                ..Default::default()
            },
            ..Default::default()
        };

        let results = store.query(&spec).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].description, "Current");
    }

    #[tokio::test]
    async fn test_aggregate_sum_count_average() {
        let store = TransactionStore::in_memory();
        store
            .insert(new_tx(1000, "A", "food", TransactionType::Expense))
            .await
            .unwrap();
        store
            .insert(new_tx(2500, "B", "food", TransactionType::Expense))
            .await
            .unwrap();
        store
            .insert(new_tx(9000, "Salary", "income", TransactionType::Income))
            .await
            .unwrap();

        let spec = QuerySpec {
            filters: QueryFilters {
                kind: Some(TransactionType::Expense),
                ..Default::default()
            },
            aggregations: vec![Aggregation::Sum, Aggregation::Count, Aggregation::Average],
            ..Default::default()
        };

        let result = store.aggregate(&spec).await.unwrap();
        assert_eq!(result.sum, Some(3500));
        assert_eq!(result.sum_dollars, Some(Decimal::new(3500, 2)));
        assert_eq!(result.count, Some(2));
        assert_eq!(result.average, Some(1750));
        assert_eq!(result.average_dollars, Some(Decimal::new(1750, 2)));
    }

    #[tokio::test]
    async fn test_aggregate_empty_set_returns_zeros() {
        let store = TransactionStore::in_memory();

        let spec = QuerySpec {
            filters: QueryFilters {
                category: Some("nothing-here".to_string()),
                ..Default::default()
            },
            aggregations: vec![Aggregation::Sum, Aggregation::Average],
            ..Default::default()
        };

        let result = store.aggregate(&spec).await.unwrap();
        assert_eq!(result.sum, Some(0));
        assert_eq!(result.average, Some(0));
        assert_eq!(result.count, None);
    }

    #[tokio::test]
    async fn test_raw_queries_rejected_on_memory_backend() {
        let store = TransactionStore::in_memory();
        let result = store.execute_raw("SELECT * FROM transactions").await;
        assert!(matches!(result, Err(AgentError::QueryExecution(_))));
    }

    #[test]
    fn test_derive_average_rounds_half_away_from_zero() {
        assert_eq!(derive_average(100, 3), 33);
        assert_eq!(derive_average(101, 2), 51);
        assert_eq!(derive_average(0, 0), 0);
    }

    #[test]
    fn test_ensure_read_only() {
        assert!(ensure_read_only("SELECT * FROM transactions").is_ok());
        assert!(ensure_read_only("  select sum(amount) from transactions;  ").is_ok());
        assert!(ensure_read_only("WITH t AS (SELECT 1) SELECT * FROM t").is_ok());

        assert!(ensure_read_only("DELETE FROM transactions").is_err());
        assert!(ensure_read_only("SELECT 1; DROP TABLE transactions").is_err());
        assert!(ensure_read_only("INSERT INTO transactions VALUES (1)").is_err());
        assert!(ensure_read_only("").is_err());

        // updated_at must not trip the 'update' keyword scan
        assert!(ensure_read_only("SELECT updated_at FROM transactions").is_ok());
    }

    #[test]
    fn test_month_bounds_year_wrap() {
        let december = Utc.with_ymd_and_hms(2025, 12, 15, 10, 30, 0).single().unwrap();
        let (start, end) = month_bounds(december);
        assert_eq!(start, Utc.with_ymd_and_hms(2025, 12, 1, 0, 0, 0).single().unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).single().unwrap());
    }
}
