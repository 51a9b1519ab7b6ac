// 🔍 Query Gateway - ad-hoc read-only SQL over the cards table
//
// Two gates before anything runs:
//   1. a lexer that only admits a single SELECT/WITH statement with no
//      statement separators or comments outside quoted literals
//   2. SQLite's own verdict on the prepared statement (sqlite3_stmt_readonly)

use crate::db::CardStore;
use crate::error::QueryError;
use rusqlite::types::ValueRef;
use rusqlite::Connection;
use serde::Serialize;
use serde_json::Value;
use std::iter::Peekable;
use std::str::CharIndices;
use std::sync::Arc;
use tracing::{debug, warn};

/// One result row: column key -> value, in select-list order
pub type QueryRow = serde_json::Map<String, Value>;

#[derive(Debug, Clone, Default, Serialize)]
pub struct QueryResult {
    /// One key per selected column. A repeated name gets a `:N` suffix
    /// (`id`, `id:1`) so no value is lost.
    pub columns: Vec<String>,
    pub rows: Vec<QueryRow>,
}

const READ_KEYWORDS: &[&str] = &["SELECT", "WITH"];

const MUTATING_KEYWORDS: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "DROP", "ALTER", "CREATE", "REPLACE", "ATTACH", "DETACH",
    "PRAGMA", "VACUUM", "REINDEX", "BEGIN", "COMMIT", "END", "ROLLBACK", "SAVEPOINT", "RELEASE",
    "ANALYZE",
];

// ============================================================================
// CLASSIFIER
// ============================================================================

fn reject(message: impl Into<String>) -> QueryError {
    QueryError::Validation(message.into())
}

/// Skip a quoted run. A doubled closing quote is an escaped quote.
fn skip_quoted(
    chars: &mut Peekable<CharIndices<'_>>,
    close: char,
    doubled_escape: bool,
) -> Result<(), QueryError> {
    while let Some((_, c)) = chars.next() {
        if c == close {
            if doubled_escape && matches!(chars.peek(), Some((_, next)) if *next == close) {
                chars.next();
                continue;
            }
            return Ok(());
        }
    }
    Err(reject("unterminated quoted literal"))
}

/// Accepts exactly one read-only statement. Returns its leading keyword.
pub fn classify(query_text: &str) -> Result<String, QueryError> {
    if query_text.trim().is_empty() {
        return Err(reject("query is empty"));
    }

    let mut chars = query_text.char_indices().peekable();
    let mut leading: Option<String> = None;
    let mut seen_token = false;

    while let Some((start, c)) = chars.next() {
        if c.is_whitespace() {
            continue;
        }

        let first = !seen_token;
        seen_token = true;

        match c {
            '\'' => skip_quoted(&mut chars, '\'', true)?,
            '"' => skip_quoted(&mut chars, '"', true)?,
            '`' => skip_quoted(&mut chars, '`', true)?,
            '[' => skip_quoted(&mut chars, ']', false)?,
            ';' => return Err(reject("multiple statements are not allowed")),
            '-' if matches!(chars.peek(), Some((_, '-'))) => {
                return Err(reject("comments are not allowed"));
            }
            '/' if matches!(chars.peek(), Some((_, '*'))) => {
                return Err(reject("comments are not allowed"));
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut end = start + c.len_utf8();
                while let Some(&(i, next)) = chars.peek() {
                    if next.is_alphanumeric() || next == '_' || next == '$' {
                        end = i + next.len_utf8();
                        chars.next();
                    } else {
                        break;
                    }
                }
                if first {
                    leading = Some(query_text[start..end].to_uppercase());
                }
            }
            _ => {}
        }
    }

    let keyword = leading.ok_or_else(|| reject("query must start with SELECT"))?;

    if READ_KEYWORDS.contains(&keyword.as_str()) {
        Ok(keyword)
    } else if MUTATING_KEYWORDS.contains(&keyword.as_str()) {
        Err(reject(format!(
            "{} statements are not allowed; only SELECT queries can be executed",
            keyword
        )))
    } else {
        Err(reject(format!(
            "'{}' is not a read-only statement; only SELECT queries can be executed",
            keyword
        )))
    }
}

// ============================================================================
// GATEWAY
// ============================================================================

fn execution_error(e: rusqlite::Error) -> QueryError {
    QueryError::Execution(e.to_string())
}

fn to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => {
            Value::String(bytes.iter().map(|b| format!("{:02x}", b)).collect())
        }
    }
}

fn unique_keys(names: &[String]) -> Vec<String> {
    let mut keys: Vec<String> = Vec::with_capacity(names.len());
    for name in names {
        let mut key = name.clone();
        let mut n = 1;
        while keys.contains(&key) {
            key = format!("{}:{}", name, n);
            n += 1;
        }
        keys.push(key);
    }
    keys
}

fn run_statement(conn: &Connection, query_text: &str) -> Result<QueryResult, QueryError> {
    let mut stmt = conn.prepare(query_text).map_err(execution_error)?;

    if !stmt.readonly() {
        warn!("query rejected by sqlite: statement writes");
        return Err(reject("statement is not read-only"));
    }

    let names: Vec<String> = stmt
        .column_names()
        .into_iter()
        .map(String::from)
        .collect();
    let columns = unique_keys(&names);

    let mut rows = stmt.query([]).map_err(execution_error)?;
    let mut out = Vec::new();

    while let Some(row) = rows.next().map_err(execution_error)? {
        let mut mapped = QueryRow::new();
        for (i, key) in columns.iter().enumerate() {
            let value = row.get_ref(i).map_err(execution_error)?;
            mapped.insert(key.clone(), to_json(value));
        }
        out.push(mapped);
    }

    Ok(QueryResult { columns, rows: out })
}

pub struct QueryGateway {
    store: Arc<CardStore>,
}

impl QueryGateway {
    pub fn new(store: Arc<CardStore>) -> Self {
        QueryGateway { store }
    }

    /// Rows only
    pub fn execute(&self, query_text: &str) -> Result<Vec<QueryRow>, QueryError> {
        self.run(query_text).map(|result| result.rows)
    }

    /// Rows plus column names (kept even when no rows come back, for CSV headers)
    pub fn run(&self, query_text: &str) -> Result<QueryResult, QueryError> {
        if let Err(e) = classify(query_text) {
            warn!(error = %e, "query rejected");
            return Err(e);
        }

        let reader = self
            .store
            .read_only_connection()
            .map_err(|e| QueryError::Execution(e.to_string()))?;

        let result = match reader {
            Some(conn) => run_statement(&conn, query_text),
            None => {
                // In-memory store: share the writer, locked into query_only
                let conn = self.store.connection();
                conn.pragma_update(None, "query_only", true)
                    .map_err(execution_error)?;
                let result = run_statement(&conn, query_text);
                conn.pragma_update(None, "query_only", false)
                    .map_err(execution_error)?;
                result
            }
        }?;

        debug!(rows = result.rows.len(), "query executed");
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::db::CardRecord;
    use crate::normalizer::Expiry;
    use chrono::Utc;

    fn seed(store: &CardStore) {
        for (number, holder, bank) in [
            ("4532015112830366", "GABRIEL LIMA", "Bank X"),
            ("4111111111111111", "ANA SOUZA", "Bank Y"),
        ] {
            store
                .insert(&CardRecord {
                    id: None,
                    card_number: number.to_string(),
                    expiration: Expiry::new(6, 2030),
                    holder_name: holder.to_string(),
                    bank_name: bank.to_string(),
                    is_valid: true,
                    processed_at: Utc::now(),
                })
                .unwrap();
        }
    }

    fn pinned(store: CardStore) -> Arc<CardStore> {
        Arc::new(store.with_clock(Arc::new(FixedClock::at(2026, 10))))
    }

    fn seeded_gateway() -> (Arc<CardStore>, QueryGateway) {
        let store = pinned(CardStore::open_in_memory().unwrap());
        seed(&store);
        let gateway = QueryGateway::new(Arc::clone(&store));
        (store, gateway)
    }

    fn is_validation(result: Result<Vec<QueryRow>, QueryError>) -> bool {
        matches!(result, Err(QueryError::Validation(_)))
    }

    #[test]
    fn test_select_all_executes() {
        let (_, gateway) = seeded_gateway();
        let rows = gateway.execute("SELECT * FROM cards").unwrap();

        assert_eq!(rows.len(), 2);
        let keys: Vec<&str> = rows[0].keys().map(String::as_str).collect();
        assert_eq!(
            keys,
            vec![
                "id",
                "card_number",
                "expiration",
                "holder_name",
                "bank_name",
                "is_valid",
                "processed_at"
            ]
        );
        assert_eq!(rows[0]["card_number"], Value::from("4532015112830366"));
        assert_eq!(rows[0]["expiration"], Value::from("06/2030"));
        assert_eq!(rows[0]["is_valid"], Value::from(1));
    }

    #[test]
    fn test_filtered_select() {
        let (_, gateway) = seeded_gateway();
        let rows = gateway
            .execute("select holder_name from cards where bank_name = 'Bank Y'")
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["holder_name"], Value::from("ANA SOUZA"));
    }

    #[test]
    fn test_unsafe_queries_rejected_without_mutation() {
        let (store, gateway) = seeded_gateway();

        for text in [
            "DROP TABLE cards",
            "SELECT * FROM cards; DROP TABLE cards",
            "SELECT * FROM cards -- ; DROP TABLE cards",
            "SELECT * FROM cards /* */",
            "delete from cards",
            "  UPDATE cards SET bank_name = 'x'",
            "PRAGMA table_info(cards)",
            "ATTACH DATABASE 'other.db' AS other",
            "SELECT * FROM cards;",
        ] {
            assert!(is_validation(gateway.execute(text)), "should reject {:?}", text);
        }

        assert_eq!(store.count().unwrap(), 2);
        assert_eq!(gateway.execute("SELECT * FROM cards").unwrap().len(), 2);
    }

    #[test]
    fn test_empty_query_rejected() {
        let (_, gateway) = seeded_gateway();
        assert!(is_validation(gateway.execute("")));
        assert!(is_validation(gateway.execute("   \n\t ")));
    }

    #[test]
    fn test_writing_cte_caught_by_sqlite() {
        let (store, gateway) = seeded_gateway();
        let result = gateway.execute("WITH doomed AS (SELECT id FROM cards) DELETE FROM cards");
        assert_eq!(
            result,
            Err(QueryError::Validation("statement is not read-only".to_string()))
        );
        assert_eq!(store.count().unwrap(), 2);
    }

    #[test]
    fn test_read_only_cte_executes() {
        let (_, gateway) = seeded_gateway();
        let rows = gateway
            .execute(
                "WITH y AS (SELECT * FROM cards WHERE bank_name = 'Bank Y') \
                 SELECT COUNT(*) AS n FROM y",
            )
            .unwrap();
        assert_eq!(rows[0]["n"], Value::from(1));
    }

    #[test]
    fn test_separator_inside_literal_is_allowed() {
        let (_, gateway) = seeded_gateway();
        let rows = gateway
            .execute("SELECT * FROM cards WHERE holder_name = 'A;B -- it''s'")
            .unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn test_unterminated_literal_rejected() {
        assert_eq!(
            classify("SELECT * FROM cards WHERE holder_name = 'oops"),
            Err(QueryError::Validation("unterminated quoted literal".to_string()))
        );
    }

    #[test]
    fn test_unknown_column_is_execution_error() {
        let (_, gateway) = seeded_gateway();
        assert!(matches!(
            gateway.execute("SELECT card_cvv FROM cards"),
            Err(QueryError::Execution(_))
        ));
        assert!(matches!(
            gateway.execute("SELECT * FROM"),
            Err(QueryError::Execution(_))
        ));
    }

    #[test]
    fn test_classify_leading_keyword() {
        assert_eq!(classify("  select 1").unwrap(), "SELECT");
        assert!(classify("(SELECT 1)").is_err());
        assert!(classify("EXPLAIN SELECT 1").is_err());
        let err = classify("Drop table cards").unwrap_err();
        assert_eq!(
            err,
            QueryError::Validation(
                "DROP statements are not allowed; only SELECT queries can be executed".to_string()
            )
        );
    }

    #[test]
    fn test_run_keeps_columns_for_empty_result() {
        let (_, gateway) = seeded_gateway();
        let result = gateway
            .run("SELECT id, bank_name FROM cards WHERE id < 0")
            .unwrap();
        assert!(result.rows.is_empty());
        assert_eq!(result.columns, vec!["id", "bank_name"]);
    }

    #[test]
    fn test_repeated_column_names_keep_every_value() {
        let (_, gateway) = seeded_gateway();
        let result = gateway
            .run(
                "SELECT id, card_number AS id, 7 AS x, 8 AS x FROM cards \
                 WHERE bank_name = 'Bank X'",
            )
            .unwrap();

        assert_eq!(result.columns, vec!["id", "id:1", "x", "x:1"]);
        let row = &result.rows[0];
        assert_eq!(row.len(), 4);
        assert_eq!(row["id"], Value::from(1));
        assert_eq!(row["id:1"], Value::from("4532015112830366"));
        assert_eq!(row["x"], Value::from(7));
        assert_eq!(row["x:1"], Value::from(8));
    }

    #[test]
    fn test_unique_keys_skip_taken_suffixes() {
        let names: Vec<String> = ["x:1", "x", "x"].iter().map(|s| s.to_string()).collect();
        assert_eq!(unique_keys(&names), vec!["x:1", "x", "x:2"]);
    }

    #[test]
    fn test_store_stays_writable_after_query() {
        let (store, gateway) = seeded_gateway();
        gateway.execute("SELECT * FROM cards").unwrap();
        assert!(is_validation(gateway.execute("DROP TABLE cards")));

        store
            .insert(&CardRecord {
                id: None,
                card_number: "5555555555554444".to_string(),
                expiration: Expiry::new(6, 2030),
                holder_name: "MARIA".to_string(),
                bank_name: "Bank Z".to_string(),
                is_valid: true,
                processed_at: Utc::now(),
            })
            .unwrap();
        assert_eq!(gateway.execute("SELECT * FROM cards").unwrap().len(), 3);
    }

    #[test]
    fn test_file_store_queries_through_read_only_handle() {
        let dir = std::env::temp_dir().join(format!("card-query-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();

        let store = pinned(CardStore::open(dir.join("cards.db")).unwrap());
        seed(&store);
        let gateway = QueryGateway::new(Arc::clone(&store));

        let rows = gateway.execute("SELECT bank_name FROM cards ORDER BY id").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1]["bank_name"], Value::from("Bank Y"));

        let result = gateway.execute("WITH doomed AS (SELECT id FROM cards) DELETE FROM cards");
        assert!(is_validation(result));
        assert_eq!(store.count().unwrap(), 2);
    }
}
