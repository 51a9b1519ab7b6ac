use crate::clock::Clock;
use crate::error::StoreError;
use crate::normalizer::{mask_card_number, CandidateFields, Expiry};
use crate::validation::{CardValidator, Verdict};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

/// Validated card, write-once
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CardRecord {
    /// Assigned by the store; None until inserted
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,

    pub card_number: String,
    pub expiration: Expiry,
    pub holder_name: String,
    pub bank_name: String,
    pub is_valid: bool,

    /// Stamped by the store at insert time
    pub processed_at: DateTime<Utc>,
}

impl CardRecord {
    /// Only a passing verdict produces a record
    pub fn from_verdict(
        fields: CandidateFields,
        verdict: &Verdict,
    ) -> Result<CardRecord, StoreError> {
        if !verdict.is_valid {
            return Err(StoreError::NotValidated(verdict.summary()));
        }
        let expiration = fields
            .expiration
            .ok_or_else(|| StoreError::NotValidated("expiration missing".to_string()))?;

        Ok(CardRecord {
            id: None,
            card_number: fields.card_number,
            expiration,
            holder_name: fields.holder_name,
            bank_name: fields.bank_name,
            is_valid: verdict.is_valid,
            processed_at: Utc::now(),
        })
    }

    pub fn masked_number(&self) -> String {
        mask_card_number(&self.card_number)
    }
}

pub fn setup_database(conn: &Connection) -> Result<(), StoreError> {
    // ==========================================================================
    // Cards Table (card_number is the natural key)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS cards (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            card_number TEXT NOT NULL,
            expiration TEXT NOT NULL,
            holder_name TEXT NOT NULL,
            bank_name TEXT NOT NULL,
            is_valid INTEGER NOT NULL,
            processed_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_cards_card_number ON cards(card_number)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_cards_bank_name ON cards(bank_name)",
        [],
    )?;

    Ok(())
}

const SELECT_COLUMNS: &str =
    "SELECT id, card_number, expiration, holder_name, bank_name, is_valid, processed_at FROM cards";

/// Row as stored; expiry and timestamp still text
struct CardRow {
    id: i64,
    card_number: String,
    expiration: String,
    holder_name: String,
    bank_name: String,
    is_valid: bool,
    processed_at: String,
}

impl CardRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(CardRow {
            id: row.get(0)?,
            card_number: row.get(1)?,
            expiration: row.get(2)?,
            holder_name: row.get(3)?,
            bank_name: row.get(4)?,
            is_valid: row.get(5)?,
            processed_at: row.get(6)?,
        })
    }

    fn into_record(self) -> Result<CardRecord, StoreError> {
        let expiration = Expiry::from_canonical(&self.expiration).ok_or_else(|| {
            StoreError::Corrupt(format!("bad expiration {:?} (id {})", self.expiration, self.id))
        })?;
        let processed_at = DateTime::parse_from_rfc3339(&self.processed_at)
            .map_err(|e| StoreError::Corrupt(format!("bad processed_at (id {}): {}", self.id, e)))?
            .with_timezone(&Utc);

        Ok(CardRecord {
            id: Some(self.id),
            card_number: self.card_number,
            expiration,
            holder_name: self.holder_name,
            bank_name: self.bank_name,
            is_valid: self.is_valid,
            processed_at,
        })
    }
}

impl From<&CardRecord> for CandidateFields {
    fn from(record: &CardRecord) -> Self {
        CandidateFields {
            card_number: record.card_number.clone(),
            expiration: Some(record.expiration),
            holder_name: record.holder_name.clone(),
            bank_name: record.bank_name.clone(),
        }
    }
}

const IN_MEMORY: &str = ":memory:";

/// The record store: one SQLite connection behind a mutex, so every write
/// goes through a single writer and the UNIQUE index settles duplicates.
pub struct CardStore {
    conn: Mutex<Connection>,
    /// None for in-memory databases, which no second connection can see
    path: Option<PathBuf>,
    validator: CardValidator,
}

impl CardStore {
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self, StoreError> {
        let db_path = db_path.as_ref();
        let conn = Connection::open(db_path)?;
        // Enable WAL mode for crash recovery
        conn.pragma_update(None, "journal_mode", "WAL")?;
        setup_database(&conn)?;
        info!(path = %db_path.display(), "card store opened");
        Ok(CardStore {
            conn: Mutex::new(conn),
            path: (db_path != Path::new(IN_MEMORY)).then(|| db_path.to_path_buf()),
            validator: CardValidator::default(),
        })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        setup_database(&conn)?;
        Ok(CardStore {
            conn: Mutex::new(conn),
            path: None,
            validator: CardValidator::default(),
        })
    }

    /// Builder pattern: the "now" used to refuse expired cards on insert
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.validator = CardValidator::new(clock);
        self
    }

    /// A panic while holding the lock cannot leave a half-written row
    /// (each insert is one statement), so a poisoned lock is still usable.
    pub(crate) fn connection(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Separate SQLITE_OPEN_READ_ONLY handle on the same file. Under WAL it
    /// reads without waiting on the writer. None for in-memory stores.
    pub(crate) fn read_only_connection(&self) -> Result<Option<Connection>, StoreError> {
        let Some(path) = &self.path else {
            return Ok(None);
        };
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Ok(Some(conn))
    }

    /// Rows in the table must satisfy every validation rule
    fn admit(&self, record: &CardRecord) -> Result<(), StoreError> {
        if !record.is_valid {
            return Err(StoreError::NotValidated("record is not marked valid".to_string()));
        }
        let verdict = self.validator.validate(&CandidateFields::from(record));
        if !verdict.is_valid {
            return Err(StoreError::NotValidated(verdict.summary()));
        }
        Ok(())
    }

    /// Stores a validated record and returns its id. `processed_at` is set to
    /// the insert time; the value on `record` is not written.
    pub fn insert(&self, record: &CardRecord) -> Result<i64, StoreError> {
        if let Err(e) = self.admit(record) {
            warn!(card = %record.masked_number(), error = %e, "record refused");
            return Err(e);
        }

        let conn = self.connection();

        let result = conn.execute(
            "INSERT INTO cards (
                card_number, expiration, holder_name, bank_name, is_valid, processed_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.card_number,
                record.expiration.to_string(),
                record.holder_name,
                record.bank_name,
                record.is_valid,
                Utc::now().to_rfc3339(),
            ],
        );

        match result {
            Ok(_) => {
                let id = conn.last_insert_rowid();
                info!(card = %record.masked_number(), id, "card inserted");
                Ok(id)
            }
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                let existing_id: i64 = conn.query_row(
                    "SELECT id FROM cards WHERE card_number = ?1",
                    [&record.card_number],
                    |row| row.get(0),
                )?;
                debug!(card = %record.masked_number(), existing_id, "duplicate card rejected");
                Err(StoreError::DuplicateKey {
                    card_number: record.card_number.clone(),
                    existing_id,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn get_by_card_number(&self, number: &str) -> Result<Option<CardRecord>, StoreError> {
        let conn = self.connection();
        let row = conn
            .query_row(
                &format!("{} WHERE card_number = ?1", SELECT_COLUMNS),
                [number],
                CardRow::from_row,
            )
            .optional()?;

        row.map(CardRow::into_record).transpose()
    }

    pub fn get_all(&self) -> Result<Vec<CardRecord>, StoreError> {
        let conn = self.connection();
        let mut stmt = conn.prepare(&format!("{} ORDER BY id ASC", SELECT_COLUMNS))?;

        let rows = stmt
            .query_map([], CardRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter().map(CardRow::into_record).collect()
    }

    pub fn count(&self) -> Result<i64, StoreError> {
        let conn = self.connection();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM cards", [], |row| row.get(0))?;
        Ok(count)
    }
}
