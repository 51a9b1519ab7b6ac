// 💾 CSV export - full table and ad-hoc query results

use crate::db::CardRecord;
use crate::query::QueryResult;
use anyhow::Result;
use serde_json::Value;
use std::io::Write;

pub const RECORD_HEADERS: [&str; 7] = [
    "id",
    "card_number",
    "expiration",
    "holder_name",
    "bank_name",
    "is_valid",
    "processed_at",
];

pub fn write_records_csv<W: Write>(records: &[CardRecord], writer: W) -> Result<()> {
    let mut wtr = csv::Writer::from_writer(writer);
    wtr.write_record(RECORD_HEADERS)?;

    for record in records {
        wtr.write_record([
            record.id.map(|id| id.to_string()).unwrap_or_default(),
            record.card_number.clone(),
            record.expiration.to_string(),
            record.holder_name.clone(),
            record.bank_name.clone(),
            record.is_valid.to_string(),
            record.processed_at.to_rfc3339(),
        ])?;
    }

    wtr.flush()?;
    Ok(())
}

fn cell(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

pub fn write_query_csv<W: Write>(result: &QueryResult, writer: W) -> Result<()> {
    let mut wtr = csv::Writer::from_writer(writer);
    wtr.write_record(&result.columns)?;

    for row in &result.rows {
        wtr.write_record(result.columns.iter().map(|column| cell(row.get(column))))?;
    }

    wtr.flush()?;
    Ok(())
}
