use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rusqlite::{params, Connection};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::Path;
use uuid::Uuid;

use crate::error::{csv_err, db_err, invalid, Result};
use crate::read_queries::{open_wallet_db, parse_account, parse_flow_date, parse_value_timestamp};
use crate::wallet_series::CashFlowKind;

const DEFAULT_SOURCE_TYPE: &str = "csv";
const PREVIEW_ROW_LIMIT: usize = 10;
const ERROR_SAMPLE_LIMIT: usize = 20;

const VALUATION_COLUMNS: &[&str] = &["date_time", "amount", "total_fee"];
const FLOW_COLUMNS: &[&str] = &["date", "event", "amount", "exchange", "notes", "sub_account"];

#[derive(Debug, Default, Deserialize)]
pub struct LedgerPreviewRequest {
    pub source_path: Option<String>,
    pub kind: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct LedgerImportRequest {
    pub source_path: Option<String>,
    pub kind: Option<String>,
    pub account: Option<String>,
    pub source_type: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LedgerFileKind {
    Valuations,
    Flows,
}

impl LedgerFileKind {
    fn parse(raw: Option<String>) -> Result<Self> {
        match raw.unwrap_or_default().trim().to_lowercase().as_str() {
            "valuations" | "account_value" => Ok(Self::Valuations),
            "flows" | "account_history" => Ok(Self::Flows),
            _ => Err(invalid("kind must be valuations or flows")),
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Valuations => "valuations",
            Self::Flows => "flows",
        }
    }

    fn required_columns(self) -> &'static [&'static str] {
        match self {
            // total_fee may be absent; it defaults to zero.
            Self::Valuations => &VALUATION_COLUMNS[..2],
            Self::Flows => &FLOW_COLUMNS[..3],
        }
    }

    fn known_columns(self) -> &'static [&'static str] {
        match self {
            Self::Valuations => VALUATION_COLUMNS,
            Self::Flows => FLOW_COLUMNS,
        }
    }
}

#[derive(Debug, Clone)]
struct ValuationRow {
    date_time: String,
    amount: f64,
    total_fee: f64,
}

#[derive(Debug, Clone)]
struct FlowRow {
    date: NaiveDate,
    event: CashFlowKind,
    amount: f64,
    exchange: Option<String>,
    notes: Option<String>,
    sub_account: Option<String>,
}

#[derive(Debug)]
struct ParsedLedgerFile {
    kind: LedgerFileKind,
    columns: Vec<String>,
    valuations: Vec<ValuationRow>,
    flows: Vec<FlowRow>,
    errors: Vec<String>,
}

impl ParsedLedgerFile {
    fn parsed_count(&self) -> usize {
        self.valuations.len() + self.flows.len()
    }

    fn preview_rows(&self) -> Vec<Value> {
        match self.kind {
            LedgerFileKind::Valuations => self
                .valuations
                .iter()
                .take(PREVIEW_ROW_LIMIT)
                .map(|row| {
                    json!({
                        "date_time": row.date_time,
                        "amount": row.amount,
                        "total_fee": row.total_fee,
                    })
                })
                .collect(),
            LedgerFileKind::Flows => self
                .flows
                .iter()
                .take(PREVIEW_ROW_LIMIT)
                .map(|row| {
                    json!({
                        "date": row.date.format("%Y-%m-%d").to_string(),
                        "event": row.event.as_str(),
                        "amount": row.amount,
                        "exchange": row.exchange,
                        "notes": row.notes,
                        "sub_account": row.sub_account,
                    })
                })
                .collect(),
        }
    }
}

fn normalize_key(key: &str) -> String {
    key.trim()
        .trim_start_matches('\u{feff}')
        .to_lowercase()
        .replace([' ', '-'], "_")
}

fn parse_amount(raw: &str) -> Option<f64> {
    let text = raw.trim().replace([',', '$', ' '], "");
    if text.is_empty() {
        return None;
    }
    text.parse::<f64>().ok().filter(|v| v.is_finite())
}

fn optional_text(raw: &str) -> Option<String> {
    let text = raw.trim();
    if text.is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}

fn parse_valuation_row(cell: &dyn Fn(&str) -> String) -> std::result::Result<ValuationRow, String> {
    let raw_time = cell("date_time");
    let ts = parse_value_timestamp(&raw_time)
        .ok_or_else(|| format!("date_time is not a timestamp: {raw_time:?}"))?;
    let date_time = DateTime::<Utc>::from_timestamp(ts, 0)
        .ok_or_else(|| format!("date_time is out of range: {raw_time:?}"))?
        .to_rfc3339_opts(SecondsFormat::Secs, true);
    let amount = parse_amount(&cell("amount"))
        .ok_or_else(|| format!("amount is not a number: {:?}", cell("amount")))?;
    let raw_fee = cell("total_fee");
    let total_fee = if raw_fee.trim().is_empty() {
        0.0
    } else {
        parse_amount(&raw_fee).ok_or_else(|| format!("total_fee is not a number: {raw_fee:?}"))?
    };
    Ok(ValuationRow {
        date_time,
        amount,
        total_fee,
    })
}

fn parse_flow_row(cell: &dyn Fn(&str) -> String) -> std::result::Result<FlowRow, String> {
    let raw_date = cell("date");
    let date = parse_flow_date(&raw_date).ok_or_else(|| format!("date is not YYYY-MM-DD: {raw_date:?}"))?;
    let raw_event = cell("event");
    let event = CashFlowKind::parse(&raw_event)
        .ok_or_else(|| format!("event must be deposit or withdrawal: {raw_event:?}"))?;
    let amount = parse_amount(&cell("amount"))
        .filter(|v| *v >= 0.0)
        .ok_or_else(|| format!("amount must be a non-negative number: {:?}", cell("amount")))?;
    Ok(FlowRow {
        date,
        event,
        amount,
        exchange: optional_text(&cell("exchange")),
        notes: optional_text(&cell("notes")),
        sub_account: optional_text(&cell("sub_account")),
    })
}

fn parse_ledger_file(path: &Path, kind: LedgerFileKind) -> Result<ParsedLedgerFile> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(path)
        .map_err(csv_err("open csv file"))?;
    let headers = reader
        .headers()
        .map_err(csv_err("read csv header"))?
        .iter()
        .map(normalize_key)
        .collect::<Vec<_>>();
    let index = headers
        .iter()
        .enumerate()
        .map(|(i, name)| (name.clone(), i))
        .collect::<HashMap<_, _>>();

    let missing = kind
        .required_columns()
        .iter()
        .filter(|c| !index.contains_key(**c))
        .copied()
        .collect::<Vec<_>>();
    if !missing.is_empty() {
        return Err(invalid(format!(
            "{} file is missing columns: {}",
            kind.as_str(),
            missing.join(", ")
        )));
    }

    let mut parsed = ParsedLedgerFile {
        kind,
        columns: kind
            .known_columns()
            .iter()
            .filter(|c| index.contains_key(**c))
            .map(|c| (*c).to_string())
            .collect(),
        valuations: Vec::new(),
        flows: Vec::new(),
        errors: Vec::new(),
    };

    for record in reader.records() {
        let record = record.map_err(csv_err("read csv row"))?;
        if record.iter().all(|c| c.trim().is_empty()) {
            continue;
        }
        let line = record.position().map(|p| p.line()).unwrap_or_default();
        let cell = |name: &str| -> String {
            index
                .get(name)
                .and_then(|i| record.get(*i))
                .unwrap_or_default()
                .trim()
                .to_string()
        };
        let outcome = match kind {
            LedgerFileKind::Valuations => parse_valuation_row(&cell).map(|row| parsed.valuations.push(row)),
            LedgerFileKind::Flows => parse_flow_row(&cell).map(|row| parsed.flows.push(row)),
        };
        if let Err(err) = outcome {
            parsed.errors.push(format!("line {line}: {err}"));
        }
    }
    Ok(parsed)
}

fn resolve_source_path_text(source_path: Option<String>) -> Result<String> {
    let path = source_path.unwrap_or_default().trim().to_string();
    if path.is_empty() {
        return Err(invalid("source_path is required"));
    }
    Ok(path)
}

fn upsert_valuation(
    conn: &Connection,
    account: &str,
    row: &ValuationRow,
    source_type: &str,
    import_job_id: &str,
) -> rusqlite::Result<()> {
    let id = Uuid::new_v5(
        &Uuid::NAMESPACE_URL,
        format!("{}:{}:account_value", account.to_lowercase(), row.date_time).as_bytes(),
    )
    .to_string();
    conn.execute(
        r#"
        INSERT INTO account_value(id, account, date_time, amount, total_fee, source_type, import_job_id)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        ON CONFLICT(account, date_time) DO UPDATE SET
            amount=excluded.amount,
            total_fee=excluded.total_fee,
            source_type=excluded.source_type,
            import_job_id=excluded.import_job_id,
            updated_at=datetime('now')
        "#,
        params![
            id,
            account,
            row.date_time,
            row.amount,
            row.total_fee,
            source_type,
            import_job_id
        ],
    )?;
    Ok(())
}

/// `occurrence` separates identical rows within one file so a re-import maps
/// each of them back onto the same id.
fn upsert_flow(
    conn: &Connection,
    account: &str,
    row: &FlowRow,
    occurrence: usize,
    source_type: &str,
    import_job_id: &str,
) -> rusqlite::Result<()> {
    let date = row.date.format("%Y-%m-%d").to_string();
    let id = Uuid::new_v5(
        &Uuid::NAMESPACE_URL,
        format!(
            "{}:{date}:{}:{}:{}:{}:{occurrence}:account_history",
            account.to_lowercase(),
            row.event.as_str(),
            row.amount,
            row.exchange.as_deref().unwrap_or_default(),
            row.sub_account.as_deref().unwrap_or_default(),
        )
        .as_bytes(),
    )
    .to_string();
    conn.execute(
        r#"
        INSERT INTO account_history(id, account, date, event, amount, exchange, notes, sub_account, source_type, import_job_id)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
        ON CONFLICT(id) DO UPDATE SET
            notes=excluded.notes,
            source_type=excluded.source_type,
            import_job_id=excluded.import_job_id,
            updated_at=datetime('now')
        "#,
        params![
            id,
            account,
            date,
            row.event.as_str(),
            row.amount,
            row.exchange,
            row.notes,
            row.sub_account,
            source_type,
            import_job_id
        ],
    )?;
    Ok(())
}

fn preview_payload(file_path: &Path, parsed: &ParsedLedgerFile) -> Value {
    json!({
        "file": file_path.to_string_lossy().to_string(),
        "kind": parsed.kind.as_str(),
        "columns": parsed.columns,
        "parsed_count": parsed.parsed_count(),
        "error_count": parsed.errors.len(),
        "errors": parsed.errors.iter().take(ERROR_SAMPLE_LIMIT).cloned().collect::<Vec<_>>(),
        "preview_rows": parsed.preview_rows(),
    })
}

pub fn ledger_preview_file(req: LedgerPreviewRequest) -> Result<Value> {
    let kind = LedgerFileKind::parse(req.kind)?;
    let source_path = resolve_source_path_text(req.source_path)?;
    let file_path = Path::new(&source_path);
    let parsed = parse_ledger_file(file_path, kind)?;
    Ok(preview_payload(file_path, &parsed))
}

/// Imports one account's valuations or cash flows. Rows are upserted under
/// deterministic ids, so importing the same file twice changes nothing but
/// the job log.
pub fn ledger_import_file_at_db_path(db_path: &Path, req: LedgerImportRequest) -> Result<Value> {
    let kind = LedgerFileKind::parse(req.kind)?;
    let account = parse_account(req.account)?;
    let source_path = resolve_source_path_text(req.source_path)?;
    let source_type = req
        .source_type
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| DEFAULT_SOURCE_TYPE.to_string());
    let file_path = Path::new(&source_path);
    let parsed = parse_ledger_file(file_path, kind)?;

    let conn = open_wallet_db(db_path)?;

    let job_id = Uuid::new_v4().to_string();
    let started_at = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
    let metadata_json = json!({
        "kind": kind.as_str(),
        "columns": parsed.columns,
    })
    .to_string();
    conn.execute(
        r#"
        INSERT INTO import_jobs(id, source_type, source_file, account, status, started_at, total_count, imported_count, error_count, metadata_json)
        VALUES (?1, ?2, ?3, ?4, 'running', ?5, 0, 0, 0, ?6)
        "#,
        params![job_id, source_type, source_path, account, started_at, metadata_json],
    )
    .map_err(db_err("create import job"))?;

    let total_count = (parsed.parsed_count() + parsed.errors.len()) as i64;
    let mut imported_count = 0_i64;
    let mut error_count = parsed.errors.len() as i64;
    let mut db_error_samples = Vec::<String>::new();
    let mut record_step = |step: rusqlite::Result<()>, label: String| match step {
        Ok(()) => imported_count += 1,
        Err(err) => {
            error_count += 1;
            if db_error_samples.len() < ERROR_SAMPLE_LIMIT {
                db_error_samples.push(format!("{label}: {err}"));
            }
        }
    };

    match kind {
        LedgerFileKind::Valuations => {
            for row in &parsed.valuations {
                let step = (|| {
                    let tx = conn.unchecked_transaction()?;
                    upsert_valuation(&tx, &account, row, &source_type, &job_id)?;
                    tx.commit()
                })();
                record_step(step, row.date_time.clone());
            }
        }
        LedgerFileKind::Flows => {
            let mut seen = HashMap::<String, usize>::new();
            for row in &parsed.flows {
                let key = format!(
                    "{}|{}|{}|{:?}|{:?}",
                    row.date, row.event.as_str(), row.amount, row.exchange, row.sub_account
                );
                let occurrence = seen.entry(key).or_insert(0);
                *occurrence += 1;
                let occurrence = *occurrence;
                let step = (|| {
                    let tx = conn.unchecked_transaction()?;
                    upsert_flow(&tx, &account, row, occurrence, &source_type, &job_id)?;
                    tx.commit()
                })();
                record_step(step, row.date.to_string());
            }
        }
    }

    let mut all_error_samples = parsed
        .errors
        .iter()
        .take(ERROR_SAMPLE_LIMIT)
        .cloned()
        .collect::<Vec<_>>();
    for item in db_error_samples {
        if all_error_samples.len() >= ERROR_SAMPLE_LIMIT {
            break;
        }
        all_error_samples.push(item);
    }
    let error_message = if all_error_samples.is_empty() {
        None
    } else {
        Some(all_error_samples.join("\n"))
    };
    let status = if imported_count == 0 && error_count > 0 {
        "failed"
    } else {
        "success"
    };

    let finished_at = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
    conn.execute(
        r#"
        UPDATE import_jobs
        SET status=?1,
            finished_at=?2,
            total_count=?3,
            imported_count=?4,
            error_count=?5,
            error_message=?6
        WHERE id=?7
        "#,
        params![
            status,
            finished_at,
            total_count,
            imported_count,
            error_count,
            error_message,
            job_id
        ],
    )
    .map_err(db_err("finish import job"))?;
    log::info!(
        "imported {imported_count}/{total_count} {} rows for {account} from {source_path}",
        kind.as_str()
    );

    Ok(json!({
        "db_path": db_path.to_string_lossy().to_string(),
        "file": source_path,
        "account": account,
        "source_type": source_type,
        "status": status,
        "imported_count": imported_count,
        "error_count": error_count,
        "import_job_id": job_id,
        "errors": all_error_samples,
        "preview": preview_payload(file_path, &parsed),
    }))
}
