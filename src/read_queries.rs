use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rusqlite::{params, Connection};
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::Path;

use crate::error::{db_err, invalid, Result};
use crate::wallet_db::{ensure_schema_ready, open_existing};
use crate::wallet_series::{day_start_ts, ts_to_date, CashFlowEvent, CashFlowKind, ValuationPoint};

const DEFAULT_HISTORY_PAGE_SIZE: u32 = 25;
const MAX_HISTORY_PAGE_SIZE: u32 = 200;

#[derive(Debug, Default, Deserialize)]
pub struct WalletHistoryQueryRequest {
    pub account: Option<String>,
    pub page: Option<u32>,
    pub page_size: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
pub struct WalletAccountsQueryRequest {}

/// Inclusive calendar-day bounds for a store read.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub(crate) struct DayRange {
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
}

impl DayRange {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn since(from: NaiveDate) -> Self {
        Self {
            from: Some(from),
            to: None,
        }
    }

    pub fn between(from: NaiveDate, to: NaiveDate) -> Self {
        Self {
            from: Some(from),
            to: Some(to),
        }
    }

    pub fn until(to: NaiveDate) -> Self {
        Self {
            from: None,
            to: Some(to),
        }
    }

    fn contains(&self, day: NaiveDate) -> bool {
        self.from.map_or(true, |from| day >= from) && self.to.map_or(true, |to| day <= to)
    }
}

pub(crate) fn parse_account(raw: Option<String>) -> Result<String> {
    let account = raw.unwrap_or_default().trim().to_string();
    if account.is_empty() {
        return Err(invalid("account is required"));
    }
    Ok(account)
}

pub(crate) fn parse_optional_date(raw: Option<String>, field_name: &str) -> Result<Option<NaiveDate>> {
    let text = raw.unwrap_or_default().trim().to_string();
    if text.is_empty() {
        return Ok(None);
    }
    NaiveDate::parse_from_str(&text, "%Y-%m-%d")
        .map(Some)
        .map_err(|_| invalid(format!("{field_name} must be formatted as YYYY-MM-DD")))
}

pub(crate) fn parse_as_of(raw: Option<String>) -> Result<NaiveDate> {
    Ok(parse_optional_date(raw, "as_of")?.unwrap_or_else(|| Utc::now().date_naive()))
}

/// Unix seconds for a stored `date_time`: RFC3339, a naive UTC datetime, or a
/// bare date at midnight UTC.
pub(crate) fn parse_value_timestamp(raw: &str) -> Option<i64> {
    let text = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.timestamp());
    }
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(text, fmt) {
            return Some(dt.and_utc().timestamp());
        }
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .map(day_start_ts)
}

pub(crate) fn parse_flow_date(raw: &str) -> Option<NaiveDate> {
    let text = raw.trim();
    let head = text.get(..10).unwrap_or(text);
    NaiveDate::parse_from_str(head, "%Y-%m-%d").ok()
}

pub(crate) fn load_valuations(
    conn: &Connection,
    account: &str,
    range: DayRange,
) -> Result<Vec<ValuationPoint>> {
    let mut stmt = conn
        .prepare(
            r#"
            SELECT date_time, amount, total_fee
            FROM account_value
            WHERE account = ?1
            ORDER BY date_time ASC
            "#,
        )
        .map_err(db_err("query account values"))?;
    let rows = stmt
        .query_map(params![account], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<f64>>(1)?,
                row.get::<_, Option<f64>>(2)?,
            ))
        })
        .map_err(db_err("query account values"))?;

    let mut out = Vec::new();
    for row in rows {
        let (date_time, amount, total_fee) = row.map_err(db_err("read account value"))?;
        let Some(ts) = parse_value_timestamp(&date_time) else {
            log::debug!("{account}: dropping valuation with bad date_time {date_time:?}");
            continue;
        };
        let Some(amount) = amount else {
            log::debug!("{account}: dropping valuation without amount at {date_time}");
            continue;
        };
        if !ts_to_date(ts).is_some_and(|day| range.contains(day)) {
            continue;
        }
        out.push(ValuationPoint::with_fee(ts, amount, total_fee.unwrap_or(0.0)));
    }
    Ok(out)
}

pub(crate) fn load_cash_flows(
    conn: &Connection,
    account: &str,
    range: DayRange,
) -> Result<Vec<CashFlowEvent>> {
    let mut stmt = conn
        .prepare(
            r#"
            SELECT date, event, amount
            FROM account_history
            WHERE account = ?1
            ORDER BY date ASC, created_at ASC
            "#,
        )
        .map_err(db_err("query account history"))?;
    let rows = stmt
        .query_map(params![account], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<f64>>(2)?,
            ))
        })
        .map_err(db_err("query account history"))?;

    let mut out = Vec::new();
    for row in rows {
        let (date, event, amount) = row.map_err(db_err("read account history"))?;
        let Some(day) = parse_flow_date(&date) else {
            log::debug!("{account}: dropping cash flow with bad date {date:?}");
            continue;
        };
        let Some(kind) = CashFlowKind::parse(&event) else {
            log::debug!("{account}: dropping cash flow with unknown event {event:?}");
            continue;
        };
        if !range.contains(day) {
            continue;
        }
        out.push(CashFlowEvent::new(day, kind, amount.unwrap_or(f64::NAN)));
    }
    Ok(out)
}

pub(crate) fn open_wallet_db(db_path: &Path) -> Result<Connection> {
    let conn = open_existing(db_path)?;
    ensure_schema_ready(&conn)?;
    Ok(conn)
}

pub fn wallet_history_query_at_db_path(
    db_path: &Path,
    req: WalletHistoryQueryRequest,
) -> Result<Value> {
    let account = parse_account(req.account)?;
    let page = req.page.unwrap_or(1).max(1);
    let page_size = req
        .page_size
        .unwrap_or(DEFAULT_HISTORY_PAGE_SIZE)
        .clamp(1, MAX_HISTORY_PAGE_SIZE);
    let conn = open_wallet_db(db_path)?;

    let total_count = conn
        .query_row(
            "SELECT COUNT(*) FROM account_history WHERE account = ?1",
            params![account],
            |row| row.get::<_, i64>(0),
        )
        .map_err(db_err("count account history"))?;

    let offset = (page as i64 - 1) * page_size as i64;
    let mut stmt = conn
        .prepare(
            r#"
            SELECT date, event, amount, exchange, notes, sub_account
            FROM account_history
            WHERE account = ?1
            ORDER BY date DESC, created_at DESC, id DESC
            LIMIT ?2 OFFSET ?3
            "#,
        )
        .map_err(db_err("query account history page"))?;
    let rows = stmt
        .query_map(params![account, page_size as i64, offset], |row| {
            Ok(json!({
                "date": row.get::<_, String>(0)?,
                "event": row.get::<_, String>(1)?,
                "amount": row.get::<_, Option<f64>>(2)?,
                "exchange": row.get::<_, Option<String>>(3)?,
                "notes": row.get::<_, Option<String>>(4)?,
                "sub_account": row.get::<_, Option<String>>(5)?,
            }))
        })
        .map_err(db_err("query account history page"))?;
    let mut items = Vec::<Value>::new();
    for row in rows {
        items.push(row.map_err(db_err("read account history page"))?);
    }

    let total_pages = (total_count + page_size as i64 - 1) / page_size as i64;
    Ok(json!({
        "account": account,
        "page": page,
        "page_size": page_size,
        "total_count": total_count,
        "total_pages": total_pages,
        "has_prev": page > 1,
        "has_next": (page as i64) < total_pages,
        "rows": items,
    }))
}

pub fn wallet_accounts_query_at_db_path(
    db_path: &Path,
    _req: WalletAccountsQueryRequest,
) -> Result<Value> {
    let conn = open_wallet_db(db_path)?;
    let mut stmt = conn
        .prepare(
            r#"
            SELECT
                v.account,
                COUNT(*) AS value_count,
                MIN(v.date_time) AS first_value_at,
                MAX(v.date_time) AS latest_value_at,
                (SELECT COUNT(*) FROM account_history h WHERE h.account = v.account) AS flow_count
            FROM account_value v
            GROUP BY v.account
            ORDER BY latest_value_at DESC, v.account
            "#,
        )
        .map_err(db_err("query accounts"))?;
    let rows = stmt
        .query_map([], |row| {
            Ok(json!({
                "account": row.get::<_, String>(0)?,
                "value_count": row.get::<_, i64>(1)?,
                "first_value_at": row.get::<_, String>(2)?,
                "latest_value_at": row.get::<_, String>(3)?,
                "flow_count": row.get::<_, i64>(4)?,
            }))
        })
        .map_err(db_err("query accounts"))?;
    let mut accounts = Vec::<Value>::new();
    for row in rows {
        accounts.push(row.map_err(db_err("read accounts"))?);
    }

    Ok(json!({
        "count": accounts.len(),
        "accounts": accounts,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;
    use uuid::Uuid;

    fn repo_root() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR"))
    }

    fn create_temp_test_db() -> PathBuf {
        std::env::temp_dir().join(format!(
            "wallet_read_queries_test_{}_{}.db",
            std::process::id(),
            Uuid::new_v4()
        ))
    }

    fn apply_all_migrations_for_test(db_path: &Path) {
        let conn = Connection::open(db_path).expect("open temp db");
        let mut entries = fs::read_dir(repo_root().join("db/migrations"))
            .expect("read migrations dir")
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.extension()
                    .and_then(|s| s.to_str())
                    .map(|s| s.eq_ignore_ascii_case("sql"))
                    .unwrap_or(false)
            })
            .collect::<Vec<_>>();
        entries.sort();
        for path in entries {
            let sql = fs::read_to_string(&path)
                .unwrap_or_else(|e| panic!("read migration {:?} failed: {e}", path));
            conn.execute_batch(&sql)
                .unwrap_or_else(|e| panic!("apply migration {:?} failed: {e}", path));
        }
    }

    fn seed_fixture(db_path: &Path) {
        let conn = Connection::open(db_path).expect("open seeded db");
        conn.execute_batch(
            r#"
            INSERT INTO account_value(id, account, date_time, amount, total_fee) VALUES
              ('v1', 'WalletAbc', '2025-01-05T00:00:00Z', 1000.0, 0),
              ('v2', 'walletabc', '2025-01-12 00:00:00', 1100.0, 10.0),
              ('v3', 'WALLETABC', '2025-01-19', 1250.0, 0),
              ('v4', 'WalletAbc', 'not a date', 999.0, 0),
              ('v5', 'OtherWallet', '2025-01-19T00:00:00Z', 50.0, 0);

            INSERT INTO account_history(id, account, date, event, amount, exchange, notes, sub_account, created_at) VALUES
              ('h1', 'walletabc', '2025-01-01', 'deposit', 1000.0, 'drift', NULL, '0', '2025-01-01 00:00:00'),
              ('h2', 'WalletAbc', '2025-01-15', 'Deposit', 100.0, 'drift', 'topup', '0', '2025-01-15 00:00:00'),
              ('h3', 'WalletAbc', '2025-01-16', 'rebate', 5.0, NULL, NULL, NULL, '2025-01-16 00:00:00'),
              ('h4', 'WalletAbc', '2025-01-18', 'withdrawal', 40.0, 'drift', NULL, '1', '2025-01-18 00:00:00');
            "#,
        )
        .expect("seed fixture sql");
    }

    #[test]
    fn timestamps_accept_the_stored_formats() {
        assert_eq!(parse_value_timestamp("2025-01-05T00:00:00Z"), Some(1_736_035_200));
        assert_eq!(parse_value_timestamp("2025-01-05T02:00:00+02:00"), Some(1_736_035_200));
        assert_eq!(parse_value_timestamp("2025-01-05 00:00:00"), Some(1_736_035_200));
        assert_eq!(parse_value_timestamp("2025-01-05"), Some(1_736_035_200));
        assert_eq!(parse_value_timestamp("05/01/2025"), None);
        assert_eq!(
            parse_flow_date("2025-01-05T12:00:00Z"),
            NaiveDate::from_ymd_opt(2025, 1, 5)
        );
    }

    #[test]
    fn loaders_match_account_case_insensitively_and_drop_bad_rows() {
        let db_path = create_temp_test_db();
        apply_all_migrations_for_test(&db_path);
        seed_fixture(&db_path);
        let conn = open_wallet_db(&db_path).expect("open");

        let values = load_valuations(&conn, "WALLETabc", DayRange::all()).expect("values");
        assert_eq!(values.len(), 3);
        assert_eq!(values[1].fee, 10.0);

        let from = NaiveDate::from_ymd_opt(2025, 1, 10).expect("date");
        let to = NaiveDate::from_ymd_opt(2025, 1, 12).expect("date");
        let values = load_valuations(&conn, "walletabc", DayRange::between(from, to)).expect("v");
        assert_eq!(values.len(), 1);
        assert_eq!(values[0].gross_value, 1100.0);

        let flows = load_cash_flows(&conn, "WalletABC", DayRange::all()).expect("flows");
        assert_eq!(flows.len(), 3, "unknown event kinds are dropped");
        assert_eq!(flows[1].kind, CashFlowKind::Deposit);
        assert_eq!(flows[2].signed_amount(), -40.0);

        let flows = load_cash_flows(&conn, "walletabc", DayRange::since(from)).expect("flows");
        assert_eq!(flows.len(), 2);
        let flows = load_cash_flows(&conn, "walletabc", DayRange::until(from)).expect("flows");
        assert_eq!(flows.len(), 1);

        drop(conn);
        let _ = fs::remove_file(&db_path);
    }

    #[test]
    fn history_pages_newest_first() {
        let db_path = create_temp_test_db();
        apply_all_migrations_for_test(&db_path);
        seed_fixture(&db_path);

        let page1 = wallet_history_query_at_db_path(
            &db_path,
            WalletHistoryQueryRequest {
                account: Some(" walletABC ".to_string()),
                page: None,
                page_size: Some(3),
            },
        )
        .expect("page 1");
        assert_eq!(page1["total_count"].as_i64(), Some(4));
        assert_eq!(page1["total_pages"].as_i64(), Some(2));
        assert_eq!(page1["has_next"].as_bool(), Some(true));
        let rows = page1["rows"].as_array().expect("rows");
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0]["date"].as_str(), Some("2025-01-18"));
        assert_eq!(rows[0]["sub_account"].as_str(), Some("1"));

        let page2 = wallet_history_query_at_db_path(
            &db_path,
            WalletHistoryQueryRequest {
                account: Some("walletabc".to_string()),
                page: Some(2),
                page_size: Some(3),
            },
        )
        .expect("page 2");
        let rows = page2["rows"].as_array().expect("rows");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["date"].as_str(), Some("2025-01-01"));
        assert_eq!(page2["has_prev"].as_bool(), Some(true));
        assert_eq!(page2["has_next"].as_bool(), Some(false));

        let default_size = wallet_history_query_at_db_path(
            &db_path,
            WalletHistoryQueryRequest {
                account: Some("walletabc".to_string()),
                ..WalletHistoryQueryRequest::default()
            },
        )
        .expect("default page");
        assert_eq!(default_size["page_size"].as_u64(), Some(25));

        let err = wallet_history_query_at_db_path(&db_path, WalletHistoryQueryRequest::default())
            .expect_err("account required");
        assert_eq!(err.category(), "VALIDATION_ERROR");

        let _ = fs::remove_file(&db_path);
    }

    #[test]
    fn account_directory_groups_case_variants() {
        let db_path = create_temp_test_db();
        apply_all_migrations_for_test(&db_path);
        seed_fixture(&db_path);

        let payload =
            wallet_accounts_query_at_db_path(&db_path, WalletAccountsQueryRequest::default())
                .expect("accounts");
        assert_eq!(payload["count"].as_u64(), Some(2));
        let wallet = payload["accounts"]
            .as_array()
            .expect("accounts")
            .iter()
            .find(|a| a["account"].as_str().map(str::to_lowercase).as_deref() == Some("walletabc"))
            .expect("walletabc listed");
        assert_eq!(wallet["value_count"].as_i64(), Some(4));
        assert_eq!(wallet["flow_count"].as_i64(), Some(4));

        let _ = fs::remove_file(&db_path);
    }
}
