use chrono::{SecondsFormat, Utc};
use rusqlite::{params, Connection};
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::Path;

use crate::equity_source::{AccountRef, EquityReading, EquitySource, HttpEquitySource};
use crate::error::{db_err, invalid, DashboardError, Result};
use crate::perf_config::SnapshotSettings;
use crate::read_queries::open_wallet_db;

#[derive(Debug, Default, Deserialize)]
pub struct EquityQueryRequest {
    pub address: Option<String>,
    pub user_account: Option<String>,
    pub sub_account: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ScheduledSnapshotRequest {
    pub cron_secret: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct EquityAccountsOverviewRequest {
    /// Restricts the overview to one authority instead of every configured one.
    pub address: Option<String>,
}

fn round_to(value: f64, digits: i32) -> f64 {
    let factor = 10_f64.powi(digits);
    (value * factor).round() / factor
}

fn ensure_enabled(settings: &SnapshotSettings) -> Result<()> {
    if settings.enabled {
        Ok(())
    } else {
        Err(DashboardError::Disabled)
    }
}

fn parse_sub_account(raw: Option<String>) -> Result<u16> {
    let text = raw.unwrap_or_default().trim().to_string();
    if text.is_empty() {
        return Ok(0);
    }
    text.parse::<u16>()
        .map_err(|_| invalid("sub_account must be a non-negative integer"))
}

fn parse_account_ref(req: EquityQueryRequest) -> Result<AccountRef> {
    let sub_account = parse_sub_account(req.sub_account)?;
    AccountRef::new(req.address, req.user_account, sub_account)
}

fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Gateway-backed source for the configured `gateway_url`. Disabled settings
/// fail here first so callers never report a missing url instead.
pub fn equity_source_from_settings(settings: &SnapshotSettings) -> Result<HttpEquitySource> {
    ensure_enabled(settings)?;
    let url = settings
        .gateway_url
        .as_deref()
        .ok_or_else(|| DashboardError::Config("equity gateway url is not configured".to_string()))?;
    HttpEquitySource::new(url)
}

fn reading_payload(account: &AccountRef, reading: &EquityReading) -> Value {
    json!({
        "address": account.address,
        "user_account": account.user_account,
        "sub_account": account.sub_account,
        "settled_usd": round_to(reading.settled_usd, 6),
        "unsettled_usd": round_to(reading.unsettled_usd, 6),
        "equity_usd": round_to(reading.equity_usd(), 6),
    })
}

pub(crate) fn upsert_snapshot(
    conn: &Connection,
    account: &AccountRef,
    reading: &EquityReading,
    as_of: &str,
) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO nav_snapshots(address, subaccount, as_of, equity_usd, settled_usd, unsettled_usd)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        ON CONFLICT(address, subaccount, as_of) DO UPDATE SET
            equity_usd = excluded.equity_usd,
            settled_usd = excluded.settled_usd,
            unsettled_usd = excluded.unsettled_usd
        "#,
        params![
            account.snapshot_key(),
            i64::from(account.sub_account),
            as_of,
            reading.equity_usd(),
            reading.settled_usd,
            reading.unsettled_usd,
        ],
    )
    .map_err(db_err("upsert nav snapshot"))?;
    Ok(())
}

pub fn equity_query(
    settings: &SnapshotSettings,
    source: &dyn EquitySource,
    req: EquityQueryRequest,
) -> Result<Value> {
    ensure_enabled(settings)?;
    let account = parse_account_ref(req)?;
    let reading = source.fetch_equity(&account)?;
    Ok(reading_payload(&account, &reading))
}

pub fn record_equity_snapshot_at_db_path(
    db_path: &Path,
    settings: &SnapshotSettings,
    source: &dyn EquitySource,
    req: EquityQueryRequest,
) -> Result<Value> {
    ensure_enabled(settings)?;
    let account = parse_account_ref(req)?;
    let conn = open_wallet_db(db_path)?;
    let reading = source.fetch_equity(&account)?;
    let as_of = now_iso();
    upsert_snapshot(&conn, &account, &reading, &as_of)?;
    log::info!(
        "recorded equity snapshot for {} sub {} at {as_of}",
        account.snapshot_key(),
        account.sub_account
    );

    let mut payload = reading_payload(&account, &reading);
    payload["snapshot_key"] = json!(account.snapshot_key());
    payload["as_of"] = json!(as_of);
    Ok(payload)
}

/// Snapshots every configured address for every configured sub account. One
/// failing account is reported in its item and does not stop the run.
pub fn run_scheduled_snapshots_at_db_path(
    db_path: &Path,
    settings: &SnapshotSettings,
    source: &dyn EquitySource,
    req: ScheduledSnapshotRequest,
) -> Result<Value> {
    ensure_enabled(settings)?;
    let provided = req.cron_secret.unwrap_or_default();
    match settings.cron_secret.as_deref() {
        Some(expected) if expected == provided.trim() => {}
        _ => return Err(DashboardError::Unauthorized),
    }
    if settings.addresses.is_empty() {
        return Err(invalid("no snapshot addresses are configured"));
    }
    let sub_accounts = if settings.sub_accounts.is_empty() {
        vec![0]
    } else {
        settings.sub_accounts.clone()
    };

    let conn = open_wallet_db(db_path)?;
    let as_of = now_iso();
    let mut items = Vec::new();
    let mut ok_count = 0_usize;
    for address in &settings.addresses {
        for sub in &sub_accounts {
            let outcome = AccountRef::authority(address, *sub).and_then(|account| {
                let reading = source.fetch_equity(&account)?;
                upsert_snapshot(&conn, &account, &reading, &as_of)?;
                Ok(reading)
            });
            match outcome {
                Ok(reading) => {
                    ok_count += 1;
                    items.push(json!({
                        "address": address,
                        "sub": sub,
                        "ok": true,
                        "equity_usd": round_to(reading.equity_usd(), 6),
                    }));
                }
                Err(err) => {
                    log::warn!("snapshot failed for {address} sub {sub}: {err}");
                    items.push(json!({
                        "address": address,
                        "sub": sub,
                        "ok": false,
                        "error": err.to_string(),
                    }));
                }
            }
        }
    }
    log::info!(
        "scheduled snapshots at {as_of}: {ok_count}/{} succeeded",
        items.len()
    );

    Ok(json!({
        "as_of": as_of,
        "attempted": items.len(),
        "succeeded": ok_count,
        "failed": items.len() - ok_count,
        "items": items,
    }))
}

fn overview_for_address(source: &dyn EquitySource, address: &str) -> Result<Value> {
    if !crate::equity_source::is_valid_address(address) {
        return Err(invalid("address is not a valid base58 address"));
    }
    let accounts = source.discover_accounts(address.trim())?;
    if accounts.is_empty() {
        return Err(DashboardError::NotFound(format!(
            "no protocol user accounts for authority {address}"
        )));
    }
    let settled = accounts.iter().map(|a| a.reading.settled_usd).sum::<f64>();
    let unsettled = accounts.iter().map(|a| a.reading.unsettled_usd).sum::<f64>();
    let rows = accounts
        .iter()
        .map(|a| {
            json!({
                "user_account": a.user_account,
                "sub_account": a.sub_account_id,
                "settled_usd": round_to(a.reading.settled_usd, 6),
                "unsettled_usd": round_to(a.reading.unsettled_usd, 6),
                "equity_usd": round_to(a.reading.equity_usd(), 6),
            })
        })
        .collect::<Vec<_>>();
    Ok(json!({
        "address": address,
        "ok": true,
        "settled_usd": round_to(settled, 6),
        "unsettled_usd": round_to(unsettled, 6),
        "equity_usd": round_to(settled + unsettled, 6),
        "accounts": rows,
    }))
}

pub fn equity_accounts_overview(
    settings: &SnapshotSettings,
    source: &dyn EquitySource,
    req: EquityAccountsOverviewRequest,
) -> Result<Value> {
    ensure_enabled(settings)?;
    let addresses = match req.address.map(|s| s.trim().to_string()) {
        Some(address) if !address.is_empty() => vec![address],
        _ => settings.addresses.clone(),
    };
    if addresses.is_empty() {
        return Err(invalid("no snapshot addresses are configured"));
    }

    let mut total = 0.0;
    let items = addresses
        .iter()
        .map(|address| match overview_for_address(source, address) {
            Ok(item) => {
                total += item["equity_usd"].as_f64().unwrap_or(0.0);
                item
            }
            Err(err) => json!({
                "address": address,
                "ok": false,
                "error": err.to_string(),
            }),
        })
        .collect::<Vec<_>>();

    Ok(json!({
        "total_equity_usd": round_to(total, 6),
        "items": items,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::equity_source::DiscoveredAccount;
    use crate::wallet_db::apply_embedded_migrations;
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::fs;
    use std::path::PathBuf;
    use uuid::Uuid;

    const ADDR_A: &str = "9xQeWvG816bUx9EPjHmaT23yvVM2ZWbrrpZb9PusVFin";
    const ADDR_B: &str = "4k3Dyjzvzp8eMZWUXbBCjEvwSkkk59S5iCNLY3QrkX6R";

    #[derive(Default)]
    struct FakeSource {
        readings: HashMap<(String, u16), EquityReading>,
        accounts: HashMap<String, Vec<DiscoveredAccount>>,
        calls: RefCell<Vec<(String, u16)>>,
    }

    impl FakeSource {
        fn with_reading(mut self, address: &str, sub: u16, settled: f64, unsettled: f64) -> Self {
            self.readings.insert(
                (address.to_string(), sub),
                EquityReading {
                    settled_usd: settled,
                    unsettled_usd: unsettled,
                },
            );
            self
        }
    }

    impl EquitySource for FakeSource {
        fn fetch_equity(&self, account: &AccountRef) -> Result<EquityReading> {
            let key = account
                .address
                .clone()
                .or_else(|| account.user_account.clone())
                .unwrap_or_default();
            self.calls.borrow_mut().push((key.clone(), account.sub_account));
            self.readings
                .get(&(key, account.sub_account))
                .copied()
                .ok_or_else(|| DashboardError::Upstream("account not initialised".to_string()))
        }

        fn discover_accounts(&self, address: &str) -> Result<Vec<DiscoveredAccount>> {
            Ok(self.accounts.get(address).cloned().unwrap_or_default())
        }
    }

    fn enabled_settings() -> SnapshotSettings {
        SnapshotSettings {
            enabled: true,
            addresses: vec![ADDR_A.to_string(), ADDR_B.to_string()],
            sub_accounts: vec![0, 1],
            cron_secret: Some("s3cret".to_string()),
            gateway_url: None,
        }
    }

    fn create_temp_test_db() -> PathBuf {
        std::env::temp_dir().join(format!(
            "wallet_snapshot_test_{}_{}.db",
            std::process::id(),
            Uuid::new_v4()
        ))
    }

    fn snapshot_rows(db_path: &Path) -> Vec<(String, i64, f64)> {
        let conn = Connection::open(db_path).expect("open db");
        let mut stmt = conn
            .prepare("SELECT address, subaccount, equity_usd FROM nav_snapshots ORDER BY address, subaccount")
            .expect("prepare");
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
            .expect("query");
        let mut out = Vec::new();
        for row in rows {
            out.push(row.expect("row"));
        }
        out
    }

    #[test]
    fn everything_is_refused_while_disabled() {
        let settings = SnapshotSettings::default();
        let source = FakeSource::default();
        let err = equity_query(
            &settings,
            &source,
            EquityQueryRequest {
                address: Some(ADDR_A.to_string()),
                ..EquityQueryRequest::default()
            },
        )
        .expect_err("disabled");
        assert_eq!(err.category(), "DISABLED");
        let err = equity_accounts_overview(&settings, &source, EquityAccountsOverviewRequest::default())
            .expect_err("disabled");
        assert_eq!(err.category(), "DISABLED");
        assert!(source.calls.borrow().is_empty());
    }

    #[test]
    fn equity_query_sums_settled_and_unsettled() {
        let source = FakeSource::default().with_reading(ADDR_A, 2, 1_000.0, -25.5);
        let out = equity_query(
            &enabled_settings(),
            &source,
            EquityQueryRequest {
                address: Some(ADDR_A.to_string()),
                user_account: None,
                sub_account: Some("2".to_string()),
            },
        )
        .expect("equity");
        assert_eq!(out["equity_usd"].as_f64(), Some(974.5));
        assert_eq!(out["sub_account"].as_u64(), Some(2));

        let err = equity_query(
            &enabled_settings(),
            &source,
            EquityQueryRequest {
                address: Some(ADDR_A.to_string()),
                user_account: None,
                sub_account: Some("-1".to_string()),
            },
        )
        .expect_err("negative sub");
        assert_eq!(err.category(), "VALIDATION_ERROR");
    }

    #[test]
    fn record_snapshot_stores_a_lowercased_key() {
        let db_path = create_temp_test_db();
        apply_embedded_migrations(&db_path).expect("migrate");
        let source = FakeSource::default().with_reading(ADDR_A, 0, 500.0, 20.0);

        let out = record_equity_snapshot_at_db_path(
            &db_path,
            &enabled_settings(),
            &source,
            EquityQueryRequest {
                address: Some(ADDR_A.to_string()),
                ..EquityQueryRequest::default()
            },
        )
        .expect("record");
        assert_eq!(out["snapshot_key"].as_str(), Some(ADDR_A.to_lowercase().as_str()));

        let rows = snapshot_rows(&db_path);
        assert_eq!(rows, vec![(ADDR_A.to_lowercase(), 0, 520.0)]);
        let _ = fs::remove_file(&db_path);
    }

    #[test]
    fn upsert_replaces_the_same_instant() {
        let db_path = create_temp_test_db();
        apply_embedded_migrations(&db_path).expect("migrate");
        let conn = Connection::open(&db_path).expect("open");
        let account = AccountRef::authority(ADDR_B, 1).expect("account");
        let first = EquityReading {
            settled_usd: 10.0,
            unsettled_usd: 0.0,
        };
        let second = EquityReading {
            settled_usd: 12.0,
            unsettled_usd: 1.0,
        };
        upsert_snapshot(&conn, &account, &first, "2025-01-05T00:00:00Z").expect("first");
        upsert_snapshot(&conn, &account, &second, "2025-01-05T00:00:00Z").expect("second");
        drop(conn);

        assert_eq!(snapshot_rows(&db_path), vec![(ADDR_B.to_lowercase(), 1, 13.0)]);
        let _ = fs::remove_file(&db_path);
    }

    #[test]
    fn scheduled_run_checks_secret_and_collects_failures() {
        let db_path = create_temp_test_db();
        apply_embedded_migrations(&db_path).expect("migrate");
        let settings = enabled_settings();
        let source = FakeSource::default()
            .with_reading(ADDR_A, 0, 100.0, 0.0)
            .with_reading(ADDR_A, 1, 50.0, 5.0)
            .with_reading(ADDR_B, 0, 10.0, 0.0);

        let err = run_scheduled_snapshots_at_db_path(
            &db_path,
            &settings,
            &source,
            ScheduledSnapshotRequest {
                cron_secret: Some("wrong".to_string()),
            },
        )
        .expect_err("bad secret");
        assert_eq!(err.category(), "UNAUTHORIZED");

        let out = run_scheduled_snapshots_at_db_path(
            &db_path,
            &settings,
            &source,
            ScheduledSnapshotRequest {
                cron_secret: Some("s3cret".to_string()),
            },
        )
        .expect("run");
        assert_eq!(out["attempted"].as_u64(), Some(4));
        assert_eq!(out["succeeded"].as_u64(), Some(3));
        let failed = out["items"]
            .as_array()
            .expect("items")
            .iter()
            .filter(|item| item["ok"] == json!(false))
            .collect::<Vec<_>>();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0]["address"].as_str(), Some(ADDR_B));
        assert_eq!(failed[0]["sub"].as_u64(), Some(1));

        assert_eq!(snapshot_rows(&db_path).len(), 3);
        let _ = fs::remove_file(&db_path);
    }

    #[test]
    fn scheduled_run_needs_a_secret_and_addresses() {
        let db_path = create_temp_test_db();
        let source = FakeSource::default();
        let mut settings = enabled_settings();
        settings.cron_secret = None;
        let err = run_scheduled_snapshots_at_db_path(
            &db_path,
            &settings,
            &source,
            ScheduledSnapshotRequest {
                cron_secret: Some(String::new()),
            },
        )
        .expect_err("no configured secret");
        assert_eq!(err.category(), "UNAUTHORIZED");

        let mut settings = enabled_settings();
        settings.addresses.clear();
        let err = run_scheduled_snapshots_at_db_path(
            &db_path,
            &settings,
            &source,
            ScheduledSnapshotRequest {
                cron_secret: Some("s3cret".to_string()),
            },
        )
        .expect_err("no addresses");
        assert_eq!(err.category(), "VALIDATION_ERROR");
    }

    #[test]
    fn accounts_overview_sums_discovered_sub_accounts() {
        let mut source = FakeSource::default();
        source.accounts.insert(
            ADDR_A.to_string(),
            vec![
                DiscoveredAccount {
                    user_account: Some("ua0".to_string()),
                    sub_account_id: 0,
                    reading: EquityReading {
                        settled_usd: 100.0,
                        unsettled_usd: 10.0,
                    },
                },
                DiscoveredAccount {
                    user_account: Some("ua1".to_string()),
                    sub_account_id: 1,
                    reading: EquityReading {
                        settled_usd: 40.0,
                        unsettled_usd: -5.0,
                    },
                },
            ],
        );

        let out = equity_accounts_overview(
            &enabled_settings(),
            &source,
            EquityAccountsOverviewRequest::default(),
        )
        .expect("overview");
        let items = out["items"].as_array().expect("items");
        assert_eq!(items.len(), 2);
        assert_eq!(items[0]["settled_usd"].as_f64(), Some(140.0));
        assert_eq!(items[0]["unsettled_usd"].as_f64(), Some(5.0));
        assert_eq!(items[0]["accounts"].as_array().map(Vec::len), Some(2));
        assert_eq!(items[1]["ok"], json!(false));
        assert!(items[1]["error"]
            .as_str()
            .unwrap_or_default()
            .contains("no protocol user accounts"));
        assert_eq!(out["total_equity_usd"].as_f64(), Some(145.0));
    }

    #[test]
    fn source_needs_a_gateway_url() {
        let err = equity_source_from_settings(&SnapshotSettings::default()).expect_err("disabled");
        assert_eq!(err.category(), "DISABLED");
        let err = equity_source_from_settings(&enabled_settings()).expect_err("no url");
        assert_eq!(err.category(), "CONFIG_ERROR");
        let mut settings = enabled_settings();
        settings.gateway_url = Some("http://127.0.0.1:8787".to_string());
        assert!(equity_source_from_settings(&settings).is_ok());
    }
}
