use serde::Serialize;
use serde_json::Value;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};
use tauri::AppHandle;

use crate::error::DashboardError;
use crate::ledger_import::{
    ledger_import_file_at_db_path, ledger_preview_file, LedgerImportRequest, LedgerPreviewRequest,
};
use crate::perf_config::{
    load_performance_config, PerformanceConfig, SnapshotSettings, PERFORMANCE_CONFIG_FILE_NAME,
};
use crate::read_queries::{
    wallet_accounts_query_at_db_path, wallet_history_query_at_db_path, WalletAccountsQueryRequest,
    WalletHistoryQueryRequest,
};
use crate::snapshot_mutations::{
    equity_accounts_overview as equity_accounts_overview_with, equity_query as equity_query_with,
    equity_source_from_settings, record_equity_snapshot_at_db_path,
    run_scheduled_snapshots_at_db_path, EquityAccountsOverviewRequest, EquityQueryRequest,
    ScheduledSnapshotRequest,
};
use crate::wallet_analytics::{
    wallet_apy_query_at_db_path, wallet_chart_query_at_db_path, wallet_fees_query_at_db_path,
    wallet_overview_query_at_db_path, WalletApyQueryRequest, WalletChartQueryRequest,
    WalletFeesQueryRequest, WalletOverviewQueryRequest,
};
use crate::wallet_db::{
    apply_embedded_migrations, inspect_status_at_path, resolve_config_dir, resolve_wallet_db_path,
    WalletDbMigrateResult, WalletDbStatus,
};

#[derive(Debug, Serialize)]
pub struct HealthPing {
    pub status: &'static str,
    pub unix_ts: u64,
    pub mode: &'static str,
}

#[derive(Debug, Serialize)]
pub struct AppMetadata {
    pub app_name: String,
    pub app_version: String,
    pub app_identifier: Option<String>,
    pub target_os: String,
    pub target_arch: String,
    pub debug: bool,
    pub tauri_major: u8,
}

type CommandResult<T> = std::result::Result<T, String>;

fn message(err: DashboardError) -> String {
    log::warn!("command failed [{}]: {err}", err.category());
    err.to_string()
}

fn now_unix_ts() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn wallet_db_path(app: &AppHandle) -> CommandResult<PathBuf> {
    resolve_wallet_db_path(app).map_err(message)
}

fn performance_config(app: &AppHandle) -> CommandResult<PerformanceConfig> {
    let dir = resolve_config_dir(app).map_err(message)?;
    load_performance_config(&dir.join(PERFORMANCE_CONFIG_FILE_NAME)).map_err(message)
}

#[tauri::command]
pub fn health_ping() -> HealthPing {
    HealthPing {
        status: "ok",
        unix_ts: now_unix_ts(),
        mode: "desktop",
    }
}

#[tauri::command]
pub fn app_metadata(app: AppHandle) -> AppMetadata {
    let package = app.package_info();
    let identifier = {
        let raw = app.config().identifier.clone();
        if raw.trim().is_empty() {
            None
        } else {
            Some(raw)
        }
    };

    AppMetadata {
        app_name: package.name.clone(),
        app_version: package.version.to_string(),
        app_identifier: identifier,
        target_os: std::env::consts::OS.to_string(),
        target_arch: std::env::consts::ARCH.to_string(),
        debug: cfg!(debug_assertions),
        tauri_major: 2,
    }
}

#[tauri::command]
pub fn wallet_db_status(app: AppHandle) -> CommandResult<WalletDbStatus> {
    let db_path = wallet_db_path(&app)?;
    inspect_status_at_path(&db_path).map_err(message)
}

#[tauri::command]
pub fn wallet_db_migrate(app: AppHandle) -> CommandResult<WalletDbMigrateResult> {
    let db_path = wallet_db_path(&app)?;
    apply_embedded_migrations(&db_path).map_err(message)
}

#[tauri::command]
pub fn wallet_overview_query(app: AppHandle, req: WalletOverviewQueryRequest) -> CommandResult<Value> {
    let db_path = wallet_db_path(&app)?;
    let config = performance_config(&app)?;
    wallet_overview_query_at_db_path(&db_path, &config, req).map_err(message)
}

#[tauri::command]
pub fn wallet_chart_query(app: AppHandle, req: WalletChartQueryRequest) -> CommandResult<Value> {
    let db_path = wallet_db_path(&app)?;
    let config = performance_config(&app)?;
    wallet_chart_query_at_db_path(&db_path, &config, req).map_err(message)
}

#[tauri::command]
pub fn wallet_apy_query(app: AppHandle, req: WalletApyQueryRequest) -> CommandResult<Value> {
    let db_path = wallet_db_path(&app)?;
    let config = performance_config(&app)?;
    wallet_apy_query_at_db_path(&db_path, &config, req).map_err(message)
}

#[tauri::command]
pub fn wallet_fees_query(app: AppHandle, req: WalletFeesQueryRequest) -> CommandResult<Value> {
    let db_path = wallet_db_path(&app)?;
    let config = performance_config(&app)?;
    wallet_fees_query_at_db_path(&db_path, &config, req).map_err(message)
}

#[tauri::command]
pub fn wallet_history_query(app: AppHandle, req: WalletHistoryQueryRequest) -> CommandResult<Value> {
    let db_path = wallet_db_path(&app)?;
    wallet_history_query_at_db_path(&db_path, req).map_err(message)
}

#[tauri::command]
pub fn wallet_accounts_query(app: AppHandle, req: WalletAccountsQueryRequest) -> CommandResult<Value> {
    let db_path = wallet_db_path(&app)?;
    wallet_accounts_query_at_db_path(&db_path, req).map_err(message)
}

#[tauri::command]
pub fn ledger_preview(req: LedgerPreviewRequest) -> CommandResult<Value> {
    ledger_preview_file(req).map_err(message)
}

#[tauri::command]
pub fn ledger_import(app: AppHandle, req: LedgerImportRequest) -> CommandResult<Value> {
    let db_path = wallet_db_path(&app)?;
    ledger_import_file_at_db_path(&db_path, req).map_err(message)
}

#[tauri::command]
pub fn equity_query(req: EquityQueryRequest) -> CommandResult<Value> {
    let settings = SnapshotSettings::from_env();
    let source = equity_source_from_settings(&settings).map_err(message)?;
    equity_query_with(&settings, &source, req).map_err(message)
}

#[tauri::command]
pub fn record_equity_snapshot(app: AppHandle, req: EquityQueryRequest) -> CommandResult<Value> {
    let settings = SnapshotSettings::from_env();
    let source = equity_source_from_settings(&settings).map_err(message)?;
    let db_path = wallet_db_path(&app)?;
    record_equity_snapshot_at_db_path(&db_path, &settings, &source, req).map_err(message)
}

#[tauri::command]
pub fn run_scheduled_snapshots(
    app: AppHandle,
    req: ScheduledSnapshotRequest,
) -> CommandResult<Value> {
    let settings = SnapshotSettings::from_env();
    let source = equity_source_from_settings(&settings).map_err(message)?;
    let db_path = wallet_db_path(&app)?;
    run_scheduled_snapshots_at_db_path(&db_path, &settings, &source, req).map_err(message)
}

#[tauri::command]
pub fn equity_accounts_overview(req: EquityAccountsOverviewRequest) -> CommandResult<Value> {
    let settings = SnapshotSettings::from_env();
    let source = equity_source_from_settings(&settings).map_err(message)?;
    equity_accounts_overview_with(&settings, &source, req).map_err(message)
}
