#![recursion_limit = "512"]

#[cfg(feature = "desktop")]
mod commands;
pub mod equity_source;
pub mod error;
pub mod fee_schedule;
pub mod ledger_import;
pub mod modified_dietz;
pub mod percent_change;
pub mod perf_config;
pub mod period_returns;
pub mod read_queries;
pub mod snapshot_mutations;
pub mod wallet_analytics;
pub mod wallet_db;
pub mod wallet_series;

pub use error::{DashboardError, Result};
pub use ledger_import::{
    ledger_import_file_at_db_path, ledger_preview_file, LedgerImportRequest, LedgerPreviewRequest,
};
pub use perf_config::{load_performance_config, PerformanceConfig, SnapshotSettings};
pub use read_queries::{
    wallet_accounts_query_at_db_path, wallet_history_query_at_db_path, WalletAccountsQueryRequest,
    WalletHistoryQueryRequest,
};
pub use snapshot_mutations::{
    equity_accounts_overview, equity_query, equity_source_from_settings,
    record_equity_snapshot_at_db_path, run_scheduled_snapshots_at_db_path,
    EquityAccountsOverviewRequest, EquityQueryRequest, ScheduledSnapshotRequest,
};
pub use wallet_analytics::{
    wallet_apy_query_at_db_path, wallet_chart_query_at_db_path, wallet_fees_query_at_db_path,
    wallet_overview_query_at_db_path, WalletApyQueryRequest, WalletChartQueryRequest,
    WalletFeesQueryRequest, WalletOverviewQueryRequest,
};
pub use wallet_db::{apply_embedded_migrations, inspect_status_at_path};

#[cfg(feature = "desktop")]
#[cfg_attr(mobile, tauri::mobile_entry_point)]
pub fn run() {
    tauri::Builder::default()
        .setup(|app| {
            if cfg!(debug_assertions) {
                app.handle().plugin(
                    tauri_plugin_log::Builder::default()
                        .level(log::LevelFilter::Info)
                        .build(),
                )?;
            }
            Ok(())
        })
        .invoke_handler(tauri::generate_handler![
            commands::health_ping,
            commands::app_metadata,
            commands::wallet_db_status,
            commands::wallet_db_migrate,
            commands::wallet_overview_query,
            commands::wallet_chart_query,
            commands::wallet_apy_query,
            commands::wallet_fees_query,
            commands::wallet_history_query,
            commands::wallet_accounts_query,
            commands::ledger_preview,
            commands::ledger_import,
            commands::equity_query,
            commands::record_equity_snapshot,
            commands::run_scheduled_snapshots,
            commands::equity_accounts_overview
        ])
        .run(tauri::generate_context!())
        .expect("error while running tauri application");
}
