use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::env;
use std::io::{self, Read};
use std::path::Path;
use wallet_dashboard_lib::{
    equity_accounts_overview, equity_query, equity_source_from_settings,
    ledger_import_file_at_db_path, ledger_preview_file, load_performance_config,
    record_equity_snapshot_at_db_path, run_scheduled_snapshots_at_db_path,
    wallet_accounts_query_at_db_path, wallet_apy_query_at_db_path, wallet_chart_query_at_db_path,
    wallet_fees_query_at_db_path, wallet_history_query_at_db_path,
    wallet_overview_query_at_db_path, DashboardError, PerformanceConfig, SnapshotSettings,
};

#[derive(Debug, Deserialize)]
struct AdapterRequest {
    schema_version: u64,
    case: Option<AdapterCaseMeta>,
    endpoint: AdapterEndpoint,
    #[serde(default)]
    query: Value,
    dataset: AdapterDataset,
}

#[derive(Debug, Deserialize)]
struct AdapterCaseMeta {
    id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AdapterEndpoint {
    path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AdapterDataset {
    db_path: Option<String>,
    config_path: Option<String>,
}

#[derive(Debug, Serialize)]
struct AdapterErrorBody {
    category: String,
    message: String,
    #[serde(rename = "type")]
    error_type: String,
}

#[derive(Debug, Serialize)]
#[serde(tag = "status")]
enum AdapterResponse {
    #[serde(rename = "success")]
    Success { payload: Value },
    #[serde(rename = "error")]
    Error { error: AdapterErrorBody },
}

/// Failure of one adapter call. Protocol problems never reach the library.
#[derive(Debug)]
enum AdapterFailure {
    Protocol(String),
    UnsupportedEndpoint(String),
    Query(DashboardError),
}

impl AdapterFailure {
    fn into_response(self) -> AdapterResponse {
        let (category, message, error_type) = match self {
            AdapterFailure::Protocol(msg) => ("ADAPTER_PROTOCOL_ERROR".to_string(), msg, "AdapterError"),
            AdapterFailure::UnsupportedEndpoint(path) => (
                "UNSUPPORTED_ENDPOINT".to_string(),
                format!("unsupported endpoint path: {path}"),
                "AdapterError",
            ),
            AdapterFailure::Query(err) => (err.category().to_string(), err.to_string(), "DashboardError"),
        };
        AdapterResponse::Error {
            error: AdapterErrorBody {
                category,
                message,
                error_type: error_type.to_string(),
            },
        }
    }
}

impl From<DashboardError> for AdapterFailure {
    fn from(err: DashboardError) -> Self {
        AdapterFailure::Query(err)
    }
}

fn parse_bool_flag(args: &[String], flag: &str) -> bool {
    args.iter().any(|arg| arg == flag)
}

fn read_stdin_json() -> Result<Value, AdapterFailure> {
    let mut raw = String::new();
    io::stdin()
        .read_to_string(&mut raw)
        .map_err(|e| AdapterFailure::Protocol(format!("read stdin failed: {e}")))?;
    if raw.trim().is_empty() {
        return Err(AdapterFailure::Protocol("empty stdin request".to_string()));
    }
    serde_json::from_str::<Value>(&raw)
        .map_err(|e| AdapterFailure::Protocol(format!("invalid JSON request: {e}")))
}

fn query_as<T: for<'de> Deserialize<'de>>(query: Value, endpoint: &str) -> Result<T, AdapterFailure> {
    let query = if query.is_null() { json!({}) } else { query };
    serde_json::from_value(query).map_err(|e| {
        AdapterFailure::Protocol(format!("request.query invalid for {endpoint}: {e}"))
    })
}

fn non_empty(raw: Option<&str>) -> Option<&str> {
    raw.map(str::trim).filter(|s| !s.is_empty())
}

/// Routes one request. Snapshot endpoints build their equity source from
/// `settings`; only endpoints that touch the store require `db_path`.
fn dispatch(req: AdapterRequest, settings: &SnapshotSettings) -> Result<Value, AdapterFailure> {
    if req.schema_version != 1 {
        return Err(AdapterFailure::Protocol(format!(
            "unsupported schema_version: {}",
            req.schema_version
        )));
    }

    let path = non_empty(req.endpoint.path.as_deref())
        .ok_or_else(|| AdapterFailure::Protocol("request.endpoint.path missing".to_string()))?;
    let db_path = non_empty(req.dataset.db_path.as_deref()).map(Path::new);
    let require_db = || {
        db_path.ok_or_else(|| AdapterFailure::Protocol("request.dataset.db_path missing".to_string()))
    };
    let config = match non_empty(req.dataset.config_path.as_deref()) {
        Some(config_path) => load_performance_config(Path::new(config_path))?,
        None => PerformanceConfig::default(),
    };

    let payload = match path {
        "/api/wallet/overview" => {
            wallet_overview_query_at_db_path(require_db()?, &config, query_as(req.query, "overview")?)?
        }
        "/api/wallet/chart" => {
            wallet_chart_query_at_db_path(require_db()?, &config, query_as(req.query, "chart")?)?
        }
        "/api/wallet/apy" => {
            wallet_apy_query_at_db_path(require_db()?, &config, query_as(req.query, "apy")?)?
        }
        "/api/wallet/fees" => {
            wallet_fees_query_at_db_path(require_db()?, &config, query_as(req.query, "fees")?)?
        }
        "/api/wallet/history" => {
            wallet_history_query_at_db_path(require_db()?, query_as(req.query, "history")?)?
        }
        "/api/wallet/accounts" => {
            wallet_accounts_query_at_db_path(require_db()?, query_as(req.query, "accounts")?)?
        }
        "/api/import/preview" => ledger_preview_file(query_as(req.query, "import preview")?)?,
        "/api/import" => {
            ledger_import_file_at_db_path(require_db()?, query_as(req.query, "import")?)?
        }
        "/api/equity" => {
            let query = query_as(req.query, "equity")?;
            let source = equity_source_from_settings(settings)?;
            equity_query(settings, &source, query)?
        }
        "/api/equity/accounts" => {
            let query = query_as(req.query, "equity accounts")?;
            let source = equity_source_from_settings(settings)?;
            equity_accounts_overview(settings, &source, query)?
        }
        "/api/snapshot" => {
            let query = query_as(req.query, "snapshot")?;
            let db_path = require_db()?;
            let source = equity_source_from_settings(settings)?;
            record_equity_snapshot_at_db_path(db_path, settings, &source, query)?
        }
        "/api/cron/snapshot" => {
            let query = query_as(req.query, "cron snapshot")?;
            let db_path = require_db()?;
            let source = equity_source_from_settings(settings)?;
            run_scheduled_snapshots_at_db_path(db_path, settings, &source, query)?
        }
        other => return Err(AdapterFailure::UnsupportedEndpoint(other.to_string())),
    };
    Ok(payload)
}

fn main() {
    let args = env::args().skip(1).collect::<Vec<_>>();
    let pretty = parse_bool_flag(&args, "--pretty");
    let verbose = parse_bool_flag(&args, "--verbose");

    let resp = match read_stdin_json()
        .and_then(|v| {
            serde_json::from_value::<AdapterRequest>(v)
                .map_err(|e| AdapterFailure::Protocol(format!("request root invalid: {e}")))
        })
        .and_then(|req| {
            if verbose {
                if let Some(case_id) = req.case.as_ref().and_then(|c| c.id.as_deref()) {
                    eprintln!("[wallet_adapter] case={case_id}");
                }
                if let Some(path) = req.endpoint.path.as_deref() {
                    eprintln!("[wallet_adapter] endpoint={path}");
                }
                if let Some(db_path) = req.dataset.db_path.as_deref() {
                    eprintln!("[wallet_adapter] db={db_path}");
                }
            }
            dispatch(req, &SnapshotSettings::from_env())
        }) {
        Ok(payload) => AdapterResponse::Success { payload },
        Err(failure) => failure.into_response(),
    };

    let out = if pretty {
        serde_json::to_string_pretty(&resp)
    } else {
        serde_json::to_string(&resp)
    }
    .unwrap_or_else(|e| {
        json!({
            "status": "error",
            "error": {
                "category": "ADAPTER_PROTOCOL_ERROR",
                "message": format!("serialize response failed: {e}"),
                "type": "SerializeError",
            }
        })
        .to_string()
    });

    print!("{out}");
}
