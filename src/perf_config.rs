use chrono::Weekday;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::{io_err, DashboardError, Result};
use crate::wallet_series::{BucketPolicy, MAX_BUCKET_DAYS};

pub const PERFORMANCE_CONFIG_FILE_NAME: &str = "performance.json";

/// Longest APY window, in buckets. Matches the query-side limit.
pub const MAX_APY_WINDOW_WEEKS: u32 = 520;
/// Longest chart lookback, about a century.
pub const MAX_CHART_LOOKBACK_DAYS: i64 = 36_600;

const ENV_SNAPSHOTS_ENABLED: &str = "WALLET_SNAPSHOTS_ENABLED";
const ENV_SNAPSHOT_ADDRESSES: &str = "WALLET_SNAPSHOT_ADDRESSES";
const ENV_SNAPSHOT_SUBACCOUNTS: &str = "WALLET_SNAPSHOT_SUBACCOUNTS";
const ENV_CRON_SECRET: &str = "WALLET_CRON_SECRET";
const ENV_EQUITY_GATEWAY_URL: &str = "WALLET_EQUITY_GATEWAY_URL";

/// Tunables for the return engine. Every field has a default so a partial
/// `performance.json` only overrides what it names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceConfig {
    pub anchor_weekday: String,
    pub bucket_days: u32,
    pub boundary_tolerance_days: i64,
    pub apy_windows_weeks: Vec<u32>,
    pub substantial_baseline_floor: f64,
    pub substantial_baseline_ratio: f64,
    pub performance_fee_rate: f64,
    pub chart_periods: BTreeMap<String, i64>,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        let mut chart_periods = BTreeMap::new();
        chart_periods.insert("30d".to_string(), 30);
        chart_periods.insert("365d".to_string(), 365);
        Self {
            anchor_weekday: "Sun".to_string(),
            bucket_days: 7,
            boundary_tolerance_days: 3,
            apy_windows_weeks: vec![1, 4, 12],
            substantial_baseline_floor: 100.0,
            substantial_baseline_ratio: 0.1,
            performance_fee_rate: 0.25,
            chart_periods,
        }
    }
}

impl PerformanceConfig {
    pub fn validate(&self) -> Result<()> {
        self.anchor()?;
        if !(1..=MAX_BUCKET_DAYS).contains(&self.bucket_days) {
            return Err(DashboardError::Config(format!(
                "bucket_days must be within [1, {MAX_BUCKET_DAYS}]"
            )));
        }
        if !(0..=MAX_BUCKET_DAYS as i64).contains(&self.boundary_tolerance_days) {
            return Err(DashboardError::Config(format!(
                "boundary_tolerance_days must be within [0, {MAX_BUCKET_DAYS}]"
            )));
        }
        if self.apy_windows_weeks.is_empty()
            || self
                .apy_windows_weeks
                .iter()
                .any(|weeks| !(1..=MAX_APY_WINDOW_WEEKS).contains(weeks))
        {
            return Err(DashboardError::Config(format!(
                "apy_windows_weeks must list windows within [1, {MAX_APY_WINDOW_WEEKS}]"
            )));
        }
        if !(0.0..=1.0).contains(&self.performance_fee_rate) {
            return Err(DashboardError::Config(
                "performance_fee_rate must be within [0, 1]".to_string(),
            ));
        }
        if !self.substantial_baseline_floor.is_finite()
            || !self.substantial_baseline_ratio.is_finite()
        {
            return Err(DashboardError::Config(
                "substantial baseline thresholds must be finite".to_string(),
            ));
        }
        if self
            .chart_periods
            .values()
            .any(|days| !(1..=MAX_CHART_LOOKBACK_DAYS).contains(days))
        {
            return Err(DashboardError::Config(format!(
                "chart_periods lookbacks must be within [1, {MAX_CHART_LOOKBACK_DAYS}]"
            )));
        }
        Ok(())
    }

    fn anchor(&self) -> Result<Weekday> {
        self.anchor_weekday.trim().parse::<Weekday>().map_err(|_| {
            DashboardError::Config(format!(
                "anchor_weekday not recognised: {}",
                self.anchor_weekday
            ))
        })
    }

    /// Configs built in code skip `load_performance_config`, so the policy
    /// is only handed out for a config that validates.
    pub fn bucket_policy(&self) -> Result<BucketPolicy> {
        self.validate()?;
        Ok(BucketPolicy::new(self.anchor()?, self.bucket_days))
    }

    pub fn chart_lookback_days(&self, period: &str) -> Option<i64> {
        self.chart_periods.get(period).copied()
    }

    pub fn max_apy_window(&self) -> u32 {
        self.apy_windows_weeks.iter().copied().max().unwrap_or(1)
    }
}

pub fn load_performance_config(path: &Path) -> Result<PerformanceConfig> {
    if !path.exists() {
        return Ok(PerformanceConfig::default());
    }
    let raw = std::fs::read_to_string(path).map_err(io_err("read performance config"))?;
    let config = serde_json::from_str::<PerformanceConfig>(&raw).map_err(|e| {
        DashboardError::Config(format!("{}: {e}", path.to_string_lossy()))
    })?;
    config.validate()?;
    log::debug!("loaded performance config from {}", path.to_string_lossy());
    Ok(config)
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SnapshotSettings {
    pub enabled: bool,
    pub addresses: Vec<String>,
    pub sub_accounts: Vec<u16>,
    pub cron_secret: Option<String>,
    pub gateway_url: Option<String>,
}

impl SnapshotSettings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let addresses = non_empty(ENV_SNAPSHOT_ADDRESSES)
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        let sub_accounts = non_empty(ENV_SNAPSHOT_SUBACCOUNTS)
            .unwrap_or_else(|| "0".to_string())
            .split(',')
            .filter_map(|s| s.trim().parse::<u16>().ok())
            .collect::<Vec<_>>();

        Self {
            enabled: non_empty(ENV_SNAPSHOTS_ENABLED).as_deref() == Some("1"),
            addresses,
            sub_accounts,
            cron_secret: non_empty(ENV_CRON_SECRET),
            gateway_url: non_empty(ENV_EQUITY_GATEWAY_URL),
        }
    }
}
