use chrono::{Duration, NaiveDate};
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::Path;

use crate::error::{invalid, DashboardError, Result};
use crate::fee_schedule::build_fee_schedule;
use crate::percent_change::{
    baseline_ratio_change, format_pct_or_dash, range_change, BaselineThresholds,
};
use crate::perf_config::PerformanceConfig;
use crate::period_returns::{annualized_average, lookback_cutoff, AnnualizedAverage};
use crate::read_queries::{
    load_cash_flows, load_valuations, open_wallet_db, parse_account, parse_as_of, DayRange,
};
use crate::wallet_series::{
    align, clean_flows, net_value_series, ts_to_date, BucketPolicy, CashFlowEvent, TimedFlow,
};

#[derive(Debug, Default, Deserialize)]
pub struct WalletOverviewQueryRequest {
    pub account: Option<String>,
    pub as_of: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct WalletChartQueryRequest {
    pub account: Option<String>,
    pub period: Option<String>,
    pub as_of: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct WalletApyQueryRequest {
    pub account: Option<String>,
    pub weeks: Option<u32>,
    pub as_of: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct WalletFeesQueryRequest {
    pub account: Option<String>,
    pub rate: Option<String>,
}

fn round_to(value: f64, digits: i32) -> f64 {
    let factor = 10_f64.powi(digits);
    (value * factor).round() / factor
}

fn ymd(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

fn ts_ymd(ts: i64) -> Option<String> {
    ts_to_date(ts).map(ymd)
}

fn window_label(weeks: u32, bucket_days: u32) -> String {
    match (weeks, bucket_days) {
        (1, 7) => "7D".to_string(),
        (4, 7) => "30D".to_string(),
        (12, 7) => "90D".to_string(),
        _ => format!("{}D", u64::from(weeks) * u64::from(bucket_days)),
    }
}

fn parse_rate_param(raw: Option<&str>, default_rate: f64) -> Result<f64> {
    let text = raw.unwrap_or("").trim();
    if text.is_empty() {
        return Ok(default_rate);
    }
    let value = text
        .parse::<f64>()
        .map_err(|_| invalid("rate must be a number such as 0.25"))?;
    if !(0.0..=1.0).contains(&value) {
        return Err(invalid("rate must be between 0 and 1"));
    }
    Ok(value)
}

fn timed_flows(flows: &[CashFlowEvent]) -> Vec<TimedFlow> {
    clean_flows(flows).iter().map(CashFlowEvent::timed).collect()
}

fn apy_payload(result: &AnnualizedAverage, bucket_days: u32) -> Value {
    let average = result.average.map(|v| round_to(v, 8));
    json!({
        "weeks": result.weeks,
        "label": window_label(result.weeks, bucket_days),
        "anchor_end": ymd(result.anchor_end),
        "used_windows": result.used_windows,
        "value": average,
        "pct": format_pct_or_dash(average),
    })
}

pub fn wallet_overview_query_at_db_path(
    db_path: &Path,
    config: &PerformanceConfig,
    req: WalletOverviewQueryRequest,
) -> Result<Value> {
    let account = parse_account(req.account)?;
    let as_of = parse_as_of(req.as_of)?;
    let policy = config.bucket_policy()?;
    let anchor_end = policy.last_completed_end(as_of);
    let conn = open_wallet_db(db_path)?;

    let all_flows = clean_flows(&load_cash_flows(&conn, &account, DayRange::all())?);
    // Same cut as the deposits, so a flow after the anchor never reads as profit.
    let values = load_valuations(&conn, &account, DayRange::until(anchor_end))?;
    if values.is_empty() && all_flows.is_empty() {
        return Err(DashboardError::NotFound(format!(
            "no valuations or cash flows for {account}"
        )));
    }

    let (settled, pending): (Vec<&CashFlowEvent>, Vec<&CashFlowEvent>) =
        all_flows.iter().partition(|f| f.date <= anchor_end);
    let total_deposits = settled.iter().map(|f| f.signed_amount()).sum::<f64>();
    let pending_deposits = pending.iter().map(|f| f.signed_amount()).sum::<f64>();

    let series = net_value_series(&values);
    let current = series.last().copied();
    let total_return = current.map(|p| p.value - total_deposits);

    let cutoff = lookback_cutoff(config.max_apy_window(), as_of, &policy);
    let apy_series = series
        .iter()
        .filter(|p| ts_to_date(p.ts).is_some_and(|day| day >= cutoff))
        .copied()
        .collect::<Vec<_>>();
    let apy_flows = timed_flows(
        &all_flows
            .iter()
            .filter(|f| f.date >= cutoff)
            .copied()
            .collect::<Vec<_>>(),
    );
    let apy = config
        .apy_windows_weeks
        .iter()
        .map(|weeks| {
            let result = annualized_average(
                *weeks,
                &apy_series,
                &apy_flows,
                as_of,
                &policy,
                config.boundary_tolerance_days,
            );
            apy_payload(&result, policy.bucket_days)
        })
        .collect::<Vec<_>>();

    Ok(json!({
        "account": account,
        "as_of": ymd(as_of),
        "anchor_end": ymd(anchor_end),
        "bucket_policy": describe_policy(&policy),
        "summary": {
            "current_value": current.map(|p| round_to(p.value, 2)),
            "current_value_at": current.and_then(|p| ts_ymd(p.ts)),
            "total_deposits": round_to(total_deposits, 2),
            "pending_deposits": round_to(pending_deposits, 2),
            "total_return": total_return.map(|v| round_to(v, 2)),
            "valuation_count": series.len(),
            "flow_count": all_flows.len(),
        },
        "profit_share": config.performance_fee_rate,
        "profit_share_pct": format!("{:.0}%", config.performance_fee_rate * 100.0),
        "apy": apy,
    }))
}

pub fn wallet_chart_query_at_db_path(
    db_path: &Path,
    config: &PerformanceConfig,
    req: WalletChartQueryRequest,
) -> Result<Value> {
    let account = parse_account(req.account)?;
    let period = req
        .period
        .unwrap_or_else(|| "30d".to_string())
        .trim()
        .to_lowercase();
    let lookback = config.chart_lookback_days(&period).ok_or_else(|| {
        invalid(format!(
            "period not supported: {period}, expected one of {}",
            config
                .chart_periods
                .keys()
                .cloned()
                .collect::<Vec<_>>()
                .join(", ")
        ))
    })?;
    let as_of = parse_as_of(req.as_of)?;
    let policy = config.bucket_policy()?;
    let anchor_end = policy.last_completed_end(as_of);
    let window_start = Duration::try_days(lookback)
        .and_then(|back| as_of.checked_sub_signed(back))
        .ok_or_else(|| invalid(format!("period {period} reaches before the calendar start")))?;
    let conn = open_wallet_db(db_path)?;

    let values = load_valuations(&conn, &account, DayRange::between(window_start, anchor_end))?;
    let flows = match values
        .iter()
        .map(|v| v.timestamp)
        .max()
        .and_then(ts_to_date)
    {
        Some(last_day) => load_cash_flows(&conn, &account, DayRange::until(last_day))?,
        None => Vec::new(),
    };
    let series = align(&values, &flows, Some(window_start), &policy);

    let thresholds = BaselineThresholds::from(config);
    let headline = range_change(&series, thresholds);
    let headline_value = headline.and_then(|r| r.change).map(|v| round_to(v, 8));
    let ratio_value = baseline_ratio_change(&series).map(|v| round_to(v, 8));

    let points = series
        .values
        .iter()
        .zip(series.deposits.iter())
        .map(|(value, deposit)| {
            json!({
                "ts": value.ts,
                "date": ts_ymd(value.ts),
                "value": round_to(value.value, 2),
                "deposits": round_to(deposit.value, 2),
            })
        })
        .collect::<Vec<_>>();

    Ok(json!({
        "account": account,
        "period": period,
        "range": {
            "from": ymd(window_start),
            "to": ymd(anchor_end),
            "as_of": ymd(as_of),
        },
        "point_count": points.len(),
        "points": points,
        "range_change": {
            "value": headline_value,
            "pct": format_pct_or_dash(headline_value),
            "baseline": headline.and_then(|r| r.baseline),
            "net_return": headline.map(|r| round_to(r.net_return, 2)),
        },
        "baseline_ratio_change": {
            "value": ratio_value,
            "pct": format_pct_or_dash(ratio_value),
        },
    }))
}

pub fn wallet_apy_query_at_db_path(
    db_path: &Path,
    config: &PerformanceConfig,
    req: WalletApyQueryRequest,
) -> Result<Value> {
    let account = parse_account(req.account)?;
    let weeks = req.weeks.unwrap_or_else(|| config.max_apy_window());
    if weeks == 0 || weeks > 520 {
        return Err(invalid("weeks must be between 1 and 520"));
    }
    let as_of = parse_as_of(req.as_of)?;
    let policy = config.bucket_policy()?;
    let cutoff = lookback_cutoff(weeks, as_of, &policy);
    let conn = open_wallet_db(db_path)?;

    let series = net_value_series(&load_valuations(&conn, &account, DayRange::since(cutoff))?);
    let flows = timed_flows(&load_cash_flows(&conn, &account, DayRange::since(cutoff))?);
    let result = annualized_average(
        weeks,
        &series,
        &flows,
        as_of,
        &policy,
        config.boundary_tolerance_days,
    );

    let windows = result
        .windows
        .iter()
        .map(|w| {
            json!({
                "bucket_start": ymd(w.bucket_start),
                "bucket_end": ymd(w.bucket_end),
                "start_date": w.start.and_then(|p| ts_ymd(p.ts)),
                "start_value": w.start.map(|p| round_to(p.value, 2)),
                "end_date": w.end.and_then(|p| ts_ymd(p.ts)),
                "end_value": w.end.map(|p| round_to(p.value, 2)),
                "flow_count": w.flow_count,
                "period_return": w.estimate.map(|e| round_to(e.period_return, 8)),
                "annualized_return": w.estimate.map(|e| round_to(e.annualized_return, 8)),
            })
        })
        .collect::<Vec<_>>();

    Ok(json!({
        "account": account,
        "as_of": ymd(as_of),
        "summary": apy_payload(&result, policy.bucket_days),
        "windows": windows,
    }))
}

pub fn wallet_fees_query_at_db_path(
    db_path: &Path,
    config: &PerformanceConfig,
    req: WalletFeesQueryRequest,
) -> Result<Value> {
    let account = parse_account(req.account)?;
    let rate = parse_rate_param(req.rate.as_deref(), config.performance_fee_rate)?;
    let conn = open_wallet_db(db_path)?;

    let values = load_valuations(&conn, &account, DayRange::all())?;
    if values.is_empty() {
        return Err(DashboardError::NotFound(format!(
            "no valuations for {account}"
        )));
    }
    let flows = load_cash_flows(&conn, &account, DayRange::all())?;
    let schedule = build_fee_schedule(&values, &flows, rate);

    let rows = schedule
        .rows
        .iter()
        .map(|row| {
            json!({
                "date": ymd(row.date),
                "gross_value": round_to(row.gross_value, 2),
                "net_flow": round_to(row.net_flow, 2),
                "gain": round_to(row.gain, 2),
                "fee": round_to(row.fee, 2),
                "cumulative_fee": round_to(row.cumulative_fee, 2),
            })
        })
        .collect::<Vec<_>>();

    Ok(json!({
        "account": account,
        "rate": rate,
        "rate_pct": format!("{:.0}%", rate * 100.0),
        "summary": {
            "row_count": rows.len(),
            "total_gain": round_to(schedule.total_gain, 2),
            "total_fee": round_to(schedule.total_fee, 2),
        },
        "rows": rows,
    }))
}

/// Bucket policy in the shape the UI needs to label axes.
pub fn describe_policy(policy: &BucketPolicy) -> Value {
    json!({
        "anchor_weekday": policy.anchor.to_string(),
        "bucket_days": policy.bucket_days,
    })
}
