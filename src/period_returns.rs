use chrono::{Duration, NaiveDate};
use serde::Serialize;

use crate::modified_dietz::calculate_modified_dietz;
use crate::wallet_series::{day_start_ts, BucketPolicy, SeriesPoint, TimedFlow, SECONDS_PER_DAY};

const DAYS_PER_YEAR: f64 = 365.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ReturnEstimate {
    pub period_return: f64,
    pub annualized_return: f64,
}

impl ReturnEstimate {
    /// `(1 + r)^(365 / days) - 1`. `None` for a non-positive span or a
    /// non-finite result.
    pub fn annualize(period_return: f64, days: f64) -> Option<Self> {
        if !period_return.is_finite() || !(days > 0.0) {
            return None;
        }
        let annualized_return = (1.0 + period_return).powf(DAYS_PER_YEAR / days) - 1.0;
        annualized_return.is_finite().then_some(Self {
            period_return,
            annualized_return,
        })
    }
}

/// One bucket of the rolling window and what was measured for it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeriodWindow {
    pub bucket_start: NaiveDate,
    pub bucket_end: NaiveDate,
    pub start: Option<SeriesPoint>,
    pub end: Option<SeriesPoint>,
    pub flow_count: usize,
    pub estimate: Option<ReturnEstimate>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnnualizedAverage {
    pub weeks: u32,
    pub anchor_end: NaiveDate,
    pub windows: Vec<PeriodWindow>,
    pub used_windows: usize,
    /// Mean of the per-window annualized returns, `None` when no window
    /// produced one.
    pub average: Option<f64>,
}

/// Point closest to `target_ts` within `tolerance_secs`. On a tie the
/// earliest point wins.
pub fn find_nearest_point(
    series: &[SeriesPoint],
    target_ts: i64,
    tolerance_secs: i64,
) -> Option<SeriesPoint> {
    let mut best: Option<(i64, SeriesPoint)> = None;
    for point in series {
        let diff = (point.ts - target_ts).abs();
        if diff > tolerance_secs {
            continue;
        }
        if best.map_or(true, |(min_diff, _)| diff < min_diff) {
            best = Some((diff, *point));
        }
    }
    best.map(|(_, point)| point)
}

fn measure_window(
    series: &[SeriesPoint],
    flows: &[TimedFlow],
    bucket_start: NaiveDate,
    bucket_end: NaiveDate,
    tolerance_secs: i64,
) -> PeriodWindow {
    let start = find_nearest_point(series, day_start_ts(bucket_start), tolerance_secs);
    let end = find_nearest_point(series, day_start_ts(bucket_end), tolerance_secs);
    let mut window = PeriodWindow {
        bucket_start,
        bucket_end,
        start,
        end,
        flow_count: 0,
        estimate: None,
    };
    let (Some(start), Some(end)) = (start, end) else {
        return window;
    };
    if start.ts >= end.ts {
        return window;
    }

    let in_window = flows
        .iter()
        .filter(|f| f.ts > start.ts && f.ts <= end.ts)
        .copied()
        .collect::<Vec<_>>();
    window.flow_count = in_window.len();

    let calc = calculate_modified_dietz(start.value, end.value, start.ts, end.ts, &in_window);
    let days = (end.ts - start.ts) as f64 / SECONDS_PER_DAY as f64;
    window.estimate = calc
        .return_rate
        .and_then(|r| ReturnEstimate::annualize(r, days));
    window
}

/// Rolling estimate over `weeks` consecutive buckets ending at the last
/// completed bucket end on or before `as_of`.
///
/// Each bucket gets its own Modified Dietz return, annualized from the actual
/// span between its boundary points. Buckets with a missing boundary or an
/// uncomputable return are skipped.
pub fn annualized_average(
    weeks: u32,
    series: &[SeriesPoint],
    flows: &[TimedFlow],
    as_of: NaiveDate,
    policy: &BucketPolicy,
    tolerance_days: i64,
) -> AnnualizedAverage {
    let anchor_end = policy.last_completed_end(as_of);
    let tolerance_secs = tolerance_days.max(0).saturating_mul(SECONDS_PER_DAY);
    let span = policy.bucket_span();

    let mut windows = Vec::new();
    if series.len() >= 2 {
        let mut bucket_end = anchor_end;
        for _ in 0..weeks {
            // Stop at the start of the calendar.
            let Some(bucket_start) = bucket_end.checked_sub_signed(span) else {
                break;
            };
            windows.push(measure_window(
                series,
                flows,
                bucket_start,
                bucket_end,
                tolerance_secs,
            ));
            bucket_end = bucket_start;
        }
    }

    let annualized = windows
        .iter()
        .filter_map(|w| w.estimate.map(|e| e.annualized_return))
        .collect::<Vec<_>>();
    for window in windows.iter().filter(|w| w.estimate.is_none()) {
        log::debug!(
            "skipping bucket {}..{}: start={} end={}",
            window.bucket_start,
            window.bucket_end,
            window.start.is_some(),
            window.end.is_some()
        );
    }

    let average = if annualized.is_empty() {
        None
    } else {
        Some(annualized.iter().sum::<f64>() / annualized.len() as f64)
    };

    AnnualizedAverage {
        weeks,
        anchor_end,
        used_windows: annualized.len(),
        windows,
        average,
    }
}

pub fn compute_annualized_average(
    weeks: u32,
    series: &[SeriesPoint],
    flows: &[TimedFlow],
    as_of: NaiveDate,
    policy: &BucketPolicy,
    tolerance_days: i64,
) -> Option<f64> {
    annualized_average(weeks, series, flows, as_of, policy, tolerance_days).average
}

/// Earliest day whose data can influence a `weeks`-bucket estimate, with one
/// bucket of slack for boundary tolerance. Saturates at the first
/// representable day.
pub fn lookback_cutoff(weeks: u32, as_of: NaiveDate, policy: &BucketPolicy) -> NaiveDate {
    let anchor_end = policy.last_completed_end(as_of);
    let days = policy.bucket_days as i64 * (weeks as i64 + 1);
    Duration::try_days(days)
        .and_then(|back| anchor_end.checked_sub_signed(back))
        .unwrap_or(NaiveDate::MIN)
}
