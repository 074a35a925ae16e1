//! Headline "% change over the range" figures. These are display heuristics
//! on an [`AlignedSeries`], not money-weighted returns.

use serde::Serialize;

use crate::perf_config::PerformanceConfig;
use crate::wallet_series::AlignedSeries;

const NEAR_ZERO: f64 = 1e-9;

/// When the deposit baseline at the start of a range is big enough to divide by.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BaselineThresholds {
    pub floor: f64,
    pub ratio: f64,
}

impl Default for BaselineThresholds {
    fn default() -> Self {
        Self {
            floor: 100.0,
            ratio: 0.1,
        }
    }
}

impl From<&PerformanceConfig> for BaselineThresholds {
    fn from(config: &PerformanceConfig) -> Self {
        Self {
            floor: config.substantial_baseline_floor,
            ratio: config.substantial_baseline_ratio,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Baseline {
    StartDeposits,
    EndDeposits,
    StartValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RangeEndpoints {
    pub start_value: f64,
    pub end_value: f64,
    pub start_deposits: f64,
    pub end_deposits: f64,
}

impl RangeEndpoints {
    /// First and last value points and the deposit totals at or before each.
    /// A missing start deposit counts as 0 and a missing end deposit falls
    /// back to the start one. Needs at least two value points.
    pub fn from_series(series: &AlignedSeries) -> Option<Self> {
        if series.values.len() < 2 {
            return None;
        }
        let first = series.values.first()?;
        let last = series.values.last()?;
        let start_deposits = series.deposit_at_or_before(first.ts).unwrap_or(0.0);
        let end_deposits = series
            .deposit_at_or_before(last.ts)
            .unwrap_or(start_deposits);
        Some(Self {
            start_value: first.value,
            end_value: last.value,
            start_deposits,
            end_deposits,
        })
    }

    /// Value change net of deposits made in between.
    pub fn net_return(&self) -> f64 {
        (self.end_value - self.start_value) - (self.end_deposits - self.start_deposits)
    }

    pub fn pick_baseline(&self, thresholds: BaselineThresholds) -> Option<(Baseline, f64)> {
        let substantial = thresholds.floor.max(self.end_deposits.abs() * thresholds.ratio);
        if self.start_deposits.abs() > substantial {
            Some((Baseline::StartDeposits, self.start_deposits))
        } else if self.end_deposits.abs() > NEAR_ZERO {
            Some((Baseline::EndDeposits, self.end_deposits))
        } else if self.start_value.abs() > NEAR_ZERO {
            Some((Baseline::StartValue, self.start_value))
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RangeChange {
    pub endpoints: RangeEndpoints,
    pub net_return: f64,
    pub baseline: Option<Baseline>,
    pub change: Option<f64>,
}

pub fn range_change(series: &AlignedSeries, thresholds: BaselineThresholds) -> Option<RangeChange> {
    let endpoints = RangeEndpoints::from_series(series)?;
    let net_return = endpoints.net_return();
    let picked = endpoints.pick_baseline(thresholds);
    let change = picked
        .map(|(_, denominator)| net_return / denominator)
        .filter(|c| c.is_finite());
    Some(RangeChange {
        endpoints,
        net_return,
        baseline: picked.map(|(baseline, _)| baseline),
        change,
    })
}

/// Net return over the range divided by the first usable baseline: start
/// deposits when substantial, else end deposits, else the start value.
pub fn range_change_percent(series: &AlignedSeries, thresholds: BaselineThresholds) -> Option<f64> {
    range_change(series, thresholds).and_then(|r| r.change)
}

/// Change in the value-to-deposits ratio between the ends of the range.
/// Undefined when either end has no deposit baseline.
pub fn baseline_ratio_change(series: &AlignedSeries) -> Option<f64> {
    let e = RangeEndpoints::from_series(series)?;
    if e.start_deposits.abs() <= NEAR_ZERO || e.end_deposits.abs() <= NEAR_ZERO {
        return None;
    }
    let change = e.end_value / e.end_deposits - e.start_value / e.start_deposits;
    change.is_finite().then_some(change)
}

/// `+1.23%`, or `—%` when there is nothing to show.
pub fn format_pct_or_dash(value: Option<f64>) -> String {
    match value.filter(|v| v.is_finite()) {
        Some(v) => {
            let sign = if v >= 0.0 { "+" } else { "" };
            format!("{sign}{:.2}%", v * 100.0)
        }
        None => "—%".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wallet_series::SeriesPoint;

    fn approx_eq(a: f64, b: f64, eps: f64) {
        assert!(
            (a - b).abs() <= eps,
            "approx not equal: left={a} right={b} eps={eps}"
        );
    }

    fn series(values: &[(i64, f64)], deposits: &[(i64, f64)]) -> AlignedSeries {
        AlignedSeries {
            values: values.iter().map(|(t, v)| SeriesPoint::new(*t, *v)).collect(),
            deposits: deposits.iter().map(|(t, v)| SeriesPoint::new(*t, *v)).collect(),
        }
    }

    #[test]
    fn substantial_start_deposits_are_the_baseline() {
        let s = series(&[(1, 1_000.0), (2, 1_300.0)], &[(1, 1_000.0), (2, 1_200.0)]);
        let r = range_change(&s, BaselineThresholds::default()).expect("range");
        assert_eq!(r.baseline, Some(Baseline::StartDeposits));
        approx_eq(r.net_return, 100.0, 1e-12);
        approx_eq(r.change.expect("change"), 0.1, 1e-12);
    }

    #[test]
    fn small_start_deposits_fall_back_to_end_deposits() {
        // 50 is below the 100 floor.
        let s = series(&[(1, 50.0), (2, 2_100.0)], &[(1, 50.0), (2, 2_050.0)]);
        let r = range_change(&s, BaselineThresholds::default()).expect("range");
        assert_eq!(r.baseline, Some(Baseline::EndDeposits));
        approx_eq(r.change.expect("change"), 50.0 / 2_050.0, 1e-12);

        // 150 clears the floor but not 10% of 5000.
        let s = series(&[(1, 150.0), (2, 5_100.0)], &[(1, 150.0), (2, 5_000.0)]);
        let r = range_change(&s, BaselineThresholds::default()).expect("range");
        assert_eq!(r.baseline, Some(Baseline::EndDeposits));
    }

    #[test]
    fn no_deposits_fall_back_to_start_value() {
        let s = series(&[(1, 400.0), (2, 500.0)], &[(1, 0.0), (2, 0.0)]);
        let r = range_change(&s, BaselineThresholds::default()).expect("range");
        assert_eq!(r.baseline, Some(Baseline::StartValue));
        approx_eq(r.change.expect("change"), 0.25, 1e-12);
    }

    #[test]
    fn nothing_to_divide_by_is_not_computable() {
        let s = series(&[(1, 0.0), (2, 10.0)], &[(1, 0.0), (2, 0.0)]);
        let r = range_change(&s, BaselineThresholds::default()).expect("range");
        assert_eq!(r.baseline, None);
        assert_eq!(r.change, None);
        assert_eq!(range_change_percent(&s, BaselineThresholds::default()), None);
    }

    #[test]
    fn needs_two_points() {
        let one = series(&[(1, 1_000.0)], &[(1, 1_000.0)]);
        assert_eq!(range_change_percent(&one, BaselineThresholds::default()), None);
        assert_eq!(baseline_ratio_change(&one), None);
        assert_eq!(
            range_change_percent(&AlignedSeries::default(), BaselineThresholds::default()),
            None
        );
    }

    #[test]
    fn missing_deposit_points_use_zero_then_start() {
        let s = series(&[(10, 1_000.0), (20, 1_100.0)], &[(30, 5_000.0)]);
        let e = RangeEndpoints::from_series(&s).expect("endpoints");
        assert_eq!(e.start_deposits, 0.0);
        assert_eq!(e.end_deposits, 0.0);
    }

    #[test]
    fn thresholds_follow_config() {
        let config = PerformanceConfig {
            substantial_baseline_floor: 10.0,
            ..PerformanceConfig::default()
        };
        let s = series(&[(1, 50.0), (2, 2_100.0)], &[(1, 50.0), (2, 400.0)]);
        let r = range_change(&s, BaselineThresholds::from(&config)).expect("range");
        assert_eq!(r.baseline, Some(Baseline::StartDeposits));
    }

    #[test]
    fn ratio_variant_differs_from_net_return_variant() {
        let s = series(&[(1, 1_000.0), (2, 1_300.0)], &[(1, 1_000.0), (2, 1_200.0)]);
        let ratio = baseline_ratio_change(&s).expect("ratio");
        approx_eq(ratio, 1_300.0 / 1_200.0 - 1.0, 1e-12);
        let headline = range_change_percent(&s, BaselineThresholds::default()).expect("pct");
        assert!((ratio - headline).abs() > 1e-3);

        let no_start = series(&[(1, 10.0), (2, 20.0)], &[(1, 0.0), (2, 10.0)]);
        assert_eq!(baseline_ratio_change(&no_start), None);
    }

    #[test]
    fn formats_signed_percent_or_dash() {
        assert_eq!(format_pct_or_dash(Some(0.0123)), "+1.23%");
        assert_eq!(format_pct_or_dash(Some(-0.5)), "-50.00%");
        assert_eq!(format_pct_or_dash(None), "—%");
        assert_eq!(format_pct_or_dash(Some(f64::NAN)), "—%");
    }
}
