//! Valuation and cash-flow series, and their alignment into parallel
//! value / cumulative-deposit series keyed by the same timestamps.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, Weekday};
use serde::Serialize;
use std::collections::BTreeMap;

pub const SECONDS_PER_DAY: i64 = 86_400;

/// Longest bucket a policy accepts; longer requests are clamped.
pub const MAX_BUCKET_DAYS: u32 = 366;

/// Midnight UTC of `date` as unix seconds.
pub fn day_start_ts(date: NaiveDate) -> i64 {
    date.and_time(NaiveTime::MIN).and_utc().timestamp()
}

/// UTC calendar day containing `ts`.
pub fn ts_to_date(ts: i64) -> Option<NaiveDate> {
    DateTime::from_timestamp(ts, 0).map(|dt| dt.date_naive())
}

/// Which weekday closes a bucket and how many days a bucket spans.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketPolicy {
    pub anchor: Weekday,
    pub bucket_days: u32,
}

impl Default for BucketPolicy {
    fn default() -> Self {
        Self::new(Weekday::Sun, 7)
    }
}

impl BucketPolicy {
    pub fn new(anchor: Weekday, bucket_days: u32) -> Self {
        Self {
            anchor,
            bucket_days: bucket_days.clamp(1, MAX_BUCKET_DAYS),
        }
    }

    pub fn bucket_span(&self) -> Duration {
        Duration::days(self.bucket_days as i64)
    }

    // 0001-01-01 (day 1 from CE) is a Monday.
    fn reference_day(&self) -> i64 {
        1 + self.anchor.num_days_from_monday() as i64
    }

    /// First bucket end on or after `date`. Saturates at the last
    /// representable day.
    pub fn bucket_end(&self, date: NaiveDate) -> NaiveDate {
        let span = self.bucket_days as i64;
        let offset = (date.num_days_from_ce() as i64 - self.reference_day()).rem_euclid(span);
        if offset == 0 {
            date
        } else {
            date.checked_add_signed(Duration::days(span - offset))
                .unwrap_or(NaiveDate::MAX)
        }
    }

    /// Most recent bucket end on or before `today`.
    pub fn last_completed_end(&self, today: NaiveDate) -> NaiveDate {
        let end = self.bucket_end(today);
        if end == today {
            today
        } else {
            end.checked_sub_signed(self.bucket_span())
                .unwrap_or(NaiveDate::MIN)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValuationPoint {
    pub timestamp: i64,
    pub gross_value: f64,
    pub fee: f64,
}

impl ValuationPoint {
    pub fn new(timestamp: i64, gross_value: f64) -> Self {
        Self {
            timestamp,
            gross_value,
            fee: 0.0,
        }
    }

    pub fn with_fee(timestamp: i64, gross_value: f64, fee: f64) -> Self {
        Self {
            timestamp,
            gross_value,
            fee,
        }
    }

    pub fn net_value(&self) -> f64 {
        self.gross_value - self.fee
    }

    fn is_well_formed(&self) -> bool {
        self.gross_value.is_finite() && self.fee.is_finite()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CashFlowKind {
    Deposit,
    Withdrawal,
}

impl CashFlowKind {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "deposit" => Some(Self::Deposit),
            "withdrawal" => Some(Self::Withdrawal),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deposit => "deposit",
            Self::Withdrawal => "withdrawal",
        }
    }

    fn sign(&self) -> f64 {
        match self {
            Self::Deposit => 1.0,
            Self::Withdrawal => -1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CashFlowEvent {
    pub date: NaiveDate,
    pub kind: CashFlowKind,
    pub amount: f64,
}

impl CashFlowEvent {
    pub fn new(date: NaiveDate, kind: CashFlowKind, amount: f64) -> Self {
        Self { date, kind, amount }
    }

    pub fn signed_amount(&self) -> f64 {
        self.kind.sign() * self.amount
    }

    pub fn timestamp(&self) -> i64 {
        day_start_ts(self.date)
    }

    pub fn timed(&self) -> TimedFlow {
        TimedFlow {
            ts: self.timestamp(),
            amount: self.signed_amount(),
        }
    }

    fn is_well_formed(&self) -> bool {
        self.amount.is_finite() && self.amount >= 0.0
    }
}

/// A signed cash flow at a unix timestamp.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimedFlow {
    pub ts: i64,
    pub amount: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SeriesPoint {
    pub ts: i64,
    pub value: f64,
}

impl SeriesPoint {
    pub fn new(ts: i64, value: f64) -> Self {
        Self { ts, value }
    }
}

/// Net values and cumulative signed deposits, index-aligned on timestamp.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AlignedSeries {
    pub values: Vec<SeriesPoint>,
    pub deposits: Vec<SeriesPoint>,
}

impl AlignedSeries {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Latest deposit point whose timestamp is at or before `ts`.
    pub fn deposit_at_or_before(&self, ts: i64) -> Option<f64> {
        self.deposits
            .iter()
            .filter(|p| p.ts <= ts)
            .max_by_key(|p| p.ts)
            .map(|p| p.value)
    }
}

/// Sorted net-value series. Non-finite rows are dropped and on duplicate
/// timestamps the last row in input order wins.
pub fn net_value_series(values: &[ValuationPoint]) -> Vec<SeriesPoint> {
    let mut rows = values
        .iter()
        .filter(|v| {
            let ok = v.is_well_formed();
            if !ok {
                log::debug!("dropping malformed valuation at ts={}", v.timestamp);
            }
            ok
        })
        .copied()
        .collect::<Vec<_>>();
    rows.sort_by_key(|v| v.timestamp);

    let mut out: Vec<SeriesPoint> = Vec::with_capacity(rows.len());
    for row in rows {
        let point = SeriesPoint::new(row.timestamp, row.net_value());
        match out.last_mut() {
            Some(last) if last.ts == point.ts => *last = point,
            _ => out.push(point),
        }
    }
    out
}

/// Well-formed flows sorted by date (stable, so same-day order is kept).
pub fn clean_flows(flows: &[CashFlowEvent]) -> Vec<CashFlowEvent> {
    let mut out = flows
        .iter()
        .filter(|f| {
            let ok = f.is_well_formed();
            if !ok {
                log::debug!("dropping malformed cash flow on {}", f.date);
            }
            ok
        })
        .copied()
        .collect::<Vec<_>>();
    out.sort_by_key(|f| f.date);
    out
}

fn bucket_flows(flows: &[CashFlowEvent], policy: &BucketPolicy) -> BTreeMap<NaiveDate, f64> {
    let mut by_bucket = BTreeMap::<NaiveDate, f64>::new();
    for flow in flows {
        *by_bucket.entry(policy.bucket_end(flow.date)).or_insert(0.0) += flow.signed_amount();
    }
    by_bucket
}

/// Builds the aligned value / cumulative-deposit series.
///
/// Flows are summed per bucket end. The running total starts with every
/// bucket that closes before the first valuation's bucket, then each
/// valuation adds the bucket keyed by its own calendar day. A valuation that
/// does not sit on a bucket end contributes nothing; each bucket is consumed
/// at most once.
///
/// When the first deposit on or after `window_start` predates the first
/// valuation, a synthetic leading point is prepended at that deposit's day.
pub fn align(
    values: &[ValuationPoint],
    flows: &[CashFlowEvent],
    window_start: Option<NaiveDate>,
    policy: &BucketPolicy,
) -> AlignedSeries {
    let value_series = net_value_series(values);
    let Some(first) = value_series.first().copied() else {
        return AlignedSeries::default();
    };
    let Some(first_day) = ts_to_date(first.ts) else {
        return AlignedSeries::default();
    };

    let flows = clean_flows(flows);
    let mut by_bucket = bucket_flows(&flows, policy);

    let first_bucket = policy.bucket_end(first_day);
    let mut cumulative = by_bucket
        .range(..first_bucket)
        .map(|(_, amount)| *amount)
        .sum::<f64>();

    let mut deposits = Vec::with_capacity(value_series.len() + 1);
    for point in &value_series {
        if let Some(day) = ts_to_date(point.ts) {
            if let Some(amount) = by_bucket.remove(&day) {
                cumulative += amount;
            }
        }
        deposits.push(SeriesPoint::new(point.ts, cumulative));
    }

    let mut values_out = value_series;
    let leading = flows.iter().find(|f| {
        f.kind == CashFlowKind::Deposit && window_start.map_or(true, |start| f.date >= start)
    });
    if let Some(origin) = leading {
        let origin_ts = origin.timestamp();
        if origin_ts < first.ts {
            let at_origin = flows
                .iter()
                .filter(|f| f.date <= origin.date)
                .map(CashFlowEvent::signed_amount)
                .sum::<f64>();
            values_out.insert(0, SeriesPoint::new(origin_ts, at_origin.max(0.0)));
            deposits.insert(0, SeriesPoint::new(origin_ts, at_origin));
        }
    }

    AlignedSeries {
        values: values_out,
        deposits,
    }
}
