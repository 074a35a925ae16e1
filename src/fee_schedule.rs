use chrono::NaiveDate;
use serde::Serialize;

use crate::wallet_series::{clean_flows, ts_to_date, CashFlowEvent, ValuationPoint};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeeRow {
    pub date: NaiveDate,
    pub timestamp: i64,
    pub gross_value: f64,
    pub net_flow: f64,
    pub gain: f64,
    pub fee: f64,
    pub cumulative_fee: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FeeSchedule {
    pub rate: f64,
    pub rows: Vec<FeeRow>,
    pub total_gain: f64,
    pub total_fee: f64,
}

/// Performance fee accrued at each valuation on the gain since the previous
/// one, net of deposits in between. Losses accrue no fee and are not carried
/// forward.
///
/// The first valuation counts everything above the flows up to its day as
/// gain (never below zero).
pub fn build_fee_schedule(
    values: &[ValuationPoint],
    flows: &[CashFlowEvent],
    rate: f64,
) -> FeeSchedule {
    let mut points = values
        .iter()
        .filter(|v| v.gross_value.is_finite())
        .copied()
        .collect::<Vec<_>>();
    points.sort_by_key(|v| v.timestamp);
    let flows = clean_flows(flows);

    let mut schedule = FeeSchedule {
        rate,
        ..FeeSchedule::default()
    };
    let mut previous: Option<(NaiveDate, f64)> = None;
    for point in points {
        let Some(date) = ts_to_date(point.timestamp) else {
            continue;
        };
        let net_flow = flows
            .iter()
            .filter(|f| match previous {
                Some((last_date, _)) => f.date > last_date && f.date <= date,
                None => f.date <= date,
            })
            .map(CashFlowEvent::signed_amount)
            .sum::<f64>();

        let gain = match previous {
            Some((_, last_gross)) => point.gross_value - last_gross - net_flow,
            None => (point.gross_value - net_flow).max(0.0),
        };
        let fee = if gain > 0.0 { gain * rate } else { 0.0 };
        schedule.total_gain += gain;
        schedule.total_fee += fee;

        schedule.rows.push(FeeRow {
            date,
            timestamp: point.timestamp,
            gross_value: point.gross_value,
            net_flow,
            gain,
            fee,
            cumulative_fee: schedule.total_fee,
        });
        previous = Some((date, point.gross_value));
    }
    schedule
}
