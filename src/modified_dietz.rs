use crate::wallet_series::TimedFlow;

const MIN_DENOMINATOR: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq)]
pub struct ModifiedDietzCalc {
    pub period_seconds: i64,
    pub net_flow: f64,
    pub weighted_flow: f64,
    pub profit: f64,
    pub weighted_capital: f64,
    /// `None` when the weighted capital base is zero or not finite.
    pub return_rate: Option<f64>,
}

/// Money-weighted return for one period.
///
/// Only flows with `start_ts <= ts <= end_ts` count. Each flow is weighted by
/// the share of the period remaining after it, so a flow at the start counts
/// fully toward the capital base and one at the end not at all.
pub fn calculate_modified_dietz(
    start_value: f64,
    end_value: f64,
    start_ts: i64,
    end_ts: i64,
    flows: &[TimedFlow],
) -> ModifiedDietzCalc {
    let period_seconds = (end_ts - start_ts).max(1);

    let mut weighted_flow = 0.0_f64;
    let mut net_flow = 0.0_f64;
    for flow in flows {
        if flow.ts < start_ts || flow.ts > end_ts {
            continue;
        }
        let weight = 1.0 - (flow.ts - start_ts) as f64 / period_seconds as f64;
        weighted_flow += flow.amount * weight.clamp(0.0, 1.0);
        net_flow += flow.amount;
    }

    let weighted_capital = start_value + weighted_flow;
    let profit = end_value - start_value - net_flow;
    let return_rate = if !weighted_capital.is_finite() || weighted_capital.abs() < MIN_DENOMINATOR
    {
        None
    } else {
        Some(profit / weighted_capital).filter(|r| r.is_finite())
    };

    ModifiedDietzCalc {
        period_seconds,
        net_flow,
        weighted_flow,
        profit,
        weighted_capital,
        return_rate,
    }
}

pub fn modified_dietz_return(
    start_value: f64,
    end_value: f64,
    start_ts: i64,
    end_ts: i64,
    flows: &[TimedFlow],
) -> Option<f64> {
    calculate_modified_dietz(start_value, end_value, start_ts, end_ts, flows).return_rate
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wallet_series::SECONDS_PER_DAY;

    const T0: i64 = 1_736_035_200;
    const WEEK: i64 = 7 * SECONDS_PER_DAY;

    fn approx_eq(a: f64, b: f64, eps: f64) {
        assert!(
            (a - b).abs() <= eps,
            "approx not equal: left={a} right={b} eps={eps}"
        );
    }

    fn flow(ts: i64, amount: f64) -> TimedFlow {
        TimedFlow { ts, amount }
    }

    #[test]
    fn without_flows_matches_simple_return() {
        for (start, end) in [(1_000.0, 1_070.0), (250.0, 200.0), (1.0, 1.0)] {
            let r = modified_dietz_return(start, end, T0, T0 + WEEK, &[]).expect("computable");
            approx_eq(r, (end - start) / start, 1e-12);
        }
    }

    #[test]
    fn late_deposit_scores_higher_than_early_deposit() {
        let early = modified_dietz_return(1_000.0, 1_200.0, T0, T0 + WEEK, &[flow(T0, 100.0)])
            .expect("early");
        let late = modified_dietz_return(
            1_000.0,
            1_200.0,
            T0,
            T0 + WEEK,
            &[flow(T0 + WEEK - 1, 100.0)],
        )
        .expect("late");
        approx_eq(early, 100.0 / 1_100.0, 1e-12);
        assert!(late > early, "late={late} early={early}");
        approx_eq(late, 0.1, 1e-5);
    }

    #[test]
    fn zero_capital_is_not_computable() {
        assert_eq!(modified_dietz_return(0.0, 50.0, T0, T0 + WEEK, &[]), None);
        assert_eq!(modified_dietz_return(f64::NAN, 50.0, T0, T0 + WEEK, &[]), None);
        // A full withdrawal at the start leaves no capital either.
        assert_eq!(
            modified_dietz_return(100.0, 0.0, T0, T0 + WEEK, &[flow(T0, -100.0)]),
            None
        );
    }

    #[test]
    fn mid_week_deposit_scenario() {
        let calc = calculate_modified_dietz(
            1_000.0,
            1_070.0,
            T0,
            T0 + WEEK,
            &[flow(T0 + 3 * SECONDS_PER_DAY, 50.0)],
        );
        approx_eq(calc.weighted_flow, 50.0 * 4.0 / 7.0, 1e-9);
        approx_eq(calc.weighted_capital, 1_000.0 + 50.0 * 4.0 / 7.0, 1e-9);
        approx_eq(calc.net_flow, 50.0, 1e-12);
        approx_eq(calc.profit, 20.0, 1e-12);
        let r = calc.return_rate.expect("computable");
        approx_eq(r, 20.0 / (1_000.0 + 200.0 / 7.0), 1e-12);
        approx_eq(r, 0.019444, 1e-6);
    }

    #[test]
    fn flows_outside_the_period_are_ignored() {
        let flows = [flow(T0 - 1, 500.0), flow(T0 + WEEK + 1, 500.0)];
        let r = modified_dietz_return(1_000.0, 1_100.0, T0, T0 + WEEK, &flows).expect("r");
        approx_eq(r, 0.1, 1e-12);
    }

    #[test]
    fn zero_length_period_is_guarded() {
        let calc = calculate_modified_dietz(1_000.0, 1_000.0, T0, T0, &[flow(T0, 10.0)]);
        assert_eq!(calc.period_seconds, 1);
        approx_eq(calc.weighted_flow, 10.0, 1e-12);
        approx_eq(calc.return_rate.expect("r"), -10.0 / 1_010.0, 1e-12);
    }
}
