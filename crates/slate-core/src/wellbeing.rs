//! Wellbeing snapshots and daily chart series
//!
//! Snapshots are recorded irregularly. Charts need one value per day, so
//! gaps are filled either by carrying the last snapshot forward or by
//! interpolating linearly between neighbours.

use crate::ids::{RecordId, UserId};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One wellbeing check-in
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WellbeingSnapshot {
    /// Server id; `None` before insert
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RecordId>,
    /// Owning user
    pub user_id: UserId,
    /// Named metric values, 0-100
    pub metrics: BTreeMap<String, f64>,
    /// Aggregate of the metrics, 0-100
    pub overall_score: f64,
    /// Check-in time
    pub created_at: DateTime<Utc>,
}

/// Which value of a snapshot to chart
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Series {
    /// `overall_score`
    Overall,
    /// A named metric
    Metric(String),
}

impl Series {
    fn value(&self, snapshot: &WellbeingSnapshot) -> Option<f64> {
        match self {
            Series::Overall => Some(snapshot.overall_score),
            Series::Metric(name) => snapshot.metrics.get(name).copied(),
        }
    }
}

/// Gap-filling strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FillMode {
    /// Repeat the latest value at or before each day
    #[default]
    CarryForward,
    /// Interpolate between surrounding values, carry the last one forward
    Interpolate,
}

/// One day on the chart
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChartPoint {
    /// Calendar day
    pub date: NaiveDate,
    /// `None` before the first snapshot
    pub value: Option<f64>,
}

/// Daily points from `start` to `end` inclusive
///
/// When several snapshots share a day the latest one wins.
#[must_use]
pub fn chart_series(
    snapshots: &[WellbeingSnapshot],
    series: &Series,
    start: NaiveDate,
    end: NaiveDate,
    mode: FillMode,
) -> Vec<ChartPoint> {
    let mut by_day: BTreeMap<NaiveDate, (DateTime<Utc>, f64)> = BTreeMap::new();
    for snapshot in snapshots {
        let Some(value) = series.value(snapshot) else {
            continue;
        };
        let day = snapshot.created_at.date_naive();
        match by_day.get(&day) {
            Some((seen, _)) if *seen > snapshot.created_at => {}
            _ => {
                by_day.insert(day, (snapshot.created_at, value));
            }
        }
    }

    let mut points = Vec::new();
    let mut day = start;
    while day <= end {
        let previous = by_day.range(..=day).next_back().map(|(d, (_, v))| (*d, *v));
        let value = match (mode, previous) {
            (_, None) => None,
            (FillMode::CarryForward, Some((_, v))) => Some(v),
            (FillMode::Interpolate, Some((prev_day, prev_value))) => {
                let next = by_day
                    .range(day + Duration::days(1)..)
                    .next()
                    .map(|(d, (_, v))| (*d, *v));
                match next {
                    Some((next_day, next_value)) if prev_day != day => {
                        let span = (next_day - prev_day).num_days() as f64;
                        let offset = (day - prev_day).num_days() as f64;
                        Some(prev_value + (next_value - prev_value) * offset / span)
                    }
                    _ => Some(prev_value),
                }
            }
        };
        points.push(ChartPoint { date: day, value });
        day += Duration::days(1);
    }
    points
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn snapshot(day: u32, hour: u32, score: f64) -> WellbeingSnapshot {
        WellbeingSnapshot {
            id: None,
            user_id: UserId::new("u1"),
            metrics: BTreeMap::from([("sleep".to_string(), score / 2.0)]),
            overall_score: score,
            created_at: Utc.with_ymd_and_hms(2024, 6, day, hour, 0, 0).unwrap(),
        }
    }

    fn date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, day).unwrap()
    }

    fn values(points: &[ChartPoint]) -> Vec<Option<f64>> {
        points.iter().map(|p| p.value).collect()
    }

    #[test]
    fn carry_forward_repeats_last_value() {
        let snaps = vec![snapshot(2, 9, 40.0), snapshot(5, 9, 80.0)];
        let points = chart_series(&snaps, &Series::Overall, date(1), date(6), FillMode::CarryForward);

        assert_eq!(
            values(&points),
            vec![None, Some(40.0), Some(40.0), Some(40.0), Some(80.0), Some(80.0)]
        );
    }

    #[test]
    fn interpolate_fills_between_neighbours() {
        let snaps = vec![snapshot(1, 9, 40.0), snapshot(5, 9, 80.0)];
        let points = chart_series(&snaps, &Series::Overall, date(1), date(6), FillMode::Interpolate);

        assert_eq!(
            values(&points),
            vec![Some(40.0), Some(50.0), Some(60.0), Some(70.0), Some(80.0), Some(80.0)]
        );
    }

    #[test]
    fn latest_snapshot_of_day_wins() {
        let snaps = vec![snapshot(3, 20, 90.0), snapshot(3, 8, 10.0)];
        let points = chart_series(&snaps, &Series::Overall, date(3), date(3), FillMode::CarryForward);
        assert_eq!(values(&points), vec![Some(90.0)]);
    }

    #[test]
    fn named_metric_series() {
        let snaps = vec![snapshot(1, 9, 60.0)];
        let series = Series::Metric("sleep".into());
        let points = chart_series(&snaps, &series, date(1), date(2), FillMode::CarryForward);
        assert_eq!(values(&points), vec![Some(30.0), Some(30.0)]);

        let missing = Series::Metric("mood".into());
        let points = chart_series(&snaps, &missing, date(1), date(1), FillMode::CarryForward);
        assert_eq!(values(&points), vec![None]);
    }

    #[test]
    fn empty_range_when_end_before_start() {
        let points = chart_series(&[], &Series::Overall, date(5), date(1), FillMode::CarryForward);
        assert!(points.is_empty());
    }
}
