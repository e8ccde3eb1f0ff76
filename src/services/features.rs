//! Feature derivation from flow aggregates and mission metadata
//!
//! Volume and duration scale with the mission's duration scaling factor,
//! mean and peak rates do not. A mission without a factor is unscaled.

use crate::domain::flow::{FlowClassifierFeatures, FlowDataSummary};
use crate::domain::mission::CompletedFlowControlMission;
use chrono::Timelike;

const DEFAULT_SCALING_FACTOR: u32 = 1;

/// Turn a window summary into the classifier's feature set
pub fn derive_features(
    summary: &FlowDataSummary,
    mission: &CompletedFlowControlMission,
) -> FlowClassifierFeatures {
    let scaling_factor =
        f64::from(mission.mission().duration_scaling_factor().unwrap_or(DEFAULT_SCALING_FACTOR));

    let elapsed = mission.end_ts() - mission.start_ts();
    let simulated_secs = elapsed
        .num_nanoseconds()
        .map_or(elapsed.num_seconds() as f64, |ns| ns as f64 / 1e9);

    let start = mission.mission().actual_start_time().unwrap_or_else(|| mission.start_ts().time());

    FlowClassifierFeatures {
        volume: scaling_factor * summary.volume,
        mean: summary.mean,
        peak: summary.peak,
        duration: scaling_factor * simulated_secs,
        hour: hour_of_day(start),
    }
}

/// Fractional hour of a time of day, ignoring sub-second parts
pub fn hour_of_day<T: Timelike>(t: T) -> f64 {
    f64::from(t.hour()) + f64::from(t.minute()) / 60.0 + f64::from(t.second()) / 3600.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::mission::{FlowControlMission, TrajectoryPoint};
    use chrono::{DateTime, NaiveTime};

    fn completed(
        factor: Option<u32>,
        start_time: Option<NaiveTime>,
        start: &str,
        end: &str,
    ) -> CompletedFlowControlMission {
        let mut mission =
            FlowControlMission::new(1, vec![TrajectoryPoint::new(10.0, 2.0)]).unwrap();
        if let Some(factor) = factor {
            mission = mission.with_duration_scaling_factor(factor).unwrap();
        }
        if let Some(start_time) = start_time {
            mission = mission.with_actual_start_time(start_time);
        }
        CompletedFlowControlMission::new(
            mission,
            DateTime::parse_from_rfc3339(start).unwrap(),
            DateTime::parse_from_rfc3339(end).unwrap(),
        )
        .unwrap()
    }

    fn summary() -> FlowDataSummary {
        FlowDataSummary { volume: 12.0, mean: 1.2, peak: 3.0 }
    }

    #[test]
    fn test_scaled_ten_minute_window() {
        let mission = completed(Some(2), None, "2022-01-01T00:00:00Z", "2022-01-01T00:10:00Z");
        let features = derive_features(&summary(), &mission);

        assert_eq!(features.duration, 1200.0);
        assert_eq!(features.volume, 24.0);
        assert_eq!(features.mean, 1.2);
        assert_eq!(features.peak, 3.0);
        assert_eq!(features.hour, 0.0);
    }

    #[test]
    fn test_scaling_is_linear_for_volume_and_duration_only() {
        let once = completed(Some(1), None, "2022-01-01T06:00:00Z", "2022-01-01T06:01:30Z");
        let twice = completed(Some(2), None, "2022-01-01T06:00:00Z", "2022-01-01T06:01:30Z");

        let base = derive_features(&summary(), &once);
        let scaled = derive_features(&summary(), &twice);

        assert_eq!(scaled.volume, 2.0 * base.volume);
        assert_eq!(scaled.duration, 2.0 * base.duration);
        assert_eq!(scaled.mean, base.mean);
        assert_eq!(scaled.peak, base.peak);
        assert_eq!(scaled.hour, base.hour);
    }

    #[test]
    fn test_missing_factor_means_unscaled() {
        let mission = completed(None, None, "2022-01-01T00:00:00Z", "2022-01-01T00:00:45Z");
        let features = derive_features(&summary(), &mission);
        assert_eq!(features.duration, 45.0);
        assert_eq!(features.volume, 12.0);
    }

    #[test]
    fn test_sub_second_duration_kept() {
        let mission =
            completed(None, None, "2022-01-01T00:00:00Z", "2022-01-01T00:00:01.250Z");
        let features = derive_features(&summary(), &mission);
        assert!((features.duration - 1.25).abs() < 1e-9);
    }

    #[test]
    fn test_hour_prefers_declared_start_time() {
        let declared = NaiveTime::from_hms_opt(11, 11, 11).unwrap();
        let mission =
            completed(None, Some(declared), "2022-01-01T20:00:00Z", "2022-01-01T20:05:00Z");
        let features = derive_features(&summary(), &mission);

        let expected = 11.0 + 11.0 / 60.0 + 11.0 / 3600.0;
        assert!((features.hour - expected).abs() < 1e-12);
        assert!((features.hour - 11.1864).abs() < 1e-4);
    }

    #[test]
    fn test_hour_uses_start_offset_local_time() {
        let mission =
            completed(None, None, "2022-01-01T16:30:00+02:00", "2022-01-01T16:40:00+02:00");
        let features = derive_features(&summary(), &mission);
        assert_eq!(features.hour, 16.5);
    }

    #[test]
    fn test_hour_bounds() {
        assert_eq!(hour_of_day(NaiveTime::from_hms_opt(0, 0, 0).unwrap()), 0.0);
        let late = hour_of_day(NaiveTime::from_hms_milli_opt(23, 59, 59, 999).unwrap());
        assert!(late < 24.0);
        assert!(late > 23.99);
    }
}
