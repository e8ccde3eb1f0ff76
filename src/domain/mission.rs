//! Flow control missions as reported by the backend
//!
//! A mission is validated once at construction (or decode) and is
//! immutable afterwards.

use chrono::{DateTime, FixedOffset, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;

/// Validation failures for mission construction
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MissionError {
    #[error("flow trajectory must not be empty")]
    EmptyTrajectory,
    #[error("time must be non-negative at index {index}: {time}")]
    NegativeTime { index: usize, time: f64 },
    #[error("flow rate must be non-negative at index {index}: {flow_rate}")]
    NegativeFlowRate { index: usize, flow_rate: f64 },
    #[error("time values must be in strictly ascending order (index {index})")]
    NotAscending { index: usize },
    #[error("valve id must be >= -1, got {0}")]
    InvalidValveId(i64),
    #[error("duration scaling factor must be >= 1, got {0}")]
    InvalidScalingFactor(u32),
    #[error("mission ends before it starts ({start} > {end})")]
    EndBeforeStart { start: DateTime<FixedOffset>, end: DateTime<FixedOffset> },
}

/// One point of a flow trajectory: the target rate holds until `time` seconds
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TrajectoryPoint {
    pub time: f64,
    pub flow_rate: f64,
}

impl TrajectoryPoint {
    pub fn new(time: f64, flow_rate: f64) -> Self {
        Self { time, flow_rate }
    }
}

/// Points arrive either as `[time, flow_rate]` or as an object
#[derive(Deserialize)]
#[serde(untagged)]
enum RawTrajectoryPoint {
    Pair(f64, f64),
    Named { time: f64, flow_rate: f64 },
}

impl<'de> Deserialize<'de> for TrajectoryPoint {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(match RawTrajectoryPoint::deserialize(deserializer)? {
            RawTrajectoryPoint::Pair(time, flow_rate) => Self { time, flow_rate },
            RawTrajectoryPoint::Named { time, flow_rate } => Self { time, flow_rate },
        })
    }
}

/// Closed set of end uses the classifier may predict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EndUseType {
    Shower,
    Toilet,
    Faucet,
    ClothesWasher,
    Dishwasher,
    Bathtub,
    #[serde(rename = "other")]
    Other,
}

/// A predicted label that has no `EndUseType` counterpart
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown end use label: {0:?}")]
pub struct UnknownEndUse(pub String);

impl EndUseType {
    pub const ALL: [EndUseType; 7] = [
        EndUseType::Shower,
        EndUseType::Toilet,
        EndUseType::Faucet,
        EndUseType::ClothesWasher,
        EndUseType::Dishwasher,
        EndUseType::Bathtub,
        EndUseType::Other,
    ];

    /// Wire label, as stored in the time-series store
    pub fn as_str(&self) -> &'static str {
        match self {
            EndUseType::Shower => "Shower",
            EndUseType::Toilet => "Toilet",
            EndUseType::Faucet => "Faucet",
            EndUseType::ClothesWasher => "ClothesWasher",
            EndUseType::Dishwasher => "Dishwasher",
            EndUseType::Bathtub => "Bathtub",
            EndUseType::Other => "other",
        }
    }
}

impl fmt::Display for EndUseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EndUseType {
    type Err = UnknownEndUse;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EndUseType::ALL
            .into_iter()
            .find(|end_use| end_use.as_str() == s)
            .ok_or_else(|| UnknownEndUse(s.to_string()))
    }
}

#[derive(Deserialize)]
struct RawFlowControlMission {
    valve_id: i64,
    flow_trajectory: Vec<TrajectoryPoint>,
    #[serde(default)]
    actual_end_use: Option<EndUseType>,
    #[serde(default)]
    duration_scaling_factor: Option<u32>,
    #[serde(default)]
    actual_start_time: Option<NaiveTime>,
}

/// A commanded flow event on one valve
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawFlowControlMission")]
pub struct FlowControlMission {
    valve_id: i64,
    flow_trajectory: Vec<TrajectoryPoint>,
    actual_end_use: Option<EndUseType>,
    duration_scaling_factor: Option<u32>,
    actual_start_time: Option<NaiveTime>,
}

impl FlowControlMission {
    pub fn new(valve_id: i64, flow_trajectory: Vec<TrajectoryPoint>) -> Result<Self, MissionError> {
        if valve_id < -1 {
            return Err(MissionError::InvalidValveId(valve_id));
        }
        validate_trajectory(&flow_trajectory)?;
        Ok(Self {
            valve_id,
            flow_trajectory,
            actual_end_use: None,
            duration_scaling_factor: None,
            actual_start_time: None,
        })
    }

    pub fn with_actual_end_use(mut self, end_use: EndUseType) -> Self {
        self.actual_end_use = Some(end_use);
        self
    }

    pub fn with_duration_scaling_factor(mut self, factor: u32) -> Result<Self, MissionError> {
        if factor < 1 {
            return Err(MissionError::InvalidScalingFactor(factor));
        }
        self.duration_scaling_factor = Some(factor);
        Ok(self)
    }

    pub fn with_actual_start_time(mut self, start: NaiveTime) -> Self {
        self.actual_start_time = Some(start);
        self
    }

    pub fn valve_id(&self) -> i64 {
        self.valve_id
    }

    pub fn flow_trajectory(&self) -> &[TrajectoryPoint] {
        &self.flow_trajectory
    }

    pub fn actual_end_use(&self) -> Option<EndUseType> {
        self.actual_end_use
    }

    pub fn duration_scaling_factor(&self) -> Option<u32> {
        self.duration_scaling_factor
    }

    pub fn actual_start_time(&self) -> Option<NaiveTime> {
        self.actual_start_time
    }
}

impl TryFrom<RawFlowControlMission> for FlowControlMission {
    type Error = MissionError;

    fn try_from(raw: RawFlowControlMission) -> Result<Self, Self::Error> {
        let mut mission = Self::new(raw.valve_id, raw.flow_trajectory)?;
        if let Some(factor) = raw.duration_scaling_factor {
            mission = mission.with_duration_scaling_factor(factor)?;
        }
        mission.actual_end_use = raw.actual_end_use;
        mission.actual_start_time = raw.actual_start_time;
        Ok(mission)
    }
}

fn validate_trajectory(trajectory: &[TrajectoryPoint]) -> Result<(), MissionError> {
    if trajectory.is_empty() {
        return Err(MissionError::EmptyTrajectory);
    }

    for (index, point) in trajectory.iter().enumerate() {
        if point.time < 0.0 {
            return Err(MissionError::NegativeTime { index, time: point.time });
        }
        if point.flow_rate < 0.0 {
            return Err(MissionError::NegativeFlowRate { index, flow_rate: point.flow_rate });
        }
    }

    for (index, pair) in trajectory.windows(2).enumerate() {
        if pair[1].time <= pair[0].time {
            return Err(MissionError::NotAscending { index: index + 1 });
        }
    }

    Ok(())
}

#[derive(Deserialize)]
struct RawCompletedMission {
    flow_control_mission: FlowControlMission,
    #[serde(deserialize_with = "deserialize_instant")]
    start_ts: DateTime<FixedOffset>,
    #[serde(deserialize_with = "deserialize_instant")]
    end_ts: DateTime<FixedOffset>,
}

/// A mission the backend has finished executing, with its actual window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawCompletedMission")]
pub struct CompletedFlowControlMission {
    flow_control_mission: FlowControlMission,
    start_ts: DateTime<FixedOffset>,
    end_ts: DateTime<FixedOffset>,
}

impl CompletedFlowControlMission {
    pub fn new(
        flow_control_mission: FlowControlMission,
        start_ts: DateTime<FixedOffset>,
        end_ts: DateTime<FixedOffset>,
    ) -> Result<Self, MissionError> {
        if end_ts < start_ts {
            return Err(MissionError::EndBeforeStart { start: start_ts, end: end_ts });
        }
        Ok(Self { flow_control_mission, start_ts, end_ts })
    }

    pub fn mission(&self) -> &FlowControlMission {
        &self.flow_control_mission
    }

    pub fn start_ts(&self) -> DateTime<FixedOffset> {
        self.start_ts
    }

    pub fn end_ts(&self) -> DateTime<FixedOffset> {
        self.end_ts
    }
}

impl TryFrom<RawCompletedMission> for CompletedFlowControlMission {
    type Error = MissionError;

    fn try_from(raw: RawCompletedMission) -> Result<Self, Self::Error> {
        Self::new(raw.flow_control_mission, raw.start_ts, raw.end_ts)
    }
}

/// RFC 3339 instant; a timestamp without offset is taken as UTC
fn deserialize_instant<'de, D>(deserializer: D) -> Result<DateTime<FixedOffset>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    let raw = String::deserialize(deserializer)?;
    if let Ok(ts) = DateTime::parse_from_rfc3339(&raw) {
        return Ok(ts);
    }
    NaiveDateTime::parse_from_str(&raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc().fixed_offset())
        .map_err(|e| D::Error::custom(format!("invalid timestamp {raw:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn points(raw: &[(f64, f64)]) -> Vec<TrajectoryPoint> {
        raw.iter().map(|&(t, r)| TrajectoryPoint::new(t, r)).collect()
    }

    #[test]
    fn test_valid_mission() {
        let mission = FlowControlMission::new(1, points(&[(10.0, 22.2), (20.0, 11.1)]))
            .unwrap()
            .with_duration_scaling_factor(2)
            .unwrap()
            .with_actual_end_use(EndUseType::Shower)
            .with_actual_start_time(NaiveTime::from_hms_opt(11, 11, 11).unwrap());

        assert_eq!(mission.valve_id(), 1);
        assert_eq!(mission.flow_trajectory().len(), 2);
        assert_eq!(mission.duration_scaling_factor(), Some(2));
        assert_eq!(mission.actual_end_use(), Some(EndUseType::Shower));
    }

    #[test]
    fn test_empty_trajectory_rejected() {
        assert_eq!(FlowControlMission::new(1, vec![]), Err(MissionError::EmptyTrajectory));
    }

    #[test]
    fn test_negative_time_rejected() {
        let err = FlowControlMission::new(1, points(&[(-1.0, 2.0), (5.0, 1.0)])).unwrap_err();
        assert!(matches!(err, MissionError::NegativeTime { index: 0, .. }));
    }

    #[test]
    fn test_non_ascending_time_rejected() {
        let err = FlowControlMission::new(1, points(&[(5.0, 2.0), (5.0, 1.0)])).unwrap_err();
        assert_eq!(err, MissionError::NotAscending { index: 1 });

        let err = FlowControlMission::new(1, points(&[(5.0, 2.0), (3.0, 1.0)])).unwrap_err();
        assert_eq!(err, MissionError::NotAscending { index: 1 });
    }

    #[test]
    fn test_negative_rate_rejected() {
        let err = FlowControlMission::new(1, points(&[(1.0, 2.0), (5.0, -0.5)])).unwrap_err();
        assert!(matches!(err, MissionError::NegativeFlowRate { index: 1, .. }));
    }

    #[test]
    fn test_zero_time_and_rate_allowed() {
        assert!(FlowControlMission::new(-1, points(&[(0.0, 0.0)])).is_ok());
    }

    #[test]
    fn test_valve_and_factor_bounds() {
        assert_eq!(
            FlowControlMission::new(-2, points(&[(1.0, 1.0)])),
            Err(MissionError::InvalidValveId(-2))
        );
        let mission = FlowControlMission::new(0, points(&[(1.0, 1.0)])).unwrap();
        assert_eq!(
            mission.with_duration_scaling_factor(0),
            Err(MissionError::InvalidScalingFactor(0))
        );
    }

    #[test]
    fn test_end_use_labels() {
        assert_eq!("Shower".parse::<EndUseType>(), Ok(EndUseType::Shower));
        assert_eq!("ClothesWasher".parse::<EndUseType>(), Ok(EndUseType::ClothesWasher));
        assert_eq!("other".parse::<EndUseType>(), Ok(EndUseType::Other));
        assert_eq!("Other".parse::<EndUseType>(), Err(UnknownEndUse("Other".to_string())));
        assert!("Sprinkler".parse::<EndUseType>().is_err());
        for end_use in EndUseType::ALL {
            assert_eq!(end_use.as_str().parse::<EndUseType>(), Ok(end_use));
        }
    }

    #[test]
    fn test_decode_completed_mission() {
        let json = r#"{
            "flow_control_mission": {
                "valve_id": 1,
                "flow_trajectory": [[10, 22.2], {"time": 20, "flow_rate": 11.1}],
                "actual_end_use": "other",
                "duration_scaling_factor": 2,
                "actual_start_time": "11:11:11"
            },
            "start_ts": "2022-01-01T00:00:00Z",
            "end_ts": "2022-01-01T00:10:00+00:00"
        }"#;

        let completed: CompletedFlowControlMission = serde_json::from_str(json).unwrap();
        let mission = completed.mission();
        assert_eq!(mission.valve_id(), 1);
        assert_eq!(mission.flow_trajectory()[1], TrajectoryPoint::new(20.0, 11.1));
        assert_eq!(mission.actual_end_use(), Some(EndUseType::Other));
        assert_eq!(mission.actual_start_time(), NaiveTime::from_hms_opt(11, 11, 11));
        assert_eq!((completed.end_ts() - completed.start_ts()).num_seconds(), 600);
    }

    #[test]
    fn test_decode_naive_timestamp_as_utc() {
        let json = r#"{
            "flow_control_mission": {"valve_id": 3, "flow_trajectory": [[1, 1]]},
            "start_ts": "2022-01-01T08:30:00",
            "end_ts": "2022-01-01T08:31:00.500"
        }"#;

        let completed: CompletedFlowControlMission = serde_json::from_str(json).unwrap();
        assert_eq!(completed.start_ts().offset().local_minus_utc(), 0);
        assert_eq!((completed.end_ts() - completed.start_ts()).num_milliseconds(), 60_500);
    }

    #[test]
    fn test_decode_runs_validation() {
        let empty = r#"{
            "flow_control_mission": {"valve_id": 1, "flow_trajectory": []},
            "start_ts": "2022-01-01T00:00:00Z",
            "end_ts": "2022-01-01T00:10:00Z"
        }"#;
        assert!(serde_json::from_str::<CompletedFlowControlMission>(empty).is_err());

        let reversed = r#"{
            "flow_control_mission": {"valve_id": 1, "flow_trajectory": [[1, 1]]},
            "start_ts": "2022-01-01T00:10:00Z",
            "end_ts": "2022-01-01T00:00:00Z"
        }"#;
        assert!(serde_json::from_str::<CompletedFlowControlMission>(reversed).is_err());
    }
}
