//! Domain models - missions, flow aggregates and classification records
//!
//! - `mission` - flow control missions, trajectories and end-use labels
//! - `flow` - aggregate summaries, classifier features, classified missions

pub mod flow;
pub mod mission;

pub use flow::{
    ClassifiedFlowControlMission, FeatureName, FlowClassifierFeatures, FlowDataSummary,
    SummaryError, UnknownFeature,
};
pub use mission::{
    CompletedFlowControlMission, EndUseType, FlowControlMission, MissionError, TrajectoryPoint,
    UnknownEndUse,
};
