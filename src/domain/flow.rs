//! Flow aggregates, classifier features and classification records

use crate::domain::mission::{CompletedFlowControlMission, EndUseType};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

/// Aggregate result sets that do not resolve to exactly Volume, Mean and Peak
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SummaryError {
    #[error("missing aggregate {0}")]
    Missing(&'static str),
    #[error("aggregate {0} appears more than once")]
    Duplicate(String),
    #[error("unexpected aggregate {0:?}")]
    Unexpected(String),
}

/// Volume, mean and peak flow over a mission window
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct FlowDataSummary {
    pub volume: f64,
    pub mean: f64,
    pub peak: f64,
}

impl FlowDataSummary {
    /// Build from an unordered (name, value) result set
    ///
    /// Every one of `Volume`, `Mean` and `Peak` must appear exactly once
    /// and no other name may appear.
    pub fn from_aggregates<I, K>(aggregates: I) -> Result<Self, SummaryError>
    where
        I: IntoIterator<Item = (K, f64)>,
        K: AsRef<str>,
    {
        let mut volume = None;
        let mut mean = None;
        let mut peak = None;

        for (name, value) in aggregates {
            let name = name.as_ref();
            let slot = match name {
                "Volume" => &mut volume,
                "Mean" => &mut mean,
                "Peak" => &mut peak,
                other => return Err(SummaryError::Unexpected(other.to_string())),
            };
            if slot.replace(value).is_some() {
                return Err(SummaryError::Duplicate(name.to_string()));
            }
        }

        Ok(Self {
            volume: volume.ok_or(SummaryError::Missing("Volume"))?,
            mean: mean.ok_or(SummaryError::Missing("Mean"))?,
            peak: peak.ok_or(SummaryError::Missing("Peak"))?,
        })
    }
}

/// Names of the values the classifier can be fed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeatureName {
    Volume,
    Mean,
    Peak,
    Duration,
    Hour,
}

impl FeatureName {
    /// Declaration order, also used for sink tags
    pub const ALL: [FeatureName; 5] = [
        FeatureName::Volume,
        FeatureName::Mean,
        FeatureName::Peak,
        FeatureName::Duration,
        FeatureName::Hour,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FeatureName::Volume => "Volume",
            FeatureName::Mean => "Mean",
            FeatureName::Peak => "Peak",
            FeatureName::Duration => "Duration",
            FeatureName::Hour => "Hour",
        }
    }
}

impl fmt::Display for FeatureName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown feature name: {0:?}")]
pub struct UnknownFeature(pub String);

impl FromStr for FeatureName {
    type Err = UnknownFeature;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FeatureName::ALL
            .into_iter()
            .find(|name| name.as_str() == s)
            .ok_or_else(|| UnknownFeature(s.to_string()))
    }
}

/// Model-ready features: the flow summary plus derived duration and hour
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct FlowClassifierFeatures {
    pub volume: f64,
    pub mean: f64,
    pub peak: f64,
    pub duration: f64,
    pub hour: f64,
}

impl FlowClassifierFeatures {
    pub fn get(&self, name: FeatureName) -> f64 {
        match name {
            FeatureName::Volume => self.volume,
            FeatureName::Mean => self.mean,
            FeatureName::Peak => self.peak,
            FeatureName::Duration => self.duration,
            FeatureName::Hour => self.hour,
        }
    }

    /// One row in the given column order
    pub fn ordered(&self, order: &[FeatureName]) -> Vec<f64> {
        order.iter().map(|&name| self.get(name)).collect()
    }

    /// All features as (name, value) pairs in declaration order
    pub fn named(&self) -> impl Iterator<Item = (FeatureName, f64)> + '_ {
        FeatureName::ALL.into_iter().map(move |name| (name, self.get(name)))
    }
}

/// A completed mission with its features and predicted end use
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassifiedFlowControlMission {
    #[serde(flatten)]
    pub mission: CompletedFlowControlMission,
    pub features: FlowClassifierFeatures,
    pub predicted_end_use: EndUseType,
}
