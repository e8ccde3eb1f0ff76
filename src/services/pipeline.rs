//! Per-mission classification: query aggregates, derive features, predict, persist
//!
//! Collaborators sit behind traits so the pipeline can run against the real
//! time-series store and model, or against in-memory fakes in tests.

use crate::domain::flow::{
    ClassifiedFlowControlMission, FeatureName, FlowDataSummary, SummaryError, UnknownFeature,
};
use crate::domain::mission::{CompletedFlowControlMission, EndUseType, UnknownEndUse};
use crate::services::classifier::{Classifier, ClassifierError};
use crate::services::features::derive_features;
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("aggregate query transport error: {0}")]
    Transport(String),
    #[error("aggregate query returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("cannot parse aggregate response: {0}")]
    Parse(String),
    #[error("aggregate query failed: {0}")]
    Flux(String),
    #[error(transparent)]
    Summary(#[from] SummaryError),
}

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("write transport error: {0}")]
    Transport(String),
    #[error("write returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("timestamp {0} cannot be written with nanosecond precision")]
    Timestamp(String),
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("model feature not supported: {0}")]
    UnsupportedFeature(#[from] UnknownFeature),
    #[error(transparent)]
    Query(#[from] QueryError),
    #[error(transparent)]
    Classifier(#[from] ClassifierError),
    #[error(transparent)]
    Label(#[from] UnknownEndUse),
}

/// Volume, mean and peak flow over a time window
#[async_trait]
pub trait AggregateSource: Send + Sync {
    async fn flow_summary(
        &self,
        start: DateTime<FixedOffset>,
        end: DateTime<FixedOffset>,
    ) -> Result<FlowDataSummary, QueryError>;
}

/// Durable store for classification records
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn write_classification(
        &self,
        record: &ClassifiedFlowControlMission,
    ) -> Result<(), SinkError>;
}

/// Result of one processed mission
#[derive(Debug, Clone, PartialEq)]
pub struct ClassificationOutcome {
    pub record: ClassifiedFlowControlMission,
    /// False when the sink rejected the write
    pub persisted: bool,
}

pub struct ClassificationPipeline {
    source: Arc<dyn AggregateSource>,
    classifier: Arc<dyn Classifier>,
    sink: Arc<dyn ResultSink>,
    feature_order: Vec<FeatureName>,
}

impl ClassificationPipeline {
    /// Resolve the classifier's feature order once; unknown names are rejected
    pub fn new(
        source: Arc<dyn AggregateSource>,
        classifier: Arc<dyn Classifier>,
        sink: Arc<dyn ResultSink>,
    ) -> Result<Self, PipelineError> {
        let feature_order = classifier
            .feature_names()
            .iter()
            .map(|name| name.parse::<FeatureName>())
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { source, classifier, sink, feature_order })
    }

    pub fn feature_order(&self) -> &[FeatureName] {
        &self.feature_order
    }

    /// Classify one completed mission and hand the record to the sink
    ///
    /// Sink failures are logged and reported through `persisted`; every
    /// other failure aborts this mission only.
    pub async fn process(
        &self,
        completed: CompletedFlowControlMission,
    ) -> Result<ClassificationOutcome, PipelineError> {
        let summary = self.source.flow_summary(completed.start_ts(), completed.end_ts()).await?;
        let features = derive_features(&summary, &completed);

        let row = features.ordered(&self.feature_order);
        let label = self.classifier.predict(&row)?;
        let predicted_end_use: EndUseType = label.parse()?;

        debug!(
            valve_id = completed.mission().valve_id(),
            volume = features.volume,
            duration = features.duration,
            hour = features.hour,
            end_use = %predicted_end_use,
            "features_derived"
        );

        let record = ClassifiedFlowControlMission { mission: completed, features, predicted_end_use };

        let persisted = match self.sink.write_classification(&record).await {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    valve_id = record.mission.mission().valve_id(),
                    error = %e,
                    "classification_write_failed"
                );
                false
            }
        };

        Ok(ClassificationOutcome { record, persisted })
    }
}
