use crate::domain::pipeline::Id;
use crate::upstream::error::FailureKind;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageAggregate {
    pub id: Id,
    pub name: String,
    pub count: u64,
    pub value: f64,
    pub pipeline_id: Id,
    pub pipeline_name: String,
    pub previous_count: Option<u64>,
    pub change: Option<i64>,
    pub change_percent: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagCount {
    pub name: String,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineAggregate {
    /// Sorted by `count`, descending.
    pub stages: Vec<StageAggregate>,
    /// Opportunities inside the date filter (all of them without a filter).
    pub total: u64,
    /// Size of the unfiltered collection.
    pub total_geral: u64,
    pub total_value: f64,
    pub pipelines_count: u32,
    pub tags: Vec<TagCount>,
    pub pipeline_id: Option<Id>,
    pub pipeline_name: Option<String>,
    pub has_comparison: bool,
    pub has_date_filter: bool,
    pub invalid_dates: u64,
    pub is_partial: bool,
    pub error: Option<String>,
    pub error_kind: Option<FailureKind>,
}

impl PipelineAggregate {
    /// "No applicable pipeline": valid, zero-valued, not an error.
    pub fn empty(has_date_filter: bool) -> Self {
        Self {
            stages: Vec::new(),
            total: 0,
            total_geral: 0,
            total_value: 0.0,
            pipelines_count: 0,
            tags: Vec::new(),
            pipeline_id: None,
            pipeline_name: None,
            has_comparison: false,
            has_date_filter,
            invalid_dates: 0,
            is_partial: false,
            error: None,
            error_kind: None,
        }
    }

    pub fn failed(has_date_filter: bool, kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            error_kind: Some(kind),
            ..Self::empty(has_date_filter)
        }
    }

    /// Usable for display: no error and at least one stage.
    pub fn is_displayable(&self) -> bool {
        self.error.is_none() && !self.stages.is_empty()
    }
}
