//! In-memory `PipelineApi` used by the collector, cache and aggregator tests.

use crate::domain::pipeline::{Id, Opportunity, Pipeline, Stage, StageRef};
use crate::upstream::error::UpstreamError;
use crate::upstream::{PageRequest, PipelineApi};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    Pipelines,
    Stages(Id),
    Opportunities { offset: u64, limit: u64 },
    Contact(Id),
}

#[derive(Default)]
pub(crate) struct FakeApi {
    pub pipelines: Mutex<Vec<Pipeline>>,
    pub stages: Mutex<HashMap<Id, Vec<Stage>>>,
    pub opportunities: Mutex<Vec<Opportunity>>,
    pub contacts: Mutex<HashMap<Id, Vec<String>>>,
    /// Popped once per opportunities call: `Some` fails that call, `None` serves it.
    pub opportunity_script: Mutex<VecDeque<Option<UpstreamError>>>,
    /// Returned by every call of the matching kind while set.
    pub pipelines_failure: Mutex<Option<UpstreamError>>,
    pub stages_failure: Mutex<Option<UpstreamError>>,
    pub contact_failures: Mutex<HashMap<Id, UpstreamError>>,
    pub calls: Mutex<Vec<(Call, Instant)>>,
}

impl FakeApi {
    pub fn with_pipeline(pipeline: Pipeline, stages: Vec<Stage>, opportunities: Vec<Opportunity>) -> Self {
        let api = Self::default();
        api.stages.lock().unwrap().insert(pipeline.id.clone(), stages);
        api.pipelines.lock().unwrap().push(pipeline);
        *api.opportunities.lock().unwrap() = opportunities;
        api
    }

    pub fn fail_next_pages(&self, errors: impl IntoIterator<Item = UpstreamError>) {
        self.opportunity_script
            .lock()
            .unwrap()
            .extend(errors.into_iter().map(Some));
    }

    pub fn serve_next_pages(&self, n: usize) {
        self.opportunity_script
            .lock()
            .unwrap()
            .extend(std::iter::repeat_with(|| None).take(n));
    }

    pub fn calls(&self) -> Vec<(Call, Instant)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn opportunity_calls(&self) -> Vec<(u64, Instant)> {
        self.calls()
            .into_iter()
            .filter_map(|(c, at)| match c {
                Call::Opportunities { offset, .. } => Some((offset, at)),
                _ => None,
            })
            .collect()
    }

    pub fn contact_calls(&self) -> usize {
        self.calls()
            .iter()
            .filter(|(c, _)| matches!(c, Call::Contact(_)))
            .count()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push((call, Instant::now()));
    }
}

#[async_trait::async_trait]
impl PipelineApi for FakeApi {
    async fn list_pipelines(&self) -> Result<Vec<Pipeline>, UpstreamError> {
        self.record(Call::Pipelines);
        if let Some(err) = self.pipelines_failure.lock().unwrap().clone() {
            return Err(err);
        }
        Ok(self.pipelines.lock().unwrap().clone())
    }

    async fn list_stages(&self, pipeline_id: &Id) -> Result<Vec<Stage>, UpstreamError> {
        self.record(Call::Stages(pipeline_id.clone()));
        if let Some(err) = self.stages_failure.lock().unwrap().clone() {
            return Err(err);
        }
        Ok(self
            .stages
            .lock()
            .unwrap()
            .get(pipeline_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn list_opportunities(
        &self,
        _pipeline_id: &Id,
        page: &PageRequest,
    ) -> Result<Vec<Opportunity>, UpstreamError> {
        self.record(Call::Opportunities {
            offset: page.offset,
            limit: page.limit,
        });
        if let Some(Some(err)) = self.opportunity_script.lock().unwrap().pop_front() {
            return Err(err);
        }
        let all = self.opportunities.lock().unwrap();
        let start = (page.offset as usize).min(all.len());
        let end = (start + page.limit as usize).min(all.len());
        Ok(all[start..end].to_vec())
    }

    async fn contact_tags(&self, contact_id: &Id) -> Result<Vec<String>, UpstreamError> {
        self.record(Call::Contact(contact_id.clone()));
        if let Some(err) = self.contact_failures.lock().unwrap().get(contact_id).cloned() {
            return Err(err);
        }
        self.contacts
            .lock()
            .unwrap()
            .get(contact_id)
            .cloned()
            .ok_or_else(|| UpstreamError::status(reqwest::StatusCode::NOT_FOUND))
    }
}

pub(crate) fn pipeline(id: u64, name: &str) -> Pipeline {
    Pipeline {
        id: Id::from(id),
        name: name.to_string(),
    }
}

pub(crate) fn stage(id: u64, name: &str) -> Stage {
    Stage {
        id: Id::from(id),
        name: name.to_string(),
    }
}

pub(crate) fn opp(id: u64, stage_id: u64, created_at: Option<&str>) -> Opportunity {
    Opportunity {
        id: Some(Id::from(id)),
        contact_id: Some(Id::from(1000 + id)),
        stage: Some(StageRef {
            id: Some(Id::from(stage_id)),
        }),
        stage_id: None,
        value: 10.0,
        created_at: created_at.map(str::to_string),
    }
}

/// `n` opportunities in stage 1, all created on 2024-01-01.
pub(crate) fn opps(n: usize) -> Vec<Opportunity> {
    (0..n as u64)
        .map(|i| opp(i, 1, Some("2024-01-01 12:00:00")))
        .collect()
}
