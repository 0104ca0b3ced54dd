use crate::domain::aggregate::StageAggregate;
use crate::domain::pipeline::{Id, Opportunity, Pipeline, Stage};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StageTally {
    pub count: u64,
    pub value: f64,
}

/// Single pass over `opportunities`, keyed by the stage id's string form.
pub fn tally_by_stage<'a>(
    opportunities: impl IntoIterator<Item = &'a Opportunity>,
) -> HashMap<Id, StageTally> {
    let mut out: HashMap<Id, StageTally> = HashMap::new();
    for opp in opportunities {
        let Some(stage_id) = opp.stage_key() else {
            continue;
        };
        let tally = out.entry(stage_id.clone()).or_default();
        tally.count += 1;
        tally.value += opp.value;
    }
    out
}

/// `change / previous` as a percentage with one decimal.
///
/// Without a previous baseline any growth reads as 100%, and no activity at all as 0%.
pub fn change_percent(count: u64, previous: u64) -> f64 {
    if previous > 0 {
        let change = count as f64 - previous as f64;
        (change / previous as f64 * 1000.0).round() / 10.0
    } else if count > 0 {
        100.0
    } else {
        0.0
    }
}

/// One aggregate per known stage (zero-count stages included), sorted by count descending.
///
/// Stages with equal counts keep the upstream stage order.
pub fn build_stage_aggregates(
    pipeline: &Pipeline,
    stages: &[Stage],
    current: &HashMap<Id, StageTally>,
    previous: Option<&HashMap<Id, StageTally>>,
) -> Vec<StageAggregate> {
    let mut out: Vec<StageAggregate> = stages
        .iter()
        .map(|stage| {
            let tally = current.get(&stage.id).copied().unwrap_or_default();
            let previous_count =
                previous.map(|p| p.get(&stage.id).map_or(0, |t| t.count));
            StageAggregate {
                id: stage.id.clone(),
                name: stage.name.clone(),
                count: tally.count,
                value: tally.value,
                pipeline_id: pipeline.id.clone(),
                pipeline_name: pipeline.name.clone(),
                previous_count,
                change: previous_count.map(|p| tally.count as i64 - p as i64),
                change_percent: previous_count.map(|p| change_percent(tally.count, p)),
            }
        })
        .collect();

    out.sort_by(|a, b| b.count.cmp(&a.count));
    out
}
