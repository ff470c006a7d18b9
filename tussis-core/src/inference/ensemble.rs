//! Decision fusion over one or more classifiers.
//!
//! ## Modes (fixed at construction)
//!
//! | Members | Decision                         | Confidence                     |
//! |---------|----------------------------------|--------------------------------|
//! | 1       | arg-max of softmax               | winning probability            |
//! | N ≥ 2   | mode of per-model arg-max votes  | per `EnsembleConfidence`       |
//!
//! Vote ties are resolved by `TieBreak`, which is deterministic: the same
//! votes always produce the same class.
//!
//! ## Failures
//!
//! A member whose inference fails is excluded under `DegradedPolicy::BestEffort`
//! (at least one survivor required) and fails the request under `FailFast`.
//! A shape contract violation is never absorbed.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::PipelineConfig;
use crate::dsp::reshape::FixedTensor;
use crate::error::{Result, TussisError};
use crate::inference::{LabelTable, ModelHandle, ScoreVector};
use crate::report::Confidence;

/// How a tie between equally voted classes is resolved.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreak {
    /// Lowest class index wins.
    #[default]
    LowestIndex,
    /// First tied label in `order` wins; unlisted ties fall back to lowest index.
    Priority { order: Vec<String> },
    /// Tied class with the highest mean probability wins, then lowest index.
    HighestMeanProbability,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradedPolicy {
    /// Any member failure fails the request (`ModelsUnavailable`).
    #[default]
    FailFast,
    /// Failed members are excluded with a warning; ≥ 1 must survive.
    BestEffort,
}

/// What an N-model ensemble reports as its confidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnsembleConfidence {
    /// Votes carry no calibrated probability; report the explicit marker.
    #[default]
    NotComputed,
    /// Mean softmax probability of the winning class across survivors.
    MeanProbability,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnsembleOptions {
    pub tie_break: TieBreak,
    pub confidence: EnsembleConfidence,
    pub degraded_policy: DegradedPolicy,
    /// Run members on scoped threads.
    pub parallel: bool,
}

impl Default for EnsembleOptions {
    fn default() -> Self {
        Self {
            tie_break: TieBreak::LowestIndex,
            confidence: EnsembleConfidence::NotComputed,
            degraded_policy: DegradedPolicy::FailFast,
            parallel: true,
        }
    }
}

impl EnsembleOptions {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            tie_break: config.tie_break.clone(),
            confidence: config.ensemble_confidence,
            degraded_policy: config.degraded_policy,
            parallel: config.parallel_inference,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum EnsembleMode {
    Single,
    Ensemble { size: usize },
}

/// One member's arg-max vote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelVote {
    pub model: String,
    pub index: usize,
    pub probability: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnsembleDecision {
    pub index: usize,
    pub confidence: Confidence,
    /// Per-class probabilities (single model, or ensemble mean when computed).
    pub probabilities: Option<Vec<f32>>,
    pub votes: Vec<ModelVote>,
    /// Members dropped under best-effort, with the reason.
    pub excluded: Vec<(String, String)>,
    /// More than one class shared the top vote count.
    pub tied: bool,
}

pub struct ClassifierEnsemble {
    members: Vec<ModelHandle>,
    labels: LabelTable,
    options: EnsembleOptions,
    mode: EnsembleMode,
}

impl ClassifierEnsemble {
    /// # Errors
    /// `ModelsUnavailable` with no members; `LabelSpaceMismatch` when members
    /// disagree on the label table.
    pub fn new(members: Vec<ModelHandle>, options: EnsembleOptions) -> Result<Self> {
        let first = members
            .first()
            .ok_or_else(|| TussisError::ModelsUnavailable("no models loaded".into()))?;
        let labels = first.manifest().label_table();
        for member in &members[1..] {
            let table = member.manifest().label_table();
            if !labels.same_space(&table) {
                return Err(TussisError::LabelSpaceMismatch {
                    model: member.name().to_string(),
                    expected: labels.labels.clone(),
                    found: table.labels,
                });
            }
        }
        let mode = match members.len() {
            1 => EnsembleMode::Single,
            size => EnsembleMode::Ensemble { size },
        };
        Ok(Self {
            members,
            labels,
            options,
            mode,
        })
    }

    pub fn mode(&self) -> EnsembleMode {
        self.mode
    }

    pub fn labels(&self) -> &LabelTable {
        &self.labels
    }

    pub fn members(&self) -> &[ModelHandle] {
        &self.members
    }

    pub fn classify(&self, tensor: &FixedTensor) -> Result<EnsembleDecision> {
        let outputs = self.run_members(tensor);

        let mut survivors: Vec<(&ModelHandle, Vec<f32>)> = Vec::with_capacity(outputs.len());
        let mut votes = Vec::with_capacity(outputs.len());
        let mut excluded = Vec::new();
        for (member, output) in self.members.iter().zip(outputs) {
            match output.and_then(|scores| vote_of(member, scores)) {
                Ok((vote, probs)) => {
                    votes.push(vote);
                    survivors.push((member, probs));
                }
                Err(e) if e.is_contract_violation() => return Err(e),
                Err(e) => match self.options.degraded_policy {
                    DegradedPolicy::FailFast => {
                        return Err(TussisError::ModelsUnavailable(format!(
                            "model '{}' failed: {e}",
                            member.name()
                        )))
                    }
                    DegradedPolicy::BestEffort => {
                        warn!(model = member.name(), error = %e, "excluding model from ensemble");
                        excluded.push((member.name().to_string(), e.to_string()));
                    }
                },
            }
        }
        if survivors.is_empty() {
            return Err(TussisError::ModelsUnavailable(format!(
                "all {} models failed",
                self.members.len()
            )));
        }

        let mut decision = match self.mode {
            EnsembleMode::Single => {
                let vote = &votes[0];
                EnsembleDecision {
                    index: vote.index,
                    confidence: Confidence::Probability(vote.probability),
                    probabilities: Some(survivors[0].1.clone()),
                    votes: Vec::new(),
                    excluded: Vec::new(),
                    tied: false,
                }
            }
            EnsembleMode::Ensemble { .. } => self.fuse(&votes, &survivors),
        };
        decision.votes = votes;
        decision.excluded = excluded;
        debug!(
            index = decision.index,
            tied = decision.tied,
            excluded = decision.excluded.len(),
            "ensemble decision"
        );
        Ok(decision)
    }

    fn run_members(&self, tensor: &FixedTensor) -> Vec<Result<ScoreVector>> {
        if !self.options.parallel || self.members.len() < 2 {
            return self.members.iter().map(|m| m.infer(tensor)).collect();
        }
        std::thread::scope(|scope| {
            let handles: Vec<_> = self
                .members
                .iter()
                .map(|member| scope.spawn(move || member.infer(tensor)))
                .collect();
            handles
                .into_iter()
                .zip(&self.members)
                .map(|(handle, member)| {
                    handle.join().unwrap_or_else(|_| {
                        Err(TussisError::Inference {
                            model: member.name().to_string(),
                            reason: "inference thread panicked".into(),
                        })
                    })
                })
                .collect()
        })
    }

    fn fuse(&self, votes: &[ModelVote], survivors: &[(&ModelHandle, Vec<f32>)]) -> EnsembleDecision {
        let n_classes = self.labels.len();
        let mut counts = vec![0usize; n_classes];
        for vote in votes {
            counts[vote.index] += 1;
        }
        let mean = mean_probabilities(survivors.iter().map(|(_, p)| p.as_slice()), n_classes);

        let top = counts.iter().copied().max().unwrap_or(0);
        let tied: Vec<usize> = (0..n_classes).filter(|&i| counts[i] == top).collect();
        let index = if tied.len() == 1 {
            tied[0]
        } else {
            self.break_tie(&tied, &mean)
        };

        let (confidence, probabilities) = match self.options.confidence {
            EnsembleConfidence::NotComputed => (Confidence::NotComputed, None),
            EnsembleConfidence::MeanProbability => {
                (Confidence::Probability(mean[index]), Some(mean))
            }
        };
        EnsembleDecision {
            index,
            confidence,
            probabilities,
            votes: Vec::new(),
            excluded: Vec::new(),
            tied: tied.len() > 1,
        }
    }

    /// `tied` is sorted ascending and non-empty.
    fn break_tie(&self, tied: &[usize], mean: &[f32]) -> usize {
        match &self.options.tie_break {
            TieBreak::LowestIndex => tied[0],
            TieBreak::Priority { order } => order
                .iter()
                .filter_map(|label| self.labels.index_of(label))
                .find(|i| tied.contains(i))
                .unwrap_or(tied[0]),
            TieBreak::HighestMeanProbability => {
                let mut best = tied[0];
                for &i in &tied[1..] {
                    if mean[i] > mean[best] {
                        best = i;
                    }
                }
                best
            }
        }
    }
}

/// Arg-max of one member's probabilities; a member with no finite score fails.
fn vote_of(member: &ModelHandle, scores: ScoreVector) -> Result<(ModelVote, Vec<f32>)> {
    let probs = scores.probabilities();
    let index = crate::inference::argmax(&probs).ok_or_else(|| TussisError::Inference {
        model: member.name().to_string(),
        reason: "no finite scores".into(),
    })?;
    let vote = ModelVote {
        model: member.name().to_string(),
        index,
        probability: probs[index],
    };
    Ok((vote, probs))
}

fn mean_probabilities<'a>(rows: impl Iterator<Item = &'a [f32]>, n_classes: usize) -> Vec<f32> {
    let mut sum = vec![0f32; n_classes];
    let mut n = 0usize;
    for row in rows {
        for (acc, &p) in sum.iter_mut().zip(row) {
            *acc += p;
        }
        n += 1;
    }
    if n > 0 {
        sum.iter_mut().for_each(|v| *v /= n as f32);
    }
    sum
}
