#![forbid(unsafe_code)]

use super::random::RandomSearch;
use super::{SearchAlgorithm, SearchRequest, ranked_history, same_value};
use crate::args::RunArgs;
use crate::error::SearchError;
use crate::history::HistoryRecord;
use crate::space::DistSpec;
use rand::RngCore;
use serde_json::Value as JsonValue;
use xt_core::rollup::metric_as_f64;

/// Tree-structured Parzen estimator over the completed history.
///
/// Records are split into a "good" top fraction and the rest. Random
/// candidates are scored by the ratio of their likelihood under the good
/// density to the bad density, summed per hyperparameter, and the best
/// candidate wins. Until `min_history` scored records exist this is plain
/// random search.
pub struct BayesianSearch {
    pub min_history: usize,
    pub candidates: usize,
    pub gamma: f64,
}

impl Default for BayesianSearch {
    fn default() -> Self {
        Self {
            min_history: 4,
            candidates: 24,
            gamma: 0.25,
        }
    }
}

impl SearchAlgorithm for BayesianSearch {
    fn name(&self) -> &'static str {
        "bayesian"
    }

    fn needs_history(&self) -> bool {
        true
    }

    fn next_args(
        &self,
        req: &SearchRequest<'_>,
        rng: &mut dyn RngCore,
    ) -> Result<RunArgs, SearchError> {
        let ranked = ranked_history(req, self.name())?;
        if ranked.len() < self.min_history.max(2) {
            return Ok(RandomSearch::sample(req, rng));
        }
        let n_good = ((ranked.len() as f64 * self.gamma).ceil() as usize).clamp(1, ranked.len() - 1);
        let good = ranked[..n_good].iter().map(|(_, r)| *r).collect::<Vec<_>>();
        let bad = ranked[n_good..].iter().map(|(_, r)| *r).collect::<Vec<_>>();

        let mut best: Option<(f64, RunArgs)> = None;
        for _ in 0..self.candidates.max(1) {
            let candidate = RandomSearch::sample(req, rng);
            let score = req
                .space
                .entries()
                .iter()
                .filter_map(|(name, spec)| {
                    let value = candidate.get(name)?;
                    log_ratio(name, spec, value, &good, &bad)
                })
                .sum::<f64>();
            if best.as_ref().is_none_or(|(s, _)| score > *s) {
                best = Some((score, candidate));
            }
        }
        match best {
            Some((_, args)) => Ok(args),
            None => Ok(RandomSearch::sample(req, rng)),
        }
    }
}

fn log_ratio(
    name: &str,
    spec: &DistSpec,
    value: &JsonValue,
    good: &[&HistoryRecord],
    bad: &[&HistoryRecord],
) -> Option<f64> {
    if let Some(choices) = spec.discrete_values() {
        let k = choices.len().max(1) as f64;
        let hits = |set: &[&HistoryRecord]| {
            set.iter()
                .filter(|r| r.hparams.get(name).is_some_and(|v| same_value(v, value)))
                .count() as f64
        };
        let l = (hits(good) + 1.0) / (good.len() as f64 + k);
        let g = (hits(bad) + 1.0) / (bad.len() as f64 + k);
        return Some((l / g).ln());
    }

    let log_scale = matches!(
        spec,
        DistSpec::LogUniform { .. }
            | DistSpec::LogNormal { .. }
            | DistSpec::QLogUniform { .. }
            | DistSpec::QLogNormal { .. }
    );
    let transform = |v: f64| if log_scale { (v.max(f64::MIN_POSITIVE)).ln() } else { v };
    let observe = |set: &[&HistoryRecord]| {
        set.iter()
            .filter_map(|r| r.hparams.get(name).and_then(metric_as_f64))
            .map(transform)
            .collect::<Vec<_>>()
    };
    let good_obs = observe(good);
    let bad_obs = observe(bad);
    if good_obs.is_empty() || bad_obs.is_empty() {
        return None;
    }
    let x = transform(metric_as_f64(value)?);
    let all = good_obs.iter().chain(bad_obs.iter()).copied().collect::<Vec<_>>();
    let bw = bandwidth(&all);
    Some((parzen(x, &good_obs, bw) / parzen(x, &bad_obs, bw)).ln())
}

/// Silverman's rule of thumb, with a floor for degenerate samples.
fn bandwidth(obs: &[f64]) -> f64 {
    let n = obs.len() as f64;
    let mean = obs.iter().sum::<f64>() / n;
    let var = obs.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    let bw = 1.06 * var.sqrt() * n.powf(-0.2);
    if bw > 0.0 && bw.is_finite() {
        bw
    } else {
        1e-3 * (mean.abs() + 1.0)
    }
}

fn parzen(x: f64, obs: &[f64], bw: f64) -> f64 {
    let density = obs
        .iter()
        .map(|o| (-0.5 * ((x - o) / bw).powi(2)).exp())
        .sum::<f64>()
        / (obs.len() as f64 * bw);
    density + 1e-12
}
