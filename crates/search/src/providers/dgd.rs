#![forbid(unsafe_code)]

use super::random::RandomSearch;
use super::{SearchAlgorithm, SearchRequest, args_key, ranked_history, same_value};
use crate::args::RunArgs;
use crate::error::SearchError;
use crate::wrappers::Wrapper;
use rand::{Rng, RngCore};
use std::collections::HashSet;

/// Discrete gradient descent: start from the best completed run and move one
/// discrete axis a single step, skipping points already tried.
pub struct DgdSearch {
    pub max_attempts: usize,
}

impl Default for DgdSearch {
    fn default() -> Self {
        Self { max_attempts: 25 }
    }
}

impl SearchAlgorithm for DgdSearch {
    fn name(&self) -> &'static str {
        "dgd"
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
        let Some((_, best)) = ranked.first() else {
            return Ok(RandomSearch::sample(req, rng));
        };

        let tried = req
            .history
            .iter()
            .map(|r| args_key(req.space, |n| r.hparams.get(n)))
            .collect::<HashSet<_>>();

        let axes = req
            .space
            .entries()
            .iter()
            .enumerate()
            .filter_map(|(i, (_, spec))| {
                let values = spec.discrete_values()?;
                (values.len() > 1).then_some((i, values))
            })
            .collect::<Vec<_>>();
        if axes.is_empty() {
            return Ok(RandomSearch::sample(req, rng));
        }

        for _ in 0..self.max_attempts {
            let mut args = RunArgs::new();
            for (name, spec) in req.space.entries() {
                let from_best = best.hparams.get(name).and_then(|v| match spec.discrete_values() {
                    Some(values) => values.into_iter().find(|c| same_value(c, v)),
                    None => Some(v.clone()),
                });
                let value = match from_best {
                    Some(v) => v,
                    None => Wrapper::for_spec(spec).sample(rng),
                };
                args.push(name.clone(), value);
            }

            let (axis, values) = &axes[rng.random_range(0..axes.len())];
            let name = &req.space.entries()[*axis].0;
            let pos = args
                .get(name)
                .and_then(|cur| values.iter().position(|c| same_value(c, cur)))
                .unwrap_or(0);
            let forward = rng.random_bool(0.5);
            let next = match (forward, pos) {
                (true, p) if p + 1 < values.len() => p + 1,
                (true, p) => p - 1,
                (false, 0) => 1,
                (false, p) => p - 1,
            };
            args.push(name.clone(), values[next].clone());

            if !tried.contains(&args_key(req.space, |n| args.get(n))) {
                return Ok(args);
            }
        }

        tracing::debug!("dgd neighbourhood exhausted; sampling at random");
        Ok(RandomSearch::sample(req, rng))
    }
}
