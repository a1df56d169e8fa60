#![forbid(unsafe_code)]

use super::{SearchAlgorithm, SearchRequest};
use crate::args::RunArgs;
use crate::error::SearchError;
use crate::generate::{assign_cycle_lens, build_wrappers, grid_cycle_len};
use crate::wrappers::Wrapper;
use rand::RngCore;

/// Grid point `run_index mod cycle`; continuous axes are sampled.
pub struct GridSearch;

impl SearchAlgorithm for GridSearch {
    fn name(&self) -> &'static str {
        "grid"
    }

    fn next_args(
        &self,
        req: &SearchRequest<'_>,
        rng: &mut dyn RngCore,
    ) -> Result<RunArgs, SearchError> {
        let mut wrappers = build_wrappers(req.space);
        assign_cycle_lens(&mut wrappers);
        let point = req.run_index % grid_cycle_len(&wrappers).max(1);
        let mut args = RunArgs::new();
        for (name, w) in &wrappers {
            let value = match w {
                Wrapper::List(list) => list.value_at(point).cloned().unwrap_or_default(),
                Wrapper::Dist(dist) => dist.sample(rng),
            };
            args.push(name.clone(), value);
        }
        Ok(args)
    }
}
