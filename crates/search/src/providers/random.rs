#![forbid(unsafe_code)]

use super::{SearchAlgorithm, SearchRequest};
use crate::args::RunArgs;
use crate::error::SearchError;
use crate::wrappers::Wrapper;
use rand::RngCore;

pub struct RandomSearch;

impl RandomSearch {
    pub(crate) fn sample(req: &SearchRequest<'_>, rng: &mut dyn RngCore) -> RunArgs {
        req.space
            .entries()
            .iter()
            .map(|(name, spec)| (name.clone(), Wrapper::for_spec(spec).sample(rng)))
            .collect()
    }
}

impl SearchAlgorithm for RandomSearch {
    fn name(&self) -> &'static str {
        "random"
    }

    fn next_args(
        &self,
        req: &SearchRequest<'_>,
        rng: &mut dyn RngCore,
    ) -> Result<RunArgs, SearchError> {
        Ok(Self::sample(req, rng))
    }
}
