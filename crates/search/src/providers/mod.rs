#![forbid(unsafe_code)]

//! Per-child search algorithms, selected by name from the job's search type.

mod bayesian;
mod dgd;
mod grid;
mod random;

pub use bayesian::BayesianSearch;
pub use dgd::DgdSearch;
pub use grid::GridSearch;
pub use random::RandomSearch;

use crate::args::RunArgs;
use crate::emit::render_arg_value;
use crate::error::SearchError;
use crate::history::HistoryRecord;
use crate::space::SearchSpace;
use rand::RngCore;
use serde_json::Value as JsonValue;

/// Everything an algorithm may look at when choosing the next child's args.
#[derive(Clone, Copy, Debug)]
pub struct SearchRequest<'a> {
    pub space: &'a SearchSpace,
    pub run_index: usize,
    pub history: &'a [HistoryRecord],
    pub primary_metric: Option<&'a str>,
    pub maximize: bool,
}

pub trait SearchAlgorithm: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether the caller must fetch completed-run history first.
    fn needs_history(&self) -> bool {
        false
    }

    fn next_args(
        &self,
        req: &SearchRequest<'_>,
        rng: &mut dyn RngCore,
    ) -> Result<RunArgs, SearchError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SearchKind {
    Random,
    Grid,
    Dgd,
    Bayesian,
}

impl SearchKind {
    pub fn from_name(name: &str) -> Result<Self, SearchError> {
        match name.trim().to_ascii_lowercase().as_str() {
            "random" => Ok(Self::Random),
            "grid" => Ok(Self::Grid),
            "dgd" => Ok(Self::Dgd),
            "bayesian" => Ok(Self::Bayesian),
            other => Err(SearchError::UnknownAlgorithm(other.to_string())),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Random => "random",
            Self::Grid => "grid",
            Self::Dgd => "dgd",
            Self::Bayesian => "bayesian",
        }
    }

    pub fn provider(self) -> Box<dyn SearchAlgorithm> {
        match self {
            Self::Random => Box::new(RandomSearch),
            Self::Grid => Box::new(GridSearch),
            Self::Dgd => Box::new(DgdSearch::default()),
            Self::Bayesian => Box::new(BayesianSearch::default()),
        }
    }
}

/// History records carrying a usable primary metric, best first. The score is
/// oriented so that larger is always better.
pub(crate) fn ranked_history<'a>(
    req: &SearchRequest<'a>,
    provider: &'static str,
) -> Result<Vec<(f64, &'a HistoryRecord)>, SearchError> {
    let primary = req.primary_metric.ok_or_else(|| SearchError::Provider {
        provider,
        reason: "a primary metric is required".to_string(),
    })?;
    let mut ranked = req
        .history
        .iter()
        .filter_map(|r| {
            let v = r.metric(primary)?;
            Some((if req.maximize { v } else { -v }, r))
        })
        .collect::<Vec<_>>();
    ranked.sort_by(|a, b| b.0.total_cmp(&a.0));
    Ok(ranked)
}

pub(crate) fn same_value(a: &JsonValue, b: &JsonValue) -> bool {
    a == b || render_arg_value(a) == render_arg_value(b)
}

/// Text key of the space's names in `lookup`, for detecting repeats.
pub(crate) fn args_key<'v>(
    space: &SearchSpace,
    lookup: impl Fn(&str) -> Option<&'v JsonValue>,
) -> String {
    space
        .entries()
        .iter()
        .map(|(name, _)| {
            let rendered = lookup(name).map(render_arg_value).unwrap_or_default();
            format!("{name}={rendered}")
        })
        .collect::<Vec<_>>()
        .join(",")
}
