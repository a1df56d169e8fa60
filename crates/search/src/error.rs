#![forbid(unsafe_code)]

use xt_core::FailureKind;

#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error("hp config has no `{0}` section")]
    MissingSection(&'static str),
    #[error("${dist}() expects {expected} arguments, got {got}")]
    ArgCount {
        dist: String,
        expected: usize,
        got: usize,
    },
    #[error("unknown distribution: ${0}()")]
    UnknownDistribution(String),
    #[error("invalid distribution for `{name}`: {reason}")]
    InvalidDistribution { name: String, reason: String },
    #[error("`{0}` has an empty choice list")]
    EmptyChoice(String),
    #[error("unknown search algorithm: {0}")]
    UnknownAlgorithm(String),
    #[error("random search requires an explicit run count")]
    RunCountRequired,
    #[error("search provider {provider} failed: {reason}")]
    Provider {
        provider: &'static str,
        reason: String,
    },
    #[error("yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl SearchError {
    pub fn kind(&self) -> FailureKind {
        FailureKind::UserConfig
    }
}
