#![forbid(unsafe_code)]

//! Hyperparameter search: search-space parsing, client-side run-set
//! generation, and the per-child search providers used by the controller.

mod args;
mod emit;
mod error;
mod generate;
mod history;
pub mod providers;
mod space;
mod wrappers;

pub use args::RunArgs;
pub use emit::{RUNSET_SECTION, insert_hparam_args, render_arg_value, runset_yaml, split_cmd};
pub use error::SearchError;
pub use generate::{GenerateMode, generate_runsets};
pub use history::{HistoryCache, HistoryRecord};
pub use providers::{SearchAlgorithm, SearchKind, SearchRequest};
pub use space::{DistSpec, HP_DISTRIBUTIONS_SECTION, SearchSpace};
pub use wrappers::{DistWrapper, ListWrapper, Wrapper};
