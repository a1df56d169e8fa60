#![forbid(unsafe_code)]

//! Up-front (client-side) expansion of a search space into run argument sets.

use crate::args::RunArgs;
use crate::error::SearchError;
use crate::space::SearchSpace;
use crate::wrappers::Wrapper;
use rand::Rng;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GenerateMode {
    Grid,
    Random,
}

impl GenerateMode {
    pub fn from_search_type(search_type: &str) -> Result<Self, SearchError> {
        match search_type.trim().to_ascii_lowercase().as_str() {
            "grid" => Ok(Self::Grid),
            "random" => Ok(Self::Random),
            other => Err(SearchError::UnknownAlgorithm(other.to_string())),
        }
    }
}

/// Full grid cycle length, i.e. the product of every discrete axis.
pub(crate) fn grid_cycle_len(wrappers: &[(String, Wrapper)]) -> usize {
    wrappers
        .iter()
        .map(|(_, w)| match w {
            Wrapper::List(list) => list.len().max(1),
            Wrapper::Dist(_) => 1,
        })
        .product()
}

pub(crate) fn build_wrappers(space: &SearchSpace) -> Vec<(String, Wrapper)> {
    space
        .entries()
        .iter()
        .map(|(name, spec)| (name.clone(), Wrapper::for_spec(spec)))
        .collect()
}

/// Assign grid cycle lengths: each list axis repeats for the product of the
/// lengths of the axes before it.
pub(crate) fn assign_cycle_lens(wrappers: &mut [(String, Wrapper)]) {
    let mut running = 1usize;
    for (_, w) in wrappers.iter_mut() {
        if let Wrapper::List(list) = w {
            list.set_cycle_len(running);
            running = running.saturating_mul(list.len().max(1));
        }
    }
}

/// Produce `count` argument sets. Grid defaults to one full cycle; random
/// search needs an explicit count. Continuous axes are sampled in both modes.
pub fn generate_runsets<R: Rng + ?Sized>(
    space: &SearchSpace,
    mode: GenerateMode,
    count: Option<usize>,
    rng: &mut R,
) -> Result<Vec<RunArgs>, SearchError> {
    let mut wrappers = build_wrappers(space);
    let mut out = Vec::new();
    match mode {
        GenerateMode::Grid => {
            assign_cycle_lens(&mut wrappers);
            let n = count.unwrap_or_else(|| grid_cycle_len(&wrappers));
            for _ in 0..n {
                let mut args = RunArgs::new();
                for (name, w) in wrappers.iter_mut() {
                    let value = match w {
                        Wrapper::List(list) => list.next_grid().unwrap_or_default(),
                        Wrapper::Dist(dist) => dist.sample(rng),
                    };
                    args.push(name.clone(), value);
                }
                out.push(args);
            }
        }
        GenerateMode::Random => {
            let n = count.ok_or(SearchError::RunCountRequired)?;
            for _ in 0..n {
                let args = wrappers
                    .iter()
                    .map(|(name, w)| (name.clone(), w.sample(rng)))
                    .collect::<RunArgs>();
                out.push(args);
            }
        }
    }
    tracing::debug!(mode = ?mode, count = out.len(), "generated hp runsets");
    Ok(out)
}
