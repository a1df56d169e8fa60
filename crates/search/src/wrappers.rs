#![forbid(unsafe_code)]

use crate::space::{DistSpec, number};
use rand::Rng;
use rand_distr::{Distribution, LogNormal, Normal};
use serde_json::Value as JsonValue;

/// Discrete values walked either as one axis of a grid or sampled uniformly.
#[derive(Clone, Debug, PartialEq)]
pub struct ListWrapper {
    values: Vec<JsonValue>,
    cycle_len: usize,
    draws: usize,
}

impl ListWrapper {
    pub fn new(values: Vec<JsonValue>) -> Self {
        Self {
            values,
            cycle_len: 1,
            draws: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Number of consecutive grid draws that repeat the same value.
    pub fn set_cycle_len(&mut self, cycle_len: usize) {
        self.cycle_len = cycle_len.max(1);
    }

    pub fn cycle_len(&self) -> usize {
        self.cycle_len
    }

    pub fn value_at(&self, draw: usize) -> Option<&JsonValue> {
        if self.values.is_empty() {
            return None;
        }
        self.values.get((draw / self.cycle_len) % self.values.len())
    }

    pub fn next_grid(&mut self) -> Option<JsonValue> {
        let value = self.value_at(self.draws).cloned();
        self.draws += 1;
        value
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<JsonValue> {
        if self.values.is_empty() {
            return None;
        }
        Some(self.values[rng.random_range(0..self.values.len())].clone())
    }

    pub fn values(&self) -> &[JsonValue] {
        &self.values
    }
}

/// Continuous distribution sampler.
#[derive(Clone, Debug, PartialEq)]
pub struct DistWrapper {
    spec: DistSpec,
}

impl DistWrapper {
    pub fn new(spec: DistSpec) -> Self {
        Self { spec }
    }

    pub fn spec(&self) -> &DistSpec {
        &self.spec
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> JsonValue {
        match self.spec {
            DistSpec::Literal(ref v) => v.clone(),
            DistSpec::Choice(ref values) => {
                if values.is_empty() {
                    JsonValue::Null
                } else {
                    values[rng.random_range(0..values.len())].clone()
                }
            }
            DistSpec::Uniform { low, high } => float(uniform(rng, low, high)),
            DistSpec::LogUniform { low, high } => float(uniform(rng, low, high).exp()),
            DistSpec::Normal { mu, sigma } => float(normal(rng, mu, sigma)),
            DistSpec::LogNormal { mu, sigma } => float(lognormal(rng, mu, sigma)),
            DistSpec::RandInt { low, high } => JsonValue::from(rng.random_range(low..high)),
            DistSpec::QUniform { low, high, q } => quantize(uniform(rng, low, high), q),
            DistSpec::QLogUniform { low, high, q } => quantize(uniform(rng, low, high).exp(), q),
            DistSpec::QNormal { mu, sigma, q } => quantize(normal(rng, mu, sigma), q),
            DistSpec::QLogNormal { mu, sigma, q } => quantize(lognormal(rng, mu, sigma), q),
        }
    }
}

/// Either kind of wrapper, one per hyperparameter.
#[derive(Clone, Debug, PartialEq)]
pub enum Wrapper {
    List(ListWrapper),
    Dist(DistWrapper),
}

impl Wrapper {
    pub fn for_spec(spec: &DistSpec) -> Self {
        match spec.discrete_values() {
            Some(values) => Wrapper::List(ListWrapper::new(values)),
            None => Wrapper::Dist(DistWrapper::new(spec.clone())),
        }
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> JsonValue {
        match self {
            Wrapper::List(list) => list.sample(rng).unwrap_or(JsonValue::Null),
            Wrapper::Dist(dist) => dist.sample(rng),
        }
    }
}

fn uniform<R: Rng + ?Sized>(rng: &mut R, low: f64, high: f64) -> f64 {
    if high <= low {
        low
    } else {
        rng.random_range(low..high)
    }
}

fn normal<R: Rng + ?Sized>(rng: &mut R, mu: f64, sigma: f64) -> f64 {
    match Normal::new(mu, sigma) {
        Ok(d) => d.sample(rng),
        Err(_) => mu,
    }
}

fn lognormal<R: Rng + ?Sized>(rng: &mut R, mu: f64, sigma: f64) -> f64 {
    match LogNormal::new(mu, sigma) {
        Ok(d) => d.sample(rng),
        Err(_) => mu.exp(),
    }
}

fn float(v: f64) -> JsonValue {
    serde_json::Number::from_f64(v)
        .map(JsonValue::Number)
        .unwrap_or(JsonValue::Null)
}

fn quantize(v: f64, q: f64) -> JsonValue {
    number((v / q).round() * q)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use serde_json::json;

    #[test]
    fn list_wrapper_cycles_with_cycle_len() {
        let mut w = ListWrapper::new(vec![json!("a"), json!("b")]);
        w.set_cycle_len(2);
        let drawn = (0..6).filter_map(|_| w.next_grid()).collect::<Vec<_>>();
        assert_eq!(
            drawn,
            vec![json!("a"), json!("a"), json!("b"), json!("b"), json!("a"), json!("a")]
        );
    }

    #[test]
    fn dist_wrapper_samples_stay_in_bounds() {
        let mut rng = StdRng::seed_from_u64(7);
        let uni = DistWrapper::new(DistSpec::Uniform { low: 1.0, high: 2.0 });
        let ri = DistWrapper::new(DistSpec::RandInt { low: 3, high: 6 });
        let qu = DistWrapper::new(DistSpec::QUniform {
            low: 16.0,
            high: 128.0,
            q: 16.0,
        });
        for _ in 0..200 {
            let u = uni.sample(&mut rng).as_f64().expect("float");
            assert!((1.0..2.0).contains(&u));
            let i = ri.sample(&mut rng).as_i64().expect("int");
            assert!((3..6).contains(&i));
            let q = qu.sample(&mut rng).as_i64().expect("quantized int");
            assert_eq!(q % 16, 0);
            assert!((16..=128).contains(&q));
        }
    }
}
