#![forbid(unsafe_code)]

use crate::error::SearchError;
use serde_json::Value as JsonValue;
use serde_yaml::Value as YamlValue;

pub const HP_DISTRIBUTIONS_SECTION: &str = "hyperparameter-distributions";

/// One hyperparameter's distribution.
///
/// Continuous distributions follow the usual hyperopt conventions:
/// `loguniform(low, high)` is `exp(uniform(low, high))`, `lognormal(mu, sigma)`
/// is `exp(normal(mu, sigma))`, `randint(low, high)` draws from `[low, high)`,
/// and the `q*` variants round the draw to the nearest multiple of `q`.
#[derive(Clone, Debug, PartialEq)]
pub enum DistSpec {
    Literal(JsonValue),
    Choice(Vec<JsonValue>),
    Uniform { low: f64, high: f64 },
    LogUniform { low: f64, high: f64 },
    Normal { mu: f64, sigma: f64 },
    LogNormal { mu: f64, sigma: f64 },
    RandInt { low: i64, high: i64 },
    QUniform { low: f64, high: f64, q: f64 },
    QLogUniform { low: f64, high: f64, q: f64 },
    QNormal { mu: f64, sigma: f64, q: f64 },
    QLogNormal { mu: f64, sigma: f64, q: f64 },
}

impl DistSpec {
    pub fn is_discrete(&self) -> bool {
        matches!(self, DistSpec::Literal(_) | DistSpec::Choice(_))
    }

    /// Discrete values; a literal is a one-element choice.
    pub fn discrete_values(&self) -> Option<Vec<JsonValue>> {
        match self {
            DistSpec::Literal(v) => Some(vec![v.clone()]),
            DistSpec::Choice(values) => Some(values.clone()),
            _ => None,
        }
    }

    /// Parse a single YAML value: a sequence is a choice, a `$name(args)`
    /// string is a named distribution, anything else is a literal.
    pub fn parse(name: &str, value: &YamlValue) -> Result<Self, SearchError> {
        match value {
            YamlValue::Sequence(items) => {
                let values = items.iter().map(yaml_to_json).collect::<Vec<_>>();
                if values.is_empty() {
                    return Err(SearchError::EmptyChoice(name.to_string()));
                }
                Ok(DistSpec::Choice(values))
            }
            YamlValue::String(text) => match parse_call(text) {
                Some((func, args)) => Self::from_call(name, func, &args),
                None => Ok(DistSpec::Literal(JsonValue::String(text.clone()))),
            },
            other => Ok(DistSpec::Literal(yaml_to_json(other))),
        }
    }

    fn from_call(name: &str, func: &str, args: &[JsonValue]) -> Result<Self, SearchError> {
        let func_lc = func.to_ascii_lowercase();
        if func_lc == "choice" {
            if args.is_empty() {
                return Err(SearchError::EmptyChoice(name.to_string()));
            }
            return Ok(DistSpec::Choice(args.to_vec()));
        }

        let expected = match func_lc.as_str() {
            "linspace" | "quniform" | "qloguniform" | "qnormal" | "qlognormal" => 3,
            "uniform" | "loguniform" | "normal" | "lognormal" | "randint" => 2,
            _ => return Err(SearchError::UnknownDistribution(func.to_string())),
        };
        if args.len() != expected {
            return Err(SearchError::ArgCount {
                dist: func_lc,
                expected,
                got: args.len(),
            });
        }
        let nums = args
            .iter()
            .map(|a| {
                xt_core::rollup::metric_as_f64(a).ok_or_else(|| SearchError::InvalidDistribution {
                    name: name.to_string(),
                    reason: format!("${func_lc}() argument {a} is not numeric"),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let invalid = |reason: &str| SearchError::InvalidDistribution {
            name: name.to_string(),
            reason: reason.to_string(),
        };

        let spec = match func_lc.as_str() {
            "linspace" => {
                let count = nums[2];
                if count < 1.0 || count.fract() != 0.0 {
                    return Err(invalid("linspace count must be a positive integer"));
                }
                DistSpec::Choice(linspace(nums[0], nums[1], count as usize))
            }
            "uniform" => DistSpec::Uniform {
                low: nums[0],
                high: nums[1],
            },
            "loguniform" => DistSpec::LogUniform {
                low: nums[0],
                high: nums[1],
            },
            "normal" => DistSpec::Normal {
                mu: nums[0],
                sigma: nums[1],
            },
            "lognormal" => DistSpec::LogNormal {
                mu: nums[0],
                sigma: nums[1],
            },
            "randint" => DistSpec::RandInt {
                low: nums[0] as i64,
                high: nums[1] as i64,
            },
            "quniform" => DistSpec::QUniform {
                low: nums[0],
                high: nums[1],
                q: nums[2],
            },
            "qloguniform" => DistSpec::QLogUniform {
                low: nums[0],
                high: nums[1],
                q: nums[2],
            },
            "qnormal" => DistSpec::QNormal {
                mu: nums[0],
                sigma: nums[1],
                q: nums[2],
            },
            _ => DistSpec::QLogNormal {
                mu: nums[0],
                sigma: nums[1],
                q: nums[2],
            },
        };
        spec.validate().map_err(invalid)?;
        Ok(spec)
    }

    fn validate(&self) -> Result<(), &'static str> {
        match *self {
            DistSpec::Uniform { low, high }
            | DistSpec::LogUniform { low, high }
            | DistSpec::QUniform { low, high, .. }
            | DistSpec::QLogUniform { low, high, .. }
                if high < low =>
            {
                Err("high must not be below low")
            }
            DistSpec::RandInt { low, high } if high <= low => Err("randint needs low < high"),
            DistSpec::Normal { sigma, .. }
            | DistSpec::LogNormal { sigma, .. }
            | DistSpec::QNormal { sigma, .. }
            | DistSpec::QLogNormal { sigma, .. }
                if !(sigma >= 0.0) || !sigma.is_finite() =>
            {
                Err("sigma must be a finite non-negative number")
            }
            DistSpec::QUniform { q, .. }
            | DistSpec::QLogUniform { q, .. }
            | DistSpec::QNormal { q, .. }
            | DistSpec::QLogNormal { q, .. }
                if !(q > 0.0) =>
            {
                Err("q must be positive")
            }
            _ => Ok(()),
        }
    }
}

/// Ordered mapping from hyperparameter name to distribution.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SearchSpace {
    entries: Vec<(String, DistSpec)>,
}

impl SearchSpace {
    pub fn from_entries(entries: Vec<(String, DistSpec)>) -> Self {
        Self { entries }
    }

    /// Parse a full hp config document; the distributions section is required.
    pub fn from_yaml_str(text: &str) -> Result<Self, SearchError> {
        let doc: YamlValue = serde_yaml::from_str(text)?;
        Self::from_yaml(&doc)
    }

    pub fn from_yaml(doc: &YamlValue) -> Result<Self, SearchError> {
        let section = doc
            .get(HP_DISTRIBUTIONS_SECTION)
            .and_then(YamlValue::as_mapping)
            .ok_or(SearchError::MissingSection(HP_DISTRIBUTIONS_SECTION))?;
        let mut entries = Vec::with_capacity(section.len());
        for (key, value) in section {
            let name = match key {
                YamlValue::String(s) => s.clone(),
                other => yaml_scalar_text(other),
            };
            let spec = DistSpec::parse(&name, value)?;
            entries.push((name, spec));
        }
        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[(String, DistSpec)] {
        &self.entries
    }

    pub fn get(&self, name: &str) -> Option<&DistSpec> {
        self.entries.iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_discrete(&self) -> bool {
        self.entries.iter().all(|(_, d)| d.is_discrete())
    }
}

fn linspace(start: f64, stop: f64, count: usize) -> Vec<JsonValue> {
    if count == 1 {
        return vec![number(start)];
    }
    let step = (stop - start) / (count - 1) as f64;
    (0..count)
        .map(|i| number(start + step * i as f64))
        .collect()
}

/// Integral floats stay integers in the emitted value.
pub(crate) fn number(v: f64) -> JsonValue {
    if v.fract() == 0.0 && v.abs() < 9.0e15 {
        JsonValue::from(v as i64)
    } else {
        serde_json::Number::from_f64(v)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null)
    }
}

fn parse_call(text: &str) -> Option<(&str, Vec<JsonValue>)> {
    let rest = text.trim().strip_prefix('$')?;
    let open = rest.find('(')?;
    let body = rest[open + 1..].strip_suffix(')')?;
    let func = rest[..open].trim();
    if func.is_empty() || !func.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return None;
    }
    let args = if body.trim().is_empty() {
        Vec::new()
    } else {
        split_args(body).into_iter().map(|a| parse_arg(&a)).collect()
    };
    Some((func, args))
}

fn split_args(body: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    for ch in body.chars() {
        match (quote, ch) {
            (Some(q), c) if c == q => {
                quote = None;
                current.push(c);
            }
            (None, '"' | '\'') => {
                quote = Some(ch);
                current.push(ch);
            }
            (None, ',') => out.push(std::mem::take(&mut current)),
            _ => current.push(ch),
        }
    }
    out.push(current);
    out
}

fn parse_arg(raw: &str) -> JsonValue {
    let text = raw.trim();
    for q in ['"', '\''] {
        if text.len() >= 2 && text.starts_with(q) && text.ends_with(q) {
            return JsonValue::String(text[1..text.len() - 1].to_string());
        }
    }
    if let Ok(i) = text.parse::<i64>() {
        return JsonValue::from(i);
    }
    if let Ok(f) = text.parse::<f64>() {
        if let Some(n) = serde_json::Number::from_f64(f) {
            return JsonValue::Number(n);
        }
    }
    match text {
        "true" | "True" => JsonValue::Bool(true),
        "false" | "False" => JsonValue::Bool(false),
        "null" | "None" => JsonValue::Null,
        _ => JsonValue::String(text.to_string()),
    }
}

fn yaml_scalar_text(v: &YamlValue) -> String {
    match v {
        YamlValue::Bool(b) => b.to_string(),
        YamlValue::Number(n) => n.to_string(),
        YamlValue::String(s) => s.clone(),
        _ => String::new(),
    }
}

fn yaml_to_json(v: &YamlValue) -> JsonValue {
    serde_json::to_value(v).unwrap_or(JsonValue::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_every_distribution_form() {
        let space = SearchSpace::from_yaml_str(
            r#"
hyperparameter-distributions:
  lr: [0.1, 0.3]
  opt: $choice(sgd, "adam")
  steps: $linspace(0, 10, 3)
  drop: $uniform(0, .5)
  wd: $loguniform(-9, -2)
  seed: $randint(0, 100)
  bs: $quniform(16, 128, 16)
  epochs: 5
"#,
        )
        .expect("space");
        let names = space.entries().iter().map(|(n, _)| n.as_str()).collect::<Vec<_>>();
        assert_eq!(names, ["lr", "opt", "steps", "drop", "wd", "seed", "bs", "epochs"]);
        assert_eq!(space.get("lr"), Some(&DistSpec::Choice(vec![json!(0.1), json!(0.3)])));
        assert_eq!(space.get("opt"), Some(&DistSpec::Choice(vec![json!("sgd"), json!("adam")])));
        assert_eq!(
            space.get("steps"),
            Some(&DistSpec::Choice(vec![json!(0), json!(5), json!(10)]))
        );
        assert_eq!(space.get("drop"), Some(&DistSpec::Uniform { low: 0.0, high: 0.5 }));
        assert_eq!(space.get("seed"), Some(&DistSpec::RandInt { low: 0, high: 100 }));
        assert_eq!(space.get("epochs"), Some(&DistSpec::Literal(json!(5))));
        assert!(!space.is_discrete());
    }

    #[test]
    fn missing_section_is_fatal() {
        let err = SearchSpace::from_yaml_str("other: 1\n").expect_err("missing");
        assert!(matches!(err, SearchError::MissingSection(_)));
    }

    #[test]
    fn argument_count_mismatch_is_fatal() {
        let err = SearchSpace::from_yaml_str(
            "hyperparameter-distributions:\n  lr: $uniform(0, 1, 2)\n",
        )
        .expect_err("arg count");
        match err {
            SearchError::ArgCount { dist, expected, got } => {
                assert_eq!(dist, "uniform");
                assert_eq!(expected, 2);
                assert_eq!(got, 3);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn unknown_distribution_and_bad_bounds_rejected() {
        assert!(matches!(
            SearchSpace::from_yaml_str("hyperparameter-distributions:\n  x: $beta(1, 2)\n"),
            Err(SearchError::UnknownDistribution(_))
        ));
        assert!(matches!(
            SearchSpace::from_yaml_str("hyperparameter-distributions:\n  x: $randint(5, 5)\n"),
            Err(SearchError::InvalidDistribution { .. })
        ));
    }
}
