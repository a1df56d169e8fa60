#![forbid(unsafe_code)]

use rand::SeedableRng;
use rand::rngs::StdRng;
use serde_json::{Value as JsonValue, json};
use std::collections::BTreeSet;
use xt_search::{
    GenerateMode, HistoryRecord, RunArgs, SearchError, SearchKind, SearchRequest, SearchSpace,
    generate_runsets,
};

const GRID_SPACE: &str = r#"
hyperparameter-distributions:
  lr: $choice(0.1, 0.3)
  opt: $choice(sgd, adam)
"#;

fn key(args: &RunArgs) -> String {
    args.fingerprint()
}

#[test]
fn grid_full_cycle_yields_every_combination_once() {
    let space = SearchSpace::from_yaml_str(GRID_SPACE).expect("space");
    let mut rng = StdRng::seed_from_u64(1);
    let sets = generate_runsets(&space, GenerateMode::Grid, None, &mut rng).expect("grid");
    assert_eq!(sets.len(), 4);

    let got = sets.iter().map(key).collect::<BTreeSet<_>>();
    let want = [
        r#"lr=0.1,opt="sgd""#,
        r#"lr=0.1,opt="adam""#,
        r#"lr=0.3,opt="sgd""#,
        r#"lr=0.3,opt="adam""#,
    ]
    .into_iter()
    .map(str::to_string)
    .collect::<BTreeSet<_>>();
    assert_eq!(got, want);
}

#[test]
fn grid_with_explicit_count_wraps_around() {
    let space = SearchSpace::from_yaml_str(GRID_SPACE).expect("space");
    let mut rng = StdRng::seed_from_u64(1);
    let sets = generate_runsets(&space, GenerateMode::Grid, Some(6), &mut rng).expect("grid");
    assert_eq!(sets.len(), 6);
    assert_eq!(sets[4], sets[0]);
    assert_eq!(sets[5], sets[1]);
}

#[test]
fn grid_product_of_three_axes() {
    let space = SearchSpace::from_yaml_str(
        r#"
hyperparameter-distributions:
  a: [1, 2, 3]
  b: [x, y]
  c: $linspace(0, 1, 2)
  fixed: 7
"#,
    )
    .expect("space");
    let mut rng = StdRng::seed_from_u64(3);
    let sets = generate_runsets(&space, GenerateMode::Grid, None, &mut rng).expect("grid");
    assert_eq!(sets.len(), 12);
    let distinct = sets.iter().map(key).collect::<BTreeSet<_>>();
    assert_eq!(distinct.len(), 12);
    assert!(sets.iter().all(|s| s.get("fixed") == Some(&json!(7))));
}

#[test]
fn random_search_is_reproducible_with_a_seed() {
    let space = SearchSpace::from_yaml_str(
        r#"
hyperparameter-distributions:
  lr: $loguniform(-7, -1)
  drop: $uniform(0, 0.5)
  opt: [sgd, adam, rmsprop]
"#,
    )
    .expect("space");
    let draw = |seed| {
        let mut rng = StdRng::seed_from_u64(seed);
        generate_runsets(&space, GenerateMode::Random, Some(5), &mut rng).expect("random")
    };
    assert_eq!(draw(42), draw(42));
    assert_ne!(draw(42), draw(43));

    for set in draw(42) {
        let lr = set.get("lr").and_then(JsonValue::as_f64).expect("lr");
        assert!(lr >= (-7f64).exp() && lr <= (-1f64).exp());
    }
}

#[test]
fn random_search_needs_a_count() {
    let space = SearchSpace::from_yaml_str(GRID_SPACE).expect("space");
    let mut rng = StdRng::seed_from_u64(0);
    let err = generate_runsets(&space, GenerateMode::Random, None, &mut rng).expect_err("count");
    assert!(matches!(err, SearchError::RunCountRequired));
}

fn history(rows: &[(&str, f64)]) -> Vec<HistoryRecord> {
    rows.iter()
        .enumerate()
        .map(|(i, (opt, acc))| HistoryRecord {
            run_name: format!("run1.{}", i + 1),
            end_id: i as i64 + 1,
            hparams: json!({ "lr": 0.1, "opt": opt })
                .as_object()
                .cloned()
                .unwrap_or_default(),
            metrics: json!({ "acc": acc }).as_object().cloned().unwrap_or_default(),
        })
        .collect()
}

#[test]
fn server_side_grid_follows_run_index() {
    let space = SearchSpace::from_yaml_str(GRID_SPACE).expect("space");
    let provider = SearchKind::Grid.provider();
    let mut rng = StdRng::seed_from_u64(0);
    let mut seen = BTreeSet::new();
    for run_index in 0..8 {
        let req = SearchRequest {
            space: &space,
            run_index,
            history: &[],
            primary_metric: None,
            maximize: true,
        };
        seen.insert(key(&provider.next_args(&req, &mut rng).expect("args")));
    }
    assert_eq!(seen.len(), 4);
}

#[test]
fn bayesian_prefers_the_value_that_scored_well() {
    let space = SearchSpace::from_yaml_str(
        "hyperparameter-distributions:\n  lr: [0.1]\n  opt: [sgd, adam]\n",
    )
    .expect("space");
    let hist = history(&[
        ("adam", 0.91),
        ("sgd", 0.20),
        ("adam", 0.88),
        ("sgd", 0.25),
        ("sgd", 0.22),
        ("adam", 0.93),
        ("sgd", 0.18),
        ("sgd", 0.30),
    ]);
    let provider = SearchKind::Bayesian.provider();
    for seed in 0..5 {
        let mut rng = StdRng::seed_from_u64(seed);
        let req = SearchRequest {
            space: &space,
            run_index: 9,
            history: &hist,
            primary_metric: Some("acc"),
            maximize: true,
        };
        let args = provider.next_args(&req, &mut rng).expect("args");
        assert_eq!(args.get("opt"), Some(&json!("adam")));
    }
}

#[test]
fn dgd_steps_away_from_the_best_point() {
    let space = SearchSpace::from_yaml_str(
        "hyperparameter-distributions:\n  lr: [0.1]\n  opt: [sgd, adam]\n",
    )
    .expect("space");
    let hist = history(&[("sgd", 0.9)]);
    let req = SearchRequest {
        space: &space,
        run_index: 1,
        history: &hist,
        primary_metric: Some("acc"),
        maximize: true,
    };
    let mut rng = StdRng::seed_from_u64(11);
    let args = SearchKind::Dgd.provider().next_args(&req, &mut rng).expect("args");
    assert_eq!(args.get("opt"), Some(&json!("adam")));
    assert_eq!(args.get("lr"), Some(&json!(0.1)));
}

#[test]
fn adaptive_search_without_primary_metric_fails_the_child_only() {
    let space = SearchSpace::from_yaml_str(GRID_SPACE).expect("space");
    let req = SearchRequest {
        space: &space,
        run_index: 0,
        history: &[],
        primary_metric: None,
        maximize: true,
    };
    let mut rng = StdRng::seed_from_u64(0);
    let err = SearchKind::Bayesian
        .provider()
        .next_args(&req, &mut rng)
        .expect_err("no metric");
    assert!(matches!(err, SearchError::Provider { .. }));
}
