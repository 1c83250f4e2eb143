//! Seeded randomized property checks.
//!
//! - raw matched sets equal a brute-force history comparison
//! - weights of every non-empty set are normalized, for every refinement method
//! - `none` refinement gives 1/|eligible| to every control
//! - Mahalanobis with k=1 keeps the nearest control
//! - the default propensity pooling rarely falls back on overlapping data

use std::collections::HashMap;

use pm_core::{
    ControlStatus, CovariateTerm, MatchConfig, PanelRecord, PropensityPool, Qoi, RefinementMethod,
};
use pm_inference::refinement::mahalanobis_distances;
use pm_inference::{PanelIndex, check_weights, detect_event_sites, match_histories, panel_match};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

// ---------------------------------------------------------------------------
// Synthetic panels
// ---------------------------------------------------------------------------

struct Synthetic {
    records: Vec<PanelRecord>,
    treatment: HashMap<(u64, i64), u8>,
}

/// Random staggered-adoption panel with occasional switch-backs and two
/// covariates correlated with treatment.
fn synthetic(seed: u64, n_units: u64, n_periods: i64) -> Synthetic {
    let mut rng = StdRng::seed_from_u64(seed);
    let noise = Normal::new(0.0, 1.0).unwrap();
    let mut records = Vec::new();
    let mut treatment = HashMap::new();
    for unit in 1..=n_units {
        let mut d = u8::from(rng.random_bool(0.2));
        let level = noise.sample(&mut rng);
        for t in 0..n_periods {
            if t > 0 && rng.random_bool(0.15) {
                d = 1 - d;
            }
            treatment.insert((unit, t), d);
            let x1 = level + 0.5 * f64::from(d) + 0.3 * noise.sample(&mut rng);
            let x2 = noise.sample(&mut rng);
            let y = 1.0 + 2.0 * f64::from(d) + x1 + noise.sample(&mut rng);
            records.push(
                PanelRecord::new(unit, t, Some(d), Some(y))
                    .with_covariate("x1", Some(x1))
                    .with_covariate("x2", Some(x2)),
            );
        }
    }
    Synthetic { records, treatment }
}

fn brute_force_controls(s: &Synthetic, unit: u64, time: i64, lag: i64, n_units: u64) -> Vec<u64> {
    if time - lag < 0 {
        return Vec::new();
    }
    (1..=n_units)
        .filter(|&c| c != unit)
        .filter(|&c| (time - lag..time).all(|t| s.treatment[&(c, t)] == s.treatment[&(unit, t)]))
        .filter(|&c| s.treatment[&(c, time)] == 0)
        .collect()
}

// ---------------------------------------------------------------------------
// Properties
// ---------------------------------------------------------------------------

#[test]
fn history_match_equals_brute_force() {
    for seed in 0..8u64 {
        let n_units = 40;
        let s = synthetic(seed, n_units, 10);
        let p = PanelIndex::from_records(&s.records).unwrap();
        for lag in 1..=4usize {
            let cfg = MatchConfig::new(lag);
            let sites = detect_event_sites(&p, &cfg, Qoi::Att).unwrap();
            let sets = match_histories(&p, &cfg, &sites, None).unwrap();
            assert_eq!(sites.len(), sets.len());
            for set in &sets {
                let ev = set.event;
                let got: Vec<u64> = set.controls.iter().map(|c| c.unit).collect();
                let want = brute_force_controls(&s, ev.unit, ev.time, lag as i64, n_units);
                assert_eq!(got, want, "seed={seed} lag={lag} event={ev:?}");
            }
        }
    }
}

#[test]
fn weights_normalized_for_every_method() {
    let methods = [
        RefinementMethod::None,
        RefinementMethod::Mahalanobis,
        RefinementMethod::PsMatch,
        RefinementMethod::CbpsMatch,
        RefinementMethod::PsWeight,
        RefinementMethod::CbpsWeight,
        RefinementMethod::PsMsmWeight,
        RefinementMethod::CbpsMsmWeight,
    ];
    let s = synthetic(11, 60, 8);
    let p = PanelIndex::from_records(&s.records).unwrap();
    for method in methods {
        for pool in [PropensityPool::PerEvent, PropensityPool::Pooled] {
            let cfg = MatchConfig::new(2)
                .with_lead([0, 1])
                .with_refinement(
                    method,
                    [CovariateTerm::lagged("x1", [0, 1]), CovariateTerm::new("x2")],
                )
                .with_size_match(3)
                .with_propensity_pool(pool);
            let result = panel_match(&p, &cfg).unwrap();
            let sets = result.sets_for(Qoi::Att).unwrap();
            assert!(!sets.is_empty());
            for set in sets {
                check_weights(set).unwrap();
                assert!(set.controls.iter().all(|c| c.weight >= 0.0));
                if !set.is_empty() {
                    assert!((set.total_weight() - 1.0).abs() < 1e-9, "{method:?}");
                }
                if method.is_matching() && !set.has_convergence_fallback() {
                    assert!(set.n_weighted() <= 3, "{method:?}");
                }
            }
        }
    }
}

#[test]
fn default_pool_rarely_falls_back() {
    let methods = [
        RefinementMethod::PsMatch,
        RefinementMethod::CbpsMatch,
        RefinementMethod::PsWeight,
        RefinementMethod::CbpsWeight,
        RefinementMethod::PsMsmWeight,
        RefinementMethod::CbpsMsmWeight,
    ];
    let s = synthetic(11, 60, 8);
    let p = PanelIndex::from_records(&s.records).unwrap();
    for method in methods {
        let cfg = MatchConfig::new(2)
            .with_lead([0, 1])
            .with_refinement(
                method,
                [CovariateTerm::lagged("x1", [0, 1]), CovariateTerm::new("x2")],
            )
            .with_size_match(3);
        assert_eq!(cfg.propensity_pool, PropensityPool::Pooled);
        let result = panel_match(&p, &cfg).unwrap();
        let sets: Vec<_> =
            result.sets_for(Qoi::Att).unwrap().iter().filter(|s| !s.controls.is_empty()).collect();
        assert!(sets.len() >= 10, "{method:?}: only {} non-empty sets", sets.len());
        let n_fallback = sets.iter().filter(|s| s.has_convergence_fallback()).count();
        assert!(
            n_fallback * 10 <= sets.len(),
            "{method:?}: {n_fallback} of {} sets fell back",
            sets.len()
        );
    }
}

#[test]
fn none_refinement_weights_all_eligible_equally() {
    let s = synthetic(3, 30, 7);
    let p = PanelIndex::from_records(&s.records).unwrap();
    let result = panel_match(&p, &MatchConfig::new(2)).unwrap();
    for set in result.sets_for(Qoi::Att).unwrap() {
        let n = set.n_eligible();
        for c in &set.controls {
            assert_eq!(c.status, ControlStatus::Retained);
            assert!((c.weight - 1.0 / n as f64).abs() < 1e-15);
        }
    }
}

#[test]
fn mahalanobis_k1_is_nearest_under_identity() {
    let mut rng = StdRng::seed_from_u64(99);
    let noise = Normal::new(0.0, 2.0).unwrap();
    for _ in 0..50 {
        let treated: Vec<f64> = (0..3).map(|_| noise.sample(&mut rng)).collect();
        let controls: Vec<Vec<f64>> =
            (0..8).map(|_| (0..3).map(|_| noise.sample(&mut rng)).collect()).collect();
        let inv = nalgebra::DMatrix::identity(3, 3);
        let d = mahalanobis_distances(&treated, &controls, &inv);
        let euclid: Vec<f64> = controls
            .iter()
            .map(|c| c.iter().zip(&treated).map(|(a, b)| (a - b).powi(2)).sum::<f64>().sqrt())
            .collect();
        let nearest = |v: &[f64]| {
            (0..v.len()).min_by(|&a, &b| v[a].total_cmp(&v[b])).unwrap()
        };
        assert_eq!(nearest(&d), nearest(&euclid));
    }
}

#[test]
fn mahalanobis_k1_through_pipeline_keeps_closest_unit() {
    // single covariate: Mahalanobis order equals absolute-distance order
    let s = synthetic(21, 25, 6);
    let p = PanelIndex::from_records(&s.records).unwrap();
    let cfg = MatchConfig::new(1)
        .with_refinement(RefinementMethod::Mahalanobis, [CovariateTerm::new("x2")])
        .with_size_match(1);
    let result = panel_match(&p, &cfg).unwrap();
    let x2: HashMap<(u64, i64), f64> = s
        .records
        .iter()
        .map(|r| ((r.unit, r.time), r.covariates["x2"].unwrap()))
        .collect();
    for set in result.sets_for(Qoi::Att).unwrap() {
        if set.controls.is_empty() {
            continue;
        }
        let ev = set.event;
        let xt = x2[&(ev.unit, ev.time)];
        let best = set
            .controls
            .iter()
            .map(|c| c.unit)
            .min_by(|&a, &b| {
                let da = (x2[&(a, ev.time)] - xt).abs();
                let db = (x2[&(b, ev.time)] - xt).abs();
                da.total_cmp(&db).then(a.cmp(&b))
            })
            .unwrap();
        assert_eq!(set.weights().into_keys().collect::<Vec<_>>(), vec![best]);
    }
}
