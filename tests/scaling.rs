use std::sync::Arc;

use pruning_rs::TreeLikelihood;
use pruning_rs::diagnostics::{CollectingSink, CoreEvent};
use pruning_rs::model::{JukesCantor, SiteModel};
use pruning_rs::patterns::SitePatterns;
use pruning_rs::tree::Tree;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

/// Caterpillar: ((((0,1),2),3),...), every branch the same length.
fn caterpillar(n_tips: usize, branch: f64) -> Tree {
    let n_nodes = 2 * n_tips - 1;
    let mut parents = vec![0i64; n_nodes];
    parents[0] = n_tips as i64;
    parents[1] = n_tips as i64;
    for tip in 2..n_tips {
        parents[tip] = (n_tips + tip - 1) as i64;
    }
    for internal in n_tips..n_nodes - 1 {
        parents[internal] = internal as i64 + 1;
    }
    parents[n_nodes - 1] = -1;
    let mut lengths = vec![branch; n_nodes];
    lengths[n_nodes - 1] = 0.0;
    Tree::from_structure(&parents, &lengths, n_tips).expect("caterpillar tree")
}

fn random_patterns(n_tips: usize, n_sites: usize, seed: u64) -> SitePatterns {
    let mut rng = SmallRng::seed_from_u64(seed);
    let seqs: Vec<Vec<usize>> = (0..n_tips)
        .map(|_| (0..n_sites).map(|_| rng.gen_range(0..4)).collect())
        .collect();
    SitePatterns::from_sequences(4, &seqs).expect("patterns")
}

fn likelihood(
    n_tips: usize,
    site_model: SiteModel,
    use_scaling: bool,
    sink: Arc<CollectingSink>,
) -> TreeLikelihood<JukesCantor> {
    TreeLikelihood::with_sink(
        caterpillar(n_tips, 0.5),
        JukesCantor::new(4).expect("model"),
        site_model,
        &random_patterns(n_tips, 6, 7),
        use_scaling,
        sink,
    )
    .expect("likelihood")
}

fn assert_relative(a: f64, b: f64, rel: f64) {
    assert!(
        ((a - b) / b).abs() <= rel,
        "expected {a} ~= {b} within relative {rel}"
    );
}

#[test]
fn scaling_does_not_change_the_likelihood() {
    let site_models = [
        SiteModel::single_rate(),
        SiteModel::equal_categories(vec![0.2, 0.9, 1.9]).expect("site model"),
    ];
    for site_model in site_models {
        let mut plain = likelihood(300, site_model.clone(), false, CollectingSink::shared());
        let mut scaled = likelihood(300, site_model, true, CollectingSink::shared());
        let a = plain.log_likelihood().expect("unscaled ll");
        let b = scaled.log_likelihood().expect("scaled ll");
        assert!(a.is_finite() && b.is_finite());
        assert_relative(b, a, 1e-9);

        // the deep end of the caterpillar has crossed the threshold
        let total: f64 = (0..scaled.core().pattern_count())
            .map(|p| scaled.core().get_log_scaling_factor(p).expect("factor"))
            .sum();
        assert!(total < 0.0, "expected rescaling to have happened");
    }
}

#[test]
fn underflow_switches_scaling_on() {
    let sink = CollectingSink::shared();
    let mut lik = likelihood(1200, SiteModel::single_rate(), false, sink.clone());
    assert!(!lik.core().uses_scaling());

    let ll = lik.log_likelihood().expect("ll");
    assert!(ll.is_finite(), "log likelihood should be finite after rescaling, got {ll}");
    assert!(lik.core().uses_scaling());
    assert!(sink.events().contains(&CoreEvent::ScalingEnabled));
}

#[test]
fn check_scaling_keeps_scaling_while_it_is_needed() {
    let sink = CollectingSink::shared();
    let mut lik = likelihood(300, SiteModel::single_rate(), true, sink.clone());
    lik.log_likelihood().expect("ll");
    for _ in 0..3 {
        lik.check_scaling();
    }
    assert!(lik.core().uses_scaling());
    assert!(!lik.core().scaling_disabled());
    let checks = sink
        .events()
        .iter()
        .filter(|e| matches!(e, CoreEvent::ScalingChecked { still_needed: true, .. }))
        .count();
    // first call checks, the next two fall inside the interval
    assert_eq!(checks, 1);
}

#[test]
fn check_scaling_disables_unneeded_scaling() {
    let sink = CollectingSink::shared();
    let mut lik = likelihood(8, SiteModel::single_rate(), true, sink.clone());
    let before = lik.log_likelihood().expect("ll");
    lik.check_scaling();
    assert!(!lik.core().uses_scaling());
    assert!(lik.core().scaling_disabled());

    lik.mark_all_dirty();
    let after = lik.log_likelihood().expect("ll");
    assert_relative(after, before, 1e-12);
    let disabled: Vec<_> = sink
        .events()
        .into_iter()
        .filter(|e| matches!(e, CoreEvent::ScalingDisabled { .. }))
        .collect();
    assert_eq!(disabled.len(), 1);
}

#[test]
fn very_deep_caterpillar_evaluates() {
    let sink = CollectingSink::shared();
    let mut lik = likelihood(20_000, SiteModel::single_rate(), false, sink.clone());
    let ll = lik.log_likelihood().expect("ll");
    assert!(ll.is_finite(), "expected a finite log likelihood, got {ll}");
    assert!(lik.core().uses_scaling());

    // an edit at the bottom of the ladder reprunes the whole spine
    lik.set_branch_length(0, 0.8).expect("branch");
    let incremental = lik.log_likelihood().expect("ll");
    lik.mark_all_dirty();
    let full = lik.log_likelihood().expect("ll");
    assert_eq!(incremental.to_bits(), full.to_bits());
}
