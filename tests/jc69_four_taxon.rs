use pruning_rs::model::{JukesCantor, SiteModel, SubstitutionModel};
use pruning_rs::patterns::SitePatterns;
use pruning_rs::tree::Tree;
use pruning_rs::{LikelihoodCore, TreeLikelihood};

fn approx_eq(a: f64, b: f64, eps: f64) {
    assert!(
        (a - b).abs() <= eps,
        "expected {a} ~= {b} within eps={eps}, got diff={}",
        (a - b).abs()
    );
}

// ((A:0.01,B:0.01)E:0.02,(C:0.02,D:0.02)F:0.01)R, all tips at height 0.03
const PARENTS: [i64; 7] = [4, 4, 5, 5, 6, 6, -1];
const LENGTHS: [f64; 7] = [0.01, 0.01, 0.02, 0.02, 0.02, 0.01, 0.0];
// A, C, A, G
const SITE: [usize; 4] = [0, 1, 0, 2];
const HAND_COMPUTED: f64 = 5.338509922247146e-06;

/// exp(Qt) for the JC69 rate matrix by a plain power series.
fn reference_matrix(t: f64) -> [[f64; 4]; 4] {
    let mut q = [[1.0 / 3.0; 4]; 4];
    for (i, row) in q.iter_mut().enumerate() {
        row[i] = -1.0;
    }
    let mut result = [[0.0; 4]; 4];
    let mut term = [[0.0; 4]; 4];
    for i in 0..4 {
        result[i][i] = 1.0;
        term[i][i] = 1.0;
    }
    for k in 1..40 {
        let mut next = [[0.0; 4]; 4];
        for i in 0..4 {
            for j in 0..4 {
                for m in 0..4 {
                    next[i][j] += term[i][m] * q[m][j] * t;
                }
                next[i][j] /= k as f64;
            }
        }
        term = next;
        for i in 0..4 {
            for j in 0..4 {
                result[i][j] += term[i][j];
            }
        }
    }
    result
}

fn brute_force_likelihood() -> f64 {
    let p = |node: usize| reference_matrix(LENGTHS[node]);
    let (pa, pb, pc, pd, pe, pf) = (p(0), p(1), p(2), p(3), p(4), p(5));
    let mut total = 0.0;
    for r in 0..4 {
        for e in 0..4 {
            for f in 0..4 {
                total += 0.25
                    * pe[r][e]
                    * pf[r][f]
                    * pa[e][SITE[0]]
                    * pb[e][SITE[1]]
                    * pc[f][SITE[2]]
                    * pd[f][SITE[3]];
            }
        }
    }
    total
}

#[test]
fn reference_agrees_with_hand_computed_value() {
    approx_eq(brute_force_likelihood(), HAND_COMPUTED, 1e-15);
}

#[test]
fn core_pipeline_matches_reference_likelihood() {
    let model = JukesCantor::new(4).expect("model");
    let mut core = LikelihoodCore::new(4).expect("core");
    core.initialize(7, 1, 1, true, false).expect("init failed");

    for tip in 0..4 {
        core.set_node_states(tip, &[SITE[tip]]).expect("states");
    }
    for node in 0..6 {
        let p = model.transition_matrix(LENGTHS[node]);
        let flat: Vec<f64> = p.iter().copied().collect();
        core.set_node_matrix(node, 0, &flat).expect("matrix");
    }
    core.calculate_partials(0, 1, 4).expect("prune E");
    core.calculate_partials(2, 3, 5).expect("prune F");
    core.calculate_partials(4, 5, 6).expect("prune R");

    let mut root = vec![0.0; 4];
    core.integrate_partials(6, &[1.0], &mut root).expect("integrate");
    let likelihood: f64 = root.iter().map(|x| 0.25 * x).sum();

    approx_eq(likelihood, brute_force_likelihood(), 1e-6);
    approx_eq(likelihood, HAND_COMPUTED, 1e-15);

    let mut ll = [0.0];
    core.calculate_log_likelihoods(&root, model.frequencies(), &mut ll)
        .expect("log likelihoods");
    approx_eq(ll[0], HAND_COMPUTED.ln(), 1e-9);
}

#[test]
fn tree_likelihood_matches_reference() {
    let tree = Tree::from_structure(&PARENTS, &LENGTHS, 4).expect("tree");
    let seqs: Vec<Vec<usize>> = SITE.iter().map(|&s| vec![s]).collect();
    let patterns = SitePatterns::from_sequences(4, &seqs).expect("patterns");
    let mut lik = TreeLikelihood::new(
        tree,
        JukesCantor::new(4).expect("model"),
        SiteModel::single_rate(),
        &patterns,
        false,
    )
    .expect("likelihood");

    let ll = lik.log_likelihood().expect("log likelihood");
    approx_eq(ll, brute_force_likelihood().ln(), 1e-9);
}

#[test]
fn repeated_columns_are_weighted() {
    let tree = Tree::from_structure(&PARENTS, &LENGTHS, 4).expect("tree");
    // the scenario site twice plus one constant column
    let seqs: Vec<Vec<usize>> = SITE.iter().map(|&s| vec![s, 0, s]).collect();
    let patterns = SitePatterns::from_sequences(4, &seqs).expect("patterns");
    assert_eq!(patterns.pattern_count(), 2);
    assert_eq!(patterns.weights(), &[2.0, 1.0]);

    let mut lik = TreeLikelihood::new(
        tree,
        JukesCantor::new(4).expect("model"),
        SiteModel::single_rate(),
        &patterns,
        false,
    )
    .expect("likelihood");
    let per_pattern = lik.pattern_log_likelihoods().expect("pattern lls");
    approx_eq(per_pattern[0], 2.0 * HAND_COMPUTED.ln(), 1e-9);
    let total = lik.log_likelihood().expect("ll");
    approx_eq(total, per_pattern.iter().sum::<f64>(), 1e-12);
}
