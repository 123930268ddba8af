use anyhow::{Context, Result, anyhow, bail};

use crate::diagnostics::{SharedSink, default_sink};
use crate::likelihood_core::LikelihoodCore;
use crate::model::{SiteModel, SubstitutionModel};
use crate::patterns::{SitePatterns, TipData};
use crate::tree::Tree;

#[derive(Debug, Clone)]
struct Checkpoint<M> {
    tree: Tree,
    model: M,
    update_node: Vec<bool>,
    log_likelihood: Option<f64>,
    pattern_log_likelihoods: Vec<f64>,
}

/// Drives a [`LikelihoodCore`] over a tree: installs branch matrices,
/// prunes the nodes whose subtree changed and combines pattern weights.
#[derive(Debug)]
pub struct TreeLikelihood<M> {
    core: LikelihoodCore,
    tree: Tree,
    model: M,
    site_model: SiteModel,
    weights: Vec<f64>,

    update_node: Vec<bool>,
    updated: Vec<bool>,
    post_order: Vec<usize>,
    matrix_buf: Vec<f64>,
    root_partials: Vec<f64>,
    pattern_log_likelihoods: Vec<f64>,
    log_likelihood: Option<f64>,
    checkpoint: Option<Checkpoint<M>>,
}

impl<M: SubstitutionModel + Clone> TreeLikelihood<M> {
    pub fn new(
        tree: Tree,
        model: M,
        site_model: SiteModel,
        patterns: &SitePatterns,
        use_scaling: bool,
    ) -> Result<Self> {
        Self::with_sink(tree, model, site_model, patterns, use_scaling, default_sink())
    }

    pub fn with_sink(
        tree: Tree,
        model: M,
        site_model: SiteModel,
        patterns: &SitePatterns,
        use_scaling: bool,
        sink: SharedSink,
    ) -> Result<Self> {
        let state_count = model.state_count();
        if patterns.state_count() != state_count {
            bail!(
                "patterns use {} states but the substitution model has {}",
                patterns.state_count(),
                state_count
            );
        }
        if patterns.tip_count() != tree.n_tips() {
            bail!(
                "patterns have {} tips but the tree has {}",
                patterns.tip_count(),
                tree.n_tips()
            );
        }
        let pattern_count = patterns.pattern_count();
        if let Some(map) = site_model.site_categories() {
            if map.len() != pattern_count {
                bail!(
                    "site category map has length {}, expected {pattern_count}",
                    map.len()
                );
            }
        }

        let mut core = LikelihoodCore::with_sink(state_count, sink)?;
        core.initialize(
            tree.n_nodes(),
            pattern_count,
            site_model.category_count(),
            site_model.integrates_categories(),
            use_scaling,
        )?;
        for tip in 0..tree.n_tips() {
            let loaded = match patterns.tip(tip) {
                TipData::States(states) => core.set_node_states(tip, states),
                TipData::Partials(partials) => core.set_node_partials(tip, partials),
            };
            loaded.with_context(|| format!("failed to load data for tip {tip}"))?;
        }

        let n_nodes = tree.n_nodes();
        let post_order = tree.post_order();
        Ok(Self {
            core,
            tree,
            model,
            site_model,
            weights: patterns.weights().to_vec(),
            update_node: vec![true; n_nodes],
            updated: vec![false; n_nodes],
            post_order,
            matrix_buf: Vec::with_capacity(state_count * state_count),
            root_partials: vec![0.0; pattern_count * state_count],
            pattern_log_likelihoods: vec![0.0; pattern_count],
            log_likelihood: None,
            checkpoint: None,
        })
    }

    pub fn core(&self) -> &LikelihoodCore {
        &self.core
    }

    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn set_branch_length(&mut self, node: usize, length: f64) -> Result<()> {
        self.tree.set_branch_length(node, length)?;
        self.update_node[node] = true;
        self.log_likelihood = None;
        Ok(())
    }

    pub fn set_model(&mut self, model: M) -> Result<()> {
        if model.state_count() != self.core.state_count() {
            bail!(
                "model has {} states, expected {}",
                model.state_count(),
                self.core.state_count()
            );
        }
        self.model = model;
        self.mark_all_dirty();
        Ok(())
    }

    pub fn mark_all_dirty(&mut self) {
        self.update_node.fill(true);
        self.log_likelihood = None;
    }

    /// Weighted total log-likelihood, recomputing only what changed.
    pub fn log_likelihood(&mut self) -> Result<f64> {
        if let Some(ll) = self.log_likelihood {
            return Ok(ll);
        }
        self.traverse()?;
        let mut ll = self.weighted_sum();

        if ll == f64::NEG_INFINITY && !self.core.uses_scaling() {
            // probably an underflow: turn rescaling on and recompute everything
            self.core.set_use_scaling(true)?;
            self.update_node.fill(true);
            self.traverse()?;
            ll = self.weighted_sum();
        }

        self.update_node.fill(false);
        self.log_likelihood = Some(ll);
        Ok(ll)
    }

    /// Per-pattern log-likelihoods times pattern weights; zero-weight
    /// patterns report `-inf`.
    pub fn pattern_log_likelihoods(&mut self) -> Result<Vec<f64>> {
        self.log_likelihood()?;
        Ok(self
            .pattern_log_likelihoods
            .iter()
            .zip(&self.weights)
            .map(|(&ll, &w)| if w > 0.0 { ll * w } else { f64::NEG_INFINITY })
            .collect())
    }

    fn weighted_sum(&self) -> f64 {
        self.pattern_log_likelihoods
            .iter()
            .zip(&self.weights)
            .filter(|(_, w)| **w > 0.0)
            .map(|(ll, w)| ll * w)
            .sum()
    }

    /// Walks the cached post-order. A node's matrices are reinstalled when it
    /// is dirty; an internal node is pruned when either child changed.
    fn traverse(&mut self) -> Result<()> {
        self.updated.fill(false);
        for idx in 0..self.post_order.len() {
            let node = self.post_order[idx];
            let parent = self.tree.parent(node);

            if parent.is_some() && self.update_node[node] {
                self.core.set_node_matrix_for_update(node)?;
                let branch = self.tree.branch_length(node);
                for k in 0..self.site_model.category_count() {
                    let p = self
                        .model
                        .transition_matrix(branch * self.site_model.rate_for_category(k));
                    self.matrix_buf.clear();
                    self.matrix_buf.extend(p.iter().copied());
                    self.core.set_node_matrix(node, k, &self.matrix_buf)?;
                }
                self.updated[node] = true;
            }

            if self.tree.is_tip(node) {
                continue;
            }
            let (child1, child2) = self
                .tree
                .children(node)
                .ok_or_else(|| anyhow!("internal node {node} is not binary"))?;
            if !(self.updated[child1] || self.updated[child2]) {
                continue;
            }

            self.core.set_node_partials_for_update(node)?;
            match self.site_model.site_categories() {
                None => self.core.calculate_partials(child1, child2, node)?,
                Some(map) => self.core.calculate_partials_mapped(child1, child2, node, map)?,
            }
            if parent.is_none() {
                if self.site_model.integrates_categories() {
                    self.core.integrate_partials(
                        node,
                        self.site_model.proportions(),
                        &mut self.root_partials,
                    )?;
                } else {
                    self.core.get_partials(node, &mut self.root_partials)?;
                }
                self.core.calculate_log_likelihoods(
                    &self.root_partials,
                    self.model.frequencies(),
                    &mut self.pattern_log_likelihoods,
                )?;
            }
            self.updated[node] = true;
        }
        Ok(())
    }

    /// Periodic check that may switch rescaling off.
    pub fn check_scaling(&mut self) {
        self.core.check_scaling();
    }

    /// Accept: checkpoint the core and the inputs that produced it.
    pub fn store_state(&mut self) {
        self.core.store_state();
        self.checkpoint = Some(Checkpoint {
            tree: self.tree.clone(),
            model: self.model.clone(),
            update_node: self.update_node.clone(),
            log_likelihood: self.log_likelihood,
            pattern_log_likelihoods: self.pattern_log_likelihoods.clone(),
        });
    }

    /// Reject: return to the last [`store_state`](Self::store_state).
    pub fn restore_state(&mut self) -> Result<()> {
        let checkpoint = self
            .checkpoint
            .take()
            .ok_or_else(|| anyhow!("restore_state called before store_state"))?;
        self.core.restore_state();
        self.tree = checkpoint.tree;
        self.model = checkpoint.model;
        self.update_node = checkpoint.update_node;
        self.log_likelihood = checkpoint.log_likelihood;
        self.pattern_log_likelihoods = checkpoint.pattern_log_likelihoods;
        Ok(())
    }
}
