use std::sync::Arc;

use crate::buffers::NodeBuffers;
use crate::config::{CoreConfig, DEFAULT_SCALING_CHECK_INTERVAL, DEFAULT_SCALING_THRESHOLD};
use crate::diagnostics::{CoreEvent, DiagnosticSink, SharedSink, default_sink};
use crate::error::{CoreError, CoreResult};
use crate::kernels::{self, Blocks, Dims};

/// What a node currently holds.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum NodeData {
    #[default]
    Uninitialized,
    /// Unambiguous tip data, one code per pattern.
    TipStates(Vec<usize>),
    /// Tip given as partial likelihoods (ambiguity or uncertainty).
    TipPartials,
    /// Partials produced by the pruning recursion.
    Internal,
}

/// Conditional likelihood store and pruning kernels for one data partition.
///
/// Node tags, partials, matrices and scaling factors are double buffered
/// behind a single selector bit: [`store_state`](Self::store_state) copies
/// live into shadow, [`restore_state`](Self::restore_state) flips the bit.
pub struct LikelihoodCore {
    state_count: usize,
    node_count: usize,
    pattern_count: usize,
    category_count: usize,
    partials_size: usize,
    matrix_size: usize,
    integrate_categories: bool,

    nodes: [Vec<NodeData>; 2],
    partials: NodeBuffers,
    matrices: NodeBuffers,
    scaling_factors: NodeBuffers,
    active: usize,

    matrix_dirty: Vec<bool>,
    partials_dirty: Vec<bool>,

    use_scaling: bool,
    scaling_threshold: f64,
    scaling_check_interval: u64,
    scaling_check_count: u64,
    total_scaling_factor: f64,
    scaling_disabled: bool,

    sink: SharedSink,
}

impl std::fmt::Debug for LikelihoodCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LikelihoodCore")
            .field("state_count", &self.state_count)
            .field("node_count", &self.node_count)
            .field("pattern_count", &self.pattern_count)
            .field("category_count", &self.category_count)
            .field("integrate_categories", &self.integrate_categories)
            .field("use_scaling", &self.use_scaling)
            .finish_non_exhaustive()
    }
}

impl LikelihoodCore {
    pub fn new(state_count: usize) -> CoreResult<Self> {
        Self::with_sink(state_count, default_sink())
    }

    pub fn with_sink(state_count: usize, sink: SharedSink) -> CoreResult<Self> {
        if state_count < 2 {
            return Err(CoreError::invalid(format!(
                "state_count must be >= 2, got {state_count}"
            )));
        }
        Ok(Self {
            state_count,
            node_count: 0,
            pattern_count: 0,
            category_count: 0,
            partials_size: 0,
            matrix_size: state_count * state_count,
            integrate_categories: true,
            nodes: [Vec::new(), Vec::new()],
            partials: NodeBuffers::default(),
            matrices: NodeBuffers::default(),
            scaling_factors: NodeBuffers::default(),
            active: 0,
            matrix_dirty: Vec::new(),
            partials_dirty: Vec::new(),
            use_scaling: false,
            scaling_threshold: DEFAULT_SCALING_THRESHOLD,
            scaling_check_interval: DEFAULT_SCALING_CHECK_INTERVAL,
            scaling_check_count: 0,
            total_scaling_factor: 0.0,
            scaling_disabled: false,
            sink,
        })
    }

    /// Builds and initialises a core from a validated config.
    pub fn from_config(config: &CoreConfig, sink: Option<Arc<dyn DiagnosticSink>>) -> anyhow::Result<Self> {
        config.validate()?;
        let mut core = Self::with_sink(config.state_count, sink.unwrap_or_else(default_sink))?;
        core.scaling_threshold = config.scaling_threshold;
        core.scaling_check_interval = config.scaling_check_interval;
        core.initialize(
            config.node_count,
            config.pattern_count,
            config.category_count,
            config.integrate_categories,
            config.use_scaling,
        )?;
        Ok(core)
    }

    /// (Re)allocates every per-node array. All nodes start uninitialised.
    pub fn initialize(
        &mut self,
        node_count: usize,
        pattern_count: usize,
        category_count: usize,
        integrate_categories: bool,
        use_scaling: bool,
    ) -> CoreResult<()> {
        if node_count == 0 || pattern_count == 0 || category_count == 0 {
            return Err(CoreError::invalid(format!(
                "node_count, pattern_count and category_count must be > 0 \
                 (got {node_count}, {pattern_count}, {category_count})"
            )));
        }
        self.node_count = node_count;
        self.pattern_count = pattern_count;
        self.category_count = category_count;
        self.integrate_categories = integrate_categories;
        self.partials_size = if integrate_categories {
            pattern_count * self.state_count * category_count
        } else {
            pattern_count * self.state_count
        };

        self.nodes = [
            vec![NodeData::Uninitialized; node_count],
            vec![NodeData::Uninitialized; node_count],
        ];
        self.partials = NodeBuffers::unallocated(node_count);
        self.matrices = NodeBuffers::zeros(node_count, category_count * self.matrix_size);
        self.scaling_factors = NodeBuffers::default();
        self.active = 0;
        self.matrix_dirty = vec![false; node_count];
        self.partials_dirty = vec![false; node_count];

        self.use_scaling = false;
        self.scaling_check_count = 0;
        self.total_scaling_factor = 0.0;
        self.scaling_disabled = false;
        if use_scaling {
            self.allocate_scaling();
        }

        tracing::debug!(
            state_count = self.state_count,
            node_count,
            pattern_count,
            category_count,
            integrate_categories,
            use_scaling,
            "likelihood core initialized"
        );
        Ok(())
    }

    /// Releases every buffer. The core must be re-initialised before reuse.
    pub fn finalize(&mut self) {
        self.node_count = 0;
        self.pattern_count = 0;
        self.category_count = 0;
        self.partials_size = 0;
        self.nodes = [Vec::new(), Vec::new()];
        self.partials = NodeBuffers::default();
        self.matrices = NodeBuffers::default();
        self.scaling_factors = NodeBuffers::default();
        self.matrix_dirty = Vec::new();
        self.partials_dirty = Vec::new();
        self.active = 0;
        self.use_scaling = false;
    }

    fn allocate_scaling(&mut self) {
        if self.scaling_factors.is_empty() {
            self.scaling_factors = NodeBuffers::zeros(self.node_count, self.pattern_count);
        }
        self.use_scaling = true;
    }

    /// Switches rescaling on or off. Turning it on allocates zeroed factors
    /// for every node; partials computed earlier are not retroactively scaled.
    pub fn set_use_scaling(&mut self, use_scaling: bool) -> CoreResult<()> {
        self.ensure_initialized()?;
        if use_scaling && !self.use_scaling {
            self.allocate_scaling();
            self.sink.record(&CoreEvent::ScalingEnabled);
        } else if !use_scaling {
            self.use_scaling = false;
        }
        Ok(())
    }

    pub fn state_count(&self) -> usize {
        self.state_count
    }

    pub fn node_count(&self) -> usize {
        self.node_count
    }

    pub fn pattern_count(&self) -> usize {
        self.pattern_count
    }

    pub fn category_count(&self) -> usize {
        self.category_count
    }

    pub fn partials_size(&self) -> usize {
        self.partials_size
    }

    pub fn matrix_size(&self) -> usize {
        self.matrix_size
    }

    pub fn integrates_categories(&self) -> bool {
        self.integrate_categories
    }

    /// Whether partials are currently being rescaled.
    pub fn uses_scaling(&self) -> bool {
        self.use_scaling
    }

    pub fn scaling_threshold(&self) -> f64 {
        self.scaling_threshold
    }

    pub fn node_data(&self, node: usize) -> CoreResult<&NodeData> {
        self.check_node(node)?;
        Ok(&self.nodes[self.active][node])
    }

    fn dims(&self) -> Dims {
        Dims {
            state_count: self.state_count,
            pattern_count: self.pattern_count,
        }
    }

    fn ensure_initialized(&self) -> CoreResult<()> {
        if self.node_count == 0 {
            return Err(CoreError::NotInitialized);
        }
        Ok(())
    }

    fn check_node(&self, node: usize) -> CoreResult<()> {
        self.ensure_initialized()?;
        if node >= self.node_count {
            return Err(CoreError::NodeOutOfRange {
                node,
                node_count: self.node_count,
            });
        }
        Ok(())
    }

    /// Partials are readable only while the live tag says so; a buffer
    /// allocated after the last store stays hidden once restored.
    fn has_partials(&self, node: usize) -> bool {
        matches!(
            self.nodes[self.active][node],
            NodeData::TipPartials | NodeData::Internal
        )
    }

    fn check_category(&self, category: usize) -> CoreResult<()> {
        if category >= self.category_count {
            return Err(CoreError::CategoryOutOfRange {
                category,
                category_count: self.category_count,
            });
        }
        Ok(())
    }

    // ---- tip data -------------------------------------------------------

    pub fn create_node_states(&mut self, node: usize) -> CoreResult<()> {
        self.check_node(node)?;
        self.nodes[self.active][node] = NodeData::TipStates(vec![0; self.pattern_count]);
        Ok(())
    }

    /// Copies exactly `pattern_count` state codes. Codes `>= state_count`
    /// are gaps.
    pub fn set_node_states(&mut self, node: usize, states: &[usize]) -> CoreResult<()> {
        self.check_node(node)?;
        if states.len() < self.pattern_count {
            return Err(CoreError::invalid(format!(
                "states for node {node} have length {}, need {}",
                states.len(),
                self.pattern_count
            )));
        }
        let codes = &states[..self.pattern_count];
        match &mut self.nodes[self.active][node] {
            NodeData::TipStates(existing) => existing.copy_from_slice(codes),
            other => *other = NodeData::TipStates(codes.to_vec()),
        }
        Ok(())
    }

    pub fn get_node_states(&self, node: usize, out: &mut [usize]) -> CoreResult<()> {
        self.check_node(node)?;
        match &self.nodes[self.active][node] {
            NodeData::TipStates(states) => {
                if out.len() < states.len() {
                    return Err(CoreError::invalid("output buffer shorter than pattern count"));
                }
                out[..states.len()].copy_from_slice(states);
                Ok(())
            }
            _ => Err(CoreError::invalid(format!("node {node} has no states"))),
        }
    }

    /// Allocates live and shadow partials for a tip. An existing buffer is
    /// kept so a pending checkpoint survives.
    pub fn create_node_partials(&mut self, node: usize) -> CoreResult<()> {
        self.check_node(node)?;
        if !self.partials.is_allocated(node) {
            self.partials.allocate(node, self.partials_size);
        }
        let tag = &mut self.nodes[self.active][node];
        if matches!(tag, NodeData::Uninitialized | NodeData::TipStates(_)) {
            *tag = NodeData::TipPartials;
        }
        Ok(())
    }

    /// Installs tip partials. Exactly one category's worth
    /// (`pattern_count * state_count`) is copied into every category block;
    /// longer input has its surplus ignored.
    pub fn set_node_partials(&mut self, node: usize, partials: &[f64]) -> CoreResult<()> {
        self.check_node(node)?;
        if !self.partials.is_allocated(node) {
            self.create_node_partials(node)?;
        }
        self.nodes[self.active][node] = NodeData::TipPartials;
        self.write_partials(node, partials)
    }

    /// Overwrites the live partials of an already allocated node, with the
    /// same tiling rule as [`set_node_partials`](Self::set_node_partials).
    pub fn set_current_node_partials(&mut self, node: usize, partials: &[f64]) -> CoreResult<()> {
        self.check_node(node)?;
        if !self.has_partials(node) {
            return Err(CoreError::UninitializedNode { node });
        }
        self.write_partials(node, partials)
    }

    fn write_partials(&mut self, node: usize, partials: &[f64]) -> CoreResult<()> {
        let size = self.partials_size;
        let block = self.pattern_count * self.state_count;
        if partials.len() < size && partials.len() != block {
            return Err(CoreError::invalid(format!(
                "partials for node {node} have length {}, need {block} (one category) or {size}",
                partials.len()
            )));
        }
        if partials.len() > size {
            self.sink.record(&CoreEvent::PartialsTruncated {
                node,
                supplied: partials.len(),
                capacity: size,
            });
        }
        let dest = self.partials.live_mut(node, self.active);
        if partials.len() < size {
            for chunk in dest.chunks_exact_mut(block) {
                chunk.copy_from_slice(partials);
            }
        } else {
            dest.copy_from_slice(&partials[..size]);
        }
        Ok(())
    }

    // ---- matrices -------------------------------------------------------

    /// Copies one row-major `state_count²` transition matrix into the
    /// category's block.
    pub fn set_node_matrix(&mut self, node: usize, category: usize, matrix: &[f64]) -> CoreResult<()> {
        self.check_node(node)?;
        self.check_category(category)?;
        let size = self.matrix_size;
        if matrix.len() < size {
            return Err(CoreError::invalid(format!(
                "matrix for node {node} has length {}, need {size}",
                matrix.len()
            )));
        }
        let block = &mut self.matrices.live_mut(node, self.active)[category * size..(category + 1) * size];
        block.copy_from_slice(&matrix[..size]);
        Ok(())
    }

    pub fn get_node_matrix(&self, node: usize, category: usize, out: &mut [f64]) -> CoreResult<()> {
        self.check_node(node)?;
        self.check_category(category)?;
        let size = self.matrix_size;
        if out.len() < size {
            return Err(CoreError::invalid("output buffer shorter than matrix size"));
        }
        let block = &self.matrices.live(node, self.active)[category * size..(category + 1) * size];
        out[..size].copy_from_slice(block);
        Ok(())
    }

    // ---- update marks ---------------------------------------------------

    pub fn set_node_matrix_for_update(&mut self, node: usize) -> CoreResult<()> {
        self.check_node(node)?;
        self.matrix_dirty[node] = true;
        Ok(())
    }

    pub fn set_node_partials_for_update(&mut self, node: usize) -> CoreResult<()> {
        self.check_node(node)?;
        self.partials_dirty[node] = true;
        Ok(())
    }

    /// Nodes marked for update since the last store or restore.
    pub fn dirty_nodes(&self) -> Vec<usize> {
        (0..self.node_count)
            .filter(|&n| self.matrix_dirty[n] || self.partials_dirty[n])
            .collect()
    }

    fn clear_marks(&mut self) {
        self.matrix_dirty.fill(false);
        self.partials_dirty.fill(false);
    }

    // ---- pruning --------------------------------------------------------

    /// Computes `parent`'s partials from its two children, integrating the
    /// category dimension later via [`integrate_partials`](Self::integrate_partials).
    pub fn calculate_partials(&mut self, child1: usize, child2: usize, parent: usize) -> CoreResult<()> {
        if !self.integrate_categories {
            return Err(CoreError::invalid(
                "core does not integrate categories; use calculate_partials_mapped",
            ));
        }
        let blocks = Blocks::Integrated {
            category_count: self.category_count,
        };
        self.prune(child1, child2, parent, blocks)
    }

    /// Variant for cores that assign each pattern to one category.
    pub fn calculate_partials_mapped(
        &mut self,
        child1: usize,
        child2: usize,
        parent: usize,
        category_map: &[usize],
    ) -> CoreResult<()> {
        if self.integrate_categories {
            return Err(CoreError::invalid(
                "core integrates categories; use calculate_partials",
            ));
        }
        if category_map.len() < self.pattern_count {
            return Err(CoreError::invalid(format!(
                "category map has length {}, need {}",
                category_map.len(),
                self.pattern_count
            )));
        }
        let map = &category_map[..self.pattern_count];
        if let Some(&bad) = map.iter().find(|&&k| k >= self.category_count) {
            return Err(CoreError::CategoryOutOfRange {
                category: bad,
                category_count: self.category_count,
            });
        }
        self.prune(child1, child2, parent, Blocks::Mapped(map))
    }

    fn prune(&mut self, child1: usize, child2: usize, parent: usize, blocks: Blocks<'_>) -> CoreResult<()> {
        self.check_node(child1)?;
        self.check_node(child2)?;
        self.check_node(parent)?;
        if parent == child1 || parent == child2 {
            return Err(CoreError::AliasedParent { node: parent });
        }
        for child in [child1, child2] {
            if self.nodes[self.active][child] == NodeData::Uninitialized {
                return Err(CoreError::UninitializedNode { node: child });
            }
        }

        if !self.partials.is_allocated(parent) {
            self.partials.allocate(parent, self.partials_size);
        }
        self.nodes[self.active][parent] = NodeData::Internal;

        let dims = self.dims();
        let active = self.active;
        let mut target = self.partials.take(parent);
        {
            let out = target.live_mut(active);
            let m1 = self.matrices.live(child1, active);
            let m2 = self.matrices.live(child2, active);
            let tags = &self.nodes[active];
            match (&tags[child1], &tags[child2]) {
                (NodeData::TipStates(s1), NodeData::TipStates(s2)) => {
                    kernels::states_states(dims, blocks, s1, m1, s2, m2, out);
                }
                (NodeData::TipStates(s1), _) => {
                    let p2 = self.partials.live(child2, active);
                    kernels::states_partials(dims, blocks, s1, m1, p2, m2, out);
                }
                (_, NodeData::TipStates(s2)) => {
                    let p1 = self.partials.live(child1, active);
                    kernels::states_partials(dims, blocks, s2, m2, p1, m1, out);
                }
                _ => {
                    let p1 = self.partials.live(child1, active);
                    let p2 = self.partials.live(child2, active);
                    kernels::partials_partials(dims, blocks, p1, m1, p2, m2, out);
                }
            }
        }
        self.partials.put(parent, target);

        if self.use_scaling {
            self.scale_partials(parent, blocks);
        }
        Ok(())
    }

    fn scale_partials(&mut self, node: usize, blocks: Blocks<'_>) {
        let block_count = match blocks {
            Blocks::Integrated { category_count } => category_count,
            Blocks::Mapped(_) => 1,
        };
        let dims = self.dims();
        let active = self.active;
        kernels::scale(
            dims,
            block_count,
            self.scaling_threshold,
            self.partials.live_mut(node, active),
            self.scaling_factors.live_mut(node, active),
        );
    }

    // ---- scaling accessors ----------------------------------------------

    /// Sum over all nodes of the log divisors applied to `pattern`; 0.0 when
    /// scaling is off.
    pub fn get_log_scaling_factor(&self, pattern: usize) -> CoreResult<f64> {
        self.ensure_initialized()?;
        if pattern >= self.pattern_count {
            return Err(CoreError::PatternOutOfRange {
                pattern,
                pattern_count: self.pattern_count,
            });
        }
        if !self.use_scaling {
            return Ok(0.0);
        }
        Ok(self
            .scaling_factors
            .iter_live(self.active)
            .map(|factors| factors[pattern])
            .sum())
    }

    pub fn get_log_scaling_factors(&self, node: usize, out: &mut [f64]) -> CoreResult<()> {
        self.check_node(node)?;
        let out = out
            .get_mut(..self.pattern_count)
            .ok_or_else(|| CoreError::invalid("output buffer shorter than pattern count"))?;
        if self.use_scaling {
            out.copy_from_slice(self.scaling_factors.live(node, self.active));
        } else {
            out.fill(0.0);
        }
        Ok(())
    }

    /// Periodically checks whether rescaling is doing anything. Once the
    /// running total of all log factors is non-negative scaling is switched
    /// off for the rest of this allocation.
    pub fn check_scaling(&mut self) {
        if !self.use_scaling || self.scaling_disabled {
            return;
        }
        if self.scaling_check_count % self.scaling_check_interval == 0 {
            let pass_total: f64 = self
                .scaling_factors
                .iter_live(self.active)
                .flat_map(|factors| factors.iter())
                .sum();
            self.total_scaling_factor += pass_total;
            let still_needed = self.total_scaling_factor < 0.0;
            self.sink.record(&CoreEvent::ScalingChecked {
                total_log_factor: self.total_scaling_factor,
                still_needed,
            });
            if !still_needed {
                self.use_scaling = false;
                self.scaling_disabled = true;
                self.sink.record(&CoreEvent::ScalingDisabled {
                    total_log_factor: self.total_scaling_factor,
                });
            }
        }
        self.scaling_check_count += 1;
    }

    /// Whether the adaptive check has permanently switched scaling off.
    pub fn scaling_disabled(&self) -> bool {
        self.scaling_disabled
    }

    // ---- results --------------------------------------------------------

    /// Collapses the category dimension: `out[p, i] = Σ_k w_k · partial[k, p, i]`.
    pub fn integrate_partials(&self, node: usize, proportions: &[f64], out: &mut [f64]) -> CoreResult<()> {
        self.check_node(node)?;
        if !self.has_partials(node) {
            return Err(CoreError::UninitializedNode { node });
        }
        if !self.integrate_categories {
            return Err(CoreError::invalid("core does not hold a category dimension"));
        }
        if proportions.len() < self.category_count {
            return Err(CoreError::invalid(format!(
                "proportions have length {}, need {}",
                proportions.len(),
                self.category_count
            )));
        }
        let len = self.pattern_count * self.state_count;
        if out.len() < len {
            return Err(CoreError::invalid(format!(
                "output buffer has length {}, need {len}",
                out.len()
            )));
        }
        kernels::integrate(
            self.dims(),
            self.category_count,
            self.partials.live(node, self.active),
            proportions,
            out,
        );
        Ok(())
    }

    pub fn get_partials(&self, node: usize, out: &mut [f64]) -> CoreResult<()> {
        self.check_node(node)?;
        if !self.has_partials(node) {
            return Err(CoreError::UninitializedNode { node });
        }
        let out = out
            .get_mut(..self.partials_size)
            .ok_or_else(|| CoreError::invalid("output buffer shorter than partials size"))?;
        out.copy_from_slice(self.partials.live(node, self.active));
        Ok(())
    }

    /// Per-pattern log-likelihoods from root partials with the category
    /// dimension already removed, including the scaling correction.
    pub fn calculate_log_likelihoods(
        &self,
        root_partials: &[f64],
        frequencies: &[f64],
        out: &mut [f64],
    ) -> CoreResult<()> {
        self.ensure_initialized()?;
        let len = self.pattern_count * self.state_count;
        if root_partials.len() < len {
            return Err(CoreError::invalid(format!(
                "root partials have length {}, need {len}",
                root_partials.len()
            )));
        }
        if frequencies.len() < self.state_count {
            return Err(CoreError::invalid(format!(
                "frequencies have length {}, need {}",
                frequencies.len(),
                self.state_count
            )));
        }
        if out.len() < self.pattern_count {
            return Err(CoreError::invalid("output buffer shorter than pattern count"));
        }
        kernels::log_likelihoods(self.dims(), root_partials, frequencies, out);
        if self.use_scaling {
            for (p, o) in out.iter_mut().take(self.pattern_count).enumerate() {
                *o += self.get_log_scaling_factor(p)?;
            }
        }
        Ok(())
    }

    // ---- checkpoint -----------------------------------------------------

    /// Deep copy of live buffers and node tags into the shadow copies.
    pub fn store_state(&mut self) {
        let active = self.active;
        let [first, second] = &mut self.nodes;
        if active == 0 {
            second.clone_from(first);
        } else {
            first.clone_from(second);
        }
        self.partials.checkpoint_all(active);
        self.matrices.checkpoint_all(active);
        self.scaling_factors.checkpoint_all(active);
        self.clear_marks();
    }

    /// Returns every live buffer to its value at the last store. O(1).
    pub fn restore_state(&mut self) {
        self.active ^= 1;
        self.clear_marks();
    }
}
