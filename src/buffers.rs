//! Double-buffered per-node storage.
//!
//! Each node owns two equally sized slots. Which one is live is decided by a
//! selector bit held by the owner, so flipping that bit restores every node
//! at once.

#[derive(Debug, Clone, Default)]
pub(crate) struct Shadowed {
    slots: [Vec<f64>; 2],
}

impl Shadowed {
    pub(crate) fn zeros(len: usize) -> Self {
        Self {
            slots: [vec![0.0; len], vec![0.0; len]],
        }
    }

    pub(crate) fn is_allocated(&self) -> bool {
        !self.slots[0].is_empty()
    }

    pub(crate) fn live(&self, active: usize) -> &[f64] {
        &self.slots[active]
    }

    pub(crate) fn live_mut(&mut self, active: usize) -> &mut [f64] {
        &mut self.slots[active]
    }

    /// Copies the live slot over the checkpoint slot.
    pub(crate) fn checkpoint(&mut self, active: usize) {
        let [first, second] = &mut self.slots;
        if active == 0 {
            second.copy_from_slice(first);
        } else {
            first.copy_from_slice(second);
        }
    }
}

/// One [`Shadowed`] per node plus the shared selector.
#[derive(Debug, Clone, Default)]
pub(crate) struct NodeBuffers {
    nodes: Vec<Shadowed>,
}

impl NodeBuffers {
    pub(crate) fn unallocated(node_count: usize) -> Self {
        Self {
            nodes: vec![Shadowed::default(); node_count],
        }
    }

    pub(crate) fn zeros(node_count: usize, len: usize) -> Self {
        Self {
            nodes: vec![Shadowed::zeros(len); node_count],
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub(crate) fn is_allocated(&self, node: usize) -> bool {
        self.nodes[node].is_allocated()
    }

    pub(crate) fn allocate(&mut self, node: usize, len: usize) {
        self.nodes[node] = Shadowed::zeros(len);
    }

    pub(crate) fn live(&self, node: usize, active: usize) -> &[f64] {
        self.nodes[node].live(active)
    }

    pub(crate) fn live_mut(&mut self, node: usize, active: usize) -> &mut [f64] {
        self.nodes[node].live_mut(active)
    }

    /// Moves a node's storage out so it can be written while its neighbours
    /// are read. Must be handed back with [`NodeBuffers::put`].
    pub(crate) fn take(&mut self, node: usize) -> Shadowed {
        std::mem::take(&mut self.nodes[node])
    }

    pub(crate) fn put(&mut self, node: usize, buffer: Shadowed) {
        self.nodes[node] = buffer;
    }

    pub(crate) fn checkpoint_all(&mut self, active: usize) {
        for node in self.nodes.iter_mut().filter(|n| n.is_allocated()) {
            node.checkpoint(active);
        }
    }

    pub(crate) fn iter_live(&self, active: usize) -> impl Iterator<Item = &[f64]> {
        self.nodes
            .iter()
            .filter(|n| n.is_allocated())
            .map(move |n| n.live(active))
    }
}
