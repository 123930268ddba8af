//! Numerical kernels for the pruning recursion.
//!
//! Partials are category-major: `(block * pattern_count + pattern) *
//! state_count + state`. Matrices are row-major per category: `category *
//! state_count² + ancestral * state_count + descendant`. A state code at or
//! above `state_count` is a gap and contributes 1.0 to every ancestral state.

#[derive(Debug, Clone, Copy)]
pub(crate) struct Dims {
    pub state_count: usize,
    pub pattern_count: usize,
}

impl Dims {
    #[inline]
    fn matrix_size(self) -> usize {
        self.state_count * self.state_count
    }

    #[inline]
    fn offset(self, block: usize, pattern: usize) -> usize {
        (block * self.pattern_count + pattern) * self.state_count
    }
}

/// How partial blocks map to matrix categories.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Blocks<'a> {
    /// One block per category, block `k` uses matrix `k`.
    Integrated { category_count: usize },
    /// A single block; pattern `p` uses matrix `map[p]`.
    Mapped(&'a [usize]),
}

impl Blocks<'_> {
    #[inline]
    fn count(&self) -> usize {
        match self {
            Blocks::Integrated { category_count } => *category_count,
            Blocks::Mapped(_) => 1,
        }
    }

    #[inline]
    fn category(&self, block: usize, pattern: usize) -> usize {
        match self {
            Blocks::Integrated { .. } => block,
            Blocks::Mapped(map) => map[pattern],
        }
    }
}

#[inline]
fn dot(a: &[f64], b: &[f64]) -> f64 {
    let mut sum = 0.0;
    for (x, y) in a.iter().zip(b) {
        sum += x * y;
    }
    sum
}

pub(crate) fn states_states(
    dims: Dims,
    blocks: Blocks<'_>,
    states1: &[usize],
    matrices1: &[f64],
    states2: &[usize],
    matrices2: &[f64],
    out: &mut [f64],
) {
    let n = dims.state_count;
    for block in 0..blocks.count() {
        for p in 0..dims.pattern_count {
            let w = blocks.category(block, p) * dims.matrix_size();
            let (s1, s2) = (states1[p], states2[p]);
            let v = dims.offset(block, p);
            let dest = &mut out[v..v + n];
            match (s1 < n, s2 < n) {
                (true, true) => {
                    for (i, d) in dest.iter_mut().enumerate() {
                        let row = w + i * n;
                        *d = matrices1[row + s1] * matrices2[row + s2];
                    }
                }
                (true, false) => {
                    for (i, d) in dest.iter_mut().enumerate() {
                        *d = matrices1[w + i * n + s1];
                    }
                }
                (false, true) => {
                    for (i, d) in dest.iter_mut().enumerate() {
                        *d = matrices2[w + i * n + s2];
                    }
                }
                (false, false) => dest.fill(1.0),
            }
        }
    }
}

pub(crate) fn states_partials(
    dims: Dims,
    blocks: Blocks<'_>,
    states1: &[usize],
    matrices1: &[f64],
    partials2: &[f64],
    matrices2: &[f64],
    out: &mut [f64],
) {
    let n = dims.state_count;
    for block in 0..blocks.count() {
        for p in 0..dims.pattern_count {
            let w = blocks.category(block, p) * dims.matrix_size();
            let s1 = states1[p];
            let v = dims.offset(block, p);
            let child2 = &partials2[v..v + n];
            for i in 0..n {
                let row = w + i * n;
                let left = if s1 < n { matrices1[row + s1] } else { 1.0 };
                out[v + i] = left * dot(&matrices2[row..row + n], child2);
            }
        }
    }
}

pub(crate) fn partials_partials(
    dims: Dims,
    blocks: Blocks<'_>,
    partials1: &[f64],
    matrices1: &[f64],
    partials2: &[f64],
    matrices2: &[f64],
    out: &mut [f64],
) {
    let n = dims.state_count;
    for block in 0..blocks.count() {
        for p in 0..dims.pattern_count {
            let w = blocks.category(block, p) * dims.matrix_size();
            let v = dims.offset(block, p);
            let child1 = &partials1[v..v + n];
            let child2 = &partials2[v..v + n];
            for i in 0..n {
                let row = w + i * n;
                out[v + i] = dot(&matrices1[row..row + n], child1)
                    * dot(&matrices2[row..row + n], child2);
            }
        }
    }
}

pub(crate) fn integrate(
    dims: Dims,
    category_count: usize,
    partials: &[f64],
    proportions: &[f64],
    out: &mut [f64],
) {
    let len = dims.pattern_count * dims.state_count;
    let out = &mut out[..len];
    out.fill(0.0);
    for (k, &weight) in proportions.iter().take(category_count).enumerate() {
        let block = &partials[k * len..(k + 1) * len];
        for (o, &x) in out.iter_mut().zip(block) {
            *o += weight * x;
        }
    }
}

/// Per-pattern rescaling against underflow. `factors[p]` receives
/// the natural log of the divisor, or exactly 0.0 when none was applied.
pub(crate) fn scale(
    dims: Dims,
    block_count: usize,
    threshold: f64,
    partials: &mut [f64],
    factors: &mut [f64],
) {
    let n = dims.state_count;
    for p in 0..dims.pattern_count {
        let mut max = 0.0f64;
        for block in 0..block_count {
            let v = dims.offset(block, p);
            for &x in &partials[v..v + n] {
                if x > max {
                    max = x;
                }
            }
        }

        if max < threshold {
            if max > 0.0 {
                for block in 0..block_count {
                    let v = dims.offset(block, p);
                    for x in &mut partials[v..v + n] {
                        *x /= max;
                    }
                }
            }
            // ln(0) = -inf: the pattern is impossible, leave it that way
            factors[p] = max.ln();
        } else {
            factors[p] = 0.0;
        }
    }
}

pub(crate) fn log_likelihoods(
    dims: Dims,
    root_partials: &[f64],
    frequencies: &[f64],
    out: &mut [f64],
) {
    let n = dims.state_count;
    for (p, o) in out.iter_mut().take(dims.pattern_count).enumerate() {
        let v = p * n;
        *o = dot(&frequencies[..n], &root_partials[v..v + n]).ln();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIMS: Dims = Dims {
        state_count: 2,
        pattern_count: 1,
    };

    #[test]
    fn states_states_multiplies_matching_columns() {
        let m1 = [0.9, 0.1, 0.2, 0.8];
        let m2 = [0.7, 0.3, 0.4, 0.6];
        let mut out = [0.0; 2];
        states_states(
            DIMS,
            Blocks::Integrated { category_count: 1 },
            &[0],
            &m1,
            &[1],
            &m2,
            &mut out,
        );
        assert_eq!(out, [0.9 * 0.3, 0.2 * 0.6]);
    }

    #[test]
    fn gap_states_are_all_ones() {
        let m = [0.9, 0.1, 0.2, 0.8];
        let mut out = [0.0; 2];
        states_states(
            DIMS,
            Blocks::Integrated { category_count: 1 },
            &[2],
            &m,
            &[2],
            &m,
            &mut out,
        );
        assert_eq!(out, [1.0, 1.0]);
    }

    #[test]
    fn scale_records_exact_zero_above_threshold() {
        let mut partials = [0.5, 0.25];
        let mut factors = [f64::NAN];
        scale(DIMS, 1, 1e-100, &mut partials, &mut factors);
        assert_eq!(factors[0], 0.0);
        assert_eq!(partials, [0.5, 0.25]);
    }

    #[test]
    fn scale_divides_by_the_largest_entry() {
        let mut partials = [2e-120, 1e-120];
        let mut factors = [0.0];
        scale(DIMS, 1, 1e-100, &mut partials, &mut factors);
        assert_eq!(partials, [1.0, 0.5]);
        assert!((factors[0] - (2e-120f64).ln()).abs() < 1e-9);
    }

    #[test]
    fn scale_leaves_impossible_patterns_at_zero() {
        let mut partials = [0.0, 0.0];
        let mut factors = [0.0];
        scale(DIMS, 1, 1e-100, &mut partials, &mut factors);
        assert_eq!(partials, [0.0, 0.0]);
        assert_eq!(factors[0], f64::NEG_INFINITY);
    }

    #[test]
    fn mapped_blocks_pick_matrix_per_pattern() {
        let dims = Dims {
            state_count: 2,
            pattern_count: 2,
        };
        // category 0 is identity, category 1 swaps states
        let m = [1.0, 0.0, 0.0, 1.0, 0.0, 1.0, 1.0, 0.0];
        let mut out = [0.0; 4];
        states_states(dims, Blocks::Mapped(&[0, 1]), &[0, 0], &m, &[0, 0], &m, &mut out);
        assert_eq!(out, [1.0, 0.0, 0.0, 1.0]);
    }
}
