use std::collections::HashMap;

use anyhow::{Result, bail};

#[derive(Debug, Clone, PartialEq)]
pub enum TipData {
    /// One state code per pattern; codes `>= state_count` are gaps.
    States(Vec<usize>),
    /// `pattern_count * state_count` partial likelihoods.
    Partials(Vec<f64>),
}

/// Compressed alignment columns with their occurrence counts.
#[derive(Debug, Clone)]
pub struct SitePatterns {
    state_count: usize,
    tips: Vec<TipData>,
    weights: Vec<f64>,
}

impl SitePatterns {
    pub fn new(state_count: usize, tips: Vec<TipData>, weights: Vec<f64>) -> Result<Self> {
        let pattern_count = weights.len();
        if pattern_count == 0 {
            bail!("no site patterns");
        }
        if tips.len() < 2 {
            bail!("need at least 2 tips, got {}", tips.len());
        }
        if weights.iter().any(|&w| !(w >= 0.0 && w.is_finite())) {
            bail!("pattern weights must be finite and non-negative");
        }
        for (i, tip) in tips.iter().enumerate() {
            let (len, expected) = match tip {
                TipData::States(s) => (s.len(), pattern_count),
                TipData::Partials(p) => (p.len(), pattern_count * state_count),
            };
            if len != expected {
                bail!("tip {i} has {len} values, expected {expected}");
            }
        }
        Ok(Self {
            state_count,
            tips,
            weights,
        })
    }

    /// Compresses per-tip sequences of state codes into unique columns.
    /// Pattern order follows first occurrence.
    pub fn from_sequences(state_count: usize, sequences: &[Vec<usize>]) -> Result<Self> {
        let Some(first) = sequences.first() else {
            bail!("no sequences");
        };
        let n_sites = first.len();
        for (i, s) in sequences.iter().enumerate() {
            if s.len() != n_sites {
                bail!("sequence {i} length {} does not match {n_sites}", s.len());
            }
        }

        let mut index: HashMap<Vec<usize>, usize> = HashMap::new();
        let mut columns: Vec<Vec<usize>> = Vec::new();
        let mut weights: Vec<f64> = Vec::new();
        for site in 0..n_sites {
            let column: Vec<usize> = sequences.iter().map(|s| s[site]).collect();
            match index.get(&column) {
                Some(&p) => weights[p] += 1.0,
                None => {
                    index.insert(column.clone(), columns.len());
                    columns.push(column);
                    weights.push(1.0);
                }
            }
        }

        let tips = (0..sequences.len())
            .map(|t| TipData::States(columns.iter().map(|c| c[t]).collect()))
            .collect();
        Self::new(state_count, tips, weights)
    }

    pub fn state_count(&self) -> usize {
        self.state_count
    }

    pub fn pattern_count(&self) -> usize {
        self.weights.len()
    }

    pub fn tip_count(&self) -> usize {
        self.tips.len()
    }

    pub fn tip(&self, index: usize) -> &TipData {
        &self.tips[index]
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }
}
