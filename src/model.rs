use anyhow::{Result, bail};
use ndarray::{Array2, arr2};

/// Source of transition probabilities and equilibrium frequencies.
pub trait SubstitutionModel {
    fn state_count(&self) -> usize;

    fn frequencies(&self) -> &[f64];

    /// Row-major `P(d)`: row = ancestral state, column = descendant state.
    fn transition_matrix(&self, distance: f64) -> Array2<f64>;
}

/// Equal rates, equal frequencies, any alphabet size.
#[derive(Debug, Clone)]
pub struct JukesCantor {
    state_count: usize,
    frequencies: Vec<f64>,
}

impl JukesCantor {
    pub fn new(state_count: usize) -> Result<Self> {
        if state_count < 2 {
            bail!("Jukes-Cantor needs at least 2 states, got {state_count}");
        }
        Ok(Self {
            state_count,
            frequencies: vec![1.0 / state_count as f64; state_count],
        })
    }
}

impl SubstitutionModel for JukesCantor {
    fn state_count(&self) -> usize {
        self.state_count
    }

    fn frequencies(&self) -> &[f64] {
        &self.frequencies
    }

    fn transition_matrix(&self, distance: f64) -> Array2<f64> {
        let n = self.state_count as f64;
        let e = (-n / (n - 1.0) * distance).exp();
        let same = 1.0 / n + (n - 1.0) / n * e;
        let diff = 1.0 / n - e / n;
        Array2::from_shape_fn((self.state_count, self.state_count), |(i, j)| {
            if i == j { same } else { diff }
        })
    }
}

/// Two-state gain/loss chain, `Q = [[-λ, λ], [μ, -μ]]`.
#[derive(Debug, Clone)]
pub struct BinaryModel {
    gain_rate: f64,
    loss_rate: f64,
    frequencies: [f64; 2],
}

impl BinaryModel {
    pub fn new(gain_rate: f64, loss_rate: f64) -> Result<Self> {
        if !(gain_rate >= 0.0 && loss_rate >= 0.0) {
            bail!("gain/loss rates must be non-negative, got {gain_rate}/{loss_rate}");
        }
        let total = gain_rate + loss_rate;
        let frequencies = if total < 1e-10 {
            [0.5, 0.5]
        } else {
            [loss_rate / total, gain_rate / total]
        };
        Ok(Self {
            gain_rate,
            loss_rate,
            frequencies,
        })
    }
}

impl SubstitutionModel for BinaryModel {
    fn state_count(&self) -> usize {
        2
    }

    fn frequencies(&self) -> &[f64] {
        &self.frequencies
    }

    fn transition_matrix(&self, distance: f64) -> Array2<f64> {
        let (gain, loss) = (self.gain_rate, self.loss_rate);
        let total = gain + loss;
        if total < 1e-10 {
            return Array2::eye(2);
        }
        let e = (-total * distance).exp();
        arr2(&[
            [(loss + gain * e) / total, (gain - gain * e) / total],
            [(loss - loss * e) / total, (gain + loss * e) / total],
        ])
    }
}

/// Arbitrary rate matrix, normalised to one expected substitution per unit
/// time. `P(d) = exp(Qd)` by scaling and squaring.
#[derive(Debug, Clone)]
pub struct GeneralModel {
    rate_matrix: Array2<f64>,
    frequencies: Vec<f64>,
}

impl GeneralModel {
    /// Off-diagonal entries of `rates` are used; the diagonal is recomputed.
    pub fn new(rates: Array2<f64>, frequencies: Vec<f64>) -> Result<Self> {
        let n = frequencies.len();
        if n < 2 {
            bail!("need at least 2 states, got {n}");
        }
        if rates.shape() != [n, n] {
            bail!(
                "rate matrix shape {:?} does not match {} frequencies",
                rates.shape(),
                n
            );
        }
        let freq_sum: f64 = frequencies.iter().sum();
        if (freq_sum - 1.0).abs() > 1e-6 || frequencies.iter().any(|&f| f < 0.0) {
            bail!("frequencies must be non-negative and sum to 1, got sum {freq_sum}");
        }

        let mut q = rates;
        for i in 0..n {
            let mut row = 0.0;
            for j in 0..n {
                if i == j {
                    continue;
                }
                if q[(i, j)] < 0.0 {
                    bail!("negative rate q[{i},{j}] = {}", q[(i, j)]);
                }
                row += q[(i, j)];
            }
            q[(i, i)] = -row;
        }
        let mu: f64 = (0..n).map(|i| -frequencies[i] * q[(i, i)]).sum();
        if mu <= 0.0 {
            bail!("rate matrix has no substitutions");
        }
        q.mapv_inplace(|x| x / mu);

        Ok(Self {
            rate_matrix: q,
            frequencies,
        })
    }

    pub fn rate_matrix(&self) -> &Array2<f64> {
        &self.rate_matrix
    }
}

impl SubstitutionModel for GeneralModel {
    fn state_count(&self) -> usize {
        self.frequencies.len()
    }

    fn frequencies(&self) -> &[f64] {
        &self.frequencies
    }

    fn transition_matrix(&self, distance: f64) -> Array2<f64> {
        expm(&(&self.rate_matrix * distance))
    }
}

/// Matrix exponential: scale to norm ≤ 0.5, Taylor series, square back.
pub fn expm(a: &Array2<f64>) -> Array2<f64> {
    let n = a.nrows();
    let norm = a
        .rows()
        .into_iter()
        .map(|r| r.iter().map(|x| x.abs()).sum::<f64>())
        .fold(0.0f64, f64::max);
    let mut squarings = 0u32;
    if norm > 0.5 {
        squarings = (norm / 0.5).log2().ceil() as u32;
    }
    let scaled = a / 2f64.powi(squarings as i32);

    let mut result = Array2::<f64>::eye(n);
    let mut term = Array2::<f64>::eye(n);
    for k in 1..=20 {
        term = term.dot(&scaled) / k as f64;
        result += &term;
    }
    for _ in 0..squarings {
        result = result.dot(&result);
    }
    result
}

/// Among-site rate variation: per-category relative rates and proportions.
#[derive(Debug, Clone)]
pub struct SiteModel {
    rates: Vec<f64>,
    proportions: Vec<f64>,
    site_categories: Option<Vec<usize>>,
}

impl SiteModel {
    pub fn single_rate() -> Self {
        Self {
            rates: vec![1.0],
            proportions: vec![1.0],
            site_categories: None,
        }
    }

    pub fn new(rates: Vec<f64>, proportions: Vec<f64>) -> Result<Self> {
        if rates.is_empty() {
            bail!("site model needs at least one category");
        }
        if rates.len() != proportions.len() {
            bail!(
                "rates length {} does not match proportions length {}",
                rates.len(),
                proportions.len()
            );
        }
        if rates.iter().any(|&r| !(r >= 0.0 && r.is_finite())) {
            bail!("category rates must be finite and non-negative");
        }
        let sum: f64 = proportions.iter().sum();
        if (sum - 1.0).abs() > 1e-9 || proportions.iter().any(|&p| p < 0.0) {
            bail!("category proportions must be non-negative and sum to 1, got sum {sum}");
        }
        Ok(Self {
            rates,
            proportions,
            site_categories: None,
        })
    }

    /// Equal proportions over the given rates.
    pub fn equal_categories(rates: Vec<f64>) -> Result<Self> {
        let k = rates.len();
        Self::new(rates, vec![1.0 / k.max(1) as f64; k])
    }

    /// Assigns every pattern to one category instead of integrating.
    pub fn with_site_categories(mut self, categories: Vec<usize>) -> Result<Self> {
        if let Some(&bad) = categories.iter().find(|&&k| k >= self.rates.len()) {
            bail!("site category {bad} out of range for {} categories", self.rates.len());
        }
        self.site_categories = Some(categories);
        Ok(self)
    }

    pub fn category_count(&self) -> usize {
        self.rates.len()
    }

    pub fn rate_for_category(&self, category: usize) -> f64 {
        self.rates[category]
    }

    pub fn proportions(&self) -> &[f64] {
        &self.proportions
    }

    pub fn integrates_categories(&self) -> bool {
        self.site_categories.is_none()
    }

    pub fn site_categories(&self) -> Option<&[usize]> {
        self.site_categories.as_deref()
    }
}
