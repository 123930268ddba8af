use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

pub const DEFAULT_SCALING_THRESHOLD: f64 = 1.0e-100;
pub const DEFAULT_SCALING_CHECK_INTERVAL: u64 = 1000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoreConfig {
    pub state_count: usize,
    pub node_count: usize,
    pub pattern_count: usize,
    #[serde(default = "default_category_count")]
    pub category_count: usize,
    #[serde(default = "default_true")]
    pub integrate_categories: bool,
    #[serde(default)]
    pub use_scaling: bool,
    #[serde(default = "default_scaling_threshold")]
    pub scaling_threshold: f64,
    #[serde(default = "default_scaling_check_interval")]
    pub scaling_check_interval: u64,
}

fn default_category_count() -> usize {
    1
}

fn default_true() -> bool {
    true
}

fn default_scaling_threshold() -> f64 {
    DEFAULT_SCALING_THRESHOLD
}

fn default_scaling_check_interval() -> u64 {
    DEFAULT_SCALING_CHECK_INTERVAL
}

impl CoreConfig {
    pub fn new(state_count: usize, node_count: usize, pattern_count: usize) -> Self {
        Self {
            state_count,
            node_count,
            pattern_count,
            category_count: default_category_count(),
            integrate_categories: true,
            use_scaling: false,
            scaling_threshold: DEFAULT_SCALING_THRESHOLD,
            scaling_check_interval: DEFAULT_SCALING_CHECK_INTERVAL,
        }
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(text).context("failed to parse likelihood core config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("failed to serialize likelihood core config")
    }

    pub fn validate(&self) -> Result<()> {
        if self.state_count < 2 {
            bail!("state_count must be >= 2, got {}", self.state_count);
        }
        if self.node_count == 0 {
            bail!("node_count must be > 0");
        }
        if self.pattern_count == 0 {
            bail!("pattern_count must be > 0");
        }
        if self.category_count == 0 {
            bail!("category_count must be > 0");
        }
        if !(self.scaling_threshold > 0.0 && self.scaling_threshold.is_finite()) {
            bail!(
                "scaling_threshold must be positive and finite, got {}",
                self.scaling_threshold
            );
        }
        if self.scaling_check_interval == 0 {
            bail!("scaling_check_interval must be > 0");
        }
        Ok(())
    }

    pub fn partials_size(&self) -> usize {
        let base = self.pattern_count * self.state_count;
        if self.integrate_categories {
            base * self.category_count
        } else {
            base
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_defaults_fill_optional_fields() {
        let config = CoreConfig::from_json(r#"{"state_count":4,"node_count":7,"pattern_count":12}"#)
            .expect("config should parse");
        assert_eq!(config.category_count, 1);
        assert!(config.integrate_categories);
        assert!(!config.use_scaling);
        assert_eq!(config.scaling_check_interval, 1000);
        assert_eq!(config.partials_size(), 48);
    }

    #[test]
    fn validate_rejects_single_state_alphabet() {
        let err = CoreConfig::new(1, 3, 2).validate().expect_err("expected rejection");
        assert!(err.to_string().contains("state_count must be >= 2"));
    }

    #[test]
    fn partials_size_drops_category_dimension_when_not_integrating() {
        let mut config = CoreConfig::new(4, 5, 10);
        config.category_count = 4;
        assert_eq!(config.partials_size(), 160);
        config.integrate_categories = false;
        assert_eq!(config.partials_size(), 40);
    }

    #[test]
    fn json_roundtrip_keeps_every_field() {
        let mut config = CoreConfig::new(20, 9, 3);
        config.use_scaling = true;
        config.scaling_threshold = 1e-40;
        let text = config.to_json().expect("serialize failed");
        let back = CoreConfig::from_json(&text).expect("parse failed");
        assert_eq!(back, config);
    }
}
