mod buffers;
pub mod config;
pub mod diagnostics;
pub mod error;
mod kernels;
pub mod likelihood;
pub mod likelihood_core;
pub mod model;
pub mod patterns;
pub mod tree;

pub use crate::config::CoreConfig;
pub use crate::error::{CoreError, CoreResult};
pub use crate::likelihood::TreeLikelihood;
pub use crate::likelihood_core::{LikelihoodCore, NodeData};
pub use crate::model::{SiteModel, SubstitutionModel};
