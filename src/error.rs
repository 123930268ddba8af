use thiserror::Error;

pub type CoreResult<T> = std::result::Result<T, CoreError>;

/// Caller programming errors. None of these are retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    #[error("core is not initialized")]
    NotInitialized,

    #[error("node index {node} out of range (node count {node_count})")]
    NodeOutOfRange { node: usize, node_count: usize },

    #[error("category index {category} out of range (category count {category_count})")]
    CategoryOutOfRange {
        category: usize,
        category_count: usize,
    },

    #[error("pattern index {pattern} out of range (pattern count {pattern_count})")]
    PatternOutOfRange {
        pattern: usize,
        pattern_count: usize,
    },

    #[error("node {node} has neither states nor partials")]
    UninitializedNode { node: usize },

    #[error("parent node {node} is also one of its children")]
    AliasedParent { node: usize },

    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },
}

impl CoreError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }
}
