use thiserror::Error;

/// Errors raised by the encoder-decoder engine.
///
/// Contract violations are reported at the point of detection and are never
/// retried; numeric overflow under reduced precision is not an error (the
/// block clamps it).
#[derive(Debug, Error)]
pub enum Error {
    #[error("you cannot specify both {side}input_ids and {side}inputs_embeds at the same time")]
    AmbiguousInputBoth { side: &'static str },
    #[error("you have to specify either {side}input_ids or {side}inputs_embeds")]
    AmbiguousInputNeither { side: &'static str },
    #[error("invalid cache state: expected {expected} past states, got {found}")]
    InvalidCacheState { expected: usize, found: usize },
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("invalid combination: {0}")]
    InvalidCombination(String),
    #[error("shape error: {0}")]
    Shape(String),
    #[error("failed to parse config: {0}")]
    Config(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True for both flavours of the ids/embeddings ambiguity.
    pub fn is_ambiguous_input(&self) -> bool {
        matches!(
            self,
            Error::AmbiguousInputBoth { .. } | Error::AmbiguousInputNeither { .. }
        )
    }
}

impl From<ndarray::ShapeError> for Error {
    fn from(e: ndarray::ShapeError) -> Self {
        Error::Shape(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
