use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("redline not found: {0}")]
    NotFound(String),

    #[error("duplicate redline id in snapshot: {0}")]
    DuplicateId(String),

    #[error("redline {id} has an inverted span ({start} > {end})")]
    InvalidSpan { id: String, start: usize, end: usize },
}
