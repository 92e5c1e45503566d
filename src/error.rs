//! Error types for the catalog index, filters and the binary catalog format.

use thiserror::Error;

/// Structural violations of the index. These indicate a caller defect, the
/// index itself is left untouched when one is returned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IndexError {
    #[error("asset already registered: {0}")]
    DuplicateObjectPath(String),
    #[error("asset not registered: {0}")]
    UnknownAsset(String),
    #[error("asset handle {0} does not refer to a live record")]
    StaleHandle(u32),
}

/// Malformed query requests, rejected before any index access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FilterError {
    #[error("filter contains an empty {field}")]
    EmptyKey { field: &'static str },
    #[error("filter has no constraints, use get_all_assets instead")]
    NoConstraints,
    #[error("recursive filter must be expanded before it reaches the index")]
    RecursionNotExpanded,
}

/// Failures while decoding a serialized catalog.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormatError {
    #[error("unexpected end of stream at byte {offset}")]
    UnexpectedEof { offset: usize },
    #[error("unknown catalog version {0}")]
    UnknownVersion(i32),
    #[error("negative count {count} at byte {offset}")]
    NegativeCount { count: i32, offset: usize },
    #[error("node index {index} outside node table of {len}")]
    IndexOutOfRange { index: i32, len: usize },
    #[error("name index {index} outside name table of {len}")]
    BadNameIndex { index: u32, len: usize },
    #[error("invalid utf-8 string at byte {offset}")]
    InvalidUtf8 { offset: usize },
    #[error("duplicate object path in stream: {0}")]
    DuplicateAsset(String),
    #[error("referencer {referencer} listed for {node} has no matching dependency")]
    DanglingReferencer { node: String, referencer: String },
}
