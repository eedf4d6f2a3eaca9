use thiserror::Error;

/// Failure modes of the bit-exact block encoding. Never carries an
/// application pointer — callers that need to annotate a failure with the
/// block pointer that produced it do so one layer up, where the pointer is
/// actually known.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum FormatError {
    #[error("block layout has a data_size of {0}, which does not fit in a 3-byte length prefix")]
    DataSizeTooLarge(usize),
    #[error("block layout must carry at least one pointer slot")]
    ZeroPointers,
    #[error("block payload is {len} bytes, but the layout only allows {max}")]
    DataTooLarge { len: usize, max: usize },
    #[error("block is {actual} bytes, expected {expected} for this layout")]
    SizeMismatch { expected: usize, actual: usize },
}
