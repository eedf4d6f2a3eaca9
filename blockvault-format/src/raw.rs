use std::ops::Deref;
use std::sync::Arc;

/// An immutable, reference-counted block of bytes.
///
/// Every layer above L0 passes blocks around by value; `RawBlock` makes that
/// free by cloning a reference count instead of the bytes themselves, the
/// same way a decoded page is shared between an LRU cache and the caller
/// that just fetched it.
#[derive(Clone)]
pub struct RawBlock(Arc<[u8]>);

impl RawBlock {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Deref for RawBlock {
    type Target = [u8];
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl AsRef<[u8]> for RawBlock {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for RawBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawBlock").field("len", &self.0.len()).finish()
    }
}

impl PartialEq for RawBlock {
    fn eq(&self, other: &Self) -> bool {
        self.0.as_ref() == other.0.as_ref()
    }
}
impl Eq for RawBlock {}

impl From<Vec<u8>> for RawBlock {
    fn from(value: Vec<u8>) -> Self {
        Self(value.into())
    }
}

impl From<Box<[u8]>> for RawBlock {
    fn from(value: Box<[u8]>) -> Self {
        Self(value.into())
    }
}

impl From<Arc<[u8]>> for RawBlock {
    fn from(value: Arc<[u8]>) -> Self {
        Self(value)
    }
}

impl From<&[u8]> for RawBlock {
    fn from(value: &[u8]) -> Self {
        Self(Arc::from(value))
    }
}
