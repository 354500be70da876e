/// Errors raised when reading raw byte buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RawAccessError {
    /// Requested range extends past the backing slice.
    #[error("range {offset:#x}+{size:#x} out of bounds (len {len:#x})")]
    OutOfBounds {
        offset: usize,
        size: usize,
        len: usize,
    },
    /// Offset math overflowed.
    #[error("offset overflow")]
    Overflow,
}

/// Bounds-checked little-endian reader over an untrusted byte buffer.
#[derive(Clone, Copy)]
pub struct RawReader<'a> {
    data: &'a [u8],
}

impl<'a> RawReader<'a> {
    pub const fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn array<const N: usize>(&self, offset: usize) -> Result<[u8; N], RawAccessError> {
        let bytes = self.bytes(offset, N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    pub fn u8(&self, offset: usize) -> Result<u8, RawAccessError> {
        Ok(self.array::<1>(offset)?[0])
    }

    pub fn u16(&self, offset: usize) -> Result<u16, RawAccessError> {
        self.array(offset).map(u16::from_le_bytes)
    }

    pub fn u32(&self, offset: usize) -> Result<u32, RawAccessError> {
        self.array(offset).map(u32::from_le_bytes)
    }

    pub fn u64(&self, offset: usize) -> Result<u64, RawAccessError> {
        self.array(offset).map(u64::from_le_bytes)
    }

    pub fn bytes(&self, offset: usize, len: usize) -> Result<&'a [u8], RawAccessError> {
        if len == 0 {
            return Ok(&[]);
        }
        let end = self.ensure(offset, len)?;
        Ok(&self.data[offset..end])
    }

    /// Bytes from `offset` up to (not including) the first NUL, bounded by `max_len`.
    pub fn cstr(&self, offset: usize, max_len: usize) -> Result<&'a [u8], RawAccessError> {
        let bytes = self.bytes(offset, max_len)?;
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        Ok(&bytes[..end])
    }

    fn ensure(&self, offset: usize, size: usize) -> Result<usize, RawAccessError> {
        let end = offset.checked_add(size).ok_or(RawAccessError::Overflow)?;
        if end > self.data.len() {
            Err(RawAccessError::OutOfBounds {
                offset,
                size,
                len: self.data.len(),
            })
        } else {
            Ok(end)
        }
    }
}
