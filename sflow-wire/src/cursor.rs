use thiserror::Error;

/// Bounds violation raised by a [`Cursor`] primitive.
///
/// Source-side reads and skips are checked against the length of the
/// datagram currently bound to the cursor; destination-side writes are
/// checked against the buffer capacity. Either variant aborts the datagram
/// being rewritten and the caller falls back to verbatim forwarding.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CursorError {
    #[error("source read of {want} bytes at offset {at} exceeds datagram length {len}")]
    SourceOverrun { at: usize, want: usize, len: usize },

    #[error("destination write of {want} bytes at offset {at} exceeds buffer capacity {cap}")]
    DestinationOverrun { at: usize, want: usize, cap: usize },
}

/// A dual-buffer byte cursor over one sFlow datagram.
///
/// Holds a source buffer filled by the receive loop and a destination
/// buffer the rewriters copy into, together with the current read and write
/// offsets. Length fields whose value is only known after a nested walk are
/// back-patched through [`Cursor::write_u32_at`], which takes an absolute
/// destination offset and does not move the write offset.
///
/// Both buffers are allocated once, at worker startup, and sized to the
/// configured maximum payload; [`Cursor::reset`] rebinds the cursor to the
/// next datagram without touching the allocations.
pub struct Cursor {
    src: Vec<u8>,
    dst: Vec<u8>,
    /// Number of meaningful bytes in `src` for the current datagram.
    src_len: usize,
    src_off: usize,
    dst_off: usize,
}

impl Cursor {
    /// Creates a cursor with two `capacity`-byte buffers.
    pub fn new(capacity: usize) -> Self {
        Self {
            src: vec![0; capacity],
            dst: vec![0; capacity],
            src_len: 0,
            src_off: 0,
            dst_off: 0,
        }
    }

    /// The full source buffer, for the receive loop to read a datagram into.
    pub fn source_mut(&mut self) -> &mut [u8] {
        &mut self.src
    }

    /// Rebinds the cursor to a new datagram of `n` bytes and rewinds both
    /// offsets. `n` must not exceed the buffer capacity (a datagram read
    /// into [`Cursor::source_mut`] never does).
    pub fn reset(&mut self, n: usize) {
        debug_assert!(n <= self.src.len());
        self.src_len = n;
        self.src_off = 0;
        self.dst_off = 0;
    }

    /// Current read offset into the source buffer.
    pub fn src_offset(&self) -> usize {
        self.src_off
    }

    /// Current write offset into the destination buffer.
    pub fn dst_offset(&self) -> usize {
        self.dst_off
    }

    /// The rewritten bytes produced so far.
    pub fn processed_bytes(&self) -> &[u8] {
        &self.dst[..self.dst_off]
    }

    /// The original datagram, untouched.
    pub fn source_bytes(&self) -> &[u8] {
        &self.src[..self.src_len]
    }

    fn check_src(&self, at: usize, want: usize) -> Result<(), CursorError> {
        if at + want > self.src_len {
            return Err(CursorError::SourceOverrun {
                at,
                want,
                len: self.src_len,
            });
        }
        Ok(())
    }

    fn check_dst(&self, at: usize, want: usize) -> Result<(), CursorError> {
        if at + want > self.dst.len() {
            return Err(CursorError::DestinationOverrun {
                at,
                want,
                cap: self.dst.len(),
            });
        }
        Ok(())
    }

    /// Returns the next `n` source bytes and advances the read offset.
    pub fn read_bytes(&mut self, n: usize) -> Result<&[u8], CursorError> {
        self.check_src(self.src_off, n)?;
        let view = &self.src[self.src_off..self.src_off + n];
        self.src_off += n;
        Ok(view)
    }

    pub fn read_u8(&mut self) -> Result<u8, CursorError> {
        Ok(self.read_bytes(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, CursorError> {
        let b = self.read_bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn read_u32(&mut self) -> Result<u32, CursorError> {
        let b = self.read_bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Copies the next `n` source bytes to the destination, advancing both
    /// offsets.
    pub fn copy_bytes(&mut self, n: usize) -> Result<(), CursorError> {
        self.check_src(self.src_off, n)?;
        self.check_dst(self.dst_off, n)?;
        self.dst[self.dst_off..self.dst_off + n]
            .copy_from_slice(&self.src[self.src_off..self.src_off + n]);
        self.src_off += n;
        self.dst_off += n;
        Ok(())
    }

    /// Copies `n` bytes from an absolute source offset to an absolute
    /// destination offset, then places both offsets at the end of the
    /// copied range.
    ///
    /// Used to carry an unsupported sample or record through verbatim: the
    /// copy spans the sub-tree's declared length from its body start, and
    /// resetting both offsets to the end of the body keeps sibling framing
    /// aligned no matter how far the caller had read ahead.
    pub fn copy_bytes_at(
        &mut self,
        n: usize,
        src_start: usize,
        dst_start: usize,
    ) -> Result<(), CursorError> {
        self.check_src(src_start, n)?;
        self.check_dst(dst_start, n)?;
        self.dst[dst_start..dst_start + n].copy_from_slice(&self.src[src_start..src_start + n]);
        self.src_off = src_start + n;
        self.dst_off = dst_start + n;
        Ok(())
    }

    /// Copies the next 4 source bytes to the destination and returns their
    /// big-endian value.
    pub fn copy_u32(&mut self) -> Result<u32, CursorError> {
        let at = self.src_off;
        self.copy_bytes(4)?;
        let b = &self.src[at..at + 4];
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Copies a 32-bit data-format word and returns its two components:
    /// the enterprise number (upper 20 bits) and the format (lower 12).
    pub fn copy_data_format(&mut self) -> Result<(u32, u32), CursorError> {
        let word = self.copy_u32()?;
        Ok((word >> 12, word & 0xFFF))
    }

    /// Advances the read offset by `n` without copying.
    pub fn skip(&mut self, n: usize) -> Result<(), CursorError> {
        self.check_src(self.src_off, n)?;
        self.src_off += n;
        Ok(())
    }

    /// Appends `n` zero bytes to the destination.
    pub fn pad(&mut self, n: usize) -> Result<(), CursorError> {
        self.check_dst(self.dst_off, n)?;
        self.dst[self.dst_off..self.dst_off + n].fill(0);
        self.dst_off += n;
        Ok(())
    }

    /// Writes a big-endian u32 at an absolute destination offset without
    /// moving the write offset. This is the back-patch primitive for length
    /// fields laid down before their value is known.
    pub fn write_u32_at(&mut self, value: u32, at: usize) -> Result<(), CursorError> {
        self.check_dst(at, 4)?;
        self.dst[at..at + 4].copy_from_slice(&value.to_be_bytes());
        Ok(())
    }
}
