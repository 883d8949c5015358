use crate::{Extent, ImageError};
use std::io::SeekFrom;

/// Extents query context for ranges that read as zeroes or are unallocated.
pub const CONTEXT_ZERO: &str = "zero";
/// Extents query context for ranges modified since a bitmap checkpoint.
pub const CONTEXT_DIRTY: &str = "dirty";

/// A seekable block device view of a disk image.
///
/// All I/O is positional relative to the backend's current offset, which is
/// advanced by `readinto`, `write` and `zero` and moved by `seek`. Backends
/// are driven by a single logical caller; sharing one instance across
/// threads requires external synchronization.
pub trait ImageBackend {
    /// Read exactly `buf.len()` bytes at the current position into `buf`.
    /// Advances the position and returns the number of bytes read.
    fn readinto(&mut self, buf: &mut [u8]) -> Result<usize, ImageError>;

    /// Write `buf` at the current position. Advances the position and
    /// returns the number of bytes written.
    fn write(&mut self, buf: &[u8]) -> Result<usize, ImageError>;

    /// Fill `length` bytes at the current position with zeroes, advancing
    /// the position.
    fn zero(&mut self, length: u64) -> Result<u64, ImageError>;

    /// Flush pending changes to storage.
    fn flush(&mut self) -> Result<(), ImageError>;

    /// Move the current position, returning the new position. `SeekFrom::End`
    /// requires the image size to be resolvable.
    fn seek(&mut self, pos: SeekFrom) -> Result<u64, ImageError>;

    /// The current position.
    fn tell(&self) -> u64;

    /// Total image size in bytes. May be resolved lazily and cached.
    fn size(&mut self) -> Result<u64, ImageError>;

    /// Image extents for `context` ([`CONTEXT_ZERO`] or [`CONTEXT_DIRTY`]),
    /// in listed order.
    fn extents(&mut self, context: &str) -> Result<Vec<Extent>, ImageError>;

    /// Release the backend's resources. Safe to call more than once.
    fn close(&mut self) -> Result<(), ImageError>;
}

/// Resolve `pos` against `current` and `size` for backend implementors,
/// failing on positions before the start of the image.
pub fn resolve_seek(current: u64, size: u64, pos: SeekFrom) -> Result<u64, ImageError> {
    let (base, delta) = match pos {
        SeekFrom::Start(n) => return Ok(n),
        SeekFrom::Current(d) => (current, d),
        SeekFrom::End(d) => (size, d),
    };
    base.checked_add_signed(delta)
        .ok_or_else(|| ImageError::InvalidArgument(format!("seek {delta:+} from {base} is before the start of the image")))
}
