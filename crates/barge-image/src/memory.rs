use crate::backend::{resolve_seek, CONTEXT_DIRTY, CONTEXT_ZERO};
use crate::{Extent, ImageBackend, ImageError};
use std::collections::HashMap;
use std::io::SeekFrom;

/// In-memory image backend with trivial buffer semantics.
///
/// Grows on writes past the end, reads short at the end of the buffer, and
/// can be seeded with canned extent listings so backend-agnostic callers can
/// be exercised without a server.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    data: Vec<u8>,
    position: u64,
    extents: HashMap<String, Vec<Extent>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_data(data: Vec<u8>) -> Self {
        Self {
            data,
            ..Self::default()
        }
    }

    /// Seed a canned extent listing for `context`.
    #[must_use]
    pub fn with_extents(mut self, context: &str, extents: Vec<Extent>) -> Self {
        self.extents.insert(context.to_owned(), extents);
        self
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    fn end_of(&self, length: u64) -> Result<usize, ImageError> {
        let end = self
            .position
            .checked_add(length)
            .ok_or_else(|| ImageError::InvalidArgument("byte range overflows".to_owned()))?;
        Ok(end as usize)
    }
}

impl ImageBackend for MemoryBackend {
    fn readinto(&mut self, buf: &mut [u8]) -> Result<usize, ImageError> {
        let start = self.position as usize;
        if start >= self.data.len() {
            return Ok(0);
        }
        let n = buf.len().min(self.data.len() - start);
        buf[..n].copy_from_slice(&self.data[start..start + n]);
        self.position += n as u64;
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, ImageError> {
        let end = self.end_of(buf.len() as u64)?;
        if end > self.data.len() {
            self.data.resize(end, 0);
        }
        let start = self.position as usize;
        self.data[start..end].copy_from_slice(buf);
        self.position = end as u64;
        Ok(buf.len())
    }

    fn zero(&mut self, length: u64) -> Result<u64, ImageError> {
        let end = self.end_of(length)?;
        if end > self.data.len() {
            self.data.resize(end, 0);
        }
        let start = self.position as usize;
        self.data[start..end].fill(0);
        self.position = end as u64;
        Ok(length)
    }

    fn flush(&mut self) -> Result<(), ImageError> {
        Ok(())
    }

    fn seek(&mut self, pos: SeekFrom) -> Result<u64, ImageError> {
        self.position = resolve_seek(self.position, self.data.len() as u64, pos)?;
        Ok(self.position)
    }

    fn tell(&self) -> u64 {
        self.position
    }

    fn size(&mut self) -> Result<u64, ImageError> {
        Ok(self.data.len() as u64)
    }

    fn extents(&mut self, context: &str) -> Result<Vec<Extent>, ImageError> {
        if context != CONTEXT_ZERO && context != CONTEXT_DIRTY {
            return Err(ImageError::InvalidArgument(format!(
                "invalid extents context: {context}"
            )));
        }
        if let Some(extents) = self.extents.get(context) {
            return Ok(extents.clone());
        }
        if context == CONTEXT_ZERO {
            if self.data.is_empty() {
                return Ok(Vec::new());
            }
            Ok(vec![Extent::Zero {
                start: 0,
                length: self.data.len() as u64,
                zero: false,
                hole: false,
            }])
        } else {
            Err(ImageError::Unsupported(
                "memory backend does not track dirty extents".to_owned(),
            ))
        }
    }

    fn close(&mut self) -> Result<(), ImageError> {
        Ok(())
    }
}
