use std::fmt;

/// A contiguous byte range of an image annotated with a storage property.
///
/// The variant is keyed by the extents query context: `"zero"` queries yield
/// [`Extent::Zero`] ranges, `"dirty"` queries yield [`Extent::Dirty`] ranges.
///
/// A full listing over `[0, size)` is ordered by `start`, non-overlapping
/// and contiguous, and its lengths sum to the image size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extent {
    Zero {
        start: u64,
        length: u64,
        /// The range reads as all-zero bytes.
        zero: bool,
        /// The range is unallocated storage.
        hole: bool,
    },
    Dirty {
        start: u64,
        length: u64,
        /// The range changed since the bitmap checkpoint.
        dirty: bool,
    },
}

impl Extent {
    pub fn start(&self) -> u64 {
        match self {
            Extent::Zero { start, .. } | Extent::Dirty { start, .. } => *start,
        }
    }

    pub fn length(&self) -> u64 {
        match self {
            Extent::Zero { length, .. } | Extent::Dirty { length, .. } => *length,
        }
    }

    /// First byte offset past the extent.
    pub fn end(&self) -> u64 {
        self.start() + self.length()
    }

    /// Whether the extent carries data that must be transferred: non-zero
    /// content for zero extents, changed ranges for dirty extents.
    pub fn has_data(&self) -> bool {
        match self {
            Extent::Zero { zero, .. } => !zero,
            Extent::Dirty { dirty, .. } => *dirty,
        }
    }
}

impl fmt::Display for Extent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Extent::Zero {
                start,
                length,
                zero,
                hole,
            } => write!(
                f,
                "extent start={start} length={length} zero={zero} hole={hole}"
            ),
            Extent::Dirty {
                start,
                length,
                dirty,
            } => write!(f, "extent start={start} length={length} dirty={dirty}"),
        }
    }
}
