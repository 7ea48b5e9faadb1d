//! Byte-range planning for chunked transfers.
//!
//! A transfer is split into an ordered sequence of [`ChunkRange`]s that
//! together cover the whole object. Planning is pure and deterministic:
//! the same `(total_size, chunk_size)` pair always produces the same plan,
//! which is a prerequisite for any future resumability work.

/// A contiguous byte interval of the source object, fetched in one unit.
///
/// `end` is inclusive, matching the HTTP `Range: bytes=start-end` wire
/// format. The half-open view of the range is `[start, end + 1)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkRange {
    /// Ordinal position of this chunk within the plan.
    pub index: usize,

    /// First byte of the range.
    pub start: u64,

    /// Last byte of the range (inclusive).
    pub end: u64,
}

impl ChunkRange {
    /// Returns the number of bytes covered by this range.
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// A range always covers at least one byte.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Formats the range as an HTTP `Range` header value.
    pub fn http_range_value(&self) -> String {
        format!("bytes={}-{}", self.start, self.end)
    }
}

/// Splits `[0, total_size)` into ordered, contiguous chunk ranges.
///
/// Every range has length `chunk_size` except possibly the last, which is
/// clamped to `total_size - 1`. A zero-length object yields an empty plan;
/// a `chunk_size` larger than the object yields exactly one range.
///
/// `chunk_size` is validated at the configuration boundary and must be
/// non-zero here.
pub fn plan_chunks(total_size: u64, chunk_size: u64) -> Vec<ChunkRange> {
    debug_assert!(chunk_size > 0, "chunk_size must be non-zero");

    let mut ranges = Vec::with_capacity(total_size.div_ceil(chunk_size) as usize);
    let mut start = 0u64;
    let mut index = 0usize;

    while start < total_size {
        let end = (start + chunk_size - 1).min(total_size - 1);
        ranges.push(ChunkRange { index, start, end });
        start = end + 1;
        index += 1;
    }

    ranges
}
