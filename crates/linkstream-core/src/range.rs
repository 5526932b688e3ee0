//! HTTP byte ranges

use crate::{CoreError, Result};

/// Inclusive byte range `[start, end]` within a file
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    /// Whole-file range; `None` for an empty file
    pub fn full(size: u64) -> Option<Self> {
        (size > 0).then(|| Self {
            start: 0,
            end: size - 1,
        })
    }

    /// Number of bytes covered
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Always false, an inclusive range covers at least one byte
    pub fn is_empty(&self) -> bool {
        false
    }

    /// `Content-Range` value for a file of `size` bytes
    pub fn content_range(&self, size: u64) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, size)
    }

    /// Parse a `Range` header against a file of `size` bytes.
    ///
    /// Accepts `bytes=a-b`, `bytes=a-` and `bytes=-n`. Only a suffix longer
    /// than the file is clamped; an explicit end past the file, like anything
    /// else that cannot be served, is `InvalidRange`.
    pub fn parse(header: &str, size: u64) -> Result<Self> {
        let ranges = header
            .trim()
            .strip_prefix("bytes=")
            .ok_or_else(|| CoreError::invalid_range("unsupported range unit", size))?;

        if ranges.contains(',') {
            return Err(CoreError::invalid_range("multiple ranges", size));
        }

        let (start_str, end_str) = ranges
            .split_once('-')
            .ok_or_else(|| CoreError::invalid_range("missing '-'", size))?;
        let (start_str, end_str) = (start_str.trim(), end_str.trim());

        let number = |s: &str| {
            s.parse::<u64>()
                .map_err(|_| CoreError::invalid_range(format!("bad number {:?}", s), size))
        };

        if size == 0 {
            return Err(CoreError::invalid_range("file is empty", size));
        }

        let range = match (start_str.is_empty(), end_str.is_empty()) {
            (true, true) => return Err(CoreError::invalid_range("empty range", size)),
            (true, false) => {
                let suffix = number(end_str)?;
                if suffix == 0 {
                    return Err(CoreError::invalid_range("zero-length suffix", size));
                }
                Self {
                    start: size.saturating_sub(suffix),
                    end: size - 1,
                }
            }
            (false, true) => Self {
                start: number(start_str)?,
                end: size - 1,
            },
            (false, false) => {
                let start = number(start_str)?;
                let end = number(end_str)?;
                if start > end {
                    return Err(CoreError::invalid_range("start after end", size));
                }
                if end >= size {
                    return Err(CoreError::invalid_range("end beyond end of file", size));
                }
                Self { start, end }
            }
        };

        if range.start >= size {
            return Err(CoreError::invalid_range("start beyond end of file", size));
        }
        Ok(range)
    }
}
