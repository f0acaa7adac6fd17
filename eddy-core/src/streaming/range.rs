//! HTTP `Range` header handling for single byte ranges.

use serde::Serialize;

use super::StreamingError;

/// Inclusive byte range within one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    /// Range covering a whole file, `None` for empty files.
    pub fn full(file_length: u64) -> Option<Self> {
        (file_length > 0).then(|| Self {
            start: 0,
            end: file_length - 1,
        })
    }

    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// `Content-Range` value for a file of `file_length` bytes.
    pub fn content_range(&self, file_length: u64) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, file_length)
    }
}

/// Parses a `Range` header against a file of `file_length` bytes.
///
/// Supports `bytes=a-b`, `bytes=a-` and `bytes=-n`. Only the first range of
/// a multi-range request is honored. Headers in another unit or with broken
/// syntax are ignored (`Ok(None)`), so the caller serves the whole file.
/// End offsets past the file are clamped.
///
/// # Errors
/// - `StreamingError::RangeNotSatisfiable` - The range starts past the end
///   of the file, is inverted, or is an empty suffix
pub fn parse_range_header(header: &str, file_length: u64) -> Result<Option<ByteRange>, StreamingError> {
    let Some(ranges) = header.trim().strip_prefix("bytes=") else {
        return Ok(None);
    };
    let first = ranges.split(',').next().unwrap_or_default().trim();
    let Some((start, end)) = first.split_once('-') else {
        return Ok(None);
    };
    let (start, end) = (start.trim(), end.trim());

    let unsatisfiable = || StreamingError::RangeNotSatisfiable {
        header: header.to_string(),
        file_length,
    };

    let range = match (start.is_empty(), end.is_empty()) {
        (true, true) => return Ok(None),
        (true, false) => {
            let Ok(suffix) = end.parse::<u64>() else {
                return Ok(None);
            };
            if suffix == 0 || file_length == 0 {
                return Err(unsatisfiable());
            }
            ByteRange {
                start: file_length.saturating_sub(suffix),
                end: file_length - 1,
            }
        }
        (false, open_ended) => {
            let Ok(first) = start.parse::<u64>() else {
                return Ok(None);
            };
            let last = if open_ended {
                u64::MAX
            } else {
                match end.parse::<u64>() {
                    Ok(last) => last,
                    Err(_) => return Ok(None),
                }
            };
            if first >= file_length || first > last {
                return Err(unsatisfiable());
            }
            ByteRange {
                start: first,
                end: last.min(file_length - 1),
            }
        }
    };
    Ok(Some(range))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(header: &str, length: u64) -> Option<ByteRange> {
        parse_range_header(header, length).unwrap()
    }

    #[test]
    fn test_closed_range() {
        let range = parse("bytes=10-19", 100).unwrap();
        assert_eq!(range, ByteRange { start: 10, end: 19 });
        assert_eq!(range.len(), 10);
        assert_eq!(range.content_range(100), "bytes 10-19/100");
    }

    #[test]
    fn test_open_and_clamped_ranges() {
        assert_eq!(parse("bytes=90-", 100), Some(ByteRange { start: 90, end: 99 }));
        assert_eq!(parse("bytes=50-5000", 100), Some(ByteRange { start: 50, end: 99 }));
        assert_eq!(parse("bytes=0-0", 1), Some(ByteRange { start: 0, end: 0 }));
    }

    #[test]
    fn test_suffix_range() {
        assert_eq!(parse("bytes=-10", 100), Some(ByteRange { start: 90, end: 99 }));
        assert_eq!(parse("bytes=-500", 100), Some(ByteRange { start: 0, end: 99 }));
    }

    #[test]
    fn test_first_of_multiple_ranges() {
        assert_eq!(parse("bytes=0-9, 20-29", 100), Some(ByteRange { start: 0, end: 9 }));
    }

    #[test]
    fn test_unsatisfiable_ranges() {
        for header in ["bytes=100-", "bytes=150-200", "bytes=20-10", "bytes=-0"] {
            assert!(
                matches!(
                    parse_range_header(header, 100),
                    Err(StreamingError::RangeNotSatisfiable { file_length: 100, .. })
                ),
                "{header}"
            );
        }
        assert!(parse_range_header("bytes=0-", 0).is_err());
    }

    #[test]
    fn test_ignored_headers() {
        for header in ["items=0-5", "bytes=abc-", "bytes=-", "bytes=5", "bytes=1-x"] {
            assert_eq!(parse(header, 100), None, "{header}");
        }
    }

    #[test]
    fn test_full_range() {
        assert_eq!(ByteRange::full(0), None);
        assert_eq!(ByteRange::full(5), Some(ByteRange { start: 0, end: 4 }));
    }
}
