//! Byte-range header helpers.
//!
//! Both directions use the HTTP conventions: `Range: bytes=START-` or
//! `bytes=START-END` on requests (END inclusive), and
//! `Content-Range: bytes START-END/TOTAL` on chunked uploads and partial
//! responses.

/// A requested byte span, inclusive start, optional inclusive end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: Option<u64>,
}

/// Parse a `Range` header value. Returns `None` for anything that is not a
/// single `bytes=` span.
pub fn parse_range(value: &str) -> Option<ByteRange> {
    let spec = value.strip_prefix("bytes=")?;
    let (start_str, end_str) = spec.split_once('-')?;
    let start: u64 = start_str.trim().parse().ok()?;
    let end = if end_str.trim().is_empty() {
        None
    } else {
        let end: u64 = end_str.trim().parse().ok()?;
        if end < start {
            return None;
        }
        Some(end)
    };
    Some(ByteRange { start, end })
}

/// Format a `Range` header for an inclusive span.
pub fn format_range(start: u64, end_inclusive: u64) -> String {
    format!("bytes={}-{}", start, end_inclusive)
}

/// Format an open-ended `Range` header (`bytes=START-`), used for resume.
pub fn format_range_from(start: u64) -> String {
    format!("bytes={}-", start)
}

/// The span carried by a `Content-Range` header, inclusive end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    pub start: u64,
    pub end: u64,
    pub total: u64,
}

impl ContentRange {
    pub fn format(&self) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, self.total)
    }
}

/// Parse a `Content-Range: bytes START-END/TOTAL` header value.
pub fn parse_content_range(value: &str) -> Option<ContentRange> {
    let spec = value.strip_prefix("bytes ")?;
    let (span, total_str) = spec.split_once('/')?;
    let (start_str, end_str) = span.split_once('-')?;
    let start: u64 = start_str.trim().parse().ok()?;
    let end: u64 = end_str.trim().parse().ok()?;
    let total: u64 = total_str.trim().parse().ok()?;
    if end < start || total <= end {
        return None;
    }
    Some(ContentRange { start, end, total })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_closed_and_open_ranges() {
        assert_eq!(
            parse_range("bytes=0-1023"),
            Some(ByteRange { start: 0, end: Some(1023) })
        );
        assert_eq!(
            parse_range("bytes=512-"),
            Some(ByteRange { start: 512, end: None })
        );
        assert_eq!(parse_range("bytes=9-3"), None);
        assert_eq!(parse_range("items=0-1"), None);
    }

    #[test]
    fn content_range_round_trips() {
        let cr = ContentRange { start: 4096, end: 8191, total: 10_000 };
        assert_eq!(cr.format(), "bytes 4096-8191/10000");
        assert_eq!(parse_content_range(&cr.format()), Some(cr));
        // End beyond total is malformed.
        assert_eq!(parse_content_range("bytes 0-10/10"), None);
    }
}
