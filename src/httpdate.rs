//! HTTP date formatting and parsing (RFC 7231 IMF-fixdate).

use time::{
    OffsetDateTime, PrimitiveDateTime, UtcOffset,
    format_description::{BorrowedFormatItem, well_known::Rfc2822},
    macros::format_description,
};

const IMF_FIXDATE: &[BorrowedFormatItem<'static>] = format_description!(
    "[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT"
);

/// Format a timestamp as an IMF-fixdate string, e.g. `Sun, 06 Nov 1994 08:49:37 GMT`.
pub fn format(timestamp: OffsetDateTime) -> Option<String> {
    timestamp.to_offset(UtcOffset::UTC).format(IMF_FIXDATE).ok()
}

/// Parse an HTTP date.
///
/// Accepts IMF-fixdate and falls back to the RFC 2822 form some clients
/// still send. Returns `None` for anything else; conditional request
/// handling ignores unparseable validators.
pub fn parse(value: &str) -> Option<OffsetDateTime> {
    let value = value.trim();
    if let Ok(parsed) = PrimitiveDateTime::parse(value, IMF_FIXDATE) {
        return Some(parsed.assume_utc());
    }
    OffsetDateTime::parse(value, &Rfc2822).ok()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;

    #[test]
    fn formats_imf_fixdate() {
        let formatted = format(datetime!(1994-11-06 08:49:37 UTC)).unwrap();
        assert_eq!(formatted, "Sun, 06 Nov 1994 08:49:37 GMT");
    }

    #[test]
    fn parses_imf_fixdate() {
        let parsed = parse("Sun, 06 Nov 1994 08:49:37 GMT").unwrap();
        assert_eq!(parsed.unix_timestamp(), 784_111_777);
    }

    #[test]
    fn parses_rfc2822_fallback() {
        let parsed = parse("Sun, 6 Nov 1994 08:49:37 +0000").unwrap();
        assert_eq!(parsed.unix_timestamp(), 784_111_777);
    }

    #[test]
    fn round_trips_through_format_and_parse() {
        let original = datetime!(2025-03-01 12:00:00 UTC);
        let parsed = parse(&format(original).unwrap()).unwrap();
        assert_eq!(parsed, original);
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse("not a date").is_none());
        assert!(parse("").is_none());
    }
}
