//! RFC 7232 preconditions and RFC 7233 single byte ranges.

use chrono::{DateTime, Utc};
use reqwest::Method;
use reqwest::header::{
    HeaderMap, IF_MATCH, IF_MODIFIED_SINCE, IF_NONE_MATCH, IF_RANGE, IF_UNMODIFIED_SINCE, RANGE,
};

/// Formats a timestamp as an HTTP date (`Sun, 06 Nov 1994 08:49:37 GMT`).
pub fn http_date(time: DateTime<Utc>) -> String {
    time.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value.trim())
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cond {
    None,
    True,
    False,
}

/// What the preconditions of a request decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Precondition {
    /// Respond `412 Precondition Failed`.
    Failed,
    /// Respond `304 Not Modified`.
    NotModified,
    /// Serve the file, honoring `range` when present.
    Proceed { range: Option<String> },
}

/// Evaluates the conditional headers of a request against the validators of
/// the file about to be served.
pub fn check_preconditions(
    method: &Method,
    headers: &HeaderMap,
    etag: Option<&str>,
    modified: Option<DateTime<Utc>>,
) -> Precondition {
    let mut cond = check_if_match(headers, etag);
    if cond == Cond::None {
        cond = check_if_unmodified_since(headers, modified);
    }
    if cond == Cond::False {
        return Precondition::Failed;
    }

    let safe = method == Method::GET || method == Method::HEAD;
    match check_if_none_match(headers, etag) {
        Cond::False if safe => return Precondition::NotModified,
        Cond::False => return Precondition::Failed,
        Cond::None if safe && check_if_modified_since(headers, modified) == Cond::False => {
            return Precondition::NotModified;
        }
        _ => {}
    }

    let range = header(headers, RANGE)
        .filter(|_| !(safe && check_if_range(headers, etag, modified) == Cond::False))
        .map(str::to_string);

    Precondition::Proceed { range }
}

fn header(headers: &HeaderMap, name: reqwest::header::HeaderName) -> Option<&str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
}

fn check_if_match(headers: &HeaderMap, etag: Option<&str>) -> Cond {
    let Some(mut buf) = header(headers, IF_MATCH) else {
        return Cond::None;
    };

    loop {
        buf = buf.trim_start();
        if buf.is_empty() {
            break;
        }
        if let Some(rest) = buf.strip_prefix(',') {
            buf = rest;
            continue;
        }
        if buf.starts_with('*') {
            return Cond::True;
        }
        let Some((tag, rest)) = scan_etag(buf) else {
            break;
        };
        if etag.is_some_and(|etag| strong_match(tag, etag)) {
            return Cond::True;
        }
        buf = rest;
    }

    Cond::False
}

fn check_if_unmodified_since(headers: &HeaderMap, modified: Option<DateTime<Utc>>) -> Cond {
    let (Some(value), Some(modified)) = (header(headers, IF_UNMODIFIED_SINCE), modified) else {
        return Cond::None;
    };
    let Some(since) = parse_http_date(value) else {
        return Cond::None;
    };

    if modified.timestamp() <= since.timestamp() {
        Cond::True
    } else {
        Cond::False
    }
}

fn check_if_none_match(headers: &HeaderMap, etag: Option<&str>) -> Cond {
    let Some(mut buf) = header(headers, IF_NONE_MATCH) else {
        return Cond::None;
    };

    loop {
        buf = buf.trim_start();
        if buf.is_empty() {
            break;
        }
        if let Some(rest) = buf.strip_prefix(',') {
            buf = rest;
            continue;
        }
        if buf.starts_with('*') {
            return Cond::False;
        }
        let Some((tag, rest)) = scan_etag(buf) else {
            break;
        };
        if etag.is_some_and(|etag| weak_match(tag, etag)) {
            return Cond::False;
        }
        buf = rest;
    }

    Cond::True
}

fn check_if_modified_since(headers: &HeaderMap, modified: Option<DateTime<Utc>>) -> Cond {
    let (Some(value), Some(modified)) = (header(headers, IF_MODIFIED_SINCE), modified) else {
        return Cond::None;
    };
    let Some(since) = parse_http_date(value) else {
        return Cond::None;
    };

    if modified.timestamp() <= since.timestamp() {
        Cond::False
    } else {
        Cond::True
    }
}

fn check_if_range(headers: &HeaderMap, etag: Option<&str>, modified: Option<DateTime<Utc>>) -> Cond {
    let Some(value) = header(headers, IF_RANGE) else {
        return Cond::None;
    };

    if let Some((tag, _)) = scan_etag(value) {
        return if etag.is_some_and(|etag| strong_match(tag, etag)) {
            Cond::True
        } else {
            Cond::False
        };
    }

    match (modified, parse_http_date(value)) {
        (Some(modified), Some(since)) if modified.timestamp() == since.timestamp() => Cond::True,
        _ => Cond::False,
    }
}

/// Splits the leading entity tag (`"x"` or `W/"x"`) off `s`.
fn scan_etag(s: &str) -> Option<(&str, &str)> {
    let s = s.trim();
    let start = if s.starts_with("W/") { 2 } else { 0 };
    let bytes = s.as_bytes();

    if bytes.len() < start + 2 || bytes[start] != b'"' {
        return None;
    }

    for (i, &c) in bytes.iter().enumerate().skip(start + 1) {
        match c {
            b'"' => return Some((&s[..=i], &s[i + 1..])),
            0x21 | 0x23..=0x7E | 0x80..=0xFF => {}
            _ => return None,
        }
    }

    None
}

fn strong_match(a: &str, b: &str) -> bool {
    a == b && a.starts_with('"')
}

fn weak_match(a: &str, b: &str) -> bool {
    a.trim_start_matches("W/") == b.trim_start_matches("W/")
}

/// Result of applying a `Range` header to a file of known size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteRange {
    /// Serve the whole file.
    Full,
    /// Serve `len` bytes from `start`.
    Partial { start: u64, len: u64 },
    /// Respond `416 Range Not Satisfiable`.
    Unsatisfiable,
}

/// Interprets a `Range` header. Only a single range is honored; several
/// ranges fall back to the full file.
pub fn parse_range(value: &str, size: u64) -> ByteRange {
    let Some(specs) = value.trim().strip_prefix("bytes=") else {
        return ByteRange::Unsatisfiable;
    };

    let mut ranges = Vec::new();
    let mut no_overlap = false;

    for spec in specs.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let Some((start, end)) = spec.split_once('-') else {
            return ByteRange::Unsatisfiable;
        };
        let (start, end) = (start.trim(), end.trim());

        if start.is_empty() {
            // suffix range: the last `end` bytes
            let Ok(suffix) = end.parse::<u64>() else {
                return ByteRange::Unsatisfiable;
            };
            if suffix == 0 || size == 0 {
                no_overlap = true;
                continue;
            }
            let suffix = suffix.min(size);
            ranges.push((size - suffix, suffix));
            continue;
        }

        let Ok(start) = start.parse::<u64>() else {
            return ByteRange::Unsatisfiable;
        };
        if start >= size {
            no_overlap = true;
            continue;
        }

        let len = if end.is_empty() {
            size - start
        } else {
            let Ok(end) = end.parse::<u64>() else {
                return ByteRange::Unsatisfiable;
            };
            if start > end {
                return ByteRange::Unsatisfiable;
            }
            end.min(size - 1) - start + 1
        };
        ranges.push((start, len));
    }

    match ranges.as_slice() {
        [] if no_overlap && size == 0 => ByteRange::Full,
        [] if no_overlap => ByteRange::Unsatisfiable,
        [(start, len)] => ByteRange::Partial {
            start: *start,
            len: *len,
        },
        _ => ByteRange::Full,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use reqwest::header::HeaderValue;

    fn headers(pairs: &[(reqwest::header::HeaderName, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(name.clone(), HeaderValue::from_str(value).unwrap());
        }
        map
    }

    fn modified() -> Option<DateTime<Utc>> {
        Some(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap())
    }

    const ETAG: Option<&str> = Some("\"abc\"");

    #[test]
    fn test_http_date_round_trip() {
        let time = modified().unwrap();
        assert_eq!(http_date(time), "Fri, 01 Mar 2024 12:00:00 GMT");
        assert_eq!(parse_http_date(&http_date(time)), Some(time));
    }

    #[test]
    fn test_no_conditions_proceed() {
        assert_eq!(
            check_preconditions(&Method::GET, &HeaderMap::new(), ETAG, modified()),
            Precondition::Proceed { range: None }
        );
    }

    #[test]
    fn test_if_none_match() {
        let cases = [
            ("\"abc\"", Precondition::NotModified),
            ("W/\"abc\"", Precondition::NotModified),
            ("\"x\", \"abc\"", Precondition::NotModified),
            ("*", Precondition::NotModified),
            ("\"other\"", Precondition::Proceed { range: None }),
        ];

        for (value, expected) in cases {
            let h = headers(&[(IF_NONE_MATCH, value)]);
            assert_eq!(check_preconditions(&Method::GET, &h, ETAG, modified()), expected, "{value}");
        }

        let h = headers(&[(IF_NONE_MATCH, "\"abc\"")]);
        assert_eq!(
            check_preconditions(&Method::POST, &h, ETAG, modified()),
            Precondition::Failed
        );
    }

    #[test]
    fn test_if_match_uses_strong_comparison() {
        let h = headers(&[(IF_MATCH, "\"abc\"")]);
        assert!(matches!(
            check_preconditions(&Method::GET, &h, ETAG, modified()),
            Precondition::Proceed { .. }
        ));

        let h = headers(&[(IF_MATCH, "W/\"abc\"")]);
        assert_eq!(
            check_preconditions(&Method::GET, &h, ETAG, modified()),
            Precondition::Failed
        );

        let h = headers(&[(IF_MATCH, "\"abc\"")]);
        assert_eq!(
            check_preconditions(&Method::GET, &h, None, modified()),
            Precondition::Failed
        );
    }

    #[test]
    fn test_modified_since() {
        let h = headers(&[(IF_MODIFIED_SINCE, "Fri, 01 Mar 2024 12:00:00 GMT")]);
        assert_eq!(
            check_preconditions(&Method::GET, &h, None, modified()),
            Precondition::NotModified
        );

        let h = headers(&[(IF_MODIFIED_SINCE, "Thu, 29 Feb 2024 12:00:00 GMT")]);
        assert!(matches!(
            check_preconditions(&Method::GET, &h, None, modified()),
            Precondition::Proceed { .. }
        ));

        // If-None-Match takes precedence
        let h = headers(&[
            (IF_NONE_MATCH, "\"other\""),
            (IF_MODIFIED_SINCE, "Fri, 01 Mar 2024 12:00:00 GMT"),
        ]);
        assert!(matches!(
            check_preconditions(&Method::GET, &h, ETAG, modified()),
            Precondition::Proceed { .. }
        ));
    }

    #[test]
    fn test_unmodified_since() {
        let h = headers(&[(IF_UNMODIFIED_SINCE, "Thu, 29 Feb 2024 12:00:00 GMT")]);
        assert_eq!(
            check_preconditions(&Method::GET, &h, None, modified()),
            Precondition::Failed
        );

        let h = headers(&[(IF_UNMODIFIED_SINCE, "Fri, 01 Mar 2024 12:00:00 GMT")]);
        assert!(matches!(
            check_preconditions(&Method::GET, &h, None, modified()),
            Precondition::Proceed { .. }
        ));
    }

    #[test]
    fn test_if_range() {
        let h = headers(&[(RANGE, "bytes=0-1"), (IF_RANGE, "\"abc\"")]);
        assert_eq!(
            check_preconditions(&Method::GET, &h, ETAG, modified()),
            Precondition::Proceed {
                range: Some("bytes=0-1".into())
            }
        );

        let h = headers(&[(RANGE, "bytes=0-1"), (IF_RANGE, "\"stale\"")]);
        assert_eq!(
            check_preconditions(&Method::GET, &h, ETAG, modified()),
            Precondition::Proceed { range: None }
        );

        let h = headers(&[(RANGE, "bytes=0-1"), (IF_RANGE, "Fri, 01 Mar 2024 12:00:00 GMT")]);
        assert_eq!(
            check_preconditions(&Method::GET, &h, ETAG, modified()),
            Precondition::Proceed {
                range: Some("bytes=0-1".into())
            }
        );
    }

    #[test]
    fn test_parse_range() {
        assert_eq!(parse_range("bytes=0-4", 10), ByteRange::Partial { start: 0, len: 5 });
        assert_eq!(parse_range("bytes=5-", 10), ByteRange::Partial { start: 5, len: 5 });
        assert_eq!(parse_range("bytes=-3", 10), ByteRange::Partial { start: 7, len: 3 });
        assert_eq!(parse_range("bytes=-30", 10), ByteRange::Partial { start: 0, len: 10 });
        assert_eq!(parse_range("bytes=8-100", 10), ByteRange::Partial { start: 8, len: 2 });
        assert_eq!(parse_range("bytes=0-1,4-5", 10), ByteRange::Full);
        assert_eq!(parse_range("bytes=10-", 10), ByteRange::Unsatisfiable);
        assert_eq!(parse_range("bytes=5-2", 10), ByteRange::Unsatisfiable);
        assert_eq!(parse_range("items=0-1", 10), ByteRange::Unsatisfiable);
        assert_eq!(parse_range("bytes=0-", 0), ByteRange::Full);
    }

    #[test]
    fn test_scan_etag() {
        assert_eq!(scan_etag("\"a\", \"b\""), Some(("\"a\"", ", \"b\"")));
        assert_eq!(scan_etag("W/\"a\""), Some(("W/\"a\"", "")));
        assert_eq!(scan_etag("a"), None);
        assert_eq!(scan_etag("\"unterminated"), None);
    }
}
