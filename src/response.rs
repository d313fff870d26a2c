//! Response headers for a transformed image.
//!
//! Headers are assembled as an ordered list; the order is part of the
//! output and is covered by tests.

use crate::config::ProxyConfig;
use crate::engine::Transformed;
use crate::imaging::MimeType;
use sha2::{Digest, Sha256};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const WEEKDAYS: [&str; 7] = ["Thu", "Fri", "Sat", "Sun", "Mon", "Tue", "Wed"];
const MONTHS: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];

/// Characters of the SHA-256 hex digest kept in an ETag.
const ETAG_LEN: usize = 16;

/// Header name/value pairs in emission order.
pub type Headers = Vec<(&'static str, String)>;

fn unix_seconds(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Year, month (1-12) and day of a day count since 1970-01-01.
fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = (if mp < 10 { mp + 3 } else { mp - 9 }) as u32;
    let year = yoe + era * 400 + i64::from(month <= 2);
    (year, month, day)
}

/// RFC 1123 date, as used by `Last-Modified` and `Expires`.
pub fn http_date(time: SystemTime) -> String {
    let secs = unix_seconds(time) as i64;
    let days = secs.div_euclid(86_400);
    let rem = secs.rem_euclid(86_400);
    let (year, month, day) = civil_from_days(days);
    format!(
        "{}, {:02} {} {} {:02}:{:02}:{:02} GMT",
        WEEKDAYS[days.rem_euclid(7) as usize],
        day,
        MONTHS[month as usize - 1],
        year,
        rem / 3600,
        rem % 3600 / 60,
        rem % 60
    )
}

/// Weak validator derived from the body length and modification time.
pub fn etag(size: usize, modified: SystemTime) -> String {
    let digest = Sha256::digest(format!("{size}.{}", unix_seconds(modified)));
    let hex = format!("{digest:x}");
    format!("\"{}\"", &hex[..ETAG_LEN])
}

/// Headers for `transformed`.
///
/// `modified` is the source's modification time, `now` the response time.
pub fn headers(
    config: &ProxyConfig,
    transformed: &Transformed,
    canonical_url: Option<&str>,
    modified: SystemTime,
    now: SystemTime,
) -> Headers {
    let size = transformed.bytes.len();
    let mime = transformed.mime_type();
    let response = &config.response;
    let mut headers: Headers = vec![
        ("Content-Length", size.to_string()),
        ("Content-Type", mime.as_str().to_string()),
        ("Last-Modified", http_date(modified)),
    ];

    if let Some(max_age) = response.max_age {
        headers.push(("Expires", http_date(now + Duration::from_secs(max_age))));
        headers.push(("Cache-Control", format!("public, max-age={max_age}")));
    }
    if let Some(url) = canonical_url {
        headers.push(("Link", format!("<{url}>; rel=\"canonical\"")));
    }
    if response.nosniff {
        headers.push(("X-Content-Type-Options", "nosniff".to_string()));
    }
    if response.etag && size > 0 {
        headers.push(("ETag", etag(size, modified)));
    }
    let saved = transformed.subject.bytes_saved;
    if response.bytes_saved && saved > 0 {
        headers.push(("X-Bytes-Saved", saved.to_string()));
    }
    if config.optimizers.disabled {
        headers.push(("X-Optim-Disabled", "true".to_string()));
    }
    if config.optimizers.cwebp().is_some() && mime != MimeType::Gif {
        headers.push(("Vary", "Accept".to_string()));
    }
    if let Some(dpr) = transformed.subject.content_dpr {
        headers.push(("Content-DPR", dpr.to_string()));
    }
    headers
}
