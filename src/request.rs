//! The client's side of a transformation: query parameters and capability signals.
//!
//! Query parameters are kept as an ordered list of pairs. The dispatch order
//! of directives is the order in which they first appear in the query, so a
//! map would lose information the engine needs.
//!
//! Numeric parameters are read leniently, the way query strings are written
//! by hand: `w=200px` is 200, `quality=abc` is 0, surrounding junk after the
//! number is ignored.

use crate::imaging::StripMode;

/// One inbound request, minus the image bytes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClientRequest {
    params: Vec<(String, String)>,
    /// Raw `Accept` header.
    pub accept: Option<String>,
    /// Raw `DPR` client-hint header.
    pub dpr: Option<String>,
    /// URL advertised in a `Link: rel="canonical"` header.
    pub canonical_url: Option<String>,
}

impl ClientRequest {
    /// Parse an `application/x-www-form-urlencoded` query string.
    ///
    /// A leading `?` is ignored. Duplicate keys keep the position of their
    /// first occurrence and the value of their last.
    pub fn from_query(query: &str) -> Self {
        let query = query.strip_prefix('?').unwrap_or(query);
        let mut params: Vec<(String, String)> = Vec::new();
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            if key.is_empty() {
                continue;
            }
            match params.iter_mut().find(|(k, _)| *k == key) {
                Some(existing) => existing.1 = value.into_owned(),
                None => params.push((key.into_owned(), value.into_owned())),
            }
        }
        Self {
            params,
            ..Self::default()
        }
    }

    pub fn with_accept(mut self, accept: impl Into<String>) -> Self {
        self.accept = Some(accept.into());
        self
    }

    pub fn with_dpr(mut self, dpr: impl Into<String>) -> Self {
        self.dpr = Some(dpr.into());
        self
    }

    pub fn with_canonical_url(mut self, url: impl Into<String>) -> Self {
        self.canonical_url = Some(url.into());
        self
    }

    /// Query pairs in first-appearance order.
    pub fn params(&self) -> &[(String, String)] {
        &self.params
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn has(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// `upscale=1` authorizes output larger than the source.
    pub fn upscale(&self) -> bool {
        self.get("upscale") == Some("1")
    }

    /// Requested quality; `None` when absent or zero.
    pub fn quality(&self) -> Option<i64> {
        self.get("quality").map(parse_int).filter(|&q| q != 0)
    }

    /// Whether a `strip` parameter is present, whatever its value.
    pub fn strip_requested(&self) -> bool {
        self.has("strip")
    }

    /// Recognized `strip` mode.
    pub fn strip(&self) -> Option<StripMode> {
        self.get("strip").and_then(StripMode::parse)
    }

    /// Explicit `zoom` parameter.
    pub fn zoom(&self) -> Option<f64> {
        self.get("zoom").map(parse_float)
    }

    /// `webp=1` forces WebP negotiation regardless of `Accept`.
    pub fn webp_override(&self) -> bool {
        self.get("webp").map(parse_int) == Some(1)
    }

    /// Device-pixel-ratio hint, honoured only when client hints are enabled.
    pub fn dpr_hint(&self, client_hints: bool) -> Option<f64> {
        if !client_hints {
            return None;
        }
        self.dpr.as_deref().map(parse_float)
    }

    /// The client advertises WebP or forces it with `webp=1`.
    pub fn accepts_webp(&self) -> bool {
        self.accept
            .as_deref()
            .is_some_and(|accept| accept.contains("image/webp"))
            || self.webp_override()
    }
}

/// Length of the leading `[+-]digits` prefix of `s`.
fn numeric_prefix(s: &str, allow_fraction: bool) -> usize {
    let bytes = s.as_bytes();
    let mut end = 0;
    if matches!(bytes.first(), Some(b'+' | b'-')) {
        end = 1;
    }
    let digits_start = end;
    while end < bytes.len() && bytes[end].is_ascii_digit() {
        end += 1;
    }
    if allow_fraction && end < bytes.len() && bytes[end] == b'.' {
        let mut frac = end + 1;
        while frac < bytes.len() && bytes[frac].is_ascii_digit() {
            frac += 1;
        }
        if frac > end + 1 || end > digits_start {
            end = frac;
        }
    }
    if end == digits_start {
        return 0;
    }
    end
}

/// Leading integer of `s`, or 0. `"200px"` is 200, `"abc"` is 0.
pub fn parse_int(s: &str) -> i64 {
    let s = s.trim_start();
    let end = numeric_prefix(s, false);
    if end == 0 {
        return 0;
    }
    let digits = &s[..end];
    digits.parse().unwrap_or(if digits.starts_with('-') {
        i64::MIN
    } else {
        i64::MAX
    })
}

/// Leading decimal number of `s`, or 0.
pub fn parse_float(s: &str) -> f64 {
    let s = s.trim_start();
    let end = numeric_prefix(s, true);
    if end == 0 {
        return 0.0;
    }
    s[..end].parse().unwrap_or(0.0)
}
