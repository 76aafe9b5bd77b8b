use http::{HeaderMap, Method};

/// Targets whose payloads are already compressed; negotiating an encoding for
/// them only fragments the cache.
const PRECOMPRESSED_EXTENSIONS: &[&str] = &[
    ".jpg", ".jpeg", ".png", ".gif", ".mp3", ".ogg", ".mp4", ".pdf", ".zip",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentEncoding {
    Brotli,
    Gzip,
    Deflate,
}

impl ContentEncoding {
    pub fn as_str(self) -> &'static str {
        match self {
            ContentEncoding::Brotli => "br",
            ContentEncoding::Gzip => "gzip",
            ContentEncoding::Deflate => "deflate",
        }
    }
}

/// Collapses a raw `Accept-Encoding` value onto a single token using the fixed
/// preference `br > gzip > deflate`. Tokens carrying `q=0` are refused by the
/// client and do not count.
pub fn normalized_accept_encoding(
    target: &str,
    accept_encoding: Option<&str>,
) -> Option<ContentEncoding> {
    if PRECOMPRESSED_EXTENSIONS
        .iter()
        .any(|ext| target.ends_with(ext))
    {
        return None;
    }
    let raw = accept_encoding?;

    let mut best: Option<ContentEncoding> = None;
    for item in raw.split(',') {
        let mut parts = item.split(';');
        let token = parts.next().unwrap_or("").trim();
        let refused = parts.any(|param| {
            let param = param.trim();
            param
                .strip_prefix("q=")
                .and_then(|q| q.trim().parse::<f32>().ok())
                .map(|q| q <= 0.0)
                .unwrap_or(false)
        });
        if refused {
            continue;
        }
        let candidate = if token.eq_ignore_ascii_case("br") {
            ContentEncoding::Brotli
        } else if token.eq_ignore_ascii_case("gzip") {
            ContentEncoding::Gzip
        } else if token.eq_ignore_ascii_case("deflate") {
            ContentEncoding::Deflate
        } else {
            continue;
        };
        best = Some(match best {
            Some(current) if rank(current) <= rank(candidate) => current,
            _ => candidate,
        });
    }
    best
}

fn rank(encoding: ContentEncoding) -> u8 {
    match encoding {
        ContentEncoding::Brotli => 0,
        ContentEncoding::Gzip => 1,
        ContentEncoding::Deflate => 2,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey {
    key_base: String,
    entry_id: String,
    encoding: Option<ContentEncoding>,
}

impl CacheKey {
    pub fn new(method: &Method, target: &str, encoding: Option<ContentEncoding>) -> Self {
        let key_base = format!(
            "{}--{}--{}",
            method,
            target,
            encoding.map(ContentEncoding::as_str).unwrap_or("")
        );
        let entry_id = Self::entry_id_for_key(&key_base);
        Self {
            key_base,
            entry_id,
            encoding,
        }
    }

    /// Derives the key for an inbound request from its method, target and
    /// `Accept-Encoding` header.
    pub fn for_request(method: &Method, target: &str, headers: &HeaderMap) -> Self {
        let accept = headers
            .get(http::header::ACCEPT_ENCODING)
            .and_then(|value| value.to_str().ok());
        Self::new(method, target, normalized_accept_encoding(target, accept))
    }

    pub fn key_base(&self) -> &str {
        &self.key_base
    }

    /// Stable filesystem-safe identifier for this key.
    pub fn entry_id(&self) -> &str {
        &self.entry_id
    }

    pub fn encoding(&self) -> Option<ContentEncoding> {
        self.encoding
    }

    pub(super) fn entry_id_for_key(key_base: &str) -> String {
        blake3::hash(key_base.as_bytes()).to_hex().to_string()
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.key_base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_header_has_no_encoding() {
        assert_eq!(normalized_accept_encoding("/foo", None), None);
    }

    #[test]
    fn gzip_only() {
        assert_eq!(
            normalized_accept_encoding("/foo", Some("gzip")),
            Some(ContentEncoding::Gzip)
        );
    }

    #[test]
    fn brotli_preferred_regardless_of_order() {
        assert_eq!(
            normalized_accept_encoding("/foo", Some("gzip, br")),
            Some(ContentEncoding::Brotli)
        );
        assert_eq!(
            normalized_accept_encoding("/foo", Some("deflate, gzip;q=0.5")),
            Some(ContentEncoding::Gzip)
        );
    }

    #[test]
    fn precompressed_targets_ignore_header() {
        assert_eq!(normalized_accept_encoding("/foo.jpg", Some("gzip, br")), None);
        assert_eq!(normalized_accept_encoding("/a/b.zip", Some("br")), None);
    }

    #[test]
    fn unknown_or_refused_encodings_are_dropped() {
        assert_eq!(normalized_accept_encoding("/foo", Some("identity, zstd")), None);
        assert_eq!(
            normalized_accept_encoding("/foo", Some("br;q=0, deflate")),
            Some(ContentEncoding::Deflate)
        );
    }

    #[test]
    fn key_separates_method_target_and_encoding() {
        let get = CacheKey::new(&Method::GET, "/count", Some(ContentEncoding::Gzip));
        assert_eq!(get.key_base(), "GET--/count--gzip");
        let head = CacheKey::new(&Method::HEAD, "/count", Some(ContentEncoding::Gzip));
        let plain = CacheKey::new(&Method::GET, "/count", None);
        assert_eq!(plain.key_base(), "GET--/count--");
        assert_ne!(get.entry_id(), head.entry_id());
        assert_ne!(get.entry_id(), plain.entry_id());
        assert_eq!(get.entry_id().len(), 64);
    }

    #[test]
    fn key_from_request_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::ACCEPT_ENCODING,
            http::HeaderValue::from_static("gzip, deflate, br"),
        );
        let key = CacheKey::for_request(&Method::GET, "/index.html?x=1", &headers);
        assert_eq!(key.encoding(), Some(ContentEncoding::Brotli));
        assert_eq!(key.key_base(), "GET--/index.html?x=1--br");
    }
}
