use reqwest::header::{ACCEPT_ENCODING, HeaderMap, RANGE};

use crate::vfs::{FileInfo, Root};

/// Precompressed siblings in server preference order.
const COMPRESSED_ENCODINGS: [(&str, &str); 2] = [("br", ".br"), ("gzip", ".gz")];

/// A precompressed sibling chosen for the response.
#[derive(Debug, Clone)]
pub struct Variant {
    pub encoding: &'static str,
    pub path: String,
    pub info: FileInfo,
}

/// Picks the `.br` or `.gz` sibling of `path` that the client accepts, if
/// any. Ranged requests always get the identity file.
pub async fn negotiate_variant(root: &dyn Root, headers: &HeaderMap, path: &str) -> Option<Variant> {
    if headers.contains_key(RANGE) {
        return None;
    }

    let mut available = Vec::with_capacity(COMPRESSED_ENCODINGS.len());
    for (encoding, extension) in COMPRESSED_ENCODINGS {
        let variant_path = format!("{path}{extension}");

        // symlinked variants are ignored
        if let Ok(info) = root.lstat(&variant_path).await
            && info.is_regular()
        {
            available.push(Variant {
                encoding,
                path: variant_path,
                info,
            });
        }
    }

    if available.is_empty() {
        return None;
    }

    let accept = accept_encoding(headers);
    let mut offers: Vec<&str> = available.iter().map(|v| v.encoding).collect();
    offers.push("identity");

    let chosen = negotiate(&accept, &offers)?;
    available.into_iter().find(|v| v.encoding == chosen)
}

fn accept_encoding(headers: &HeaderMap) -> Vec<(String, f32)> {
    headers
        .get_all(ACCEPT_ENCODING)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(parse_spec)
        .collect()
}

fn parse_spec(spec: &str) -> Option<(String, f32)> {
    let mut parts = spec.split(';');
    let value = parts.next()?.trim();
    if value.is_empty() {
        return None;
    }

    let mut q = 1.0;
    for param in parts {
        if let Some((name, raw)) = param.split_once('=')
            && name.trim().eq_ignore_ascii_case("q")
        {
            q = raw.trim().parse().ok()?;
        }
    }

    Some((value.to_ascii_lowercase(), q))
}

/// Returns the offer with the highest q-value, earlier offers winning ties.
/// `identity` when the client sent no preference, `None` when everything it
/// listed is refused with `q=0`.
fn negotiate<'a>(accept: &[(String, f32)], offers: &[&'a str]) -> Option<&'a str> {
    let mut best = "identity";
    let mut best_q = -1.0;

    for &offer in offers {
        for (value, q) in accept {
            if *q > best_q && (value == "*" || value == offer) {
                best_q = *q;
                best = offer;
            }
        }
    }

    if best_q == 0.0 { None } else { Some(best) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::local::LocalVfs;
    use reqwest::header::HeaderValue;

    fn accept(value: &str) -> Vec<(String, f32)> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT_ENCODING, HeaderValue::from_str(value).unwrap());
        accept_encoding(&headers)
    }

    #[test]
    fn test_negotiate() {
        let offers = ["br", "gzip", "identity"];

        assert_eq!(negotiate(&[], &offers), Some("identity"));
        assert_eq!(negotiate(&accept("gzip, br"), &offers), Some("br"));
        assert_eq!(negotiate(&accept("gzip"), &offers), Some("gzip"));
        assert_eq!(negotiate(&accept("br;q=0.5, gzip;q=0.8"), &offers), Some("gzip"));
        assert_eq!(negotiate(&accept("*"), &offers), Some("br"));
        assert_eq!(negotiate(&accept("deflate"), &offers), Some("identity"));
        assert_eq!(negotiate(&accept("*;q=0"), &offers), None);
    }

    #[tokio::test]
    async fn test_negotiate_variant() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("app.js"), "plain").unwrap();
        std::fs::write(dir.path().join("app.js.gz"), "gz").unwrap();
        std::fs::write(dir.path().join("app.js.br"), "br").unwrap();
        let root = LocalVfs::new()
            .local_root(&dir.path().to_string_lossy())
            .await
            .unwrap();

        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("gzip, br"));
        let variant = negotiate_variant(&root, &headers, "app.js").await.unwrap();
        assert_eq!(variant.encoding, "br");
        assert_eq!(variant.path, "app.js.br");
        assert_eq!(variant.info.size, 2);

        headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("gzip"));
        let variant = negotiate_variant(&root, &headers, "app.js").await.unwrap();
        assert_eq!(variant.path, "app.js.gz");

        headers.insert(RANGE, HeaderValue::from_static("bytes=0-1"));
        assert!(negotiate_variant(&root, &headers, "app.js").await.is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlinked_variant_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("app.js"), "plain").unwrap();
        std::fs::write(dir.path().join("other.gz"), "gz").unwrap();
        std::os::unix::fs::symlink("other.gz", dir.path().join("app.js.gz")).unwrap();
        let root = LocalVfs::new()
            .local_root(&dir.path().to_string_lossy())
            .await
            .unwrap();

        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("gzip"));
        assert!(negotiate_variant(&root, &headers, "app.js").await.is_none());
    }
}
