use tokio::io::AsyncReadExt;

use crate::error::VfsResult;
use crate::vfs::Root;

const SNIFF_LEN: usize = 512;

const HTML_TAGS: &[&[u8]] = &[
    b"<!DOCTYPE HTML",
    b"<HTML",
    b"<HEAD",
    b"<SCRIPT",
    b"<IFRAME",
    b"<H1",
    b"<DIV",
    b"<FONT",
    b"<TABLE",
    b"<A",
    b"<STYLE",
    b"<TITLE",
    b"<B",
    b"<BODY",
    b"<BR",
    b"<P",
    b"<!--",
];

const SIGNATURES: &[(&[u8], &str)] = &[
    (b"%PDF-", "application/pdf"),
    (b"%!PS-Adobe-", "application/postscript"),
    (b"\xFE\xFF", "text/plain; charset=utf-16be"),
    (b"\xFF\xFE", "text/plain; charset=utf-16le"),
    (b"\xEF\xBB\xBF", "text/plain; charset=utf-8"),
    (b"GIF87a", "image/gif"),
    (b"GIF89a", "image/gif"),
    (b"\x89PNG\x0D\x0A\x1A\x0A", "image/png"),
    (b"\xFF\xD8\xFF", "image/jpeg"),
    (b"\x00\x00\x01\x00", "image/x-icon"),
    (b"BM", "image/bmp"),
    (b"wOFF", "font/woff"),
    (b"wOF2", "font/woff2"),
    (b"\x1F\x8B\x08", "application/x-gzip"),
    (b"PK\x03\x04", "application/zip"),
    (b"\x00asm", "application/wasm"),
];

/// Content type of `path`: by extension first, then by sniffing the first
/// bytes of the file.
pub async fn detect_content_type(root: &dyn Root, path: &str) -> VfsResult<String> {
    let extension = extension(path);

    let content_type = match by_extension(extension) {
        Some(content_type) => content_type,
        None => {
            let mut file = root.open(path).await?;
            let mut buf = Vec::with_capacity(SNIFF_LEN);
            // short or failing reads still sniff whatever arrived
            let _ = (&mut file).take(SNIFF_LEN as u64).read_to_end(&mut buf).await;
            sniff(&buf).to_string()
        }
    };

    if content_type == "application/octet-stream" && extension == "avif" {
        return Ok("image/avif".to_string());
    }

    Ok(content_type)
}

fn extension(path: &str) -> &str {
    let base = path.rsplit('/').next().unwrap_or(path);
    base.rsplit_once('.').map(|(_, ext)| ext).unwrap_or("")
}

fn by_extension(extension: &str) -> Option<String> {
    if extension.is_empty() {
        return None;
    }

    let mime = mime_guess::from_ext(extension).first()?;
    if mime.type_() == mime_guess::mime::TEXT || mime.subtype() == mime_guess::mime::JAVASCRIPT {
        Some(format!("{}; charset=utf-8", mime.essence_str()))
    } else {
        Some(mime.essence_str().to_string())
    }
}

/// A small subset of the WHATWG MIME sniffing algorithm.
fn sniff(data: &[u8]) -> &'static str {
    let data = &data[..data.len().min(SNIFF_LEN)];

    let start = data
        .iter()
        .position(|&b| !matches!(b, b'\t' | b'\n' | 0x0C | b'\r' | b' '))
        .unwrap_or(data.len());
    let trimmed = &data[start..];

    for tag in HTML_TAGS {
        if is_html_tag(trimmed, tag) {
            return "text/html; charset=utf-8";
        }
    }

    if trimmed.starts_with(b"<?xml") {
        return "text/xml; charset=utf-8";
    }

    for (signature, content_type) in SIGNATURES {
        if data.starts_with(signature) {
            return *content_type;
        }
    }

    if data.len() >= 14 && data.starts_with(b"RIFF") && &data[8..14] == b"WEBPVP" {
        return "image/webp";
    }

    if data.iter().any(|&b| is_binary(b)) {
        "application/octet-stream"
    } else {
        "text/plain; charset=utf-8"
    }
}

fn is_html_tag(data: &[u8], tag: &[u8]) -> bool {
    if data.len() <= tag.len() || !data[..tag.len()].eq_ignore_ascii_case(tag) {
        return false;
    }
    matches!(data[tag.len()], b' ' | b'>')
}

fn is_binary(b: u8) -> bool {
    matches!(b, 0x00..=0x08 | 0x0B | 0x0E..=0x1A | 0x1C..=0x1F)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::local::LocalVfs;

    #[test]
    fn test_by_extension() {
        assert_eq!(by_extension("html").unwrap(), "text/html; charset=utf-8");
        assert_eq!(by_extension("css").unwrap(), "text/css; charset=utf-8");
        assert_eq!(by_extension("png").unwrap(), "image/png");
        assert!(by_extension("").is_none());
        assert!(by_extension("definitely-not-a-type").is_none());
    }

    #[test]
    fn test_sniff() {
        assert_eq!(sniff(b"  <!doctype html><html>"), "text/html; charset=utf-8");
        assert_eq!(sniff(b"<p>hi</p>"), "text/html; charset=utf-8");
        assert_eq!(sniff(b"<?xml version=\"1.0\"?>"), "text/xml; charset=utf-8");
        assert_eq!(sniff(b"\x89PNG\r\n\x1a\n\0\0"), "image/png");
        assert_eq!(sniff(b"just some words"), "text/plain; charset=utf-8");
        assert_eq!(sniff(b"\x00\x01\x02garbage"), "application/octet-stream");
        assert_eq!(sniff(b""), "text/plain; charset=utf-8");
    }

    #[test]
    fn test_extension() {
        assert_eq!(extension("a/b/file.tar.gz"), "gz");
        assert_eq!(extension("dir.d/README"), "");
        assert_eq!(extension("noext"), "");
    }

    #[tokio::test]
    async fn test_detect_content_type() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("page"), "<html><body>x</body></html>").unwrap();
        std::fs::write(dir.path().join("style.css"), "\x00 not sniffed").unwrap();
        let root = LocalVfs::new()
            .local_root(&dir.path().to_string_lossy())
            .await
            .unwrap();

        assert_eq!(
            detect_content_type(&root, "page").await.unwrap(),
            "text/html; charset=utf-8"
        );
        assert_eq!(
            detect_content_type(&root, "style.css").await.unwrap(),
            "text/css; charset=utf-8"
        );
        assert!(detect_content_type(&root, "missing").await.unwrap_err().is_not_found());
    }
}
