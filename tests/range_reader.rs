mod common;

use std::io::SeekFrom;
use tokio::io::AsyncReadExt;

use common::{TestServer, client};
use pages_vfs::{RangeReader, RangedReader, ReadAt, Resource, VfsError};

fn reference(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

async fn serve_reference(len: usize) -> (TestServer, Vec<u8>) {
    let server = TestServer::start().await;
    let data = reference(len);
    server.put("object.bin", data.clone());
    (server, data)
}

#[tokio::test]
async fn test_probe_records_metadata() {
    let (server, data) = serve_reference(4096).await;
    let resource = Resource::new(client(), server.url("object.bin")).await.unwrap();

    assert_eq!(resource.size(), data.len() as u64);
    assert_eq!(resource.etag(), Some("\"v0\""));
    assert!(resource.is_valid());
    assert_eq!(server.probe_count(), 1);
}

#[tokio::test]
async fn test_missing_object_is_not_found() {
    let server = TestServer::start().await;
    let err = Resource::new(client(), server.url("missing.zip")).await.unwrap_err();
    assert!(matches!(err, VfsError::NotFound(_)));
}

#[tokio::test]
async fn test_read_after_seek_returns_reference_bytes() {
    let (server, data) = serve_reference(10_000).await;
    let resource = Resource::new(client(), server.url("object.bin")).await.unwrap();

    for (offset, len) in [(0, 1), (0, 10_000), (1, 999), (4096, 4096), (9_999, 1), (5_000, 0)] {
        let mut reader = RangeReader::new(resource.clone(), offset, len);
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.unwrap();
        assert_eq!(
            buf,
            &data[offset as usize..(offset + len) as usize],
            "window {offset}+{len}"
        );
    }

    // seeking inside a window
    let mut reader = RangeReader::new(resource.clone(), 1000, 2000);
    reader.seek(SeekFrom::Start(500)).unwrap();
    let mut buf = vec![0u8; 100];
    reader.read_exact(&mut buf).await.unwrap();
    assert_eq!(buf, &data[1500..1600]);

    reader.seek(SeekFrom::End(-10)).unwrap();
    let mut buf = Vec::new();
    reader.read_to_end(&mut buf).await.unwrap();
    assert_eq!(buf, &data[2990..3000]);
}

#[tokio::test]
async fn test_reads_outside_the_window_fail() {
    let (server, _) = serve_reference(1000).await;
    let resource = Resource::new(client(), server.url("object.bin")).await.unwrap();

    let mut reader = RangeReader::new(resource.clone(), 100, 100);
    assert!(matches!(
        reader.seek(SeekFrom::Start(101)),
        Err(VfsError::OutsideRange)
    ));
    assert!(matches!(
        reader.seek(SeekFrom::Current(-1)),
        Err(VfsError::OutsideRange)
    ));

    let ranged = RangedReader::new(resource.clone());
    let mut buf = vec![0u8; 10];
    assert!(matches!(
        ranged.read_at(995, &mut buf).await,
        Err(VfsError::InvalidRange)
    ));
    assert!(matches!(ranged.section(1000, 1), Err(VfsError::InvalidRange)));

    // a window past the end of the object never issues a request
    let before = server.request_count();
    let mut reader = RangeReader::new(resource, 900, 200);
    let err = reader.read(&mut buf).await.unwrap_err();
    assert!(matches!(err, VfsError::InvalidRange));
    assert_eq!(server.request_count(), before);
}

#[tokio::test]
async fn test_cached_session_reuses_one_response() {
    const CHUNK: usize = 1024;
    const CHUNKS: usize = 8;

    let (server, data) = serve_reference(CHUNK * CHUNKS).await;
    let resource = Resource::new(client(), server.url("object.bin")).await.unwrap();
    let ranged = RangedReader::new(resource.clone());

    let before = resource.requests();
    for i in 0..CHUNKS {
        let mut buf = vec![0u8; CHUNK];
        ranged.read_at((i * CHUNK) as u64, &mut buf).await.unwrap();
        assert_eq!(buf, &data[i * CHUNK..(i + 1) * CHUNK]);
    }
    assert_eq!(resource.requests() - before, CHUNKS as u64);

    let cached = ranged.cached();
    let before = resource.requests();
    for i in 0..CHUNKS {
        let mut buf = vec![0u8; CHUNK];
        cached.read_at((i * CHUNK) as u64, &mut buf).await.unwrap();
        assert_eq!(buf, &data[i * CHUNK..(i + 1) * CHUNK]);
    }
    assert_eq!(resource.requests() - before, 1);
}

#[tokio::test]
async fn test_changed_content_invalidates_resource() {
    let (server, _) = serve_reference(2048).await;
    let resource = Resource::new(client(), server.url("object.bin")).await.unwrap();
    let ranged = RangedReader::new(resource.clone());

    server.put("object.bin", reference(2048).into_iter().rev().collect());

    let mut buf = vec![0u8; 16];
    assert!(matches!(
        ranged.read_at(0, &mut buf).await,
        Err(VfsError::ContentChanged)
    ));
    assert!(!resource.is_valid());

    // no further requests once invalid
    let before = server.request_count();
    assert!(matches!(
        ranged.read_at(100, &mut buf).await,
        Err(VfsError::ContentChanged)
    ));
    assert_eq!(server.request_count(), before);
}

#[tokio::test]
async fn test_full_response_to_ranged_read_is_rejected() {
    let (server, _) = serve_reference(2048).await;
    server.ignore_ranges(true);

    let resource = Resource::new(client(), server.url("object.bin")).await.unwrap();
    assert_eq!(resource.size(), 2048);

    let ranged = RangedReader::new(resource.clone());
    let mut buf = vec![0u8; 16];
    assert!(matches!(
        ranged.read_at(100, &mut buf).await,
        Err(VfsError::RangeRequestsNotSupported)
    ));
    assert!(!resource.is_valid());

    server.ignore_ranges(false);
    assert!(matches!(
        ranged.read_at(0, &mut buf).await,
        Err(VfsError::RangeRequestsNotSupported)
    ));
}
