//! Streaming digests over files on disk.

use std::io::Write;

use execguard::identity::{digest_of, Digest, DigestError, DigestOptions, MIN_BLOCK_SIZE};

#[test]
fn file_digest_matches_in_memory_digest() {
    let mut file = tempfile::NamedTempFile::new().expect("should create temp file");
    file.write_all(b"abc").expect("should write");

    let digest = match digest_of(file.path(), DigestOptions::default()) {
        Ok(digest) => digest,
        Err(err) => panic!("readable file should hash: {err}"),
    };
    assert_eq!(
        digest.as_str(),
        "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
    );
    assert_eq!(digest, Digest::of_bytes(b"abc"));
}

#[test]
fn content_spanning_many_blocks_hashes_whole_prefix() {
    let len = MIN_BLOCK_SIZE.saturating_mul(3).saturating_add(17);
    let content: Vec<u8> = (0..len)
        .map(|i| u8::try_from(i % 251).unwrap_or_default())
        .collect();
    let mut file = tempfile::NamedTempFile::new().expect("should create temp file");
    file.write_all(&content).expect("should write");

    let options = DigestOptions {
        read_limit: None,
        block_size: MIN_BLOCK_SIZE,
    };
    let digest = digest_of(file.path(), options).expect("should hash");
    assert_eq!(digest, Digest::of_bytes(&content));
}

#[test]
fn read_limit_ignores_trailing_bytes() {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let a = dir.path().join("a");
    let b = dir.path().join("b");
    std::fs::write(&a, b"same-prefix-AAAA").expect("should write a");
    std::fs::write(&b, b"same-prefix-BBBB").expect("should write b");

    let limited = DigestOptions {
        read_limit: Some(11),
        ..DigestOptions::default()
    };
    let da = digest_of(&a, limited).expect("should hash a");
    let db = digest_of(&b, limited).expect("should hash b");
    assert_eq!(da, db);
    assert_eq!(da, Digest::of_bytes(b"same-prefix"));

    let full = DigestOptions {
        read_limit: None,
        ..DigestOptions::default()
    };
    assert_ne!(
        digest_of(&a, full).expect("should hash a"),
        digest_of(&b, full).expect("should hash b")
    );
}

#[test]
fn missing_file_is_a_read_error() {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let missing = dir.path().join("nope");
    match digest_of(&missing, DigestOptions::default()) {
        Err(DigestError::Read { path, .. }) => assert_eq!(path, missing),
        other => panic!("expected read error, got {other:?}"),
    }
}

#[test]
fn directory_is_a_read_error() {
    let dir = tempfile::tempdir().expect("should create temp dir");
    assert!(matches!(
        digest_of(dir.path(), DigestOptions::default()),
        Err(DigestError::Read { .. })
    ));
}

#[test]
fn digest_serializes_as_hex_string() {
    let digest = Digest::of_bytes(b"abc");
    let json = serde_json::to_string(&digest).expect("should serialize");
    assert_eq!(json, format!("\"{}\"", digest.as_str()));

    let bad = serde_json::from_str::<Digest>("\"not-a-digest\"");
    assert!(bad.is_err());
}
