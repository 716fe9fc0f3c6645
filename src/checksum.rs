//! Three-level checksum verification.
//!
//! 1. **Envelope format** — the `sha256:<64 hex>` shape was validated at
//!    parse time; [`assert_envelope_format`] re-asserts it here as a
//!    precondition before any hashing starts.
//! 2. **Archive digest** — [`verify_archive_checksum`] recomputes the
//!    SHA-256 of the downloaded archive with a streaming 1 MiB buffer and
//!    compares it to the envelope value.
//! 3. **Manifest** — [`verify_manifest`] parses `checksums.sha256`
//!    (`<hex>  <relative-path>` per line) and verifies every extracted file
//!    against it. Missing files, files on disk that the manifest does not
//!    list, malformed lines, and digest mismatches all fail.
//!
//! Digest comparisons are constant-time. Every failure maps to the
//! non-retryable `checksum_mismatch`.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::error::{StageError, StageResult};

/// Streaming read buffer for archive hashing.
const HASH_BUF_SIZE: usize = 1024 * 1024;

/// File name of the in-archive manifest.
pub const MANIFEST_NAME: &str = "checksums.sha256";

/// Re-assert the envelope checksum shape (64 lowercase hex characters).
pub fn assert_envelope_format(checksum_hex: &str) -> StageResult<()> {
    let well_formed = checksum_hex.len() == 64
        && checksum_hex
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
    if !well_formed {
        return Err(StageError::checksum(format!(
            "envelope checksum '{checksum_hex}' is not 64 lowercase hex characters"
        )));
    }
    Ok(())
}

/// Compute the lowercase hex SHA-256 of a file, streaming in 1 MiB reads.
pub fn file_sha256(path: &Path) -> StageResult<String> {
    let mut file = std::fs::File::open(path).map_err(|e| {
        StageError::checksum(format!("cannot open '{}' for hashing: {e}", path.display()))
    })?;

    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_BUF_SIZE];
    loop {
        let n = file
            .read(&mut buf)
            .map_err(|e| StageError::checksum(format!("read failed while hashing: {e}")))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Constant-time comparison of two hex digests.
///
/// Length differences short-circuit; equal-length inputs are compared
/// without data-dependent branching.
fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes().zip(b.bytes()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Verify the downloaded archive against the envelope checksum.
pub fn verify_archive_checksum(archive: &Path, expected_hex: &str) -> StageResult<()> {
    assert_envelope_format(expected_hex)?;
    let actual = file_sha256(archive)?;
    if !constant_time_eq(&actual, expected_hex) {
        return Err(StageError::checksum(format!(
            "archive digest mismatch: expected {expected_hex}, computed {actual}"
        )));
    }
    Ok(())
}

/// One `<hex>  <relative-path>` manifest line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub digest_hex: String,
    pub relative_path: String,
}

/// Parse manifest content. Blank lines and `#` comments are tolerated;
/// anything else that does not match the line format is an error.
pub fn parse_manifest(content: &str) -> StageResult<Vec<ManifestEntry>> {
    let mut entries = Vec::new();

    for (idx, raw) in content.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let (digest, path) = match line.find("  ") {
            Some(pos) => (&line[..pos], line[pos..].trim_start()),
            None => {
                return Err(StageError::checksum(format!(
                    "manifest line {} is malformed: '{raw}'",
                    idx + 1
                )))
            }
        };

        let digest_ok = digest.len() == 64
            && digest
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if !digest_ok || path.is_empty() {
            return Err(StageError::checksum(format!(
                "manifest line {} has a bad digest or path: '{raw}'",
                idx + 1
            )));
        }

        entries.push(ManifestEntry {
            digest_hex: digest.to_string(),
            relative_path: path.to_string(),
        });
    }

    if entries.is_empty() {
        return Err(StageError::checksum("manifest lists no files"));
    }
    Ok(entries)
}

/// Verify every extracted file against the manifest.
///
/// `require_self_listing` selects the policy for the manifest's own entry:
/// when true the manifest must list itself (the line is skipped rather than
/// hashed — a file cannot contain its own digest); when false a
/// self-listing is tolerated but not demanded. Returns the number of files
/// whose digests were verified.
pub fn verify_manifest(extract_root: &Path, require_self_listing: bool) -> StageResult<usize> {
    let manifest_path = extract_root.join(MANIFEST_NAME);
    let content = std::fs::read_to_string(&manifest_path)
        .map_err(|e| StageError::checksum(format!("cannot read {MANIFEST_NAME}: {e}")))?;

    let entries = parse_manifest(&content)?;
    let by_path: BTreeMap<&str, &str> = entries
        .iter()
        .map(|e| (e.relative_path.as_str(), e.digest_hex.as_str()))
        .collect();

    if !by_path.contains_key("conversation.json") {
        return Err(StageError::checksum(
            "manifest does not cover conversation.json",
        ));
    }

    let self_listed = by_path.contains_key(MANIFEST_NAME);
    if require_self_listing && !self_listed {
        return Err(StageError::checksum(format!(
            "manifest does not list itself ({MANIFEST_NAME})"
        )));
    }

    // Every listed file must exist and match.
    let mut verified = 0usize;
    for entry in &entries {
        if entry.relative_path == MANIFEST_NAME {
            continue;
        }
        let path = extract_root.join(&entry.relative_path);
        if !path.is_file() {
            return Err(StageError::checksum(format!(
                "file listed in manifest not found: {}",
                entry.relative_path
            )));
        }
        let actual = file_sha256(&path)?;
        if !constant_time_eq(&actual, &entry.digest_hex) {
            return Err(StageError::checksum(format!(
                "digest mismatch for '{}': expected {}, computed {actual}",
                entry.relative_path, entry.digest_hex
            )));
        }
        verified += 1;
    }

    // Every file on disk must be listed (the manifest itself is governed by
    // the self-listing policy above).
    for file in walk_files(extract_root)? {
        let rel = file
            .strip_prefix(extract_root)
            .map_err(|e| StageError::checksum(format!("path outside extract root: {e}")))?
            .to_string_lossy()
            .replace('\\', "/");
        if rel == MANIFEST_NAME {
            continue;
        }
        if !by_path.contains_key(rel.as_str()) {
            return Err(StageError::checksum(format!(
                "file on disk not covered by manifest: {rel}"
            )));
        }
    }

    Ok(verified)
}

/// Recursively collect regular files under a directory.
fn walk_files(root: &Path) -> StageResult<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let entries = std::fs::read_dir(&dir).map_err(|e| {
            StageError::checksum(format!("cannot list '{}': {e}", dir.display()))
        })?;
        for entry in entries {
            let entry =
                entry.map_err(|e| StageError::checksum(format!("directory walk failed: {e}")))?;
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else {
                files.push(path);
            }
        }
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn hex_digest(data: &[u8]) -> String {
        hex::encode(Sha256::digest(data))
    }

    fn write_package(root: &Path, require_self: bool) {
        let body = br#"{"segments": []}"#;
        fs::write(root.join("conversation.json"), body).unwrap();

        let mut manifest = format!("{}  conversation.json\n", hex_digest(body));
        if require_self {
            // The digest value for the self-entry is never checked.
            manifest.push_str(&format!("{}  {}\n", "0".repeat(64), MANIFEST_NAME));
        }
        fs::write(root.join(MANIFEST_NAME), manifest).unwrap();
    }

    #[test]
    fn test_envelope_format_assert() {
        assert!(assert_envelope_format(&"a".repeat(64)).is_ok());
        assert!(assert_envelope_format(&"A".repeat(64)).is_err());
        assert!(assert_envelope_format(&"a".repeat(63)).is_err());
        assert!(assert_envelope_format("xyz").is_err());
    }

    #[test]
    fn test_archive_checksum_round_trip() {
        let tmp = TempDir::new().unwrap();
        let archive = tmp.path().join("pkg.tar.gz");
        fs::write(&archive, b"archive bytes").unwrap();

        let digest = hex_digest(b"archive bytes");
        verify_archive_checksum(&archive, &digest).unwrap();

        let wrong = hex_digest(b"other bytes");
        assert!(verify_archive_checksum(&archive, &wrong).is_err());
    }

    #[test]
    fn test_parse_manifest_formats() {
        let content = format!(
            "# produced by transcript-svc\n\n{}  conversation.json\n{}  media/audio.ogg\n",
            "a".repeat(64),
            "b".repeat(64)
        );
        let entries = parse_manifest(&content).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].relative_path, "media/audio.ogg");
    }

    #[test]
    fn test_parse_manifest_rejects_malformed() {
        // Single-space separator.
        assert!(parse_manifest(&format!("{} conversation.json\n", "a".repeat(64))).is_err());
        // Bad digest length.
        assert!(parse_manifest(&format!("{}  conversation.json\n", "a".repeat(10))).is_err());
        // Empty manifest.
        assert!(parse_manifest("# nothing here\n").is_err());
    }

    #[test]
    fn test_manifest_verify_self_listing_required() {
        let tmp = TempDir::new().unwrap();
        write_package(tmp.path(), true);
        assert_eq!(verify_manifest(tmp.path(), true).unwrap(), 1);

        // Without the self entry, the default policy fails...
        let tmp2 = TempDir::new().unwrap();
        write_package(tmp2.path(), false);
        assert!(verify_manifest(tmp2.path(), true).is_err());
        // ...and the relaxed policy accepts it.
        assert_eq!(verify_manifest(tmp2.path(), false).unwrap(), 1);
    }

    #[test]
    fn test_manifest_must_cover_conversation_json() {
        let tmp = TempDir::new().unwrap();
        let body = b"data";
        fs::write(tmp.path().join("notes.txt"), body).unwrap();
        fs::write(
            tmp.path().join(MANIFEST_NAME),
            format!("{}  notes.txt\n", hex_digest(body)),
        )
        .unwrap();
        let err = verify_manifest(tmp.path(), false).unwrap_err();
        assert!(err.message.contains("conversation.json"));
    }

    #[test]
    fn test_missing_listed_file() {
        let tmp = TempDir::new().unwrap();
        write_package(tmp.path(), true);
        fs::remove_file(tmp.path().join("conversation.json")).unwrap();
        let err = verify_manifest(tmp.path(), true).unwrap_err();
        assert!(err.message.contains("not found"));
    }

    #[test]
    fn test_unlisted_file_on_disk() {
        let tmp = TempDir::new().unwrap();
        write_package(tmp.path(), true);
        fs::write(tmp.path().join("rogue.bin"), b"?").unwrap();
        let err = verify_manifest(tmp.path(), true).unwrap_err();
        assert!(err.message.contains("rogue.bin"));
    }

    #[test]
    fn test_digest_mismatch() {
        let tmp = TempDir::new().unwrap();
        write_package(tmp.path(), true);
        fs::write(tmp.path().join("conversation.json"), b"tampered").unwrap();
        let err = verify_manifest(tmp.path(), true).unwrap_err();
        assert!(err.message.contains("mismatch"));
    }

    #[test]
    fn test_nested_files_verified() {
        let tmp = TempDir::new().unwrap();
        let body = br#"{"segments": []}"#;
        let media = b"fake-ogg";
        fs::create_dir(tmp.path().join("media")).unwrap();
        fs::write(tmp.path().join("conversation.json"), body).unwrap();
        fs::write(tmp.path().join("media/audio.ogg"), media).unwrap();
        fs::write(
            tmp.path().join(MANIFEST_NAME),
            format!(
                "{}  conversation.json\n{}  media/audio.ogg\n{}  {}\n",
                hex_digest(body),
                hex_digest(media),
                "0".repeat(64),
                MANIFEST_NAME
            ),
        )
        .unwrap();
        assert_eq!(verify_manifest(tmp.path(), true).unwrap(), 2);
    }
}
