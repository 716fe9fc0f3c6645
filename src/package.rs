//! Package extraction: tar+gzip archives into a scoped directory.
//!
//! The package contract: a single top-level directory named after the
//! event's `external_event_id`, containing `conversation.json` and
//! `checksums.sha256`, with optional `media/`, `artifacts/`, and `logs/`
//! subtrees at most two levels deep. Members are capped at 2 GiB each and
//! 5 GiB total (enforced here against the *declared* entry sizes, and by
//! the fetcher against the bytes actually downloaded).
//!
//! Every member path is validated before unpacking: absolute paths, parent
//! traversal, and writes outside the extraction root are rejected.

use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use tar::Archive;

use crate::checksum::MANIFEST_NAME;
use crate::error::{ErrorCode, StageError, StageResult};

/// Subtrees a package may carry besides the two required files.
const ALLOWED_SUBTREES: &[&str] = &["media", "artifacts", "logs"];

/// Maximum directory depth below the package root for subtree members
/// (`media/a/b.ogg` is depth 2).
const MAX_SUBTREE_DEPTH: usize = 2;

/// Result of a successful extraction.
#[derive(Debug)]
pub struct ExtractedPackage {
    /// The package root: `<dest>/<external_event_id>`.
    pub root: PathBuf,
    pub unpacked_bytes: u64,
    pub file_count: usize,
}

impl ExtractedPackage {
    pub fn conversation_json(&self) -> PathBuf {
        self.root.join("conversation.json")
    }
}

/// Unpack `archive` into `dest`, enforcing the package layout contract.
///
/// `expected_root` is the event id the single top-level directory must be
/// named after. Size caps apply to declared entry sizes; exceeding either
/// maps to `payload_too_large`, every other contract violation to
/// `validation_error`.
pub fn extract_package(
    archive: &Path,
    dest: &Path,
    expected_root: &str,
    max_member_bytes: u64,
    max_total_bytes: u64,
) -> StageResult<ExtractedPackage> {
    let file = std::fs::File::open(archive).map_err(|e| {
        StageError::with_source(
            ErrorCode::ProcessingFailure,
            format!("cannot open archive '{}'", archive.display()),
            e,
        )
    })?;

    let mut tar = Archive::new(GzDecoder::new(file));
    let mut total_bytes = 0u64;
    let mut file_count = 0usize;
    let mut saw_conversation = false;
    let mut saw_manifest = false;

    let entries = tar
        .entries()
        .map_err(|e| StageError::validation(format!("archive is not a readable tar.gz: {e}")))?;

    for entry in entries {
        let mut entry = entry
            .map_err(|e| StageError::validation(format!("corrupt archive entry: {e}")))?;

        let path = entry
            .path()
            .map_err(|e| StageError::validation(format!("archive entry has a bad path: {e}")))?
            .into_owned();

        let components = sanitize_components(&path)?;
        if components.is_empty() {
            continue;
        }

        if components[0] != expected_root {
            return Err(StageError::validation(format!(
                "archive top-level entry '{}' does not match event id '{expected_root}'",
                components[0]
            )));
        }

        let header_type = entry.header().entry_type();
        if header_type.is_dir() {
            check_layout(&components, true)?;
            // Directories are created implicitly by unpack_in.
            continue;
        }
        if !header_type.is_file() {
            return Err(StageError::validation(format!(
                "archive entry '{}' is not a regular file or directory",
                path.display()
            )));
        }

        check_layout(&components, false)?;

        let size = entry
            .header()
            .size()
            .map_err(|e| StageError::validation(format!("entry size unreadable: {e}")))?;
        if size > max_member_bytes {
            return Err(StageError::new(
                ErrorCode::PayloadTooLarge,
                format!(
                    "archive member '{}' is {size} bytes (cap {max_member_bytes})",
                    path.display()
                ),
            ));
        }
        total_bytes += size;
        if total_bytes > max_total_bytes {
            return Err(StageError::new(
                ErrorCode::PayloadTooLarge,
                format!("uncompressed package exceeds {max_total_bytes} bytes"),
            ));
        }

        if components.len() == 2 {
            match components[1].as_str() {
                "conversation.json" => saw_conversation = true,
                MANIFEST_NAME => saw_manifest = true,
                _ => {}
            }
        }

        // unpack_in refuses writes that would land outside dest, as a
        // second line of defense behind sanitize_components.
        let unpacked = entry.unpack_in(dest).map_err(|e| {
            StageError::validation(format!("failed to unpack '{}': {e}", path.display()))
        })?;
        if !unpacked {
            return Err(StageError::validation(format!(
                "archive entry '{}' escapes the extraction root",
                path.display()
            )));
        }
        file_count += 1;
    }

    if !saw_conversation {
        return Err(StageError::validation(
            "package is missing conversation.json",
        ));
    }
    if !saw_manifest {
        return Err(StageError::validation(format!(
            "package is missing {MANIFEST_NAME}"
        )));
    }

    Ok(ExtractedPackage {
        root: dest.join(expected_root),
        unpacked_bytes: total_bytes,
        file_count,
    })
}

/// Normalize an entry path into plain components, rejecting anything that
/// could step outside the extraction root.
fn sanitize_components(path: &Path) -> StageResult<Vec<String>> {
    let mut components = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => {
                components.push(part.to_string_lossy().into_owned());
            }
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(StageError::validation(format!(
                    "archive entry '{}' attempts path traversal",
                    path.display()
                )));
            }
        }
    }
    Ok(components)
}

/// Enforce the layout contract relative to the package root.
///
/// `components[0]` is the root directory itself.
fn check_layout(components: &[String], is_dir: bool) -> StageResult<()> {
    match components.len() {
        0 | 1 => Ok(()),
        2 if is_dir => {
            let name = components[1].as_str();
            if ALLOWED_SUBTREES.contains(&name) {
                Ok(())
            } else {
                Err(StageError::validation(format!(
                    "unexpected directory '{name}' at package root"
                )))
            }
        }
        // Files directly under the root are fine (conversation.json,
        // checksums.sha256, and any future flat companions).
        2 => Ok(()),
        n => {
            let subtree = components[1].as_str();
            if !ALLOWED_SUBTREES.contains(&subtree) {
                return Err(StageError::validation(format!(
                    "nested entry outside the allowed subtrees: {}",
                    components.join("/")
                )));
            }
            // Depth below the subtree root: media/a/b.ogg has n == 4.
            if n - 2 > MAX_SUBTREE_DEPTH {
                return Err(StageError::validation(format!(
                    "subtree entry too deep: {}",
                    components.join("/")
                )));
            }
            Ok(())
        }
    }
}
