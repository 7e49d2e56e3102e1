//! Request target to filesystem path resolution.
//!
//! The dangerous step is canonicalization: a decoded target may climb out
//! of the document root through `..` segments or encodings of them. The
//! guard is to canonicalize the joined path and require the result to stay
//! under the (already canonical) root.

use std::ffi::OsString;
use std::io;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Why a target failed to resolve.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// The file does not exist, escapes the root, or is not accessible.
    /// Absence and permission problems are deliberately conflated so the
    /// response does not leak which one it was.
    #[error("not found")]
    NotFound,
    /// The target's percent-encoding is malformed.
    #[error("malformed percent-encoding")]
    BadEncoding,
    /// Unexpected filesystem error (EIO, EMFILE, ...). Surfaces as an
    /// internal server error rather than a not-found.
    #[error("i/o error: {0}")]
    Io(io::Error),
}

fn hex_value(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

/// Percent-decodes `input`; `+` maps to space. Malformed or truncated
/// escapes fail.
fn percent_decode(input: &[u8]) -> Result<Vec<u8>, ResolveError> {
    let mut out = Vec::with_capacity(input.len());
    let mut i = 0;
    while i < input.len() {
        match input[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' => {
                let (hi, lo) = match (input.get(i + 1), input.get(i + 2)) {
                    (Some(&hi), Some(&lo)) => (hi, lo),
                    _ => return Err(ResolveError::BadEncoding),
                };
                let (hi, lo) = match (hex_value(hi), hex_value(lo)) {
                    (Some(hi), Some(lo)) => (hi, lo),
                    _ => return Err(ResolveError::BadEncoding),
                };
                out.push((hi << 4) | lo);
                i += 3;
            }
            byte => {
                out.push(byte);
                i += 1;
            }
        }
    }
    Ok(out)
}

/// Resolves `target` (as received on the wire) to a file under `root`.
///
/// `root` must already be canonical (the configuration canonicalizes it at
/// startup). Steps: drop the query string, percent-decode, join under the
/// root, complete `/`-suffixed or empty targets with `index.html`,
/// canonicalize, verify containment, and turn directories into their
/// `index.html`.
pub fn resolve(root: &Path, target: &[u8]) -> Result<PathBuf, ResolveError> {
    // Everything from the first '?' on is the query string.
    let target = match target.iter().position(|&b| b == b'?') {
        Some(pos) => &target[..pos],
        None => target,
    };

    let decoded = percent_decode(target)?;

    // Byte-level concatenation: the target begins with '/', which
    // `Path::join` would treat as a filesystem-absolute replacement.
    let mut joined = root.as_os_str().as_bytes().to_vec();
    if !decoded.first().is_some_and(|&b| b == b'/') {
        joined.push(b'/');
    }
    joined.extend_from_slice(&decoded);
    if decoded.is_empty() || decoded.last() == Some(&b'/') {
        joined.extend_from_slice(b"index.html");
    }

    let candidate = PathBuf::from(OsString::from_vec(joined));
    let mut resolved = canonical_within(root, &candidate)?;

    let metadata = std::fs::metadata(&resolved).map_err(io_to_resolve)?;
    if metadata.is_dir() {
        resolved.push("index.html");
        let resolved = canonical_within(root, &resolved)?;
        std::fs::metadata(&resolved).map_err(io_to_resolve)?;
        return Ok(resolved);
    }

    Ok(resolved)
}

/// Canonicalizes `candidate` and rejects results outside `root`.
fn canonical_within(root: &Path, candidate: &Path) -> Result<PathBuf, ResolveError> {
    let resolved = candidate.canonicalize().map_err(io_to_resolve)?;
    if !resolved.starts_with(root) {
        return Err(ResolveError::NotFound);
    }
    Ok(resolved)
}

fn io_to_resolve(error: io::Error) -> ResolveError {
    // ENOTDIR ("/index.html/extra") and ELOOP are request-shaped failures,
    // not server faults. Matched by errno: the corresponding ErrorKind
    // names are newer than the minimum supported toolchain.
    if matches!(
        error.raw_os_error(),
        Some(libc::ENOTDIR) | Some(libc::ELOOP)
    ) {
        return ResolveError::NotFound;
    }
    match error.kind() {
        io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied => ResolveError::NotFound,
        _ => ResolveError::Io(error),
    }
}
