//! Blob path validation.
//!
//! Masters and artifacts are addressed by relative paths. These must never
//! escape the storage root.

use std::path::{Component, Path, PathBuf};

use crate::error::{ErrorKind, Result};

/// Validates and normalizes a blob path.
///
/// `..` is resolved lexically and may never climb above the root. Null bytes
/// are rejected because they truncate paths in C-based syscalls.
///
/// # Examples
///
/// ```
/// use std::path::Path;
/// use encore_storage::validate_path;
/// assert!(validate_path("masters/a1b2.flac").is_ok());
/// assert!(validate_path("transcodes/x/../y.mp3").is_ok());
/// assert!(validate_path("../etc/passwd").is_err());
/// assert!(validate_path("a\0b").is_err());
/// assert_eq!(
///     validate_path("./transcodes//abc/./abcdef.opus/").unwrap(),
///     Path::new("transcodes/abc/abcdef.opus")
/// );
/// ```
pub fn validate(path: impl AsRef<Path>) -> Result<PathBuf> {
    let original = path.as_ref();
    let mut components = Vec::new();
    for component in original.components() {
        match component {
            Component::Normal(s) => {
                if s.as_encoded_bytes().contains(&0) {
                    exn::bail!(ErrorKind::InvalidPath(original.to_path_buf()));
                }
                components.push(s)
            },
            Component::CurDir | Component::RootDir => {},
            Component::Prefix(_) => exn::bail!(ErrorKind::InvalidPath(original.to_path_buf())),
            Component::ParentDir => {
                if components.pop().is_none() {
                    exn::bail!(ErrorKind::InvalidPath(original.to_path_buf()));
                }
            },
        }
    }
    match components.is_empty() {
        true => exn::bail!(ErrorKind::InvalidPath(original.to_path_buf())),
        false => Ok(components.into_iter().collect()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_paths() {
        assert_eq!(validate("masters/m1.flac").unwrap(), Path::new("masters/m1.flac"));
        assert_eq!(validate("transcodes/Ab3/Ab3xYz.ogg").unwrap(), Path::new("transcodes/Ab3/Ab3xYz.ogg"));
        assert_eq!(validate("cover.png").unwrap(), Path::new("cover.png"));
    }

    #[test]
    fn test_normalization() {
        assert_eq!(validate("a//b//c").unwrap(), Path::new("a/b/c"));
        assert_eq!(validate("a/./b/./c").unwrap(), Path::new("a/b/c"));
        assert_eq!(validate("/leading/slash").unwrap(), Path::new("leading/slash"));
        assert_eq!(validate("transcodes/abc///").unwrap(), Path::new("transcodes/abc"));
        assert_eq!(validate("a/b/..").unwrap(), Path::new("a"));
    }

    #[test]
    fn test_traversal_attempts() {
        assert!(validate("../etc/passwd").is_err());
        assert!(validate("a/../../b").is_err());
        assert!(validate("..").is_err());
    }

    #[test]
    fn test_null_bytes() {
        assert!(validate("a\0b").is_err());
        assert!(validate("\0").is_err());
    }

    #[test]
    fn test_empty_paths() {
        assert!(validate("").is_err());
        assert!(validate(".").is_err());
        assert!(validate("./.").is_err());
        assert!(validate("//").is_err());
    }
}
