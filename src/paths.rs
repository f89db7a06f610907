//! Guest path resolution.
//!
//! Guest binaries reference iOS framework locations by absolute path
//! (`/System/Library/Frameworks/...`). The build system mirrors those
//! locations inside a `gen/` staging folder in the application package, so an
//! absolute guest path becomes a package-relative host path under `gen/`.

use std::path::{Component, Path, PathBuf};

/// A resolved binary location.
///
/// `relative` means the file lives inside the application package; otherwise
/// `path` is an absolute host path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryPath {
    pub path: String,
    pub relative: bool,
}

/// Resolve a guest-style path into a host location.
///
/// Guest-absolute paths are re-rooted under `gen/` with host path separators;
/// anything else is kept as-is and classified by whether it is absolute on
/// the host.
pub fn resolve_path(path: &str) -> BinaryPath {
    if path.starts_with('/') {
        let mut host = PathBuf::from("gen");
        for component in Path::new(path).components() {
            if let Component::Normal(part) = component {
                host.push(part);
            }
        }
        return BinaryPath {
            path: host.to_string_lossy().into_owned(),
            relative: true,
        };
    }

    BinaryPath {
        relative: !Path::new(path).is_absolute(),
        path: path.to_string(),
    }
}
