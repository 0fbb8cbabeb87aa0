//! Utility functions for bitseal
//!
//! ## Categories of Utilities
//!
//! ### Path Handling
//! - Normalizing and pruning the list of trees to work on
//! - Splitting `sources -- destinations` item lists
//! - Removing written files and the directories they leave behind
//!
//! ### Seal Files
//! - Generating timestamped seal file names and recognizing them again
//!
//! ### Cross-Platform Compatibility
//! - Grouping paths by the storage device they live on
//! - Symbolic link creation

use crate::error::{Result, SealError};
use chrono::Local;
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

/// Base name of every seal file
pub const SEAL_BASE_NAME: &str = "bitseal";

/// Prefix of seals still being written
pub const SEAL_TEMP_PREFIX: &str = ".bitseal";

/// Separates sources from destinations in a sealed copy
pub const COPY_SEPARATOR: &str = "--";

/// Path of a new seal file inside `tree`: `bitseal_YYYY-MM-DD_HHMMSS.<ext>`
pub fn index_path(tree: &Path, extension: &str) -> PathBuf {
    let stamp = Local::now().format("%Y-%m-%d_%H%M%S");
    tree.join(format!("{}_{}.{}", SEAL_BASE_NAME, stamp, extension))
}

/// True if `name` looks like a file produced by [`index_path`]
pub fn is_seal_name(name: &str) -> bool {
    let Some(rest) = name.strip_prefix(SEAL_BASE_NAME).and_then(|r| r.strip_prefix('_')) else {
        return false;
    };
    let bytes = rest.as_bytes();
    // YYYY-MM-DD_HHMMSS.
    const SHAPE: &[u8] = b"dddd-dd-dd_dddddd.";
    if bytes.len() <= SHAPE.len() {
        return false;
    }
    SHAPE.iter().zip(bytes).all(|(shape, b)| match *shape {
        b'd' => b.is_ascii_digit(),
        other => other == *b,
    })
}

/// True for dotfiles
pub fn is_hidden(name: &str) -> bool {
    name.starts_with('.')
}

/// Make `path` absolute and remove `.` components and trailing separators
pub fn normalize_path(path: &Path) -> Result<PathBuf> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        env::current_dir()?.join(path)
    };

    let mut out = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    Ok(out)
}

/// Normalize a list of trees and drop every tree that lies within another.
///
/// With `must_exist`, each tree has to be an existing directory.
pub fn parse_sources<P: AsRef<Path>>(items: &[P], must_exist: bool) -> Result<Vec<PathBuf>> {
    let mut trees = Vec::with_capacity(items.len());
    for item in items {
        let tree = normalize_path(item.as_ref())?;
        if must_exist {
            let meta = fs::metadata(&tree).map_err(|e| SealError::io_at(&tree, e))?;
            if !meta.is_dir() {
                return Err(SealError::config(format!(
                    "'{}' is not a directory",
                    tree.display()
                )));
            }
        }
        trees.push(tree);
    }

    let pruned = trees
        .iter()
        .enumerate()
        .filter(|(i, tree)| {
            !trees.iter().enumerate().any(|(j, other)| {
                // keep the first of two equal trees
                (other == *tree && j < *i) || (other != *tree && tree.starts_with(other))
            })
        })
        .map(|(_, tree)| tree.clone())
        .collect::<Vec<_>>();

    if pruned.len() != trees.len() {
        tracing::debug!(given = trees.len(), kept = pruned.len(), "pruned nested trees");
    }
    Ok(pruned)
}

/// Split `src... -- dst...` into sources and destinations.
///
/// The separator may be omitted if there is exactly one source and one destination.
pub fn split_copy_items<P: AsRef<Path>>(items: &[P]) -> Result<(Vec<PathBuf>, Vec<PathBuf>)> {
    let usage = || {
        SealError::config(format!(
            "Please specify sealed copies like so: source/ {} destination/ \
             ({} can be omitted if there is only one source and one destination)",
            COPY_SEPARATOR, COPY_SEPARATOR
        ))
    };

    let pos = items
        .iter()
        .position(|item| item.as_ref() == Path::new(COPY_SEPARATOR));
    let to_paths = |slice: &[P]| slice.iter().map(|p| p.as_ref().to_path_buf()).collect::<Vec<_>>();

    match pos {
        Some(0) => Err(usage()),
        Some(i) if i == items.len() - 1 => Err(usage()),
        Some(i) => Ok((to_paths(&items[..i]), to_paths(&items[i + 1..]))),
        None if items.len() == 2 => Ok((to_paths(&items[..1]), to_paths(&items[1..]))),
        None => Err(usage()),
    }
}

/// Group `paths` by the device they reside on.
///
/// Paths that cannot be inspected share the default group. The order of
/// groups is stable for a given set of devices.
pub fn device_map(paths: &[PathBuf]) -> Vec<Vec<PathBuf>> {
    let mut groups: BTreeMap<u64, Vec<PathBuf>> = BTreeMap::new();
    for path in paths {
        groups.entry(device_id(path)).or_default().push(path.clone());
    }
    groups.into_values().collect()
}

/// Device identifier of the closest existing ancestor of `path` (Unix)
#[cfg(unix)]
fn device_id(path: &Path) -> u64 {
    use std::os::unix::fs::MetadataExt;
    path.ancestors()
        .find_map(|p| fs::metadata(p).ok())
        .map(|m| m.dev())
        .unwrap_or(0)
}

/// Device identifier, unavailable on this platform
#[cfg(not(unix))]
fn device_id(_path: &Path) -> u64 {
    0
}

/// Raw bytes of a path, e.g. a symbolic link target streamed as file content
#[cfg(unix)]
pub fn path_to_bytes(path: &Path) -> Vec<u8> {
    use std::os::unix::ffi::OsStrExt;
    path.as_os_str().as_bytes().to_vec()
}

/// Raw bytes of a path (lossy where the platform has no byte representation)
#[cfg(not(unix))]
pub fn path_to_bytes(path: &Path) -> Vec<u8> {
    path.to_string_lossy().into_owned().into_bytes()
}

/// Inverse of [`path_to_bytes`]
#[cfg(unix)]
pub fn path_from_bytes(bytes: &[u8]) -> PathBuf {
    use std::os::unix::ffi::OsStrExt;
    PathBuf::from(std::ffi::OsStr::from_bytes(bytes))
}

/// Inverse of [`path_to_bytes`]
#[cfg(not(unix))]
pub fn path_from_bytes(bytes: &[u8]) -> PathBuf {
    PathBuf::from(String::from_utf8_lossy(bytes).into_owned())
}

/// Create a symbolic link at `link` pointing to `target` (Unix)
#[cfg(unix)]
pub fn create_symlink(target: &Path, link: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

/// Create a symbolic link (Windows)
#[cfg(windows)]
pub fn create_symlink(target: &Path, link: &Path) -> io::Result<()> {
    use std::os::windows::fs::{symlink_dir, symlink_file};
    if target.is_dir() {
        symlink_dir(target, link)
    } else {
        symlink_file(target, link)
    }
}

/// Create a symbolic link (unsupported platforms)
#[cfg(not(any(unix, windows)))]
pub fn create_symlink(_target: &Path, _link: &Path) -> io::Result<()> {
    Err(io::Error::new(io::ErrorKind::Unsupported, "symbolic links are not supported"))
}

/// Remove `path`, then every parent directory that became empty, stopping at `tree`.
///
/// Returns false if `path` could not be removed.
pub fn remove_with_empty_parents(tree: &Path, path: &Path) -> bool {
    if fs::remove_file(path).is_err() {
        return false;
    }
    for dir in path.ancestors().skip(1) {
        if dir == tree || !dir.starts_with(tree) || fs::remove_dir(dir).is_err() {
            break;
        }
    }
    true
}
