use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

use omero_core::OriginalFileId;
use thiserror::Error;

use crate::hierarchy::NodeId;

const REPLACEMENT: char = '_';

#[derive(Debug, Error)]
pub enum PathError {
    #[error("destination path is empty")]
    Empty,
    #[error("destination path contains unsupported component")]
    UnsupportedComponent,
}

/// Who a name inside a destination directory belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PathOwner {
    Node(NodeId),
    File(OriginalFileId),
}

/// Validates the destination root chosen by the user.
pub fn destination_root(path: &Path) -> Result<PathBuf, PathError> {
    if path.as_os_str().is_empty() {
        return Err(PathError::Empty);
    }
    if path
        .components()
        .any(|component| matches!(component, Component::ParentDir))
    {
        return Err(PathError::UnsupportedComponent);
    }
    Ok(path.to_path_buf())
}

/// Turns a remote display name into a single safe path component.
pub fn sanitize_component(name: &str) -> String {
    let replaced: String = name
        .chars()
        .map(|ch| match ch {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => REPLACEMENT,
            ch if ch.is_control() => REPLACEMENT,
            ch => ch,
        })
        .collect();
    let trimmed = replaced.trim_end_matches(['.', ' ']).trim_start();
    match trimmed {
        "" | "." | ".." => REPLACEMENT.to_string(),
        other => other.to_string(),
    }
}

/// Hands out collision-free names per destination directory for one run.
///
/// The first owner of a name keeps it; later owners get a ` (n)` suffix,
/// placed before the extension for files. Comparison ignores ASCII case so
/// the layout survives case-insensitive file systems.
#[derive(Debug, Default)]
pub struct NameAllocator {
    claimed: HashMap<PathBuf, HashMap<String, PathOwner>>,
}

impl NameAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn claim(&mut self, dir: &Path, name: &str, owner: PathOwner) -> PathBuf {
        let base = sanitize_component(name);
        let names = self.claimed.entry(dir.to_path_buf()).or_default();
        let mut candidate = base.clone();
        let mut suffix = 1u32;
        loop {
            match names.get(&candidate.to_ascii_lowercase()) {
                Some(existing) if *existing == owner => break,
                None => {
                    names.insert(candidate.to_ascii_lowercase(), owner);
                    break;
                }
                Some(_) => {
                    suffix += 1;
                    candidate = with_suffix(&base, suffix, matches!(owner, PathOwner::File(_)));
                }
            }
        }
        dir.join(candidate)
    }
}

fn with_suffix(name: &str, n: u32, keep_extension: bool) -> String {
    if keep_extension {
        if let Some((stem, ext)) = name.rsplit_once('.') {
            if !stem.is_empty() {
                return format!("{stem} ({n}).{ext}");
            }
        }
    }
    format!("{name} ({n})")
}
