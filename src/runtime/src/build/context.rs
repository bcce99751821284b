//! Build context handling for COPY and ADD.
//!
//! Resolves source patterns inside the context directory, applies
//! `.dockerignore` rules, computes a content checksum for the cache key and
//! packs the selected files into a tar archive for upload.

use ignore::gitignore::{Gitignore, GitignoreBuilder};
use kiln_core::error::{KilnError, Result};
use sha2::{Digest, Sha256};
use std::path::{Component, Path, PathBuf};

/// Name of the ignore file read from the context root.
pub const DOCKERIGNORE: &str = ".dockerignore";

/// Read `.dockerignore` patterns from the context, if present.
pub fn read_dockerignore(context_dir: &Path) -> Result<Vec<String>> {
    let path = context_dir.join(DOCKERIGNORE);
    if !path.is_file() {
        return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(&path)?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(str::to_string)
        .collect())
}

/// Compiled `.dockerignore` rules. The last matching rule wins; `!` negates.
///
/// Patterns are matched from the context root, so each one is anchored
/// before it is handed to the gitignore matcher.
pub struct IgnoreMatcher {
    rules: Gitignore,
}

impl IgnoreMatcher {
    pub fn new(patterns: &[String]) -> Result<Self> {
        let mut builder = GitignoreBuilder::new(".");
        for raw in patterns {
            builder.add_line(None, &anchor(raw)).map_err(|e| {
                KilnError::ConfigError(format!("invalid .dockerignore pattern '{}': {}", raw, e))
            })?;
        }
        let rules = builder
            .build()
            .map_err(|e| KilnError::ConfigError(format!("invalid .dockerignore: {}", e)))?;
        Ok(Self { rules })
    }

    /// Whether a context-relative path (using `/` separators) is excluded.
    ///
    /// A path is also excluded when one of its parent directories matches.
    pub fn is_ignored(&self, relative: &str) -> bool {
        self.rules
            .matched_path_or_any_parents(relative, false)
            .is_ignore()
    }
}

/// `node_modules/` -> `/node_modules`, `!./keep.log` -> `!/keep.log`.
fn anchor(raw: &str) -> String {
    let (negate, pattern) = match raw.strip_prefix('!') {
        Some(p) => ("!", p),
        None => ("", raw),
    };
    let pattern = pattern
        .trim_start_matches("./")
        .trim_start_matches('/')
        .trim_end_matches('/');
    format!("{}/{}", negate, pattern)
}

/// One file or directory to place in the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyEntry {
    pub source: PathBuf,
    /// Absolute path inside the container
    pub target: String,
    pub is_dir: bool,
}

/// Resolve a container path against the working directory.
pub fn resolve_path(workdir: &str, path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        let workdir = if workdir.is_empty() { "/" } else { workdir };
        format!("{}/{}", workdir.trim_end_matches('/'), path.trim_start_matches("./"))
    }
}

/// Expand COPY/ADD sources into the list of entries to upload.
pub fn collect(
    context_dir: &Path,
    sources: &[String],
    dest: &str,
    workdir: &str,
    ignore: &IgnoreMatcher,
) -> Result<Vec<CopyEntry>> {
    let mut matched = Vec::new();
    for src in sources {
        if escapes_context(src) {
            return Err(KilnError::BuildError(format!(
                "COPY source {} is outside of the build context",
                src
            )));
        }
        let pattern = context_dir.join(src.trim_start_matches('/'));
        let pattern = pattern.to_string_lossy();
        let paths = glob::glob(&pattern).map_err(|e| {
            KilnError::BuildError(format!("invalid COPY source '{}': {}", src, e))
        })?;
        let before = matched.len();
        for path in paths {
            let path = path.map_err(|e| KilnError::BuildError(e.to_string()))?;
            matched.push(path);
        }
        if matched.len() == before {
            return Err(KilnError::BuildError(format!(
                "COPY source not found: {} (in context {})",
                src,
                context_dir.display()
            )));
        }
    }

    let dest = resolve_path(workdir, dest);
    let into_dir = dest.ends_with('/') || matched.len() > 1 || matched.iter().any(|p| p.is_dir());
    let dest = dest.trim_end_matches('/');

    let mut entries = Vec::new();
    for path in matched {
        let relative = relative_to(context_dir, &path)?;
        if ignore.is_ignored(&relative) {
            continue;
        }
        if path.is_dir() {
            walk(context_dir, &path, &path, dest, ignore, &mut entries)?;
        } else {
            let target = if into_dir {
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                format!("{}/{}", dest, name)
            } else {
                dest.to_string()
            };
            entries.push(CopyEntry {
                source: path,
                target,
                is_dir: false,
            });
        }
    }

    entries.sort_by(|a, b| a.target.cmp(&b.target));
    entries.dedup_by(|a, b| a.target == b.target);
    Ok(entries)
}

fn walk(
    context_dir: &Path,
    root: &Path,
    current: &Path,
    dest: &str,
    ignore: &IgnoreMatcher,
    entries: &mut Vec<CopyEntry>,
) -> Result<()> {
    let read_dir = std::fs::read_dir(current).map_err(|e| {
        KilnError::BuildError(format!(
            "Failed to read directory {}: {}",
            current.display(),
            e
        ))
    })?;

    for entry in read_dir {
        let path = entry?.path();
        if ignore.is_ignored(&relative_to(context_dir, &path)?) {
            continue;
        }
        let inner = relative_to(root, &path)?;
        let target = format!("{}/{}", dest, inner);
        if path.is_dir() {
            entries.push(CopyEntry {
                source: path.clone(),
                target,
                is_dir: true,
            });
            walk(context_dir, root, &path, dest, ignore, entries)?;
        } else {
            entries.push(CopyEntry {
                source: path,
                target,
                is_dir: false,
            });
        }
    }
    Ok(())
}

fn escapes_context(src: &str) -> bool {
    let mut depth = 0i32;
    for component in Path::new(src.trim_start_matches('/')).components() {
        match component {
            Component::ParentDir => depth -= 1,
            Component::Normal(_) => depth += 1,
            _ => {}
        }
        if depth < 0 {
            return true;
        }
    }
    false
}

fn relative_to(base: &Path, path: &Path) -> Result<String> {
    let relative = path.strip_prefix(base).map_err(|_| {
        KilnError::BuildError(format!(
            "{} is outside of {}",
            path.display(),
            base.display()
        ))
    })?;
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Ok(parts.join("/"))
}

/// Content checksum of the entries: target paths plus file contents.
pub fn checksum(entries: &[CopyEntry]) -> Result<String> {
    let mut hasher = Sha256::new();
    for entry in entries {
        hasher.update(entry.target.as_bytes());
        hasher.update(b"\0");
        if entry.is_dir {
            hasher.update(b"dir\0");
            continue;
        }
        let data = std::fs::read(&entry.source).map_err(|e| {
            KilnError::BuildError(format!("Failed to read {}: {}", entry.source.display(), e))
        })?;
        hasher.update(Sha256::digest(&data));
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Pack the entries into a tar archive rooted at `/`.
pub fn make_archive(entries: &[CopyEntry]) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    builder.follow_symlinks(true);

    for entry in entries {
        let name = entry.target.trim_start_matches('/');
        let added = if entry.is_dir {
            builder.append_dir(name, &entry.source)
        } else {
            builder.append_path_with_name(&entry.source, name)
        };
        added.map_err(|e| {
            KilnError::BuildError(format!(
                "Failed to add {} to archive: {}",
                entry.source.display(),
                e
            ))
        })?;
    }

    builder
        .into_inner()
        .map_err(|e| KilnError::BuildError(format!("Failed to finalize archive: {}", e)))
}
