//! Directory discovery for batch ingestion.
//!
//! Walks the root with `walkdir`, matching root-relative paths against
//! include and exclude globs. Results are sorted so runs are reproducible.

use anyhow::{bail, Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Include and exclude globs over root-relative paths.
pub struct FileSelector {
    include: GlobSet,
    exclude: GlobSet,
}

impl FileSelector {
    pub fn new(include_globs: &[String], exclude_globs: &[String]) -> Result<Self> {
        let mut excludes = vec!["**/.git/**".to_string()];
        excludes.extend(exclude_globs.iter().cloned());
        Ok(Self {
            include: build_globset(include_globs)?,
            exclude: build_globset(&excludes)?,
        })
    }

    /// Whether a path relative to the ingest root is selected.
    pub fn matches(&self, relative: &Path) -> bool {
        let rel = relative.to_string_lossy();
        !self.exclude.is_match(rel.as_ref()) && self.include.is_match(rel.as_ref())
    }
}

pub fn discover(root: &Path, selector: &FileSelector, follow_symlinks: bool) -> Result<Vec<PathBuf>> {
    if !root.is_dir() {
        bail!("ingest root is not a directory: {}", root.display());
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(root).follow_links(follow_symlinks) {
        let entry = entry.with_context(|| format!("failed to walk {}", root.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        if selector.matches(relative) {
            files.push(path.to_path_buf());
        }
    }

    files.sort();
    Ok(files)
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).with_context(|| format!("invalid glob: {}", pattern))?;
        builder.add(glob);
    }
    Ok(builder.build()?)
}
