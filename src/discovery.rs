//! Package discovery.
//!
//! Expands the workspace membership patterns into candidate directories and
//! admits every candidate whose `package.json` carries a name. Discovery is a
//! one-shot snapshot: callers re-run it wholesale to refresh.
//!
//! Problems with a single pattern or candidate are logged and skipped so one
//! broken package never hides the rest of the workspace.

use std::collections::HashSet;
use std::io;
use std::path::{Component, PathBuf};

use globset::{GlobBuilder, GlobMatcher, GlobSet, GlobSetBuilder};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::fs::{Entry, WorkspaceFs};
use crate::package::{select_script, Package};
use crate::workspace::{self, MANIFEST_FILE};

/// Deepest level walked below a glob pattern's literal prefix.
const MAX_GLOB_DEPTH: usize = 8;

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("{} is not a directory", .0.display())]
    RootNotDirectory(PathBuf),
}

#[derive(Debug, thiserror::Error)]
pub enum PatternError {
    #[error("failed to list {path}: {source}")]
    List {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid pattern `{pattern}`: {source}")]
    Glob {
        pattern: String,
        #[source]
        source: globset::Error,
    },
}

/// Why a candidate directory was not admitted as a package.
#[derive(Debug, thiserror::Error)]
pub enum Rejection {
    #[error("no package.json")]
    NoManifest,
    #[error("failed to read package.json: {0}")]
    Unreadable(#[source] io::Error),
    #[error("failed to parse package.json: {0}")]
    Corrupt(#[source] serde_json::Error),
    #[error("package.json has no `name`")]
    MissingName,
}

#[derive(Debug, Deserialize)]
struct Manifest {
    name: Option<String>,
    scripts: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum MemberPattern {
    /// `prefix/*`: every immediate subdirectory of `prefix`.
    Children(String),
    /// A single directory.
    Direct(String),
    /// Any other glob, matched against walked directories.
    Glob(String),
}

/// Discovers the packages of the workspace rooted at `root`.
///
/// A root without a marker or a membership declaration yields an empty list.
pub fn discover(fs: &dyn WorkspaceFs, root: &Entry) -> Result<Vec<Package>, DiscoveryError> {
    if !fs.is_dir(root) {
        return Err(DiscoveryError::RootNotDirectory(root.path().to_path_buf()));
    }
    let Some(declaration) = workspace::resolve(fs, root) else {
        return Ok(Vec::new());
    };

    let (exclusions, inclusions): (Vec<&String>, Vec<&String>) = declaration
        .patterns
        .iter()
        .partition(|pattern| pattern.trim_start().starts_with('!'));
    let excluded = exclusion_set(&exclusions);

    let mut packages: Vec<Package> = Vec::new();
    let mut seen = HashSet::new();
    for raw in inclusions {
        let pattern = normalize(raw);
        let candidates = match expand(fs, root, &pattern) {
            Ok(candidates) => candidates,
            Err(err) => {
                warn!(pattern = %raw, error = %err, "error processing workspace path");
                continue;
            }
        };

        for dir in candidates {
            let relative = relative_path(root, &dir);
            if excluded.is_match(&relative) {
                debug!(path = %relative, "candidate excluded by workspace pattern");
                continue;
            }
            match admit_package(fs, &dir) {
                Ok(package) => {
                    if seen.insert(package.name.clone()) {
                        debug!(name = %package.name, script = %package.script, path = %relative, "admitted package");
                        packages.push(package);
                    } else {
                        debug!(name = %package.name, path = %relative, "duplicate package name, keeping first");
                    }
                }
                Err(Rejection::NoManifest) => {
                    debug!(path = %relative, "skipping directory without {}", MANIFEST_FILE);
                }
                Err(err) => {
                    warn!(path = %dir.path().display(), error = %err, "skipping package candidate");
                }
            }
        }
    }

    info!(count = packages.len(), "discovered packages");
    Ok(packages)
}

/// Admits `dir` as a package when its manifest declares a name.
pub fn admit_package(fs: &dyn WorkspaceFs, dir: &Entry) -> Result<Package, Rejection> {
    let manifest = fs
        .find_child(dir, MANIFEST_FILE)
        .ok_or(Rejection::NoManifest)?;
    let raw = fs.read_to_string(&manifest).map_err(Rejection::Unreadable)?;
    let manifest: Manifest = serde_json::from_str(&raw).map_err(Rejection::Corrupt)?;
    let name = manifest.name.ok_or(Rejection::MissingName)?;
    let script = select_script(manifest.scripts.as_ref());
    Ok(Package::new(name, dir.clone(), script))
}

fn normalize(raw: &str) -> String {
    let mut pattern = raw.trim();
    while let Some(rest) = pattern.strip_prefix("./") {
        pattern = rest;
    }
    pattern.trim_end_matches('/').to_string()
}

fn has_glob_meta(text: &str) -> bool {
    text.contains(['*', '?', '[', '{'])
}

fn classify(pattern: &str) -> MemberPattern {
    if pattern == "*" {
        return MemberPattern::Children(String::new());
    }
    if let Some(prefix) = pattern.strip_suffix("/*") {
        if !has_glob_meta(prefix) {
            return MemberPattern::Children(prefix.to_string());
        }
    }
    if has_glob_meta(pattern) {
        MemberPattern::Glob(pattern.to_string())
    } else {
        MemberPattern::Direct(pattern.to_string())
    }
}

fn expand(fs: &dyn WorkspaceFs, root: &Entry, pattern: &str) -> Result<Vec<Entry>, PatternError> {
    match classify(pattern) {
        MemberPattern::Children(prefix) => match find_dir(fs, root, &prefix) {
            Some(dir) => subdirectories(fs, &dir),
            None => Ok(Vec::new()),
        },
        MemberPattern::Direct(path) => Ok(find_dir(fs, root, &path).into_iter().collect()),
        MemberPattern::Glob(pattern) => expand_glob(fs, root, &pattern),
    }
}

fn find_dir(fs: &dyn WorkspaceFs, root: &Entry, relative: &str) -> Option<Entry> {
    fs.find_relative(root, relative).filter(|entry| fs.is_dir(entry))
}

fn subdirectories(fs: &dyn WorkspaceFs, dir: &Entry) -> Result<Vec<Entry>, PatternError> {
    let children = fs.children(dir).map_err(|source| PatternError::List {
        path: dir.path().to_path_buf(),
        source,
    })?;
    Ok(children.into_iter().filter(|child| fs.is_dir(child)).collect())
}

fn compile(pattern: &str) -> Result<GlobMatcher, PatternError> {
    GlobBuilder::new(pattern)
        .literal_separator(true)
        .build()
        .map(|glob| glob.compile_matcher())
        .map_err(|source| PatternError::Glob {
            pattern: pattern.to_string(),
            source,
        })
}

fn expand_glob(fs: &dyn WorkspaceFs, root: &Entry, pattern: &str) -> Result<Vec<Entry>, PatternError> {
    let matcher = compile(pattern)?;
    let segments = pattern.split('/').collect::<Vec<_>>();
    let literal = segments
        .iter()
        .take_while(|segment| !has_glob_meta(segment))
        .copied()
        .collect::<Vec<_>>();
    let max_depth = if pattern.contains("**") {
        MAX_GLOB_DEPTH
    } else {
        segments.len() - literal.len()
    };

    let base_relative = literal.join("/");
    let Some(base) = find_dir(fs, root, &base_relative) else {
        return Ok(Vec::new());
    };
    let mut matches = Vec::new();
    walk(fs, &base, &base_relative, 1, max_depth, &matcher, &mut matches)?;
    Ok(matches)
}

fn walk(
    fs: &dyn WorkspaceFs,
    dir: &Entry,
    relative: &str,
    depth: usize,
    max_depth: usize,
    matcher: &GlobMatcher,
    matches: &mut Vec<Entry>,
) -> Result<(), PatternError> {
    for child in subdirectories(fs, dir)? {
        let name = child.name();
        if name == "node_modules" || name.starts_with('.') {
            continue;
        }
        let child_relative = if relative.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", relative, name)
        };
        if matcher.is_match(&child_relative) {
            matches.push(child.clone());
        }
        if depth < max_depth {
            if let Err(err) = walk(fs, &child, &child_relative, depth + 1, max_depth, matcher, matches) {
                warn!(dir = %child_relative, error = %err, "skipping directory during glob expansion");
            }
        }
    }
    Ok(())
}

fn exclusion_set(patterns: &[&String]) -> GlobSet {
    let mut builder = GlobSetBuilder::new();
    for raw in patterns {
        let pattern = normalize(raw.trim_start().trim_start_matches('!'));
        match GlobBuilder::new(&pattern).literal_separator(true).build() {
            Ok(glob) => {
                builder.add(glob);
            }
            Err(err) => warn!(pattern = %raw, error = %err, "ignoring invalid exclusion pattern"),
        }
    }
    builder.build().unwrap_or_else(|err| {
        warn!(error = %err, "ignoring workspace exclusions");
        GlobSet::empty()
    })
}

/// `/`-joined path of `dir` relative to `root`, used for glob matching and logs.
fn relative_path(root: &Entry, dir: &Entry) -> String {
    match dir.path().strip_prefix(root.path()) {
        Ok(relative) => relative
            .components()
            .filter_map(|component| match component {
                Component::Normal(part) => part.to_str(),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("/"),
        Err(_) => dir.path().display().to_string(),
    }
}
