//! Workspace declaration resolution.
//!
//! A directory is treated as a monorepo root only when it carries a
//! `turbo.json` marker. Member patterns then come from `workspace.json` when it
//! exists and parses, and from the `workspaces` field of the root
//! `package.json` otherwise.

use std::path::PathBuf;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::fs::{Entry, WorkspaceFs};

/// File whose presence marks the monorepo root.
pub const ROOT_MARKER: &str = "turbo.json";
/// Dedicated membership file, checked before the root manifest.
pub const WORKSPACE_FILE: &str = "workspace.json";
/// Package manifest file name, at the root and in every member.
pub const MANIFEST_FILE: &str = "package.json";

/// Where a declaration was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeclarationSource {
    WorkspaceFile,
    Manifest,
}

/// Ordered membership patterns of one workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceDeclaration {
    pub source: DeclarationSource,
    pub patterns: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("{path}: {reason}")]
    Shape { path: PathBuf, reason: String },
}

/// Resolves the membership declaration for `root`.
///
/// Returns `None` when `root` is not a monorepo root or declares no members.
/// Malformed sources are logged and skipped.
pub fn resolve(fs: &dyn WorkspaceFs, root: &Entry) -> Option<WorkspaceDeclaration> {
    if fs.find_child(root, ROOT_MARKER).is_none() {
        info!(root = %root.path().display(), "no {} found in project root", ROOT_MARKER);
        return None;
    }

    if let Some(file) = fs.find_child(root, WORKSPACE_FILE) {
        match read_json(fs, &file).and_then(|json| workspace_file_patterns(&file, &json)) {
            Ok(patterns) => {
                debug!(count = patterns.len(), "using {}", WORKSPACE_FILE);
                return Some(WorkspaceDeclaration {
                    source: DeclarationSource::WorkspaceFile,
                    patterns,
                });
            }
            Err(err) => warn!(error = %err, "ignoring {}", WORKSPACE_FILE),
        }
    }

    if let Some(file) = fs.find_child(root, MANIFEST_FILE) {
        match read_json(fs, &file).and_then(|json| manifest_patterns(&file, &json)) {
            Ok(Some(patterns)) => {
                debug!(count = patterns.len(), "using workspaces from {}", MANIFEST_FILE);
                return Some(WorkspaceDeclaration {
                    source: DeclarationSource::Manifest,
                    patterns,
                });
            }
            Ok(None) => {}
            Err(err) => warn!(error = %err, "error parsing {}", MANIFEST_FILE),
        }
    }

    info!(root = %root.path().display(), "no workspace configuration found");
    None
}

fn read_json(fs: &dyn WorkspaceFs, file: &Entry) -> Result<Value, WorkspaceError> {
    let raw = fs.read_to_string(file).map_err(|source| WorkspaceError::Read {
        path: file.path().to_path_buf(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| WorkspaceError::Parse {
        path: file.path().to_path_buf(),
        source,
    })
}

/// Collects `projects` values from a `workspace.json` document.
///
/// Values are either a path string or an object carrying a `root` path.
/// Keys only name the projects and are otherwise ignored.
fn workspace_file_patterns(file: &Entry, json: &Value) -> Result<Vec<String>, WorkspaceError> {
    let Some(object) = json.as_object() else {
        return Err(shape_error(file, "expected a JSON object"));
    };
    let Some(projects) = object.get("projects") else {
        return Ok(Vec::new());
    };
    let Some(projects) = projects.as_object() else {
        return Err(shape_error(file, "`projects` must be an object"));
    };

    let mut patterns = Vec::with_capacity(projects.len());
    for (key, value) in projects {
        let path = match value {
            Value::String(path) => Some(path.as_str()),
            Value::Object(project) => project.get("root").and_then(Value::as_str),
            _ => None,
        };
        match path {
            Some(path) => patterns.push(path.to_string()),
            None => warn!(project = %key, "skipping project without a path in {}", WORKSPACE_FILE),
        }
    }
    Ok(patterns)
}

/// Collects the `workspaces` field of a root manifest, if it declares one.
fn manifest_patterns(file: &Entry, json: &Value) -> Result<Option<Vec<String>>, WorkspaceError> {
    let Some(object) = json.as_object() else {
        return Err(shape_error(file, "expected a JSON object"));
    };
    let entries = match object.get("workspaces") {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::Array(entries)) => entries,
        // Yarn's `{ "packages": [...], "nohoist": [...] }` form.
        Some(Value::Object(workspaces)) => match workspaces.get("packages") {
            Some(Value::Array(entries)) => entries,
            _ => return Ok(None),
        },
        Some(_) => {
            return Err(shape_error(file, "`workspaces` must be an array"));
        }
    };

    let patterns = entries
        .iter()
        .filter_map(|entry| match entry.as_str() {
            Some(pattern) => Some(pattern.to_string()),
            None => {
                warn!(entry = %entry, "skipping non-string workspace entry");
                None
            }
        })
        .collect();
    Ok(Some(patterns))
}

fn shape_error(file: &Entry, reason: &str) -> WorkspaceError {
    WorkspaceError::Shape {
        path: file.path().to_path_buf(),
        reason: reason.to_string(),
    }
}
