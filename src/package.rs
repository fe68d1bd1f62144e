//! Package records and how their dev processes are invoked.

use std::path::{Path, PathBuf};

use serde_json::{Map, Value};

use crate::fs::{Entry, WorkspaceFs};

/// Scripts tried in order when picking what to run for a package.
pub const SCRIPT_PRIORITY: [&str; 3] = ["dev", "start", "serve"];
/// Script used when a manifest declares none of [`SCRIPT_PRIORITY`].
pub const DEFAULT_SCRIPT: &str = "dev";
/// Lockfile that switches the invocation from npm to yarn.
pub const YARN_LOCKFILE: &str = "yarn.lock";

/// A runnable member of the workspace, fresh for every discovery pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Package {
    /// Name declared in the package manifest.
    pub name: String,
    /// Handle to the package directory.
    pub dir: Entry,
    /// Manifest script started for this package.
    pub script: String,
}

impl Package {
    pub fn new(name: impl Into<String>, dir: Entry, script: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dir,
            script: script.into(),
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

/// Picks the script to run from a manifest's `scripts` map.
pub fn select_script(scripts: Option<&Map<String, Value>>) -> &'static str {
    scripts
        .and_then(|scripts| {
            SCRIPT_PRIORITY
                .iter()
                .copied()
                .find(|name| scripts.contains_key(*name))
        })
        .unwrap_or(DEFAULT_SCRIPT)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageManager {
    Npm,
    Yarn,
}

impl PackageManager {
    /// Yarn when the package directory holds a yarn lockfile, npm otherwise.
    pub fn detect(fs: &dyn WorkspaceFs, dir: &Entry) -> Self {
        if fs.find_child(dir, YARN_LOCKFILE).is_some() {
            PackageManager::Yarn
        } else {
            PackageManager::Npm
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            PackageManager::Npm => "npm",
            PackageManager::Yarn => "yarn",
        }
    }

    fn program(&self) -> &'static str {
        match self {
            #[cfg(windows)]
            PackageManager::Npm => "npm.cmd",
            #[cfg(windows)]
            PackageManager::Yarn => "yarn.cmd",
            #[cfg(not(windows))]
            PackageManager::Npm => "npm",
            #[cfg(not(windows))]
            PackageManager::Yarn => "yarn",
        }
    }

    fn args(&self, script: &str) -> Vec<String> {
        match self {
            PackageManager::Npm => vec!["run".to_string(), script.to_string()],
            PackageManager::Yarn => vec![script.to_string()],
        }
    }
}

/// A concrete command line for one package process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
}

impl Invocation {
    pub fn for_package(fs: &dyn WorkspaceFs, package: &Package) -> Self {
        let manager = PackageManager::detect(fs, &package.dir);
        Self {
            program: manager.program().to_string(),
            args: manager.args(&package.script),
            cwd: package.path().to_path_buf(),
        }
    }

    /// Shell-quoted rendering for logs and the console.
    pub fn display(&self) -> String {
        let mut words = Vec::with_capacity(self.args.len() + 1);
        words.push(self.program.as_str());
        words.extend(self.args.iter().map(String::as_str));
        shell_words::join(words)
    }
}
