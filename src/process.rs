//! View-side state of each listed package.
//!
//! The process manager owns the truth about what is running; `PackageState`
//! mirrors it from lifecycle events and adds the console buffer and scroll
//! position the TUI needs.

use std::time::Instant;

use crate::output::LogBuffer;
use crate::package::Package;

/// The lifecycle status of a package as last reported by the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageStatus {
    Stopped,
    Running,
}

/// Runtime state of a single listed package.
#[derive(Debug, Clone)]
pub struct PackageState {
    /// Package record from the latest discovery pass that listed it.
    pub package: Package,
    pub status: PackageStatus,
    /// Process ID of the current run.
    pub pid: Option<u32>,
    pub started_at: Option<Instant>,
    /// Exit code of the last run.
    pub exit_code: Option<i32>,
    /// Why the last start attempt failed.
    pub last_error: Option<String>,
    /// First local URL the dev server printed in this run.
    pub url: Option<String>,
    pub logs: LogBuffer,
    pub scroll: usize,
    pub follow: bool,
    /// Still running but no longer part of the workspace.
    pub stale: bool,
}

impl PackageState {
    pub fn new(package: Package, max_lines: usize) -> Self {
        Self {
            package,
            status: PackageStatus::Stopped,
            pid: None,
            started_at: None,
            exit_code: None,
            last_error: None,
            url: None,
            logs: LogBuffer::new(max_lines),
            scroll: 0,
            follow: true,
            stale: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.package.name
    }

    pub fn is_running(&self) -> bool {
        self.status == PackageStatus::Running
    }
}
