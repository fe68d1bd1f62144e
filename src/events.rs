//! Event definitions for the application event loop.
//!
//! Discovery results, lifecycle transitions, process output and terminal input
//! all arrive on one channel as [`Event`]s. Lifecycle events double as user
//! notifications: [`Event::notification`] renders the message and
//! [`Event::severity`] says how loudly to show it.

use crossterm::event::KeyEvent;

use crate::output::StreamKind;
use crate::package::Package;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Error,
}

/// Represents an event in the application's main event loop.
#[derive(Debug, Clone)]
pub enum Event {
    /// A discovery pass finished with this snapshot.
    PackagesLoaded(Vec<Package>),
    /// A discovery pass could not run at all.
    DiscoveryError { message: String },
    /// A package process was spawned.
    PackageStarted {
        name: String,
        pid: Option<u32>,
        command: String,
    },
    /// A package left the running state, by request or on its own.
    PackageStopped { name: String },
    /// The process of a package ended (None usually implies signal termination).
    PackageExited { name: String, code: Option<i32> },
    /// A package process could not be started.
    PackageError { name: String, message: String },
    /// A line of output (stdout or stderr) from a package process.
    PackageOutput {
        name: String,
        line: String,
        stream: StreamKind,
    },
    /// The console of a package was reset for a new run.
    ConsoleCleared { name: String },
    /// A keyboard event received from the user.
    Key(KeyEvent),
    /// The terminal window was resized.
    Resize { width: u16, height: u16 },
    /// SIGINT/SIGTERM was received.
    Shutdown,
}

impl Event {
    /// User-facing notification text, for events that warrant one.
    pub fn notification(&self) -> Option<String> {
        match self {
            Event::PackagesLoaded(packages) => Some(match packages.len() {
                0 => "No Turborepo packages found".to_string(),
                1 => "Loaded 1 package".to_string(),
                n => format!("Loaded {} packages", n),
            }),
            Event::DiscoveryError { message } => {
                Some(format!("Error loading Turborepo packages: {}", message))
            }
            Event::PackageStarted { name, .. } => Some(format!("Started package: {}", name)),
            Event::PackageStopped { name } => Some(format!("Package {} has stopped", name)),
            Event::PackageError { name, message } => {
                Some(format!("Error starting package {}: {}", name, message))
            }
            _ => None,
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            Event::DiscoveryError { .. } | Event::PackageError { .. } => Severity::Error,
            _ => Severity::Info,
        }
    }
}
