//! System clipboard access for copying a package console.

use anyhow::{bail, Context, Result};

/// Places the console text of a package on the system clipboard.
pub fn copy_console(name: &str, text: &str) -> Result<()> {
    if text.is_empty() {
        bail!("console of {} is empty", name);
    }
    let mut clipboard = arboard::Clipboard::new().context("failed to access clipboard")?;
    clipboard
        .set_text(text.to_owned())
        .with_context(|| format!("failed to copy console of {}", name))?;
    Ok(())
}
