//! `.env` handling.
//!
//! The daemon both consumes and maintains the node's `.env` file: it is loaded
//! into the process environment at startup (and again by the `reloadEnv`
//! action), and rewritten during bootstrap with the resolved cloud facts while
//! preserving every key an operator put there.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Load the file into the process environment. A missing file is fine; values
/// already present in the environment win.
pub fn apply(path: &Path) -> Result<()> {
    match dotenvy::from_path(path) {
        Ok(()) => Ok(()),
        Err(dotenvy::Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("load {}", path.display())),
    }
}

/// Read the file as an ordered key/value list. Missing file yields an empty
/// list so a first boot can still write one.
pub fn read(path: &Path) -> Result<Vec<(String, String)>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let mut pairs = Vec::new();
    for item in dotenvy::from_path_iter(path)
        .with_context(|| format!("parse {}", path.display()))?
    {
        let (key, value) = item.with_context(|| format!("parse {}", path.display()))?;
        pairs.push((key, value));
    }
    Ok(pairs)
}

/// Merge `updates` into the file, replacing matching keys in place and
/// appending new ones, then write atomically via a tmp file + rename.
pub fn rewrite(path: &Path, updates: &[(&str, String)]) -> Result<()> {
    let mut pairs = read(path)?;

    for (key, value) in updates {
        match pairs.iter_mut().find(|(k, _)| k == key) {
            Some(pair) => pair.1 = value.clone(),
            None => pairs.push((key.to_string(), value.clone())),
        }
    }

    let mut body = String::new();
    for (key, value) in &pairs {
        body.push_str(key);
        body.push('=');
        body.push_str(&quote_if_needed(value));
        body.push('\n');
    }

    let tmp: PathBuf = path.with_extension("tmp");
    fs::write(&tmp, body).with_context(|| format!("write {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| {
        format!(
            "move env file into place ({} -> {})",
            tmp.display(),
            path.display()
        )
    })?;

    Ok(())
}

fn quote_if_needed(value: &str) -> String {
    let needs_quoting = value
        .chars()
        .any(|c| c.is_whitespace() || c == '#' || c == '"');
    if needs_quoting {
        format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
    } else {
        value.to_string()
    }
}
