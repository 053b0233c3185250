//! Boundary parsers for the runtime's string-encoded formats.
//!
//! Environment entries travel as `KEY=VALUE` and bind mounts as `src:dst[:mode]`.
//! Both are parsed into records here, once, and only records flow further in.

use crate::error::ProvisionError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvEntry {
    pub name: String,
    pub value: String,
}

/// Split at the first `=`. A missing `=` yields an empty value.
pub fn parse_env(entry: &str) -> Result<EnvEntry, ProvisionError> {
    let (name, value) = match entry.split_once('=') {
        Some((n, v)) => (n, v),
        None => (entry, ""),
    };
    if name.is_empty() {
        return Err(ProvisionError::Configuration(format!("env entry {:?} has no name", entry)));
    }
    Ok(EnvEntry { name: name.to_string(), value: value.to_string() })
}

pub fn parse_env_list(entries: &[String]) -> Result<Vec<EnvEntry>, ProvisionError> {
    entries.iter().map(|e| parse_env(e)).collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMount {
    pub source: String,
    pub destination: String,
    pub read_only: bool,
}

/// Parse `src:dst[:mode]`. The mode is a comma separated option list; `ro` makes the
/// mount read-only, anything else (or an empty mode) leaves it read-write.
pub fn parse_bind(bind: &str) -> Result<BindMount, ProvisionError> {
    let mut parts = bind.splitn(3, ':');
    let source = parts.next().unwrap_or_default();
    let destination = parts.next().unwrap_or_default();
    let mode = parts.next().unwrap_or_default();
    if source.is_empty() {
        return Err(ProvisionError::Configuration(format!("bind {:?} has no source", bind)));
    }
    if destination.is_empty() {
        return Err(ProvisionError::Configuration(format!("bind {:?} has no destination", bind)));
    }
    let read_only = mode.split(',').any(|opt| opt == "ro");
    Ok(BindMount { source: source.to_string(), destination: destination.to_string(), read_only })
}

pub fn parse_bind_list(binds: &[String]) -> Result<Vec<BindMount>, ProvisionError> {
    binds.iter().map(|b| parse_bind(b)).collect()
}
