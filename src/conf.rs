//! Config file mutation for parameter sweeps.
//!
//! Patched files are written next to their source as `<stem>-mod.conf`; the
//! source is never touched.

use std::path::{Path, PathBuf};

use serde_json::{Map, Value};

use crate::error::{DeployError, Result};

/// Path of the patched copy of `source`.
pub fn patched_path(source: &Path) -> PathBuf {
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    source.with_file_name(format!("{}-mod.conf", stem))
}

/// Set `key value` in a redis config, replacing the directive if present.
pub fn patch_redis(source: &Path, key: &str, value: &str) -> Result<PathBuf> {
    let text = std::fs::read_to_string(source)?;
    let patched = set_directive(&text, key, value);
    let dest = patched_path(source);
    std::fs::write(&dest, patched)?;
    Ok(dest)
}

fn set_directive(text: &str, key: &str, value: &str) -> String {
    let directive = format!("{} {}", key, value);
    let mut found = false;
    let mut lines: Vec<String> = text
        .lines()
        .map(|line| {
            if !found && line.split_whitespace().next() == Some(key) {
                found = true;
                directive.clone()
            } else {
                line.to_string()
            }
        })
        .collect();
    if !found {
        lines.push(directive);
    }
    let mut out = lines.join("\n");
    out.push('\n');
    out
}

/// Set a dotted key such as `net.maxIncomingConnections` in a JSON config.
pub fn patch_mongo(source: &Path, key: &str, value: Value) -> Result<PathBuf> {
    let text = std::fs::read_to_string(source)?;
    let mut doc: Value = if text.trim().is_empty() {
        Value::Object(Map::new())
    } else {
        serde_json::from_str(&text)?
    };
    set_dotted(&mut doc, key, value)?;
    let dest = patched_path(source);
    std::fs::write(&dest, serde_json::to_string_pretty(&doc)?)?;
    Ok(dest)
}

fn set_dotted(doc: &mut Value, key: &str, value: Value) -> Result<()> {
    let mut parts: Vec<&str> = key.split('.').collect();
    let last = match parts.pop() {
        Some(last) if !last.is_empty() => last,
        _ => return Err(DeployError::ConfigPatch(format!("empty key {:?}", key))),
    };

    let mut node = doc;
    for part in parts {
        let map = node
            .as_object_mut()
            .ok_or_else(|| DeployError::ConfigPatch(format!("{} is not an object", part)))?;
        node = map
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    node.as_object_mut()
        .ok_or_else(|| DeployError::ConfigPatch(format!("parent of {} is not an object", last)))?
        .insert(last.to_string(), value);
    Ok(())
}
