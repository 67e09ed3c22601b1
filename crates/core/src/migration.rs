//! Registry schema migrations.
//!
//! Each step is a pure function over the registry's `data` document. Steps
//! work on untyped JSON because older layouts do not deserialize into the
//! current types. Step `i` upgrades version `i` to `i + 1`.

use crate::server::normalize_name;
use crate::{Error, Result};
use serde_json::{Map, Value};
use tracing::info;

type Migration = fn(Value) -> Result<Value>;

const MIGRATIONS: &[Migration] = &[fold_legacy_server_map, convert_legacy_types];

/// Highest schema version this build understands.
pub const CURRENT_VERSION: u32 = MIGRATIONS.len() as u32;

/// Whether a document at `version` must be upgraded before use.
pub fn needs_migration(version: u32) -> bool {
    version < CURRENT_VERSION
}

/// Upgrade `data` from `from_version` to [`CURRENT_VERSION`].
pub fn migrate(mut data: Value, from_version: u32) -> Result<Value> {
    if from_version > CURRENT_VERSION {
        return Err(Error::config(
            format!(
                "Registry version {} is newer than the latest supported version {}",
                from_version, CURRENT_VERSION
            ),
            None,
        ));
    }

    for (step, migration) in MIGRATIONS.iter().enumerate().skip(from_version as usize) {
        info!("Migrating registry from version {} to {}", step, step + 1);
        data = migration(data)?;
    }
    Ok(data)
}

fn as_object(data: Value, version: usize) -> Result<Map<String, Value>> {
    match data {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Map::new()),
        other => Err(Error::config(
            format!(
                "Registry data at version {} must be an object, found {}",
                version, other
            ),
            None,
        )),
    }
}

/// v0 -> v1: fold the legacy `mcpServers` map into `servers`.
fn fold_legacy_server_map(data: Value) -> Result<Value> {
    let mut data = as_object(data, 0)?;

    let mut servers = match data.remove("servers") {
        Some(Value::Object(servers)) => servers,
        _ => Map::new(),
    };
    if let Some(Value::Object(legacy)) = data.remove("mcpServers") {
        for (name, entry) in legacy {
            servers.entry(name).or_insert(entry);
        }
    }

    data.insert("servers".to_string(), Value::Object(servers));
    Ok(Value::Object(data))
}

/// v1 -> v2: legacy `type: npx | binary` entries become `kind: command`,
/// and keys are normalized.
fn convert_legacy_types(data: Value) -> Result<Value> {
    let mut data = as_object(data, 1)?;

    let servers = match data.remove("servers") {
        Some(Value::Object(servers)) => servers,
        _ => Map::new(),
    };

    let mut converted = Map::new();
    for (key, entry) in servers {
        let name = normalize_name(&key);
        let entry = convert_entry(entry);
        if converted.insert(name.clone(), entry).is_some() {
            return Err(Error::config(
                format!("Registry contains duplicate server name '{}' after normalization", name),
                None,
            ));
        }
    }

    data.insert("servers".to_string(), Value::Object(converted));
    Ok(Value::Object(data))
}

fn convert_entry(entry: Value) -> Value {
    let Value::Object(mut entry) = entry else {
        return entry;
    };
    if entry.contains_key("kind") {
        return Value::Object(entry);
    }

    let legacy_type = entry
        .remove("type")
        .and_then(|t| t.as_str().map(str::to_string));

    if legacy_type.as_deref() == Some("npx") {
        let command = entry
            .get("command")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if command != "npx" && !command.is_empty() {
            let mut args = vec![Value::String(command)];
            if let Some(Value::Array(rest)) = entry.remove("args") {
                args.extend(rest);
            }
            entry.insert("command".to_string(), Value::String("npx".to_string()));
            entry.insert("args".to_string(), Value::Array(args));
        }
    }

    let kind = if entry.contains_key("host") { "socket" } else { "command" };
    entry.insert("kind".to_string(), Value::String(kind.to_string()));
    Value::Object(entry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_current_version_matches_steps() {
        assert_eq!(CURRENT_VERSION, 2);
        assert!(needs_migration(0));
        assert!(!needs_migration(CURRENT_VERSION));
    }

    #[test]
    fn test_migrate_from_v0_legacy_layout() {
        let v0 = json!({
            "mcpServers": {
                "GitHub": {"type": "npx", "command": "@modelcontextprotocol/server-github", "args": [], "env": {"TOKEN": "t"}},
                "local": {"type": "binary", "command": "/usr/bin/srv", "args": ["--stdio"], "env": {}}
            }
        });

        let migrated = migrate(v0, 0).unwrap();
        assert_eq!(
            migrated,
            json!({
                "servers": {
                    "github": {"kind": "command", "command": "npx", "args": ["@modelcontextprotocol/server-github"], "env": {"TOKEN": "t"}},
                    "local": {"kind": "command", "command": "/usr/bin/srv", "args": ["--stdio"], "env": {}}
                }
            })
        );
    }

    #[test]
    fn test_servers_win_over_legacy_map() {
        let v0 = json!({
            "servers": {"a": {"kind": "command", "command": "new"}},
            "mcpServers": {"a": {"type": "binary", "command": "old"}, "b": {"type": "binary", "command": "b"}}
        });
        let migrated = migrate(v0, 0).unwrap();
        assert_eq!(migrated["servers"]["a"]["command"], "new");
        assert_eq!(migrated["servers"]["b"]["kind"], "command");
        assert!(migrated.get("mcpServers").is_none());
    }

    #[test]
    fn test_empty_document_migrates() {
        assert_eq!(migrate(Value::Null, 0).unwrap(), json!({"servers": {}}));
    }

    #[test]
    fn test_migration_keeps_unrelated_keys() {
        let v1 = json!({"servers": {}, "note": "keep me"});
        assert_eq!(migrate(v1, 1).unwrap()["note"], "keep me");
    }

    #[test]
    fn test_duplicate_names_after_normalization_fail() {
        let v1 = json!({"servers": {"Foo": {"command": "a"}, "foo": {"command": "b"}}});
        let err = migrate(v1, 1).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Config);
    }

    #[test]
    fn test_future_version_fails_loudly() {
        let err = migrate(json!({}), CURRENT_VERSION + 1).unwrap_err();
        assert!(err.to_string().contains("newer than the latest supported version"));
    }

    #[test]
    fn test_up_to_date_document_is_untouched() {
        let v2 = json!({"servers": {"a": {"kind": "command", "command": "x"}}});
        assert_eq!(migrate(v2.clone(), CURRENT_VERSION).unwrap(), v2);
    }
}
