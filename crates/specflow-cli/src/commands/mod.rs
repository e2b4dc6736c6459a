//! CLI command implementations.
//!
//! Each submodule corresponds to a top-level CLI command and drives the
//! specflow-core engine directly.

pub mod workflow;

use std::path::PathBuf;

use serde_json::{Map, Value};
use specflow_core::workflow::DefinitionLocator;

/// Where agent, gate, prompt and schema definitions are looked up.
#[derive(Debug, Clone, Default, clap::Args)]
pub struct DefinitionDirs {
    /// Project definition directory (shadows builtins)
    #[arg(long, env = "SPECFLOW_PROJECT_DIR", default_value = ".specflow")]
    pub project_dir: Option<PathBuf>,
    /// Builtin definition directory
    #[arg(long, env = "SPECFLOW_BUILTIN_DIR")]
    pub builtin_dir: Option<PathBuf>,
}

impl DefinitionDirs {
    pub fn locator(&self) -> DefinitionLocator {
        DefinitionLocator::new(self.project_dir.clone(), self.builtin_dir.clone())
    }
}

/// Parse `key=value` pairs into invocation parameters. A value that parses
/// as JSON (numbers, booleans, lists, objects) is kept as JSON; anything
/// else is a plain string.
pub fn parse_params(pairs: &[String]) -> Result<Map<String, Value>, String> {
    let mut params = Map::new();
    for pair in pairs {
        let (key, raw) = pair
            .split_once('=')
            .ok_or_else(|| format!("invalid --param '{}': expected KEY=VALUE", pair))?;
        let key = key.trim();
        if key.is_empty() {
            return Err(format!("invalid --param '{}': empty key", pair));
        }
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        params.insert(key.to_string(), value);
    }
    Ok(params)
}

/// Pretty-print a JSON value to stdout.
pub fn print_json(value: &Value) {
    println!(
        "{}",
        serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
    );
}

pub fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let head: String = s.chars().take(max.saturating_sub(1)).collect();
        format!("{}…", head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_params() {
        let params = parse_params(&[
            "branch=feature/login".to_string(),
            "prNumber=42".to_string(),
            "changedFiles=[\"src/a.rs\"]".to_string(),
            "note=a=b".to_string(),
        ])
        .unwrap();
        assert_eq!(params["branch"], "feature/login");
        assert_eq!(params["prNumber"], 42);
        assert_eq!(params["changedFiles"], json!(["src/a.rs"]));
        assert_eq!(params["note"], "a=b");

        assert!(parse_params(&["novalue".to_string()]).is_err());
        assert!(parse_params(&["=x".to_string()]).is_err());
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("a-very-long-name", 6), "a-ver…");
    }
}
