use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Project configuration from mcp-manager.yaml
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProjectConfig {
    /// Servers this project needs running
    #[serde(default)]
    pub servers: Vec<String>,
}

impl ProjectConfig {
    /// Load project config from a file path
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: ProjectConfig = serde_yaml::from_str(&content)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_load_servers() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("mcp-manager.yaml");
        fs::write(&path, "servers:\n  - github\n  - files\n").unwrap();

        let config = ProjectConfig::load(&path).unwrap();
        assert_eq!(config.servers, vec!["github", "files"]);
    }

    #[test]
    fn test_empty_file_has_no_servers() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("mcp-manager.yaml");
        fs::write(&path, "").unwrap();
        assert!(ProjectConfig::load(&path).unwrap().servers.is_empty());
    }
}
