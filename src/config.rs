use crate::normalizer::NamePolicy;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::{fs, path::Path};

pub const DEFAULT_CONFIG_PATH: &str = "card-analyzer.toml";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub db_path: String,
    pub blob_dir: String,
    /// Where `<image name>.json` extraction results are looked up
    pub fields_dir: Option<String>,
    pub server_addr: String,
    pub name_policy: NamePolicy,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            db_path: "cards.db".to_string(),
            blob_dir: "blobs".to_string(),
            fields_dir: None,
            server_addr: "127.0.0.1:3000".to_string(),
            name_policy: NamePolicy::default(),
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Invalid config {}", path.display()))
    }

    /// A missing file means defaults; an unreadable or invalid one is an error
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Config::default())
        }
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }
}
