//! Server configuration.
//!
//! [`Config`] is deserialized from JSON. Every section defaults sensibly so
//! an empty `{}` file, or no file at all, is valid.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::library::{MediaLibrary, DEFAULT_CONTENT_TYPE};
use crate::stream::CHUNK_SIZE;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub media: MediaConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    /// Directory holding the uploaded files.
    pub root: PathBuf,
    /// Bytes read from disk per body chunk.
    pub chunk_size: usize,
    /// Served when a file's extension does not map to a known type.
    pub default_content_type: String,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("uploads"),
            chunk_size: CHUNK_SIZE,
            default_content_type: DEFAULT_CONTENT_TYPE.to_string(),
        }
    }
}

impl MediaConfig {
    pub fn library(&self) -> MediaLibrary {
        MediaLibrary::new(&self.root)
            .with_chunk_size(self.chunk_size)
            .with_default_content_type(self.default_content_type.clone())
    }
}

impl Config {
    pub fn from_json(json_str: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json_str)
    }

    /// Load configuration from a file path, falling back to defaults if the
    /// path is `None`, the file does not exist, or it cannot be parsed.
    pub fn load_or_default(path: Option<&Path>) -> Self {
        let Some(path) = path else {
            return Self::default();
        };

        match std::fs::read_to_string(path) {
            Ok(contents) => Self::from_json(&contents).unwrap_or_else(|e| {
                tracing::warn!("Failed to parse config file {}: {e}", path.display());
                Self::default()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No config file at {}; using defaults", path.display());
                Self::default()
            }
            Err(e) => {
                tracing::warn!("Failed to read config file {}: {e}", path.display());
                Self::default()
            }
        }
    }

    /// Return a list of validation warnings (non-fatal issues).
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.server.port == 0 {
            warnings.push("server.port is 0; a random port will be assigned".into());
        }
        if self.media.chunk_size == 0 {
            warnings.push("media.chunk_size is 0; 1 byte chunks will be used".into());
        }
        if !self.media.root.is_dir() {
            warnings.push(format!("media.root {} is not a directory", self.media.root.display()));
        }
        if self.media.default_content_type.parse::<mime_guess::mime::Mime>().is_err() {
            warnings.push(format!(
                "media.default_content_type {:?} is not a valid MIME type",
                self.media.default_content_type
            ));
        }

        warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_json_is_default() {
        assert_eq!(Config::default(), Config::from_json("{}").unwrap());
    }

    #[test]
    fn test_partial_sections() {
        let config = Config::from_json(r#"{ "server": { "port": 8080 }, "media": { "root": "/srv/audio" } }"#).unwrap();
        assert_eq!("0.0.0.0:8080", config.server.bind_addr());
        assert_eq!(PathBuf::from("/srv/audio"), config.media.root);
        assert_eq!(CHUNK_SIZE, config.media.chunk_size);
    }

    #[test]
    fn test_invalid_json() {
        assert!(Config::from_json(r#"{ "server": { "port": "eighty" } }"#).is_err());
    }

    #[test]
    fn test_load_or_default() {
        assert_eq!(Config::default(), Config::load_or_default(None));

        let dir = tempfile::tempdir().unwrap();
        assert_eq!(Config::default(), Config::load_or_default(Some(dir.path().join("missing.json").as_path())));

        let broken = dir.path().join("broken.json");
        std::fs::write(&broken, "{ not json").unwrap();
        assert_eq!(Config::default(), Config::load_or_default(Some(broken.as_path())));

        let good = dir.path().join("voxly.json");
        std::fs::write(&good, r#"{ "media": { "chunk_size": 4096 } }"#).unwrap();
        assert_eq!(4096, Config::load_or_default(Some(good.as_path())).media.chunk_size);
    }

    #[test]
    fn test_validate() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.media.root = dir.path().to_path_buf();
        assert!(config.validate().is_empty());

        config.server.port = 0;
        config.media.chunk_size = 0;
        config.media.root = dir.path().join("nope");
        config.media.default_content_type = "nonsense".into();
        assert_eq!(4, config.validate().len());
    }
}
