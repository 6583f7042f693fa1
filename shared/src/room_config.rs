//! Per-room YAML configuration.
//!
//! ```yaml
//! name: nursery
//! camera:
//!   uri: "0"
//!   frame_width: 640        # optional
//!   frame_height: 360       # optional
//!   subsample_rate: 4       # optional
//!   subsampled_stream_maxlen: 64
//!   realtime_stream_maxlen: 3
//! llm:
//!   model_name: Qwen/Qwen2.5-VL-3B-Instruct-AWQ
//! instructions:
//!   - Alert if the baby climbs out of the crib.
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::frame_source::CameraLocation;
use crate::stream::{RoomStreams, StreamBounds};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid configuration: {0}")]
    Validation(String),
    #[error("room `{name}` is configured twice ({first} and {second})")]
    DuplicateRoom {
        name: String,
        first: PathBuf,
        second: PathBuf,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CameraConfig {
    pub uri: String,
    #[serde(default = "default_frame_width")]
    pub frame_width: u32,
    #[serde(default = "default_frame_height")]
    pub frame_height: u32,
    /// Every `subsample_rate`-th captured frame also goes to the subsampled
    /// stream.
    #[serde(default = "default_subsample_rate")]
    pub subsample_rate: u64,
    #[serde(default = "default_subsampled_stream_maxlen")]
    pub subsampled_stream_maxlen: usize,
    #[serde(default = "default_realtime_stream_maxlen")]
    pub realtime_stream_maxlen: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct LlmConfig {
    pub model_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RoomConfig {
    pub name: String,
    pub camera: CameraConfig,
    pub llm: LlmConfig,
    #[serde(default)]
    pub instructions: Vec<String>,
}

impl RoomConfig {
    pub fn from_yaml(text: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(text)
    }

    /// Load and validate a room file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref().to_path_buf();
        let reader = std::fs::File::open(&path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        let config: RoomConfig = serde_yaml::from_reader(reader)
            .map_err(|source| ConfigError::Parse { path, source })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::Validation("room name is empty".into()));
        }
        if self.name.contains(':') {
            return Err(ConfigError::Validation(format!(
                "room name `{}` must not contain ':'",
                self.name
            )));
        }
        if self.camera.uri.trim().is_empty() {
            return Err(self.invalid("camera.uri is empty"));
        }
        if let Err(e) = CameraLocation::resolve(&self.camera.uri) {
            return Err(self.invalid(&format!("camera.uri: {e}")));
        }
        if self.camera.subsample_rate == 0 {
            return Err(self.invalid("camera.subsample_rate must be at least 1"));
        }
        if self.camera.subsampled_stream_maxlen == 0 || self.camera.realtime_stream_maxlen == 0 {
            return Err(self.invalid("stream bounds must be at least 1"));
        }
        if self.camera.frame_width == 0 || self.camera.frame_height == 0 {
            return Err(self.invalid("frame size must be non-zero"));
        }
        if self.llm.model_name.trim().is_empty() {
            return Err(self.invalid("llm.model_name is empty"));
        }
        Ok(())
    }

    /// The watcher cannot run without at least one non-blank instruction.
    pub fn require_instructions(&self) -> Result<&[String], ConfigError> {
        if self.instructions.iter().any(|i| i.trim().is_empty()) {
            return Err(self.invalid("instructions must not be blank"));
        }
        if self.instructions.is_empty() {
            return Err(self.invalid("at least one instruction is required"));
        }
        Ok(&self.instructions)
    }

    pub fn frame_size(&self) -> (u32, u32) {
        (self.camera.frame_width, self.camera.frame_height)
    }

    pub fn stream_bounds(&self) -> StreamBounds {
        StreamBounds {
            realtime_max_len: self.camera.realtime_stream_maxlen,
            subsampled_max_len: self.camera.subsampled_stream_maxlen,
            ..StreamBounds::default()
        }
    }

    pub fn streams(&self) -> RoomStreams {
        RoomStreams::for_room(&self.name, self.stream_bounds())
    }

    fn invalid(&self, reason: &str) -> ConfigError {
        ConfigError::Validation(format!("room `{}`: {}", self.name, reason))
    }
}

/// Load several room files keyed by room name.
pub fn load_room_configs<P: AsRef<Path>>(
    paths: &[P],
) -> Result<BTreeMap<String, RoomConfig>, ConfigError> {
    let mut rooms: BTreeMap<String, (PathBuf, RoomConfig)> = BTreeMap::new();
    for path in paths {
        let path = path.as_ref();
        let config = RoomConfig::load(path)?;
        if let Some((first, _)) = rooms.get(&config.name) {
            return Err(ConfigError::DuplicateRoom {
                name: config.name,
                first: first.clone(),
                second: path.to_path_buf(),
            });
        }
        rooms.insert(config.name.clone(), (path.to_path_buf(), config));
    }
    Ok(rooms
        .into_iter()
        .map(|(name, (_, config))| (name, config))
        .collect())
}

fn default_frame_width() -> u32 {
    640
}

fn default_frame_height() -> u32 {
    360
}

fn default_subsample_rate() -> u64 {
    4
}

fn default_subsampled_stream_maxlen() -> usize {
    64
}

fn default_realtime_stream_maxlen() -> usize {
    3
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::TrimMode;
    use std::fs;
    use tempfile::TempDir;

    const FULL: &str = r#"
name: custom_room
camera:
  uri: rtsp://example.com/stream
  frame_width: 1280
  frame_height: 720
  subsampled_stream_maxlen: 100
  subsample_rate: 8
llm:
  model_name: some/model
instructions:
  - custom instruction
"#;

    const PARTIAL: &str = r#"
name: partial_room
camera:
  uri: "2"
  frame_width: 800
llm:
  model_name: some/model
"#;

    fn write(dir: &TempDir, file: &str, text: &str) -> PathBuf {
        let path = dir.path().join(file);
        fs::write(&path, text).unwrap();
        path
    }

    #[test]
    fn test_load_with_optional_fields() {
        let dir = TempDir::new().unwrap();
        let config = RoomConfig::load(write(&dir, "custom.yaml", FULL)).unwrap();

        assert_eq!(config.name, "custom_room");
        assert_eq!(config.camera.uri, "rtsp://example.com/stream");
        assert_eq!(config.instructions, vec!["custom instruction".to_string()]);
        assert_eq!(config.frame_size(), (1280, 720));
        assert_eq!(config.camera.subsampled_stream_maxlen, 100);
        assert_eq!(config.camera.subsample_rate, 8);
    }

    #[test]
    fn test_partial_fields_keep_defaults() {
        let config = RoomConfig::from_yaml(PARTIAL).unwrap();
        assert_eq!(config.camera.frame_width, 800);
        assert_eq!(config.camera.frame_height, 360);
        assert_eq!(config.camera.subsampled_stream_maxlen, 64);
        assert_eq!(config.camera.realtime_stream_maxlen, 3);
        assert_eq!(config.camera.subsample_rate, 4);
        assert!(config.instructions.is_empty());
        assert!(config.require_instructions().is_err());
    }

    #[test]
    fn test_streams_follow_room_name_and_bounds() {
        let config = RoomConfig::from_yaml(FULL).unwrap();
        let streams = config.streams();
        assert_eq!(streams.realtime.key, "custom_room:realtime");
        assert_eq!(streams.realtime.trim, TrimMode::Exact);
        assert_eq!(streams.subsampled.max_len, 100);
        assert_eq!(streams.subsampled.trim, TrimMode::Approximate);
        assert_eq!(streams.logs.max_len, StreamBounds::default().logs_max_len);
    }

    #[test]
    fn test_missing_required_field_is_parse_error() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "bad.yaml", "name: x\ncamera:\n  uri: '0'\n");
        assert!(matches!(RoomConfig::load(path), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_zero_subsample_rate_is_rejected() {
        let dir = TempDir::new().unwrap();
        let text = PARTIAL.replace("frame_width: 800", "subsample_rate: 0");
        let path = write(&dir, "zero.yaml", &text);
        assert!(matches!(RoomConfig::load(path), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_camera_uri_must_resolve() {
        assert!(RoomConfig::from_yaml(FULL).unwrap().validate().is_ok());
        let text = PARTIAL.replace("uri: \"2\"", "uri: ftp://example.com/stream");
        assert!(matches!(
            RoomConfig::from_yaml(&text).unwrap().validate(),
            Err(ConfigError::Validation(reason)) if reason.contains("unsupported camera uri")
        ));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = TempDir::new().unwrap();
        let result = RoomConfig::load(dir.path().join("nope.yaml"));
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }

    #[test]
    fn test_load_multiple_rooms() {
        let dir = TempDir::new().unwrap();
        let paths = vec![
            write(&dir, "a.yaml", FULL),
            write(&dir, "b.yaml", PARTIAL),
        ];
        let rooms = load_room_configs(&paths).unwrap();
        assert_eq!(
            rooms.keys().cloned().collect::<Vec<_>>(),
            vec!["custom_room".to_string(), "partial_room".to_string()]
        );
    }

    #[test]
    fn test_duplicate_room_names_are_rejected() {
        let dir = TempDir::new().unwrap();
        let paths = vec![write(&dir, "a.yaml", FULL), write(&dir, "b.yaml", FULL)];
        assert!(matches!(
            load_room_configs(&paths),
            Err(ConfigError::DuplicateRoom { name, .. }) if name == "custom_room"
        ));
    }
}
