//! Save locations, persisted as `key=value` lines.
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::{debug, warn};

const CONFIG_FILE: &str = "settings.conf";
const PICTURE_DIR_KEY: &str = "picture_dir";
const VIDEO_DIR_KEY: &str = "video_dir";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    pub screenshot_dir: PathBuf,
    pub recording_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        let home = dirs::home_dir().unwrap_or_default();
        let pictures = dirs::picture_dir().unwrap_or_else(|| home.join("Pictures"));
        let videos = dirs::video_dir().unwrap_or_else(|| home.join("Videos"));

        Self {
            screenshot_dir: pictures.join("Screenshots"),
            recording_dir: videos.join("Recordings"),
        }
    }
}

impl Config {
    pub fn path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("simpleshot").join(CONFIG_FILE))
    }

    /// Reads the config file; a missing or unreadable file gives the defaults.
    pub fn load() -> Self {
        let Some(path) = Self::path() else {
            return Self::default();
        };

        match fs::read_to_string(&path) {
            Ok(text) => Self::parse(&text),
            Err(err) => {
                debug!("using default config, {}: {err}", path.display());
                Self::default()
            }
        }
    }

    fn parse(text: &str) -> Self {
        let mut config = Self::default();

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                warn!("skipping malformed config line {line:?}");
                continue;
            };
            let value = value.trim();
            if value.is_empty() {
                continue;
            }

            match key.trim() {
                PICTURE_DIR_KEY => config.screenshot_dir = PathBuf::from(value),
                VIDEO_DIR_KEY => config.recording_dir = PathBuf::from(value),
                other => debug!("ignoring unknown config key {other:?}"),
            }
        }

        config
    }

    fn render(&self) -> String {
        format!(
            "{PICTURE_DIR_KEY}={}\n{VIDEO_DIR_KEY}={}\n",
            self.screenshot_dir.display(),
            self.recording_dir.display()
        )
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::path().context("cannot locate a config directory")?;
        self.save_to(&path)
    }

    pub(crate) fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("cannot create {}", parent.display()))?;
        }
        fs::write(path, self.render())
            .with_context(|| format!("cannot write {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_keys_override_defaults() {
        let config = Config::parse("picture_dir=/data/shots\nvideo_dir = /data/videos \n");
        assert_eq!(config.screenshot_dir, PathBuf::from("/data/shots"));
        assert_eq!(config.recording_dir, PathBuf::from("/data/videos"));
    }

    #[test]
    fn malformed_and_unknown_lines_are_skipped() {
        let config = Config::parse("garbage\n# comment\ntheme=dark\nvideo_dir=\npicture_dir=/a=b\n");
        assert_eq!(config.screenshot_dir, PathBuf::from("/a=b"));
        assert_eq!(config.recording_dir, Config::default().recording_dir);
    }

    #[test]
    fn saved_file_loads_back() {
        let path = std::env::temp_dir()
            .join(format!("simpleshot-config-{}", std::process::id()))
            .join(CONFIG_FILE);
        let config = Config {
            screenshot_dir: PathBuf::from("/tmp/shots"),
            recording_dir: PathBuf::from("/tmp/recordings"),
        };

        config.save_to(&path).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(Config::parse(&text), config);

        let _ = fs::remove_dir_all(path.parent().unwrap());
    }
}
