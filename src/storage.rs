use crate::config::StorageConfig;
use crate::device::VideoStream;
use crate::error::{LmConnectError, Result};
use futures::StreamExt;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, info};

const APP_DIR_NAME: &str = "LmConnect";
const APP_DIR_NAME_UNIX: &str = "lmconnect";

/// Shot video persistence under a per-user application directory
#[derive(Debug, Clone)]
pub struct VideoStorage {
    directory: PathBuf,
}

impl VideoStorage {
    pub fn new<P: Into<PathBuf>>(directory: P) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    /// Use the configured directory, or the platform default
    pub fn from_config(config: &StorageConfig) -> Self {
        match &config.video_directory {
            Some(path) if !path.trim().is_empty() => Self::new(path),
            _ => Self::new(default_video_directory()),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Deterministic location of a shot's video
    pub fn video_path(&self, shot_id: &str) -> PathBuf {
        self.directory
            .join(format!("{}.mp4", sanitize_file_stem(shot_id)))
    }

    /// Create the video directory if it does not exist
    pub async fn ensure_directory(&self) -> Result<()> {
        if !fs::try_exists(&self.directory).await.unwrap_or(false) {
            fs::create_dir_all(&self.directory).await.map_err(|e| {
                LmConnectError::system(format!(
                    "Failed to create video directory {}: {}",
                    self.directory.display(),
                    e
                ))
            })?;
            info!("Created video directory: {}", self.directory.display());
        }
        Ok(())
    }

    /// Write a video stream to disk chunk by chunk.
    ///
    /// Returns the file path and the number of bytes written. A failing stream
    /// leaves the partial file in place.
    pub async fn save_video(&self, shot_id: &str, mut stream: VideoStream) -> Result<(PathBuf, u64)> {
        self.ensure_directory().await?;

        let path = self.video_path(shot_id);
        let file = fs::File::create(&path).await?;
        let mut writer = BufWriter::new(file);
        let mut written: u64 = 0;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            writer.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }

        writer.flush().await?;
        debug!("Wrote {} bytes to {}", written, path.display());

        Ok((path, written))
    }
}

/// Platform application-data directory for shot videos
pub fn default_video_directory() -> PathBuf {
    let home = std::env::var_os("HOME").map(PathBuf::from);

    if cfg!(target_os = "windows") {
        if let Some(local) = std::env::var_os("LOCALAPPDATA") {
            return PathBuf::from(local).join(APP_DIR_NAME).join("Videos");
        }
    } else if cfg!(target_os = "macos") {
        if let Some(home) = home {
            return home
                .join("Library")
                .join("Application Support")
                .join(APP_DIR_NAME)
                .join("Videos");
        }
    } else {
        if let Some(data_home) = std::env::var_os("XDG_DATA_HOME").filter(|v| !v.is_empty()) {
            return PathBuf::from(data_home).join(APP_DIR_NAME_UNIX).join("videos");
        }
        if let Some(home) = home {
            return home
                .join(".local")
                .join("share")
                .join(APP_DIR_NAME_UNIX)
                .join("videos");
        }
    }

    PathBuf::from("videos")
}

/// Keep shot ids from escaping the video directory
fn sanitize_file_stem(shot_id: &str) -> String {
    let stem: String = shot_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();

    if stem.is_empty() {
        "unnamed".to_string()
    } else {
        stem
    }
}
