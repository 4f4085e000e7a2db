//! Background downloads triggered by video and point cloud notifications.
//!
//! Each notification spawns one independent task. Failures are logged at the
//! task boundary and never reach the session; at teardown the manager waits a
//! bounded grace period and then abandons whatever is still running.

use crate::config::StorageConfig;
use crate::device::LaunchMonitor;
use crate::error::{LmConnectError, Result};
use crate::storage::VideoStorage;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Resource fetched on demand for a shot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FetchKind {
    Video,
    PointCloud,
}

impl fmt::Display for FetchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchKind::Video => f.write_str("video"),
            FetchKind::PointCloud => f.write_str("point cloud"),
        }
    }
}

/// How one fetch ended
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    VideoSaved {
        shot_id: String,
        path: PathBuf,
        bytes: u64,
    },
    PointCloudReceived {
        shot_id: String,
        points: usize,
    },
    Cancelled {
        shot_id: String,
        kind: FetchKind,
    },
}

/// Running totals across all fetches of a session
#[derive(Debug, Default)]
pub struct FetchStats {
    started: AtomicU64,
    succeeded: AtomicU64,
    unauthorized: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
}

impl FetchStats {
    pub fn started(&self) -> u64 {
        self.started.load(Ordering::Acquire)
    }

    pub fn succeeded(&self) -> u64 {
        self.succeeded.load(Ordering::Acquire)
    }

    pub fn unauthorized(&self) -> u64 {
        self.unauthorized.load(Ordering::Acquire)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Acquire)
    }

    pub fn cancelled(&self) -> u64 {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Result of waiting for in-flight fetches at teardown
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    pub completed: bool,
    pub abandoned: usize,
}

/// Supervisor for auxiliary fetch tasks
#[derive(Clone)]
pub struct AuxiliaryFetchManager {
    tracker: TaskTracker,
    cancellation_token: CancellationToken,
    storage: Arc<VideoStorage>,
    save_videos: bool,
    fetch_point_clouds: bool,
    preview_points: usize,
    stats: Arc<FetchStats>,
}

impl AuxiliaryFetchManager {
    pub fn new(storage: VideoStorage, preview_points: usize) -> Self {
        Self {
            tracker: TaskTracker::new(),
            cancellation_token: CancellationToken::new(),
            storage: Arc::new(storage),
            save_videos: true,
            fetch_point_clouds: true,
            preview_points,
            stats: Arc::new(FetchStats::default()),
        }
    }

    pub fn from_config(config: &StorageConfig) -> Self {
        Self {
            save_videos: config.save_videos,
            fetch_point_clouds: config.fetch_point_clouds,
            ..Self::new(VideoStorage::from_config(config), config.point_cloud_preview)
        }
    }

    pub fn storage(&self) -> &VideoStorage {
        &self.storage
    }

    pub fn stats(&self) -> Arc<FetchStats> {
        Arc::clone(&self.stats)
    }

    /// Fetches spawned but not yet finished
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Start downloading the video for a shot
    pub fn fetch_video(&self, device: Arc<dyn LaunchMonitor>, shot_id: String) {
        if !self.save_videos {
            debug!("Video saving disabled, ignoring video for shot {}", shot_id);
            return;
        }

        let storage = Arc::clone(&self.storage);
        self.spawn(FetchKind::Video, shot_id, move |shot_id| async move {
            let stream = device.get_shot_video(&shot_id).await?;
            let (path, bytes) = storage.save_video(&shot_id, stream).await?;
            Ok::<_, LmConnectError>(FetchOutcome::VideoSaved {
                shot_id,
                path,
                bytes,
            })
        });
    }

    /// Start downloading the point cloud for a shot
    pub fn fetch_point_cloud(&self, device: Arc<dyn LaunchMonitor>, shot_id: String) {
        if !self.fetch_point_clouds {
            debug!(
                "Point cloud fetching disabled, ignoring point cloud for shot {}",
                shot_id
            );
            return;
        }

        let preview_points = self.preview_points;
        self.spawn(FetchKind::PointCloud, shot_id, move |shot_id| async move {
            let cloud = device.get_point_cloud(&shot_id).await?;
            info!("Point cloud for shot {}: {} points", shot_id, cloud.len());
            for point in cloud.preview(preview_points) {
                info!("  {}", point);
            }
            Ok::<_, LmConnectError>(FetchOutcome::PointCloudReceived {
                shot_id,
                points: cloud.len(),
            })
        });
    }

    fn spawn<F, Fut>(&self, kind: FetchKind, shot_id: String, fetch: F)
    where
        F: FnOnce(String) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<FetchOutcome>> + Send + 'static,
    {
        let token = self.cancellation_token.clone();
        let stats = Arc::clone(&self.stats);
        stats.started.fetch_add(1, Ordering::AcqRel);
        debug!("Fetching {} for shot {}", kind, shot_id);

        self.tracker.spawn(async move {
            let outcome = tokio::select! {
                result = fetch(shot_id.clone()) => result,
                _ = token.cancelled() => Ok(FetchOutcome::Cancelled {
                    shot_id: shot_id.clone(),
                    kind,
                }),
            };
            record_outcome(&stats, kind, &shot_id, outcome);
        });
    }

    /// Wait up to `grace` for in-flight fetches, then abandon the rest.
    ///
    /// Abandoned downloads may leave partial files behind.
    pub async fn drain(&self, grace: Duration) -> DrainReport {
        self.tracker.close();
        let pending = self.tracker.len();
        if pending == 0 {
            return DrainReport {
                completed: true,
                abandoned: 0,
            };
        }

        info!("Waiting up to {:?} for {} auxiliary fetches", grace, pending);
        match timeout(grace, self.tracker.wait()).await {
            Ok(()) => DrainReport {
                completed: true,
                abandoned: 0,
            },
            Err(_) => {
                let abandoned = self.tracker.len();
                warn!(
                    "Abandoning {} auxiliary fetches after {:?}",
                    abandoned, grace
                );
                self.cancellation_token.cancel();
                DrainReport {
                    completed: false,
                    abandoned,
                }
            }
        }
    }
}

fn record_outcome(stats: &FetchStats, kind: FetchKind, shot_id: &str, outcome: Result<FetchOutcome>) {
    match outcome {
        Ok(FetchOutcome::VideoSaved { path, bytes, .. }) => {
            stats.succeeded.fetch_add(1, Ordering::AcqRel);
            info!(
                "Saved video for shot {} ({} bytes) to {}",
                shot_id,
                bytes,
                path.display()
            );
        }
        Ok(FetchOutcome::PointCloudReceived { .. }) => {
            stats.succeeded.fetch_add(1, Ordering::AcqRel);
        }
        Ok(FetchOutcome::Cancelled { .. }) => {
            stats.cancelled.fetch_add(1, Ordering::AcqRel);
            debug!("Fetch of {} for shot {} cancelled", kind, shot_id);
        }
        Err(LmConnectError::NotAuthorized { .. }) => {
            stats.unauthorized.fetch_add(1, Ordering::AcqRel);
            warn!("Not authorized to fetch {} for shot {}", kind, shot_id);
        }
        Err(e) => {
            stats.failed.fetch_add(1, Ordering::AcqRel);
            error!("Failed to fetch {} for shot {}: {}", kind, shot_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimulatorConfig;
    use crate::simulator::SimulatedDevice;
    use tempfile::TempDir;

    async fn connected_device(config: SimulatorConfig) -> Arc<SimulatedDevice> {
        let device = Arc::new(SimulatedDevice::new("LM-1", config));
        device.connect().await.unwrap();
        device
    }

    #[tokio::test]
    async fn test_video_fetch_persists_file() {
        let temp_dir = TempDir::new().unwrap();
        let manager = AuxiliaryFetchManager::new(VideoStorage::new(temp_dir.path()), 3);
        let device = connected_device(SimulatorConfig::manual()).await;

        manager.fetch_video(device, "shot-1".to_string());
        let report = manager.drain(Duration::from_secs(5)).await;

        assert!(report.completed);
        assert_eq!(manager.stats().succeeded(), 1);
        let path = manager.storage().video_path("shot-1");
        assert!(tokio::fs::metadata(&path).await.unwrap().len() > 0);
    }

    #[tokio::test]
    async fn test_unauthorized_fetches_are_contained() {
        let temp_dir = TempDir::new().unwrap();
        let manager = AuxiliaryFetchManager::new(VideoStorage::new(temp_dir.path()), 3);
        let device = connected_device(SimulatorConfig::manual()).await;
        device.deny_video();
        device.deny_point_cloud();

        manager.fetch_video(device.clone(), "shot-1".to_string());
        manager.fetch_point_cloud(device, "shot-1".to_string());
        let report = manager.drain(Duration::from_secs(5)).await;

        assert!(report.completed);
        let stats = manager.stats();
        assert_eq!(stats.started(), 2);
        assert_eq!(stats.unauthorized(), 2);
        assert_eq!(stats.succeeded(), 0);
        assert!(!manager.storage().video_path("shot-1").exists());
    }

    #[tokio::test]
    async fn test_drain_abandons_slow_fetches() {
        let temp_dir = TempDir::new().unwrap();
        let manager = AuxiliaryFetchManager::new(VideoStorage::new(temp_dir.path()), 3);
        let device = connected_device(SimulatorConfig::manual()).await;
        device.set_fetch_latency(Duration::from_secs(30));

        manager.fetch_point_cloud(device, "shot-1".to_string());
        assert_eq!(manager.in_flight(), 1);

        let report = manager.drain(Duration::from_millis(50)).await;
        assert!(!report.completed);
        assert_eq!(report.abandoned, 1);

        // Cancellation is advisory; the task notices it promptly
        timeout(Duration::from_secs(1), async {
            while manager.stats().cancelled() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_disabled_fetches_are_skipped() {
        let temp_dir = TempDir::new().unwrap();
        let config = StorageConfig {
            video_directory: Some(temp_dir.path().to_string_lossy().into_owned()),
            save_videos: false,
            fetch_point_clouds: false,
            point_cloud_preview: 5,
        };
        let manager = AuxiliaryFetchManager::from_config(&config);
        let device = connected_device(SimulatorConfig::manual()).await;

        manager.fetch_video(device.clone(), "shot-1".to_string());
        manager.fetch_point_cloud(device, "shot-1".to_string());

        assert_eq!(manager.stats().started(), 0);
        assert!(manager.drain(Duration::from_millis(10)).await.completed);
    }
}
