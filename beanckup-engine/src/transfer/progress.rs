//! Task progress tracking.
//!
//! Workers never share live counters with the UI. They send `ProgressEvent`s
//! over a channel to a single reporter task that owns the `ProgressTracker`
//! and publishes immutable `TaskStatus` snapshots on a `watch` channel at a
//! bounded rate.

use crate::config::ProgressConfig;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Snapshot of the in-flight task, as seen by pollers and subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatus {
    pub is_running: bool,

    /// Free-form phase label ("scanning", "hashing", "packaging", ...)
    pub current_phase: String,

    /// Fraction complete within the current phase (0.0 - 1.0)
    pub progress: f64,

    pub processed_files: usize,
    pub total_files: usize,

    /// Bytes processed so far
    pub processed_size: u64,
    pub total_size: u64,

    /// Smoothed throughput in bytes/second
    pub speed: f64,

    /// Seconds since the task started
    pub elapsed_time: u64,

    /// Seconds remaining; `None` until a speed is known
    pub estimated_time: Option<u64>,
}

impl TaskStatus {
    pub fn idle() -> Self {
        Self {
            is_running: false,
            current_phase: "idle".to_string(),
            progress: 0.0,
            processed_files: 0,
            total_files: 0,
            processed_size: 0,
            total_size: 0,
            speed: 0.0,
            elapsed_time: 0,
            estimated_time: None,
        }
    }
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::idle()
    }
}

/// Messages from workers to the reporter
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    /// A new phase starts; counters reset to the given totals
    Phase {
        label: String,
        total_files: usize,
        total_size: u64,
    },

    /// Bytes read, hashed or written
    Bytes(u64),

    /// One file finished
    FileDone,

    /// The task reached a terminal state
    Finish { label: String },
}

impl ProgressEvent {
    pub fn phase(label: &str, total_files: usize, total_size: u64) -> Self {
        ProgressEvent::Phase {
            label: label.to_string(),
            total_files,
            total_size,
        }
    }

    fn is_boundary(&self) -> bool {
        matches!(self, ProgressEvent::Phase { .. } | ProgressEvent::Finish { .. })
    }
}

pub type ProgressSender = mpsc::UnboundedSender<ProgressEvent>;

/// Minimum window for a speed sample
const MIN_SAMPLE_WINDOW: Duration = Duration::from_millis(50);

/// Progress tracker with smoothed speed calculation
pub struct ProgressTracker {
    start_time: Instant,
    last_sample_time: Instant,
    last_sample_bytes: u64,
    smoothing: f64,
    speed: f64,
    running: bool,
    phase: String,
    processed_files: usize,
    total_files: usize,
    processed_size: u64,
    total_size: u64,
}

impl ProgressTracker {
    /// Create a new progress tracker; `smoothing` is the EMA factor in (0, 1]
    pub fn new(smoothing: f64) -> Self {
        let now = Instant::now();
        Self {
            start_time: now,
            last_sample_time: now,
            last_sample_bytes: 0,
            smoothing: smoothing.clamp(f64::EPSILON, 1.0),
            speed: 0.0,
            running: true,
            phase: "starting".to_string(),
            processed_files: 0,
            total_files: 0,
            processed_size: 0,
            total_size: 0,
        }
    }

    pub fn apply(&mut self, event: ProgressEvent) {
        match event {
            ProgressEvent::Phase {
                label,
                total_files,
                total_size,
            } => {
                self.phase = label;
                self.total_files = total_files;
                self.total_size = total_size;
                self.processed_files = 0;
                self.processed_size = 0;
                self.last_sample_bytes = 0;
                self.last_sample_time = Instant::now();
                self.speed = 0.0;
            }
            ProgressEvent::Bytes(bytes) => {
                self.processed_size = self.processed_size.saturating_add(bytes);
            }
            ProgressEvent::FileDone => {
                self.processed_files += 1;
            }
            ProgressEvent::Finish { label } => {
                self.phase = label;
                self.running = false;
            }
        }
    }

    /// Fold the bytes processed since the last sample into the smoothed speed
    pub fn sample_speed(&mut self, now: Instant) {
        let window = now.saturating_duration_since(self.last_sample_time);
        if window < MIN_SAMPLE_WINDOW {
            return;
        }

        let bytes_diff = self.processed_size.saturating_sub(self.last_sample_bytes);
        let instantaneous = bytes_diff as f64 / window.as_secs_f64();
        self.speed = if self.speed > 0.0 {
            self.smoothing * instantaneous + (1.0 - self.smoothing) * self.speed
        } else {
            instantaneous
        };

        self.last_sample_time = now;
        self.last_sample_bytes = self.processed_size;
    }

    /// Get total elapsed time
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn snapshot(&self) -> TaskStatus {
        let progress = if self.total_size > 0 {
            self.processed_size as f64 / self.total_size as f64
        } else if self.total_files > 0 {
            self.processed_files as f64 / self.total_files as f64
        } else if self.running {
            0.0
        } else {
            1.0
        };

        let speed = if self.running { self.speed } else { 0.0 };
        let estimated_time = if !self.running {
            Some(0)
        } else if speed > 0.0 {
            let remaining = self.total_size.saturating_sub(self.processed_size);
            Some((remaining as f64 / speed).ceil() as u64)
        } else {
            None
        };

        TaskStatus {
            is_running: self.running,
            current_phase: self.phase.clone(),
            progress: progress.clamp(0.0, 1.0),
            processed_files: self.processed_files,
            total_files: self.total_files,
            processed_size: self.processed_size,
            total_size: self.total_size,
            speed,
            elapsed_time: self.elapsed().as_secs(),
            estimated_time,
        }
    }
}

/// Spawn the reporter that turns events into published snapshots.
///
/// The reporter exits once every `ProgressSender` clone is dropped, after
/// publishing a final snapshot.
pub fn spawn_reporter(
    status_tx: Arc<watch::Sender<TaskStatus>>,
    config: &ProgressConfig,
) -> (ProgressSender, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<ProgressEvent>();
    let publish_interval = Duration::from_millis(config.publish_interval_ms);
    let smoothing = config.speed_smoothing;

    let handle = tokio::spawn(async move {
        let mut tracker = ProgressTracker::new(smoothing);
        let mut ticker = tokio::time::interval(publish_interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut last_publish: Option<Instant> = None;

        status_tx.send_replace(tracker.snapshot());

        loop {
            tokio::select! {
                event = rx.recv() => {
                    let Some(event) = event else { break };
                    let boundary = event.is_boundary();
                    tracker.apply(event);
                    let due = last_publish.map_or(true, |t| t.elapsed() >= publish_interval);
                    if boundary || due {
                        tracker.sample_speed(Instant::now());
                        status_tx.send_replace(tracker.snapshot());
                        last_publish = Some(Instant::now());
                    }
                }
                _ = ticker.tick() => {
                    tracker.sample_speed(Instant::now());
                    status_tx.send_replace(tracker.snapshot());
                    last_publish = Some(Instant::now());
                }
            }
        }

        status_tx.send_replace(tracker.snapshot());
    });

    (tx, handle)
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

/// Format speed as human-readable string
pub fn format_speed(bytes_per_second: f64) -> String {
    format!("{}/s", format_bytes(bytes_per_second.max(0.0) as u64))
}

/// Format duration as human-readable string
pub fn format_duration(seconds: u64) -> String {
    if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else {
        format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60)
    }
}
