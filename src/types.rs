// src/types.rs
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use crate::config::DeviceConfig;

// 调度器状态
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchedulerState {
    Idle,
    Running,
    Paused,
    Stopped,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum EpochStatus {
    Ok,
    /// Acquisition succeeded but detection produced nothing usable.
    Degraded(String),
    /// Acquisition failed; raw and filtered samples are empty.
    Failed(String),
}

impl EpochStatus {
    pub fn is_failed(&self) -> bool {
        matches!(self, EpochStatus::Failed(_))
    }
}

/// One detected heartbeat.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BeatEvent {
    /// Sample index inside the epoch.
    pub index: usize,
    pub amplitude: f64,
    /// Seconds since the run started.
    pub time_s: f64,
}

/// One acquire-and-process cycle.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Epoch {
    pub index: u64,
    pub started_at: DateTime<Local>,
    /// Seconds between run start and this epoch's acquisition start.
    pub offset_s: f64,
    pub raw: Vec<f64>,
    pub filtered: Vec<f64>,
    pub beats: Vec<BeatEvent>,
    pub templates: Vec<Vec<f64>>,
    pub status: EpochStatus,
}

impl Epoch {
    pub fn failed(index: u64, started_at: DateTime<Local>, offset_s: f64, reason: String) -> Self {
        Self {
            index,
            started_at,
            offset_s,
            raw: Vec::new(),
            filtered: Vec::new(),
            beats: Vec::new(),
            templates: Vec::new(),
            status: EpochStatus::Failed(reason),
        }
    }
}

/// Rate and variability for one epoch. `None` means undefined (too few beats).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VariabilityRecord {
    pub epoch_index: u64,
    pub mean_hr_bpm: Option<f64>,
    /// Standard deviation of the intervals in the window.
    pub sdnn_ms: Option<f64>,
    pub rmssd_ms: Option<f64>,
    /// Number of intervals the metrics were computed from.
    pub interval_count: usize,
    /// This epoch's own RR intervals, in seconds.
    pub rr_intervals_s: Vec<f64>,
}

impl VariabilityRecord {
    pub fn undefined(epoch_index: u64) -> Self {
        Self {
            epoch_index,
            mean_hr_bpm: None,
            sdnn_ms: None,
            rmssd_ms: None,
            interval_count: 0,
            rr_intervals_s: Vec::new(),
        }
    }
}

// 前端发给调度器的控制命令
#[derive(Clone, Debug)]
pub enum Command {
    Start(DeviceConfig),
    Pause,
    Resume,
    Stop,
}

/// What the presentation layer receives for every processed epoch.
#[derive(Clone, Debug)]
pub struct ProcessedEpoch {
    pub index: u64,
    pub started_at: DateTime<Local>,
    pub sample_rate_hz: f64,
    pub filtered: Vec<f64>,
    pub beats: Vec<BeatEvent>,
    pub templates: Vec<Vec<f64>>,
    pub status: EpochStatus,
    pub variability_series: Vec<VariabilityRecord>,
}

/// Final accounting of a run, produced by `stop()`.
#[derive(Clone, Debug, PartialEq)]
pub struct RunSummary {
    pub started_at: DateTime<Local>,
    pub epochs: u64,
    pub failed: u64,
    pub degraded: u64,
    pub persisted: u64,
    pub unresolved_writes: u64,
    /// False when some epochs never reached the store.
    pub complete: bool,
    pub terminal_error: Option<String>,
}

// 后台发给前端的消息
#[derive(Clone, Debug)]
pub enum MonitorEvent {
    StateChanged(SchedulerState),
    EpochProcessed(Box<ProcessedEpoch>),
    EpochFailed { index: u64, reason: String },
    Stopped(RunSummary),
}
