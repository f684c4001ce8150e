// src/config.rs
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use log::warn;
use serde::{Deserialize, Serialize};

use crate::drivers::protocol::{clamp_sample_count, clamp_sample_period};
use crate::drivers::DeviceError;

/// Slowest sampling any source accepts (1 Hz).
pub const MAX_PERIOD_US: u32 = 1_000_000;
/// Longest time between epoch starts.
pub const MAX_INTER_EPOCH_GAP_S: f64 = 24.0 * 3600.0;

/// Which acquisition front end a run uses. Chosen once at `start()`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceKind {
    /// Host audio input. `device` is a name substring; `None` picks the default input.
    Soundcard {
        #[serde(default)]
        device: Option<String>,
        #[serde(default)]
        channel: usize,
    },
    /// Microcontroller analog front end on a serial line.
    Serial {
        port: String,
        #[serde(default = "default_baud_rate")]
        baud_rate: u32,
    },
    /// Replays stored samples, paced like a live device.
    Playback {
        path: PathBuf,
        #[serde(default)]
        loop_playback: bool,
    },
}

fn default_baud_rate() -> u32 {
    115_200
}

impl Default for SourceKind {
    fn default() -> Self {
        SourceKind::Soundcard {
            device: None,
            channel: 0,
        }
    }
}

/// Acquisition parameters, fixed for the lifetime of a run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub source: SourceKind,
    /// Samples per epoch (N).
    pub sample_count: usize,
    pub sample_period_us: u32,
    /// Time between the starts of consecutive epochs. Acquisition time is part of it.
    pub inter_epoch_gap_s: f64,
    pub invert: bool,
    /// Added on top of N × period when waiting for a device answer.
    pub response_margin_ms: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            source: SourceKind::default(),
            sample_count: 200,
            sample_period_us: 5000,
            inter_epoch_gap_s: 5.0,
            invert: false,
            response_margin_ms: 2000,
        }
    }
}

impl DeviceConfig {
    pub fn sample_rate_hz(&self) -> f64 {
        1.0e6 / self.sample_period_us as f64
    }

    /// Nominal time one epoch's acquisition takes (N × period).
    pub fn acquisition_time(&self) -> Duration {
        Duration::from_micros(self.sample_count as u64 * self.sample_period_us as u64)
    }

    pub fn response_timeout(&self) -> Duration {
        self.acquisition_time() + Duration::from_millis(self.response_margin_ms)
    }

    pub fn inter_epoch_gap(&self) -> Duration {
        Duration::from_secs_f64(self.inter_epoch_gap_s.max(0.0))
    }

    /// Checks the configuration and applies the firmware limits when the
    /// serial front end is selected.
    pub fn validated(&self) -> Result<Self, DeviceError> {
        if self.sample_count == 0 {
            return Err(DeviceError::Configuration(
                "sample count must be at least 1".into(),
            ));
        }
        if self.sample_period_us == 0 || self.sample_period_us > MAX_PERIOD_US {
            return Err(DeviceError::Configuration(format!(
                "sample period must be in 1..={MAX_PERIOD_US}us, got {}",
                self.sample_period_us
            )));
        }
        let gap = self.inter_epoch_gap_s;
        if !(gap.is_finite() && gap > 0.0 && gap <= MAX_INTER_EPOCH_GAP_S) {
            return Err(DeviceError::Configuration(format!(
                "inter-epoch gap must be in (0, {MAX_INTER_EPOCH_GAP_S}] s, got {gap}"
            )));
        }
        let mut out = self.clone();
        if let SourceKind::Serial { .. } = self.source {
            out.sample_count = clamp_sample_count(self.sample_count);
            out.sample_period_us = clamp_sample_period(self.sample_period_us);
            if out.sample_count != self.sample_count {
                warn!(
                    "sample count {} outside firmware range, using {}",
                    self.sample_count, out.sample_count
                );
            }
            if out.sample_period_us != self.sample_period_us {
                warn!(
                    "sample period {}us outside firmware range, using {}us",
                    self.sample_period_us, out.sample_period_us
                );
            }
        }
        Ok(out)
    }
}

/// Signal conditioning applied to every epoch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterSettings {
    pub lowpass_hz: f64,
    pub notch_enabled: bool,
    /// Powerline frequency, 60 Hz or 50 Hz.
    pub notch_hz: f64,
    pub notch_q: f64,
    pub remove_dc: bool,
    /// Carry filter state from one epoch's tail into the next.
    pub continuous: bool,
}

impl Default for FilterSettings {
    fn default() -> Self {
        Self {
            lowpass_hz: 40.0,
            notch_enabled: true,
            notch_hz: 60.0,
            notch_q: 30.0,
            remove_dc: true,
            continuous: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DetectorConfig {
    #[default]
    Builtin,
    Library { path: PathBuf },
}

/// Everything the monitor needs, loaded from a JSON file.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub device: DeviceConfig,
    pub filter: FilterSettings,
    pub detector: DetectorConfig,
    /// K: variability is computed over the current and previous K epochs.
    pub tracker_window_epochs: usize,
    /// Consecutive failed epochs that stop the run; 0 never stops.
    pub max_consecutive_failures: u32,
    pub max_epochs: Option<u64>,
    pub write_behind_capacity: usize,
    pub output_dir: PathBuf,
    pub info_text: String,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            device: DeviceConfig::default(),
            filter: FilterSettings::default(),
            detector: DetectorConfig::default(),
            tracker_window_epochs: 4,
            max_consecutive_failures: 3,
            max_epochs: None,
            write_behind_capacity: 8,
            output_dir: PathBuf::from("."),
            info_text: String::new(),
        }
    }
}

impl MonitorConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config = serde_json::from_str(&text)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        Ok(config)
    }
}
