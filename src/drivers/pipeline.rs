use chrono::{DateTime, Local};
use log::debug;

use crate::config::{DeviceConfig, FilterSettings};
use crate::drivers::detector::{BeatDetector, BeatDetectorAdapter};
use crate::drivers::filter::FilterStage;
use crate::drivers::source::ensure_epoch_len;
use crate::drivers::variability::{IntervalHistory, VariabilityTracker};
use crate::drivers::DeviceError;
use crate::types::{Epoch, EpochStatus, VariabilityRecord};

/// Per-run processing chain: filter, detect, track. Owns the run's
/// cross-epoch state (filter tail and interval history).
pub struct EpochPipeline {
    filter: FilterStage,
    adapter: BeatDetectorAdapter,
    tracker: VariabilityTracker,
    history: IntervalHistory,
    sample_count: usize,
    sample_rate_hz: f64,
}

impl EpochPipeline {
    pub fn new(
        device: &DeviceConfig,
        filter: &FilterSettings,
        detector: Box<dyn BeatDetector>,
        window_epochs: usize,
    ) -> Self {
        let sample_rate_hz = device.sample_rate_hz();
        Self {
            filter: FilterStage::new(filter.clone(), sample_rate_hz, device.invert),
            adapter: BeatDetectorAdapter::new(detector),
            tracker: VariabilityTracker::new(window_epochs),
            history: IntervalHistory::new(),
            sample_count: device.sample_count,
            sample_rate_hz,
        }
    }

    pub fn sample_rate_hz(&self) -> f64 {
        self.sample_rate_hz
    }

    #[cfg(test)]
    fn history(&self) -> &IntervalHistory {
        &self.history
    }

    /// Runs one acquired epoch through the chain. A wrong-length buffer is
    /// rejected before it can reach the filter.
    pub fn process(
        &mut self,
        index: u64,
        started_at: DateTime<Local>,
        offset_s: f64,
        raw: Vec<f64>,
    ) -> Result<(Epoch, VariabilityRecord), DeviceError> {
        ensure_epoch_len(&raw, self.sample_count)?;
        let filtered = self.filter.process(&raw);
        let detection = self.adapter.detect(&filtered, self.sample_rate_hz, offset_s);
        let status = match detection.degraded {
            Some(reason) => EpochStatus::Degraded(reason),
            None => EpochStatus::Ok,
        };
        let record = self.tracker.update(
            &mut self.history,
            index,
            &detection.beats,
            self.sample_rate_hz,
        );
        debug!(
            "epoch {index}: {} beats via {}, {:?}",
            detection.beats.len(),
            self.adapter.detector_name(),
            record.mean_hr_bpm
        );
        let epoch = Epoch {
            index,
            started_at,
            offset_s,
            raw,
            filtered,
            beats: detection.beats,
            templates: detection.templates,
            status,
        };
        Ok((epoch, record))
    }

    /// Placeholder for an epoch whose acquisition failed.
    pub fn fail(
        &mut self,
        index: u64,
        started_at: DateTime<Local>,
        offset_s: f64,
        reason: String,
    ) -> (Epoch, VariabilityRecord) {
        // 失败的 epoch 之后滤波器从零状态重新开始
        self.filter.reset();
        let record = self.tracker.skip(&mut self.history, index);
        (Epoch::failed(index, started_at, offset_s, reason), record)
    }
}
