// src/drivers/variability.rs
use std::collections::VecDeque;

use ndarray::Array1;

use crate::types::{BeatEvent, VariabilityRecord};

/// 每个 epoch 的 RR 间期，滑动窗口保存当前和前 K 个 epoch
#[derive(Clone, Debug, Default)]
pub struct IntervalHistory {
    slots: VecDeque<Vec<f64>>,
}

impl IntervalHistory {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, intervals: Vec<f64>, capacity: usize) {
        while self.slots.len() >= capacity {
            self.slots.pop_front();
        }
        self.slots.push_back(intervals);
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }
}

/// Mean heart rate, SDNN and RMSSD over a sliding window of epochs.
///
/// Intervals never span two epochs: the gap between epochs is not
/// observed, so the last beat of one epoch and the first beat of the next
/// are not consecutive beats.
#[derive(Clone, Debug)]
pub struct VariabilityTracker {
    window_epochs: usize,
}

impl VariabilityTracker {
    /// `window_epochs` is K, the number of previous epochs kept next to the current one.
    pub fn new(window_epochs: usize) -> Self {
        Self { window_epochs }
    }

    /// Records this epoch's beats and computes the window metrics. The
    /// metrics stay undefined when the epoch itself yields no interval.
    pub fn update(
        &self,
        history: &mut IntervalHistory,
        epoch_index: u64,
        beats: &[BeatEvent],
        sample_rate_hz: f64,
    ) -> VariabilityRecord {
        let intervals: Vec<f64> = beats
            .windows(2)
            .map(|w| (w[1].index as f64 - w[0].index as f64) / sample_rate_hz)
            .filter(|rr| *rr > 0.0)
            .collect();
        history.push(intervals.clone(), self.window_epochs + 1);
        if intervals.is_empty() {
            return VariabilityRecord::undefined(epoch_index);
        }

        let pooled: Vec<f64> = history.slots.iter().flatten().copied().collect();
        let rr = Array1::from(pooled);
        let mean_rr = rr.mean().unwrap_or(0.0);
        let mean_hr = (mean_rr > 0.0).then(|| 60.0 / mean_rr);
        let sdnn_ms = rr.std(0.0) * 1000.0;

        // 相邻间期之差只在同一个 epoch 内计算
        let diffs: Vec<f64> = history
            .slots
            .iter()
            .flat_map(|slot| slot.windows(2).map(|w| w[1] - w[0]))
            .collect();
        let rmssd_ms = if diffs.is_empty() {
            None
        } else {
            let d = Array1::from(diffs);
            Some(d.mapv(|x| x * x).mean().unwrap_or(0.0).sqrt() * 1000.0)
        };

        VariabilityRecord {
            epoch_index,
            mean_hr_bpm: mean_hr,
            sdnn_ms: mean_hr.map(|_| sdnn_ms),
            rmssd_ms,
            interval_count: rr.len(),
            rr_intervals_s: intervals,
        }
    }

    /// A failed epoch still occupies a window slot and gets an undefined record.
    pub fn skip(&self, history: &mut IntervalHistory, epoch_index: u64) -> VariabilityRecord {
        history.push(Vec::new(), self.window_epochs + 1);
        VariabilityRecord::undefined(epoch_index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    fn beats_at(indices: &[usize]) -> Vec<BeatEvent> {
        indices
            .iter()
            .map(|&index| BeatEvent {
                index,
                amplitude: 1.0,
                time_s: index as f64 / 100.0,
            })
            .collect()
    }
    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }
    #[test]
    fn no_beats_is_undefined() {
        let tracker = VariabilityTracker::new(4);
        let mut history = IntervalHistory::new();
        let record = tracker.update(&mut history, 0, &[], 100.0);
        assert_eq!(record, VariabilityRecord::undefined(0));
        let record = tracker.update(&mut history, 1, &beats_at(&[40]), 100.0);
        assert_eq!(record.mean_hr_bpm, None);
        assert_eq!(record.sdnn_ms, None);
    }
    #[test]
    fn two_beats_give_one_interval() {
        let tracker = VariabilityTracker::new(4);
        let mut history = IntervalHistory::new();
        // 0.8 s apart at 100 Hz.
        let record = tracker.update(&mut history, 0, &beats_at(&[10, 90]), 100.0);
        assert_eq!(record.interval_count, 1);
        assert!(close(record.mean_hr_bpm.unwrap(), 60.0 / 0.8));
        assert!(close(record.sdnn_ms.unwrap(), 0.0));
        assert_eq!(record.rmssd_ms, None);
    }
    #[test]
    fn metrics_span_the_window() {
        let tracker = VariabilityTracker::new(1);
        let mut history = IntervalHistory::new();
        // Intervals 0.8, 1.0 then 0.6 s.
        tracker.update(&mut history, 0, &beats_at(&[0, 80, 180]), 100.0);
        let record = tracker.update(&mut history, 1, &beats_at(&[0, 60]), 100.0);
        assert_eq!(record.interval_count, 3);
        assert_eq!(record.rr_intervals_s.len(), 1);
        assert!(close(record.mean_hr_bpm.unwrap(), 60.0 / 0.8));
        let sdnn = ((0.0f64 + 0.04 + 0.04) / 3.0).sqrt() * 1000.0;
        assert!(close(record.sdnn_ms.unwrap(), sdnn));
        // Only 0.8 -> 1.0 is a successive pair.
        assert!(close(record.rmssd_ms.unwrap(), 200.0));
    }
    #[test]
    fn old_epochs_leave_the_window() {
        let tracker = VariabilityTracker::new(1);
        let mut history = IntervalHistory::new();
        tracker.update(&mut history, 0, &beats_at(&[0, 50]), 100.0);
        tracker.update(&mut history, 1, &beats_at(&[0, 100]), 100.0);
        let record = tracker.update(&mut history, 2, &beats_at(&[0, 100]), 100.0);
        assert_eq!(history.len(), 2);
        assert!(close(record.mean_hr_bpm.unwrap(), 60.0));
    }
    #[test]
    fn skipped_epoch_takes_a_slot() {
        let tracker = VariabilityTracker::new(1);
        let mut history = IntervalHistory::new();
        tracker.update(&mut history, 0, &beats_at(&[0, 50]), 100.0);
        let skipped = tracker.skip(&mut history, 1);
        assert_eq!(skipped, VariabilityRecord::undefined(1));
        let record = tracker.update(&mut history, 2, &beats_at(&[0, 100]), 100.0);
        assert_eq!(record.interval_count, 1);
    }
}
