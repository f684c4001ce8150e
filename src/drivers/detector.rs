// src/drivers/detector.rs
use std::os::raw::{c_double, c_int};
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;

use find_peaks::PeakFinder;
use libloading::Library;
use log::{debug, info, warn};

use crate::config::DetectorConfig;
use crate::drivers::DetectorError;
use crate::types::BeatEvent;

/// Shortest epoch worth handing to a detector.
pub const MIN_WINDOW_S: f64 = 0.5;
const TEMPLATE_BEFORE_S: f64 = 0.1;
const TEMPLATE_AFTER_S: f64 = 0.15;

/// External beat-detection capability. Returns R-peak sample indices.
pub trait BeatDetector: Send {
    fn name(&self) -> &str;
    fn detect_beats(&self, filtered: &[f64], sample_rate_hz: f64)
        -> Result<Vec<usize>, DetectorError>;
}

pub fn build_detector(config: &DetectorConfig) -> Result<Box<dyn BeatDetector>, DetectorError> {
    match config {
        DetectorConfig::Builtin => Ok(Box::new(PeakDetector::default())),
        DetectorConfig::Library { path } => Ok(Box::new(LibraryDetector::load(path)?)),
    }
}

/// R-peak finder: local maxima above a fraction of the epoch maximum,
/// at least one refractory period apart.
#[derive(Clone, Debug)]
pub struct PeakDetector {
    pub relative_height: f64,
    pub relative_prominence: f64,
    pub refractory_s: f64,
}

impl Default for PeakDetector {
    fn default() -> Self {
        Self {
            relative_height: 0.5,
            relative_prominence: 0.3,
            refractory_s: 0.3,
        }
    }
}

impl BeatDetector for PeakDetector {
    fn name(&self) -> &str {
        "peak-finder"
    }

    fn detect_beats(
        &self,
        filtered: &[f64],
        sample_rate_hz: f64,
    ) -> Result<Vec<usize>, DetectorError> {
        let max = filtered.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        if !max.is_finite() || max <= 0.0 {
            return Ok(Vec::new());
        }
        let distance = ((self.refractory_s * sample_rate_hz).round() as usize).max(1);
        let peaks = PeakFinder::new(filtered)
            .with_min_prominence(max * self.relative_prominence)
            .with_min_height(max * self.relative_height)
            .with_min_distance(distance)
            .find_peaks();
        let mut peaks: Vec<usize> = peaks.iter().map(|p| p.position.start).collect();
        peaks.sort_unstable();
        Ok(peaks)
    }
}

// int ecg_detect_beats(const double *samples, size_t len, double fs,
//                      size_t *out_idx, size_t out_cap, size_t *out_len);
type DetectFn =
    unsafe extern "C" fn(*const c_double, usize, c_double, *mut usize, usize, *mut usize) -> c_int;

/// Detector living in a shared library with a C ABI.
pub struct LibraryDetector {
    #[allow(dead_code)]
    lib: Library,
    detect: DetectFn,
    name: String,
}

impl LibraryDetector {
    pub fn load(path: &Path) -> Result<Self, DetectorError> {
        let lib = unsafe { Library::new(path) }.map_err(|e| {
            DetectorError::Unavailable(format!("{}: {e}", path.display()))
        })?;
        // Safety: the library is expected to export the signature above.
        let detect: DetectFn = unsafe { *lib.get::<DetectFn>(b"ecg_detect_beats\0")? };
        info!("loaded beat detector from {}", path.display());
        Ok(Self {
            lib,
            detect,
            name: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "library".into()),
        })
    }
}

impl BeatDetector for LibraryDetector {
    fn name(&self) -> &str {
        &self.name
    }

    fn detect_beats(
        &self,
        filtered: &[f64],
        sample_rate_hz: f64,
    ) -> Result<Vec<usize>, DetectorError> {
        let mut out = vec![0usize; filtered.len()];
        let mut out_len = 0usize;
        let code = unsafe {
            (self.detect)(
                filtered.as_ptr(),
                filtered.len(),
                sample_rate_hz,
                out.as_mut_ptr(),
                out.len(),
                &mut out_len as *mut usize,
            )
        };
        if code != 0 {
            return Err(DetectorError::Code(code));
        }
        out.truncate(out_len.min(filtered.len()));
        Ok(out)
    }
}

/// What the adapter hands back for one epoch.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Detection {
    pub beats: Vec<BeatEvent>,
    pub templates: Vec<Vec<f64>>,
    /// Set when the detector could not produce a usable result.
    pub degraded: Option<String>,
}

impl Detection {
    fn degraded(reason: String) -> Self {
        Self {
            degraded: Some(reason),
            ..Self::default()
        }
    }
}

/// Marshals filtered epochs to a detector. Detector failures never escape:
/// they come back as a degraded, empty detection.
pub struct BeatDetectorAdapter {
    detector: Box<dyn BeatDetector>,
    min_window_s: f64,
}

impl BeatDetectorAdapter {
    pub fn new(detector: Box<dyn BeatDetector>) -> Self {
        Self {
            detector,
            min_window_s: MIN_WINDOW_S,
        }
    }

    pub fn detector_name(&self) -> &str {
        self.detector.name()
    }

    /// `epoch_offset_s` places the epoch on the run timeline for `time_s`.
    pub fn detect(&self, filtered: &[f64], sample_rate_hz: f64, epoch_offset_s: f64) -> Detection {
        let min_len = (self.min_window_s * sample_rate_hz).ceil() as usize;
        if filtered.len() < min_len.max(1) {
            let reason = format!(
                "epoch of {} samples is shorter than {} s",
                filtered.len(),
                self.min_window_s
            );
            warn!("{reason}");
            return Detection::degraded(reason);
        }

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            self.detector.detect_beats(filtered, sample_rate_hz)
        }));
        let indices = match outcome {
            Ok(Ok(indices)) => indices,
            Ok(Err(e)) => return self.degrade(e),
            Err(payload) => {
                let msg = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".into());
                return self.degrade(DetectorError::Panicked(msg));
            }
        };
        if let Some(&index) = indices.iter().find(|&&i| i >= filtered.len()) {
            return self.degrade(DetectorError::OutOfRange {
                index,
                len: filtered.len(),
            });
        }
        let mut indices = indices;
        indices.sort_unstable();
        indices.dedup();

        let before = (TEMPLATE_BEFORE_S * sample_rate_hz).round() as usize;
        let after = (TEMPLATE_AFTER_S * sample_rate_hz).round() as usize;
        let beats = indices
            .iter()
            .map(|&index| BeatEvent {
                index,
                amplitude: filtered[index],
                time_s: epoch_offset_s + index as f64 / sample_rate_hz,
            })
            .collect();
        // 只保留完整落在本段内的模板
        let templates = indices
            .iter()
            .filter(|&&i| i >= before && i + after <= filtered.len())
            .map(|&i| filtered[i - before..i + after].to_vec())
            .collect();
        debug!(
            "{}: {} beats in {} samples",
            self.detector.name(),
            indices.len(),
            filtered.len()
        );
        Detection {
            beats,
            templates,
            degraded: None,
        }
    }

    fn degrade(&self, err: DetectorError) -> Detection {
        warn!("{} degraded: {err}", self.detector.name());
        Detection::degraded(err.to_string())
    }
}
