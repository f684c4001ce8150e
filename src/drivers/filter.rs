use std::f64::consts::{FRAC_1_SQRT_2, PI};

use log::warn;

use crate::config::FilterSettings;

#[derive(Clone, Copy, Debug)]
pub enum FilterKind {
    Notch { freq_hz: f64, q: f64 },
    Lowpass { cutoff_hz: f64, q: f64 },
}
#[derive(Clone, Copy, Debug)]
struct BiquadCoeffs {
    b0: f64,
    b1: f64,
    b2: f64,
    a1: f64,
    a2: f64,
}
#[derive(Clone, Copy, Debug, Default)]
struct BiquadState {
    z1: f64,
    z2: f64,
}
#[derive(Clone, Copy, Debug)]
struct BiquadFilter {
    coeffs: BiquadCoeffs,
    state: BiquadState,
}
impl BiquadFilter {
    fn new(coeffs: BiquadCoeffs) -> Self {
        Self {
            coeffs,
            state: BiquadState::default(),
        }
    }
    fn process(&mut self, input: f64) -> f64 {
        // Transposed direct form II
        let y = self.coeffs.b0 * input + self.state.z1;
        self.state.z1 = self.coeffs.b1 * input - self.coeffs.a1 * y + self.state.z2;
        self.state.z2 = self.coeffs.b2 * input - self.coeffs.a2 * y;
        y
    }
}
#[derive(Clone, Default, Debug)]
pub struct FilterChain {
    sections: Vec<BiquadFilter>,
}
impl FilterChain {
    pub fn from_kinds(sample_rate_hz: f64, kinds: &[FilterKind]) -> Self {
        let sections = kinds
            .iter()
            .map(|kind| BiquadFilter::new(design(sample_rate_hz, *kind)))
            .collect();
        Self { sections }
    }
    pub fn process_sample(&mut self, mut value: f64) -> f64 {
        for section in &mut self.sections {
            value = section.process(value);
        }
        value
    }
    pub fn reset(&mut self) {
        for section in &mut self.sections {
            section.state = BiquadState::default();
        }
    }
}
fn design(sample_rate_hz: f64, kind: FilterKind) -> BiquadCoeffs {
    let nyquist = sample_rate_hz * 0.5;
    match kind {
        FilterKind::Notch { freq_hz, q } => {
            notch(nyquist_clamp(freq_hz, nyquist), sample_rate_hz, q.max(0.1))
        }
        FilterKind::Lowpass { cutoff_hz, q } => {
            lowpass(nyquist_clamp(cutoff_hz, nyquist), sample_rate_hz, q)
        }
    }
}
fn nyquist_clamp(freq_hz: f64, nyquist: f64) -> f64 {
    // Very slow sampling leaves no room below Nyquist; use the floor.
    let ceiling = (nyquist - 0.01).max(0.01);
    freq_hz.clamp(0.01, ceiling)
}
fn lowpass(freq_hz: f64, sample_rate_hz: f64, q: f64) -> BiquadCoeffs {
    let w0 = 2.0 * PI * freq_hz / sample_rate_hz;
    let alpha = w0.sin() / (2.0 * q);
    let cos_w0 = w0.cos();
    let b0 = (1.0 - cos_w0) * 0.5;
    let b1 = 1.0 - cos_w0;
    let b2 = b0;
    let a0 = 1.0 + alpha;
    let a1 = -2.0 * cos_w0;
    let a2 = 1.0 - alpha;
    normalize(b0, b1, b2, a0, a1, a2)
}
fn notch(center_hz: f64, sample_rate_hz: f64, q: f64) -> BiquadCoeffs {
    let w0 = 2.0 * PI * center_hz / sample_rate_hz;
    let alpha = w0.sin() / (2.0 * q);
    let cos_w0 = w0.cos();
    let b0 = 1.0;
    let b1 = -2.0 * cos_w0;
    let b2 = 1.0;
    let a0 = 1.0 + alpha;
    let a1 = -2.0 * cos_w0;
    let a2 = 1.0 - alpha;
    normalize(b0, b1, b2, a0, a1, a2)
}
fn normalize(b0: f64, b1: f64, b2: f64, a0: f64, a1: f64, a2: f64) -> BiquadCoeffs {
    let a0_inv = 1.0 / a0;
    BiquadCoeffs {
        b0: b0 * a0_inv,
        b1: b1 * a0_inv,
        b2: b2 * a0_inv,
        a1: a1 * a0_inv,
        a2: a2 * a0_inv,
    }
}

/// Per-run signal conditioning: DC removal, low-pass, notch, then polarity.
///
/// State is cleared at the start of every epoch unless `continuous` is set,
/// in which case each epoch starts from the previous epoch's tail.
#[derive(Clone, Debug)]
pub struct FilterStage {
    settings: FilterSettings,
    invert: bool,
    chain: FilterChain,
}

impl FilterStage {
    pub fn new(settings: FilterSettings, sample_rate_hz: f64, invert: bool) -> Self {
        let nyquist = sample_rate_hz * 0.5;
        let mut kinds = vec![FilterKind::Lowpass {
            cutoff_hz: settings.lowpass_hz,
            q: FRAC_1_SQRT_2,
        }];
        if settings.lowpass_hz >= nyquist {
            warn!(
                "low-pass {} Hz is above Nyquist ({nyquist} Hz), clamping",
                settings.lowpass_hz
            );
        }
        if settings.notch_enabled {
            if settings.notch_hz < nyquist {
                kinds.push(FilterKind::Notch {
                    freq_hz: settings.notch_hz,
                    q: settings.notch_q,
                });
            } else {
                warn!(
                    "notch {} Hz is not below Nyquist ({nyquist} Hz), skipping it",
                    settings.notch_hz
                );
            }
        }
        Self {
            chain: FilterChain::from_kinds(sample_rate_hz, &kinds),
            settings,
            invert,
        }
    }

    /// Output length always equals input length.
    pub fn process(&mut self, raw: &[f64]) -> Vec<f64> {
        if !self.settings.continuous {
            self.chain.reset();
        }
        let offset = if self.settings.remove_dc && !raw.is_empty() {
            raw.iter().sum::<f64>() / raw.len() as f64
        } else {
            0.0
        };
        let sign = if self.invert { -1.0 } else { 1.0 };
        raw.iter()
            .map(|&x| sign * self.chain.process_sample(x - offset))
            .collect()
    }

    pub fn reset(&mut self) {
        self.chain.reset();
    }
}

/// One-shot filtering of a single epoch with fresh filter state.
#[cfg(test)]
fn filter_epoch(
    raw: &[f64],
    sample_rate_hz: f64,
    settings: &FilterSettings,
    invert: bool,
) -> Vec<f64> {
    let settings = FilterSettings {
        continuous: false,
        ..settings.clone()
    };
    FilterStage::new(settings, sample_rate_hz, invert).process(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    fn sine(freq_hz: f64, fs: f64, n: usize) -> Vec<f64> {
        (0..n)
            .map(|i| (2.0 * PI * freq_hz * i as f64 / fs).sin())
            .collect()
    }
    fn peak(values: &[f64]) -> f64 {
        values.iter().fold(0.0, |acc: f64, v| acc.max(v.abs()))
    }
    #[test]
    fn output_length_matches_input() {
        let settings = FilterSettings::default();
        for n in [1usize, 7, 200, 256] {
            let raw = vec![1.0; n];
            assert_eq!(filter_epoch(&raw, 200.0, &settings, false).len(), n);
        }
        assert!(filter_epoch(&[], 200.0, &settings, false).is_empty());
    }
    #[test]
    fn powerline_is_suppressed() {
        let raw = sine(60.0, 1000.0, 1000);
        let out = filter_epoch(&raw, 1000.0, &FilterSettings::default(), false);
        assert!(peak(&out[750..]) < 0.05, "60 Hz residue {}", peak(&out[750..]));
    }
    #[test]
    fn fifty_hertz_notch_is_configurable() {
        let settings = FilterSettings {
            notch_hz: 50.0,
            lowpass_hz: 100.0,
            ..FilterSettings::default()
        };
        let raw = sine(50.0, 1000.0, 1000);
        let out = filter_epoch(&raw, 1000.0, &settings, false);
        assert!(peak(&out[750..]) < 0.05);
    }
    #[test]
    fn low_frequency_content_passes() {
        let raw = sine(5.0, 1000.0, 1000);
        let out = filter_epoch(&raw, 1000.0, &FilterSettings::default(), false);
        assert!(peak(&out[500..]) > 0.9);
    }
    #[test]
    fn inversion_is_applied_last() {
        let raw = sine(7.0, 200.0, 200);
        let settings = FilterSettings::default();
        let plain = filter_epoch(&raw, 200.0, &settings, false);
        let inverted = filter_epoch(&raw, 200.0, &settings, true);
        let negated: Vec<f64> = plain.iter().map(|v| -v).collect();
        assert_eq!(inverted, negated);
    }
    #[test]
    fn constant_input_is_removed() {
        let out = filter_epoch(&[3.7; 200], 200.0, &FilterSettings::default(), false);
        assert!(peak(&out) < 1e-9);
    }
    #[test]
    fn very_slow_sampling_still_filters() {
        // 30 s per sample: Nyquist is below every configured corner.
        let fs = 1.0e6 / 30_000_000.0;
        let out = filter_epoch(&[1.0, 2.0, 1.0, 0.0], fs, &FilterSettings::default(), false);
        assert_eq!(out.len(), 4);
        assert!(out.iter().all(|v| v.is_finite()));
    }
    #[test]
    fn notch_above_nyquist_is_skipped() {
        // 100 Hz sampling: 60 Hz cannot be represented.
        let stage = FilterStage::new(FilterSettings::default(), 100.0, false);
        assert_eq!(stage.chain.sections.len(), 1);
    }
    #[test]
    fn reset_per_epoch_is_deterministic() {
        let raw = sine(3.0, 200.0, 200);
        let mut stage = FilterStage::new(FilterSettings::default(), 200.0, false);
        let first = stage.process(&raw);
        let second = stage.process(&raw);
        assert_eq!(first, second);
    }
    #[test]
    fn continuous_mode_carries_state() {
        let raw = sine(3.0, 200.0, 200);
        let settings = FilterSettings {
            continuous: true,
            ..FilterSettings::default()
        };
        let mut stage = FilterStage::new(settings, 200.0, false);
        let first = stage.process(&raw);
        let second = stage.process(&raw);
        assert_ne!(first, second);
    }
}
