use std::fs;
use std::path::Path;
use std::sync::Arc;

use log::info;

use crate::clock::Clock;
use crate::config::{DeviceConfig, SourceKind};
use crate::drivers::serial::SerialDeviceSource;
use crate::drivers::soundcard::SoundcardSource;
use crate::drivers::DeviceError;
use crate::recorder;

/// An open acquisition handle delivering fixed-length epochs.
pub trait DeviceSource {
    fn describe(&self) -> String;
    /// N as actually applied by the device.
    fn sample_count(&self) -> usize;
    fn sample_period_us(&self) -> u32;
    /// Blocks for about N × period. Never returns fewer or more than N samples.
    fn read_epoch(&mut self) -> Result<Vec<f64>, DeviceError>;
    fn close(&mut self) -> Result<(), DeviceError>;
}

/// Opens the source variant named in `config.source`.
pub fn open_source(
    config: &DeviceConfig,
    clock: Arc<dyn Clock>,
) -> Result<Box<dyn DeviceSource>, DeviceError> {
    let source: Box<dyn DeviceSource> = match &config.source {
        SourceKind::Soundcard { device, channel } => {
            Box::new(SoundcardSource::open(device.as_deref(), *channel, config)?)
        }
        SourceKind::Serial { port, baud_rate } => {
            Box::new(SerialDeviceSource::open(port, *baud_rate, config)?)
        }
        SourceKind::Playback {
            path,
            loop_playback,
        } => Box::new(PlaybackSource::open(path, *loop_playback, config, clock)?),
    };
    info!("opened {}", source.describe());
    Ok(source)
}

/// Rejects anything that is not exactly `n` samples.
pub fn ensure_epoch_len(samples: &[f64], n: usize) -> Result<(), DeviceError> {
    if samples.len() != n {
        return Err(DeviceError::framing(format!(
            "epoch holds {} samples, expected {n}",
            samples.len()
        )));
    }
    Ok(())
}

/// Replays stored samples in N-sample epochs, paced by the clock.
pub struct PlaybackSource {
    name: String,
    samples: Vec<f64>,
    cursor: usize,
    loop_playback: bool,
    sample_count: usize,
    sample_period_us: u32,
    clock: Arc<dyn Clock>,
    closed: bool,
}

impl PlaybackSource {
    /// Reads a text file with one value per line (`#` starts a comment) or a
    /// stored run (`.jsonl`), whose raw samples are concatenated.
    pub fn open(
        path: &Path,
        loop_playback: bool,
        config: &DeviceConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, DeviceError> {
        let samples = if path.extension().is_some_and(|ext| ext == "jsonl") {
            let run = recorder::load_run(path)
                .map_err(|e| DeviceError::Disconnected(e.to_string()))?;
            run.entries
                .into_iter()
                .filter(|entry| !entry.epoch.status.is_failed())
                .flat_map(|entry| entry.epoch.raw)
                .collect()
        } else {
            let text = fs::read_to_string(path)
                .map_err(|e| DeviceError::Disconnected(format!("{}: {e}", path.display())))?;
            parse_sample_text(&text)?
        };
        Self::from_samples(
            format!("playback {}", path.display()),
            samples,
            loop_playback,
            config,
            clock,
        )
    }

    pub fn from_samples(
        name: String,
        samples: Vec<f64>,
        loop_playback: bool,
        config: &DeviceConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, DeviceError> {
        if samples.len() < config.sample_count {
            return Err(DeviceError::Configuration(format!(
                "{name} holds {} samples, less than one epoch of {}",
                samples.len(),
                config.sample_count
            )));
        }
        Ok(Self {
            name,
            samples,
            cursor: 0,
            loop_playback,
            sample_count: config.sample_count,
            sample_period_us: config.sample_period_us,
            clock,
            closed: false,
        })
    }
}

fn parse_sample_text(text: &str) -> Result<Vec<f64>, DeviceError> {
    text.lines()
        .enumerate()
        .map(|(no, line)| (no, line.split('#').next().unwrap_or("").trim()))
        .filter(|(_, line)| !line.is_empty())
        .map(|(no, line)| {
            line.parse::<f64>().map_err(|_| {
                DeviceError::Configuration(format!("line {}: not a sample value: {line:?}", no + 1))
            })
        })
        .collect()
}

impl DeviceSource for PlaybackSource {
    fn describe(&self) -> String {
        self.name.clone()
    }
    fn sample_count(&self) -> usize {
        self.sample_count
    }
    fn sample_period_us(&self) -> u32 {
        self.sample_period_us
    }
    fn read_epoch(&mut self) -> Result<Vec<f64>, DeviceError> {
        if self.closed {
            return Err(DeviceError::Disconnected(format!("{} is closed", self.name)));
        }
        let n = self.sample_count;
        if self.cursor + n > self.samples.len() {
            if !self.loop_playback {
                return Err(DeviceError::Disconnected(format!(
                    "{} exhausted after {} samples",
                    self.name, self.cursor
                )));
            }
            self.cursor = 0;
        }
        self.clock.sleep(std::time::Duration::from_micros(
            n as u64 * self.sample_period_us as u64,
        ));
        let epoch = self.samples[self.cursor..self.cursor + n].to_vec();
        self.cursor += n;
        Ok(epoch)
    }
    fn close(&mut self) -> Result<(), DeviceError> {
        self.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::io::Write;
    use std::time::Duration;
    fn config(n: usize) -> DeviceConfig {
        DeviceConfig {
            sample_count: n,
            sample_period_us: 1000,
            ..DeviceConfig::default()
        }
    }
    #[test]
    fn playback_delivers_exact_epochs_and_paces_the_clock() {
        let clock = ManualClock::new();
        let samples: Vec<f64> = (0..10).map(f64::from).collect();
        let mut source = PlaybackSource::from_samples(
            "test".into(),
            samples,
            false,
            &config(4),
            Arc::new(clock.clone()),
        )
        .unwrap();
        assert_eq!(source.read_epoch().unwrap(), vec![0.0, 1.0, 2.0, 3.0]);
        assert_eq!(source.read_epoch().unwrap(), vec![4.0, 5.0, 6.0, 7.0]);
        assert_eq!(clock.now(), Duration::from_millis(8));
        // Only two samples left: never hand out a partial epoch.
        assert!(matches!(
            source.read_epoch(),
            Err(DeviceError::Disconnected(_))
        ));
    }
    #[test]
    fn looping_playback_wraps_around() {
        let samples: Vec<f64> = (0..6).map(f64::from).collect();
        let mut source = PlaybackSource::from_samples(
            "loop".into(),
            samples,
            true,
            &config(4),
            Arc::new(ManualClock::new()),
        )
        .unwrap();
        source.read_epoch().unwrap();
        assert_eq!(source.read_epoch().unwrap(), vec![0.0, 1.0, 2.0, 3.0]);
    }
    #[test]
    fn closed_playback_is_disconnected() {
        let mut source = PlaybackSource::from_samples(
            "closed".into(),
            vec![0.0; 8],
            true,
            &config(4),
            Arc::new(ManualClock::new()),
        )
        .unwrap();
        source.close().unwrap();
        assert!(matches!(
            source.read_epoch(),
            Err(DeviceError::Disconnected(_))
        ));
    }
    #[test]
    fn text_file_with_comments() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# lead II, 1 kHz").unwrap();
        writeln!(file, "1.5").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "-2 # clipped").unwrap();
        writeln!(file, "3").unwrap();
        writeln!(file, "4").unwrap();
        let mut source = PlaybackSource::open(
            file.path(),
            false,
            &config(4),
            Arc::new(ManualClock::new()),
        )
        .unwrap();
        assert_eq!(source.read_epoch().unwrap(), vec![1.5, -2.0, 3.0, 4.0]);
    }
    #[test]
    fn epoch_length_check() {
        assert!(ensure_epoch_len(&[0.0; 3], 3).is_ok());
        assert!(matches!(
            ensure_epoch_len(&[0.0; 2], 3),
            Err(DeviceError::Framing(_))
        ));
    }
}
