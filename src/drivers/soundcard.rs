// src/drivers/soundcard.rs
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SampleRate, SizedSample, Stream, StreamConfig};
use log::{error, info, warn};

use crate::config::DeviceConfig;
use crate::drivers::source::{ensure_epoch_len, DeviceSource};
use crate::drivers::DeviceError;

const CHUNK_QUEUE: usize = 64;

// 回调线程与读取线程共享的标志
struct Shared {
    capturing: AtomicBool,
    overrun: AtomicBool,
    fault: Mutex<Option<String>>,
}

impl Shared {
    fn new() -> Self {
        Self {
            capturing: AtomicBool::new(false),
            overrun: AtomicBool::new(false),
            fault: Mutex::new(None),
        }
    }

    fn check_fault(&self) -> Result<(), DeviceError> {
        if let Ok(fault) = self.fault.lock() {
            if let Some(reason) = fault.as_ref() {
                return Err(DeviceError::Disconnected(reason.clone()));
            }
        }
        Ok(())
    }
}

/// Host audio input used as an ECG front end. One channel of the input
/// stream is sampled at 1 / period.
pub struct SoundcardSource {
    name: String,
    stream: Option<Stream>,
    rx: Receiver<Vec<f32>>,
    shared: Arc<Shared>,
    sample_count: usize,
    sample_period_us: u32,
    response_timeout: Duration,
}

impl SoundcardSource {
    /// `device` is matched as a substring of the input device name.
    pub fn open(
        device: Option<&str>,
        channel: usize,
        config: &DeviceConfig,
    ) -> Result<Self, DeviceError> {
        let host = cpal::default_host();
        let input = match device {
            None => host
                .default_input_device()
                .ok_or_else(|| DeviceError::Configuration("no default input device".into()))?,
            Some(wanted) => host
                .input_devices()
                .map_err(|e| DeviceError::Disconnected(e.to_string()))?
                .find(|d| d.name().map(|n| n.contains(wanted)).unwrap_or(false))
                .ok_or_else(|| {
                    DeviceError::Configuration(format!("no input device matching {wanted:?}"))
                })?,
        };
        let device_name = input.name().unwrap_or_else(|_| "unknown input".into());
        let rate = (1.0e6 / config.sample_period_us as f64).round() as u32;

        let ranges: Vec<_> = input
            .supported_input_configs()
            .map_err(|e| DeviceError::Configuration(e.to_string()))?
            .collect();
        let supported = ranges
            .iter()
            .filter(|r| (r.channels() as usize) > channel)
            .filter(|r| r.min_sample_rate().0 <= rate && rate <= r.max_sample_rate().0)
            // f32 first, then whatever integer format the card offers
            .min_by_key(|r| match r.sample_format() {
                SampleFormat::F32 => 0,
                SampleFormat::I16 => 1,
                SampleFormat::U16 => 2,
                _ => 3,
            })
            .cloned()
            .ok_or_else(|| {
                DeviceError::Configuration(format!(
                    "{device_name} supports no {rate} Hz input with channel {channel}"
                ))
            })?
            .with_sample_rate(SampleRate(rate));

        let stream_config: StreamConfig = supported.config();
        let (tx, rx) = mpsc::sync_channel(CHUNK_QUEUE);
        let shared = Arc::new(Shared::new());
        let stream = match supported.sample_format() {
            SampleFormat::F32 => {
                build_stream::<f32>(&input, &stream_config, channel, tx, shared.clone())
            }
            SampleFormat::I16 => {
                build_stream::<i16>(&input, &stream_config, channel, tx, shared.clone())
            }
            SampleFormat::U16 => {
                build_stream::<u16>(&input, &stream_config, channel, tx, shared.clone())
            }
            other => {
                return Err(DeviceError::Configuration(format!(
                    "unsupported sample format {other:?}"
                )))
            }
        }?;
        stream
            .play()
            .map_err(|e| DeviceError::Disconnected(e.to_string()))?;
        info!(
            "soundcard {device_name}: {rate} Hz, {} channels, using channel {channel}",
            stream_config.channels
        );
        Ok(Self {
            name: format!("soundcard {device_name}"),
            stream: Some(stream),
            rx,
            shared,
            sample_count: config.sample_count,
            sample_period_us: config.sample_period_us,
            response_timeout: config.response_timeout(),
        })
    }
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    channel: usize,
    tx: SyncSender<Vec<f32>>,
    shared: Arc<Shared>,
) -> Result<Stream, DeviceError>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let channels = config.channels as usize;
    let data_shared = shared.clone();
    let data_cb = move |data: &[T], _: &cpal::InputCallbackInfo| {
        if data_shared.capturing.load(Ordering::Acquire) {
            deliver(&tx, &data_shared, select_channel(data, channels, channel));
        }
    };
    let err_cb = move |err: cpal::StreamError| {
        error!("audio input stream error: {err}");
        if let Ok(mut fault) = shared.fault.lock() {
            *fault = Some(err.to_string());
        }
    };
    device
        .build_input_stream(config, data_cb, err_cb, None)
        .map_err(|e| DeviceError::Configuration(e.to_string()))
}

/// Picks one channel out of interleaved frames.
fn select_channel<T>(data: &[T], channels: usize, channel: usize) -> Vec<f32>
where
    T: Sample,
    f32: FromSample<T>,
{
    data.chunks(channels.max(1))
        .filter_map(|frame| frame.get(channel))
        .map(|&s| s.to_sample::<f32>())
        .collect()
}

/// Hands one callback's worth of samples to the reader. A full queue means
/// samples are lost, which the reader reports as an overrun.
fn deliver(tx: &SyncSender<Vec<f32>>, shared: &Shared, chunk: Vec<f32>) {
    match tx.try_send(chunk) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) => shared.overrun.store(true, Ordering::Release),
        Err(TrySendError::Disconnected(_)) => {}
    }
}

/// Collects exactly `n` contiguous samples before `timeout` runs out.
fn assemble_epoch(
    rx: &Receiver<Vec<f32>>,
    shared: &Shared,
    n: usize,
    timeout: Duration,
) -> Result<Vec<f64>, DeviceError> {
    shared.capturing.store(true, Ordering::Release);
    let deadline = Instant::now() + timeout;
    let mut samples = Vec::with_capacity(n);
    let outcome = loop {
        if samples.len() >= n {
            break Ok(());
        }
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            warn!("underrun, {} of {n} samples", samples.len());
            break Err(DeviceError::Timeout { waited: timeout });
        }
        match rx.recv_timeout(left) {
            Ok(chunk) => {
                let take = (n - samples.len()).min(chunk.len());
                samples.extend(chunk[..take].iter().map(|&s| s as f64));
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                break Err(DeviceError::Disconnected("audio stream ended".into()))
            }
        }
    };
    shared.capturing.store(false, Ordering::Release);
    shared.check_fault()?;
    outcome?;
    if shared.overrun.swap(false, Ordering::AcqRel) {
        // Samples were dropped mid-epoch, the buffer is not contiguous.
        warn!("overrun while collecting {n} samples");
        return Err(DeviceError::Timeout { waited: timeout });
    }
    ensure_epoch_len(&samples, n)?;
    Ok(samples)
}

impl DeviceSource for SoundcardSource {
    fn describe(&self) -> String {
        format!(
            "{} (N={}, {}us)",
            self.name, self.sample_count, self.sample_period_us
        )
    }
    fn sample_count(&self) -> usize {
        self.sample_count
    }
    fn sample_period_us(&self) -> u32 {
        self.sample_period_us
    }
    fn read_epoch(&mut self) -> Result<Vec<f64>, DeviceError> {
        if self.stream.is_none() {
            return Err(DeviceError::Disconnected(format!("{} is closed", self.name)));
        }
        self.shared.check_fault()?;
        // 丢弃上一轮之后残留的数据
        while self.rx.try_recv().is_ok() {}
        self.shared.overrun.store(false, Ordering::Release);
        assemble_epoch(&self.rx, &self.shared, self.sample_count, self.response_timeout)
            .map_err(|e| {
                warn!("{}: {e}", self.name);
                e
            })
    }
    fn close(&mut self) -> Result<(), DeviceError> {
        self.shared.capturing.store(false, Ordering::Release);
        if let Some(stream) = self.stream.take() {
            if let Err(e) = stream.pause() {
                warn!("{}: pause on close failed: {e}", self.name);
            }
            info!("{} closed", self.name);
        }
        Ok(())
    }
}

impl Drop for SoundcardSource {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
