// src/engine.rs
use std::collections::VecDeque;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local};
use log::{debug, error, info, warn};
use thiserror::Error;

use crate::clock::Clock;
use crate::config::{DeviceConfig, MonitorConfig};
use crate::drivers::{open_source, BeatDetector, DeviceError, DeviceSource, EpochPipeline};
use crate::recorder::{PersistenceError, RunHeader, RunRecorder, FORMAT_VERSION};
use crate::types::*;

// 等待期间每隔一段时间检查一次控制命令
const POLL_SLICE: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error("cannot {action} while {state:?}")]
    InvalidState {
        action: &'static str,
        state: SchedulerState,
    },
}

pub type SourceOpener =
    Box<dyn FnMut(&DeviceConfig) -> Result<Box<dyn DeviceSource>, DeviceError>>;

/// Cloneable handle for sending control commands from other threads. Commands
/// take effect at the next epoch boundary.
#[derive(Clone)]
pub struct ControlHandle {
    tx: Sender<Command>,
}

impl ControlHandle {
    /// Returns false once the scheduler is gone.
    pub fn send(&self, command: Command) -> bool {
        self.tx.send(command).is_ok()
    }
    pub fn pause(&self) -> bool {
        self.send(Command::Pause)
    }
    pub fn resume(&self) -> bool {
        self.send(Command::Resume)
    }
    pub fn stop(&self) -> bool {
        self.send(Command::Stop)
    }
}

struct Run {
    started_at: DateTime<Local>,
    start_offset: Duration,
    gap: Duration,
    source: Box<dyn DeviceSource>,
    pipeline: EpochPipeline,
    recorder: RunRecorder,
    epochs: Vec<Epoch>,
    records: Vec<VariabilityRecord>,
    next_due: Duration,
    consecutive_failures: u32,
    failed: u64,
    degraded: u64,
    lost_writes: u64,
}

/// Drives one device source through epochs: acquire, filter, detect,
/// track, persist, notify. Owns the source and all run state.
///
/// `Stopped` is terminal; a new run needs a new scheduler.
pub struct AcquisitionScheduler {
    config: MonitorConfig,
    clock: Arc<dyn Clock>,
    detector: Option<Box<dyn BeatDetector>>,
    opener: SourceOpener,
    state: SchedulerState,
    run: Option<Run>,
    summary: Option<RunSummary>,
    cmd_tx: Sender<Command>,
    cmd_rx: Receiver<Command>,
    queued: VecDeque<Command>,
    event_tx: Sender<MonitorEvent>,
    event_rx: Option<Receiver<MonitorEvent>>,
}

impl AcquisitionScheduler {
    pub fn new(config: MonitorConfig, detector: Box<dyn BeatDetector>, clock: Arc<dyn Clock>) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel();
        let (event_tx, event_rx) = mpsc::channel();
        let source_clock = clock.clone();
        Self {
            config,
            clock,
            detector: Some(detector),
            opener: Box::new(move |device: &DeviceConfig| open_source(device, source_clock.clone())),
            state: SchedulerState::Idle,
            run: None,
            summary: None,
            cmd_tx,
            cmd_rx,
            queued: VecDeque::new(),
            event_tx,
            event_rx: Some(event_rx),
        }
    }

    /// Replaces how the device source is opened at `start()`.
    pub fn with_source_opener(mut self, opener: SourceOpener) -> Self {
        self.opener = opener;
        self
    }

    /// The event stream for the presentation side. Can be taken once.
    pub fn events(&mut self) -> Option<Receiver<MonitorEvent>> {
        self.event_rx.take()
    }

    pub fn control(&self) -> ControlHandle {
        ControlHandle {
            tx: self.cmd_tx.clone(),
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    /// Epochs of the current (or finished) run, in order.
    pub fn epochs(&self) -> &[Epoch] {
        self.run
            .as_ref()
            .map(|run| run.epochs.as_slice())
            .unwrap_or_default()
    }

    pub fn variability_series(&self) -> &[VariabilityRecord] {
        self.run
            .as_ref()
            .map(|run| run.records.as_slice())
            .unwrap_or_default()
    }

    pub fn summary(&self) -> Option<&RunSummary> {
        self.summary.as_ref()
    }

    /// Idle → Running. Opens the source and creates the run store.
    pub fn start(&mut self, device: DeviceConfig) -> Result<(), MonitorError> {
        if self.state != SchedulerState::Idle {
            return Err(MonitorError::InvalidState {
                action: "start",
                state: self.state,
            });
        }
        let device = device.validated()?;
        let mut source = (self.opener)(&device)?;
        // 以设备实际采用的参数为准
        let device = DeviceConfig {
            sample_count: source.sample_count(),
            sample_period_us: source.sample_period_us(),
            ..device
        };
        let detector_name = self
            .detector
            .as_ref()
            .map(|d| d.name().to_string())
            .unwrap_or_default();
        let started_at = self.clock.wall();
        let header = RunHeader {
            format_version: FORMAT_VERSION,
            started_at,
            device: device.clone(),
            filter: self.config.filter.clone(),
            detector: detector_name,
            info_text: self.config.info_text.clone(),
        };
        let recorder = match RunRecorder::create(
            &self.config.output_dir,
            &header,
            self.config.write_behind_capacity,
        ) {
            Ok(recorder) => recorder,
            Err(e) => {
                let _ = source.close();
                return Err(e.into());
            }
        };
        let Some(detector) = self.detector.take() else {
            let _ = source.close();
            return Err(MonitorError::InvalidState {
                action: "start",
                state: self.state,
            });
        };
        let pipeline = EpochPipeline::new(
            &device,
            &self.config.filter,
            detector,
            self.config.tracker_window_epochs,
        );
        let now = self.clock.now();
        info!(
            "run started at {started_at}: {}, epoch every {}s",
            source.describe(),
            device.inter_epoch_gap_s
        );
        self.run = Some(Run {
            started_at,
            start_offset: now,
            gap: device.inter_epoch_gap(),
            source,
            pipeline,
            recorder,
            epochs: Vec::new(),
            records: Vec::new(),
            next_due: now,
            consecutive_failures: 0,
            failed: 0,
            degraded: 0,
            lost_writes: 0,
        });
        self.set_state(SchedulerState::Running);
        Ok(())
    }

    /// Running → Paused. The source stays open.
    pub fn pause(&mut self) {
        if self.state == SchedulerState::Running {
            self.set_state(SchedulerState::Paused);
        } else {
            debug!("pause ignored while {:?}", self.state);
        }
    }

    /// Paused → Running. An epoch that fell due during the pause starts at once.
    pub fn resume(&mut self) {
        if self.state != SchedulerState::Paused {
            debug!("resume ignored while {:?}", self.state);
            return;
        }
        let now = self.clock.now();
        if let Some(run) = self.run.as_mut() {
            run.next_due = run.next_due.max(now);
        }
        self.set_state(SchedulerState::Running);
    }

    /// Any live state → Stopped. Closes the source and finalizes the run.
    /// No-op while Idle; returns the existing summary once stopped.
    pub fn stop(&mut self) -> Option<RunSummary> {
        match self.state {
            SchedulerState::Idle => {
                debug!("stop ignored while Idle");
                None
            }
            SchedulerState::Stopped => self.summary.clone(),
            SchedulerState::Running | SchedulerState::Paused => Some(self.finalize(None)),
        }
    }

    /// Drives the scheduler until it stops. Returns the terminal error if
    /// the run ended on one.
    pub fn run_until_stopped(&mut self) -> Result<RunSummary, MonitorError> {
        loop {
            self.step(None)?;
            if self.state == SchedulerState::Stopped {
                return self.summary.clone().ok_or(MonitorError::InvalidState {
                    action: "summarize",
                    state: self.state,
                });
            }
        }
    }

    /// Drives the scheduler for `span` of clock time, or until it stops.
    pub fn run_for(&mut self, span: Duration) -> Result<(), MonitorError> {
        let end = self.clock.now() + span;
        while self.state != SchedulerState::Stopped && self.clock.now() < end {
            self.step(Some(end))?;
        }
        Ok(())
    }

    /// One boundary: apply queued commands, then run a due epoch or wait.
    fn step(&mut self, end: Option<Duration>) -> Result<(), MonitorError> {
        self.apply_commands()?;
        let now = self.clock.now();
        match self.state {
            SchedulerState::Stopped => Ok(()),
            SchedulerState::Running => {
                let due = self.run.as_ref().map_or(now, |run| run.next_due);
                if let Some(end) = end.filter(|end| due >= *end) {
                    self.wait_until(end);
                    return Ok(());
                }
                if now >= due {
                    self.run_epoch()
                } else {
                    self.wait_until(due);
                    Ok(())
                }
            }
            SchedulerState::Idle | SchedulerState::Paused => {
                let until = now + POLL_SLICE;
                self.wait_until(end.map_or(until, |end| end.min(until)));
                Ok(())
            }
        }
    }

    /// Sleeps in slices, returning early when a command arrives.
    fn wait_until(&mut self, until: Duration) {
        loop {
            while let Ok(command) = self.cmd_rx.try_recv() {
                self.queued.push_back(command);
            }
            if !self.queued.is_empty() {
                return;
            }
            let now = self.clock.now();
            if now >= until {
                return;
            }
            self.clock.sleep((until - now).min(POLL_SLICE));
        }
    }

    fn apply_commands(&mut self) -> Result<(), MonitorError> {
        while let Ok(command) = self.cmd_rx.try_recv() {
            self.queued.push_back(command);
        }
        while let Some(command) = self.queued.pop_front() {
            debug!("applying {command:?}");
            match command {
                Command::Start(device) => match self.start(device) {
                    Err(MonitorError::InvalidState { state, .. }) => {
                        warn!("start ignored while {state:?}")
                    }
                    other => other?,
                },
                Command::Pause => self.pause(),
                Command::Resume => self.resume(),
                Command::Stop => {
                    self.stop();
                }
            }
        }
        Ok(())
    }

    fn run_epoch(&mut self) -> Result<(), MonitorError> {
        let threshold = self.config.max_consecutive_failures;
        let started_at = self.clock.wall();
        let now = self.clock.now();
        let Some(run) = self.run.as_mut() else {
            return Ok(());
        };
        let index = run.epochs.len() as u64;
        let offset_s = (now - run.start_offset).as_secs_f64();
        run.next_due = now + run.gap;

        let outcome = run
            .source
            .read_epoch()
            .and_then(|raw| run.pipeline.process(index, started_at, offset_s, raw));
        let (epoch, record, failure) = match outcome {
            Ok((epoch, record)) => {
                run.consecutive_failures = 0;
                if matches!(epoch.status, EpochStatus::Degraded(_)) {
                    run.degraded += 1;
                }
                (epoch, record, None)
            }
            Err(e) => {
                run.consecutive_failures += 1;
                run.failed += 1;
                warn!(
                    "epoch {index} failed ({} in a row): {e}",
                    run.consecutive_failures
                );
                let (epoch, record) = run.pipeline.fail(index, started_at, offset_s, e.to_string());
                (epoch, record, Some(e))
            }
        };

        if let Err(e) = run.recorder.append(&epoch, &record) {
            error!("epoch {index} not persisted: {e}");
            run.lost_writes += 1;
        }
        run.records.push(record);
        let event = match &epoch.status {
            EpochStatus::Failed(reason) => MonitorEvent::EpochFailed {
                index,
                reason: reason.clone(),
            },
            _ => MonitorEvent::EpochProcessed(Box::new(ProcessedEpoch {
                index,
                started_at: epoch.started_at,
                sample_rate_hz: run.pipeline.sample_rate_hz(),
                filtered: epoch.filtered.clone(),
                beats: epoch.beats.clone(),
                templates: epoch.templates.clone(),
                status: epoch.status.clone(),
                variability_series: run.records.clone(),
            })),
        };
        run.epochs.push(epoch);
        let consecutive = run.consecutive_failures;
        let total = run.epochs.len() as u64;
        self.event_tx.send(event).ok();

        if let Some(e) = failure {
            let fatal = !e.is_epoch_local();
            if fatal || (threshold > 0 && consecutive >= threshold) {
                error!("stopping run after epoch {index}: {e}");
                self.finalize(Some(e.to_string()));
                return Err(e.into());
            }
        }
        if self.config.max_epochs.is_some_and(|max| total >= max) {
            info!("reached {total} epochs, stopping");
            self.finalize(None);
        }
        Ok(())
    }

    fn finalize(&mut self, terminal_error: Option<String>) -> RunSummary {
        let summary = match self.run.as_mut() {
            Some(run) => {
                if let Err(e) = run.source.close() {
                    warn!("closing {} failed: {e}", run.source.describe());
                }
                let report = run.recorder.finish();
                let unresolved = report.unresolved + run.lost_writes;
                RunSummary {
                    started_at: run.started_at,
                    epochs: run.epochs.len() as u64,
                    failed: run.failed,
                    degraded: run.degraded,
                    persisted: report.written,
                    unresolved_writes: unresolved,
                    complete: unresolved == 0,
                    terminal_error,
                }
            }
            None => RunSummary {
                started_at: self.clock.wall(),
                epochs: 0,
                failed: 0,
                degraded: 0,
                persisted: 0,
                unresolved_writes: 0,
                complete: true,
                terminal_error,
            },
        };
        info!(
            "run finished: {} epochs, {} failed, {} persisted",
            summary.epochs, summary.failed, summary.persisted
        );
        self.summary = Some(summary.clone());
        self.set_state(SchedulerState::Stopped);
        self.event_tx.send(MonitorEvent::Stopped(summary.clone())).ok();
        summary
    }

    fn set_state(&mut self, state: SchedulerState) {
        info!("scheduler {:?} -> {:?}", self.state, state);
        self.state = state;
        self.event_tx.send(MonitorEvent::StateChanged(state)).ok();
    }
}
