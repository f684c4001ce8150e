//! In-memory stand-in for the acquisition firmware, speaking the same
//! command protocol over `Read + Write`.
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::clock::ManualClock;
use crate::drivers::protocol::{
    clamp_sample_count, clamp_sample_period, SerialLink,
};

const BASELINE: i64 = 512;
const R_PEAK: i64 = 900;
/// Beat every 0.8 s (75 bpm) of emulated time.
const BEAT_PERIOD_US: u64 = 800_000;

/// Misbehaviour applied to the next `a` command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fault {
    Silent,
    MissingClosingBracket,
    WrongCount,
    NonNumeric,
}

struct State {
    sample_count: usize,
    sample_period_us: u32,
    last_buffer: Vec<i64>,
    acquisitions: usize,
    sample_clock_us: u64,
    faults: VecDeque<Fault>,
    outbox: VecDeque<u8>,
    arg_command: Option<u8>,
    arg: String,
    clock: Option<ManualClock>,
}

#[derive(Clone)]
pub struct FirmwareEmulator {
    state: Arc<Mutex<State>>,
}

impl FirmwareEmulator {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                sample_count: 256,
                sample_period_us: 4000,
                last_buffer: Vec::new(),
                acquisitions: 0,
                sample_clock_us: 0,
                faults: VecDeque::new(),
                outbox: VecDeque::new(),
                arg_command: None,
                arg: String::new(),
                clock: None,
            })),
        }
    }

    /// Acquisitions advance `clock` by N × period, like the real blocking `a`.
    pub fn with_clock(self, clock: ManualClock) -> Self {
        self.state.lock().unwrap().clock = Some(clock);
        self
    }

    pub fn inject(&self, fault: Fault) {
        self.state.lock().unwrap().faults.push_back(fault);
    }

    pub fn push_unsolicited(&self, bytes: &[u8]) {
        self.state.lock().unwrap().outbox.extend(bytes.iter().copied());
    }

    pub fn last_buffer(&self) -> Vec<i64> {
        self.state.lock().unwrap().last_buffer.clone()
    }

    pub fn acquisitions(&self) -> usize {
        self.state.lock().unwrap().acquisitions
    }
}

impl State {
    fn sample_at(&self, t_us: u64) -> i64 {
        let phase = t_us % BEAT_PERIOD_US;
        let width = 3 * self.sample_period_us as u64;
        if phase < width {
            // Narrow triangular R wave.
            let half = width as i64 / 2;
            let dist = (phase as i64 - half).abs();
            R_PEAK - (R_PEAK - BASELINE) * dist / half.max(1)
        } else {
            BASELINE
        }
    }

    fn handle(&mut self, command: u8, arg: Option<&str>) {
        match command {
            b'i' => {
                let ready = u8::from(!self.last_buffer.is_empty());
                self.reply(&format!(
                    "{}, {}, {}\n",
                    self.sample_count, self.sample_period_us, ready
                ));
            }
            b'n' => {
                let requested = arg.and_then(|a| a.trim().parse::<usize>().ok()).unwrap_or(1);
                self.sample_count = clamp_sample_count(requested);
                let echo = self.sample_count;
                self.reply(&format!("{echo}\n"));
            }
            b's' => {
                let requested = arg.and_then(|a| a.trim().parse::<u32>().ok()).unwrap_or(0);
                self.sample_period_us = clamp_sample_period(requested);
                let echo = self.sample_period_us;
                self.reply(&format!("{echo}\n"));
            }
            b'm' => self.reply(&format!("{BASELINE}\n")),
            b'a' => self.acquire(),
            b'r' => {
                let digits: String = self
                    .last_buffer
                    .iter()
                    .map(|v| format!("{:04}", v))
                    .collect();
                self.reply(&format!("[{digits}]\n"));
            }
            other => self.reply(&format!("Unrecognized command: {}\n", other as char)),
        }
    }

    fn acquire(&mut self) {
        let n = self.sample_count;
        let period = self.sample_period_us as u64;
        let start = self.sample_clock_us;
        self.last_buffer = (0..n as u64)
            .map(|i| self.sample_at(start + i * period))
            .collect();
        self.sample_clock_us += n as u64 * period;
        self.acquisitions += 1;
        if let Some(clock) = &self.clock {
            clock.advance(Duration::from_micros(n as u64 * period));
        }
        let mut body: String = self.last_buffer.iter().map(|v| format!("{v},")).collect();
        match self.faults.pop_front() {
            None => self.reply(&format!("[{body}]\n")),
            Some(Fault::Silent) => {}
            Some(Fault::MissingClosingBracket) => self.reply(&format!("[{body}\n")),
            Some(Fault::WrongCount) => {
                body.push_str("0,");
                self.reply(&format!("[{body}]\n"));
            }
            Some(Fault::NonNumeric) => {
                body.replace_range(0..1, "x");
                self.reply(&format!("[{body}]\n"));
            }
        }
    }

    fn reply(&mut self, text: &str) {
        self.outbox.extend(text.bytes());
    }
}

impl Write for FirmwareEmulator {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state.lock().unwrap();
        for &byte in buf {
            if let Some(cmd) = state.arg_command {
                if byte == b';' {
                    let arg = std::mem::take(&mut state.arg);
                    state.arg_command = None;
                    state.handle(cmd, Some(&arg));
                } else {
                    state.arg.push(byte as char);
                }
                continue;
            }
            match byte {
                b'\r' | b'\n' | b' ' => {}
                b'n' | b's' => state.arg_command = Some(byte),
                other => state.handle(other, None),
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Read for FirmwareEmulator {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.lock().unwrap();
        if state.outbox.is_empty() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "no data"));
        }
        let len = buf.len().min(state.outbox.len());
        for (slot, byte) in buf.iter_mut().zip(state.outbox.drain(..len)) {
            *slot = byte;
        }
        Ok(len)
    }
}

impl SerialLink for FirmwareEmulator {
    fn discard_input(&mut self) -> io::Result<()> {
        self.state.lock().unwrap().outbox.clear();
        Ok(())
    }
}
