//! Command/response exchange with the acquisition firmware.
//!
//! Every command is a single ASCII byte, optionally followed by a decimal
//! argument terminated by `;`. Every answer is one line of ASCII ending in
//! `\n`. The firmware is strictly request/response: exactly one line per
//! command, so a line left unread will be mistaken for the next answer.
//!
//! | cmd | answer                                 |
//! |-----|----------------------------------------|
//! | `i` | `nSamp, samplePeriodUs, dataReadyFlag` |
//! | `n` | echoed (clamped) sample count          |
//! | `s` | echoed (clamped) sample period in µs   |
//! | `m` | mean of N reads                        |
//! | `a` | `[v0,v1,...,vN-1,]`                    |
//! | `r` | `[v0v1...vN-1]`                        |
use std::io::{self, Read, Write};
use std::thread;
use std::time::{Duration, Instant};

use log::debug;
use serialport::{ClearBuffer, SerialPort};

use crate::drivers::DeviceError;

pub const MAX_SAMPLE_COUNT: usize = 256;
pub const MIN_SAMPLE_PERIOD_US: u32 = 100;
pub const MAX_SAMPLE_PERIOD_US: u32 = 16383;
/// Answer timeout for commands that do not acquire.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(2);
const MAX_LINE_BYTES: usize = 8 * 1024;

pub fn clamp_sample_count(requested: usize) -> usize {
    requested.clamp(1, MAX_SAMPLE_COUNT)
}

pub fn clamp_sample_period(requested_us: u32) -> u32 {
    requested_us.clamp(MIN_SAMPLE_PERIOD_US, MAX_SAMPLE_PERIOD_US)
}

/// Byte transport to the firmware.
pub trait SerialLink: Read + Write {
    /// Drop anything the device sent that has not been read yet.
    fn discard_input(&mut self) -> io::Result<()>;
}

impl SerialLink for Box<dyn SerialPort> {
    fn discard_input(&mut self) -> io::Result<()> {
        self.clear(ClearBuffer::Input).map_err(io::Error::from)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    Info,
    SetSampleCount(usize),
    SetSamplePeriod(u32),
    Mean,
    Acquire,
    Reread,
}

impl Command {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Command::Info => b"i".to_vec(),
            Command::SetSampleCount(n) => format!("n{n};").into_bytes(),
            Command::SetSamplePeriod(us) => format!("s{us};").into_bytes(),
            Command::Mean => b"m".to_vec(),
            Command::Acquire => b"a".to_vec(),
            Command::Reread => b"r".to_vec(),
        }
    }
}

/// Answer to `i`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceInfo {
    pub sample_count: usize,
    pub sample_period_us: u32,
    pub data_ready: bool,
}

pub struct ProtocolClient<L: SerialLink> {
    link: L,
    pending: Vec<u8>,
}

impl<L: SerialLink> ProtocolClient<L> {
    pub fn new(link: L) -> Self {
        Self {
            link,
            pending: Vec::new(),
        }
    }

    pub fn info(&mut self) -> Result<DeviceInfo, DeviceError> {
        let line = self.exchange(Command::Info, COMMAND_TIMEOUT)?;
        parse_info(&line)
    }

    /// Returns the value the firmware actually applied.
    pub fn set_sample_count(&mut self, requested: usize) -> Result<usize, DeviceError> {
        let line = self.exchange(
            Command::SetSampleCount(clamp_sample_count(requested)),
            COMMAND_TIMEOUT,
        )?;
        parse_decimal(&line, "sample count echo")
    }

    /// Returns the value the firmware actually applied.
    pub fn set_sample_period(&mut self, requested_us: u32) -> Result<u32, DeviceError> {
        let line = self.exchange(
            Command::SetSamplePeriod(clamp_sample_period(requested_us)),
            COMMAND_TIMEOUT,
        )?;
        parse_decimal(&line, "sample period echo")
    }

    pub fn mean_reading(&mut self, timeout: Duration) -> Result<i64, DeviceError> {
        let line = self.exchange(Command::Mean, timeout)?;
        parse_decimal(&line, "mean reading")
    }

    /// Triggers one acquisition and returns its buffer. Blocks for about
    /// N × period; `timeout` bounds the whole round trip.
    pub fn acquire(&mut self, n: usize, timeout: Duration) -> Result<Vec<i64>, DeviceError> {
        let line = self.exchange(Command::Acquire, timeout)?;
        parse_acquire_frame(&line, n)
    }

    /// Reads the last buffer again without triggering a new acquisition.
    pub fn reread(&mut self, n: usize) -> Result<Vec<i64>, DeviceError> {
        let line = self.exchange(Command::Reread, COMMAND_TIMEOUT)?;
        parse_reread_frame(&line, n)
    }

    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    fn exchange(&mut self, command: Command, timeout: Duration) -> Result<String, DeviceError> {
        self.link.discard_input()?;
        self.pending.clear();
        let bytes = command.encode();
        self.link.write_all(&bytes)?;
        self.link.flush()?;
        debug!("-> {:?}", String::from_utf8_lossy(&bytes));
        let line = self.read_line(timeout)?;
        debug!("<- {} bytes for {:?}", line.len(), command);
        Ok(line)
    }

    fn read_line(&mut self, timeout: Duration) -> Result<String, DeviceError> {
        let deadline = Instant::now() + timeout;
        let mut chunk = [0u8; 256];
        loop {
            if let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
                let raw: Vec<u8> = self.pending.drain(..=pos).collect();
                let line = String::from_utf8(raw)
                    .map_err(|_| DeviceError::framing("response is not ASCII"))?;
                return Ok(line.trim_end_matches(['\r', '\n']).to_string());
            }
            if self.pending.len() > MAX_LINE_BYTES {
                return Err(DeviceError::framing(format!(
                    "no line terminator within {MAX_LINE_BYTES} bytes"
                )));
            }
            if Instant::now() >= deadline {
                return Err(DeviceError::Timeout { waited: timeout });
            }
            match self.link.read(&mut chunk) {
                Ok(0) => thread::sleep(Duration::from_millis(1)),
                Ok(len) => self.pending.extend_from_slice(&chunk[..len]),
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::TimedOut
                            | io::ErrorKind::WouldBlock
                            | io::ErrorKind::Interrupted
                    ) => {}
                Err(e) => return Err(DeviceError::Disconnected(e.to_string())),
            }
        }
    }
}

fn parse_decimal<T: std::str::FromStr>(line: &str, what: &str) -> Result<T, DeviceError> {
    line.trim()
        .parse::<T>()
        .map_err(|_| DeviceError::framing(format!("{what}: expected a decimal integer, got {line:?}")))
}

pub fn parse_info(line: &str) -> Result<DeviceInfo, DeviceError> {
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    if fields.len() != 3 {
        return Err(DeviceError::framing(format!(
            "info: expected 3 fields, got {line:?}"
        )));
    }
    let sample_count = parse_decimal(fields[0], "info sample count")?;
    let sample_period_us = parse_decimal(fields[1], "info sample period")?;
    let ready: u8 = parse_decimal(fields[2], "info data ready flag")?;
    Ok(DeviceInfo {
        sample_count,
        sample_period_us,
        data_ready: ready != 0,
    })
}

fn strip_brackets(line: &str) -> Result<&str, DeviceError> {
    let body = line.trim();
    let body = body
        .strip_prefix('[')
        .ok_or_else(|| DeviceError::framing("missing opening bracket"))?;
    body.strip_suffix(']')
        .ok_or_else(|| DeviceError::framing("missing closing bracket"))
}

/// Parses the answer to `a`: `[v0,v1,...,vN-1,]`, trailing comma included.
pub fn parse_acquire_frame(line: &str, n: usize) -> Result<Vec<i64>, DeviceError> {
    let inner = strip_brackets(line)?;
    let inner = inner
        .strip_suffix(',')
        .ok_or_else(|| DeviceError::framing("missing trailing comma before closing bracket"))?;
    let values = if inner.is_empty() {
        Vec::new()
    } else {
        inner
            .split(',')
            .map(|token| {
                token.trim().parse::<i64>().map_err(|_| {
                    DeviceError::framing(format!("non-numeric sample token {token:?}"))
                })
            })
            .collect::<Result<Vec<_>, _>>()?
    };
    if values.len() != n {
        return Err(DeviceError::framing(format!(
            "expected {n} samples, got {}",
            values.len()
        )));
    }
    Ok(values)
}

/// Parses the answer to `r`: `[v0v1...vN-1]` with no separators. Values are
/// read as N equal-width digit fields; anything else is rejected.
pub fn parse_reread_frame(line: &str, n: usize) -> Result<Vec<i64>, DeviceError> {
    let inner = strip_brackets(line)?;
    if let Some(bad) = inner.chars().find(|c| !c.is_ascii_digit()) {
        return Err(DeviceError::framing(format!(
            "unexpected character {bad:?} in re-read buffer"
        )));
    }
    if n == 0 || inner.is_empty() || inner.len() % n != 0 {
        return Err(DeviceError::framing(format!(
            "{} digits cannot be split into {n} equal fields",
            inner.len()
        )));
    }
    let width = inner.len() / n;
    inner
        .as_bytes()
        .chunks(width)
        .map(|field| {
            std::str::from_utf8(field)
                .ok()
                .and_then(|s| s.parse::<i64>().ok())
                .ok_or_else(|| DeviceError::framing("unreadable re-read field"))
        })
        .collect()
}
