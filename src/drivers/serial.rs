// src/drivers/serial.rs
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};
use serialport::SerialPort;

use crate::config::DeviceConfig;
use crate::drivers::protocol::{DeviceInfo, ProtocolClient, SerialLink, COMMAND_TIMEOUT};
use crate::drivers::source::{ensure_epoch_len, DeviceSource};
use crate::drivers::DeviceError;

// 打开串口后等待单片机复位完成
const SETTLE_TIME: Duration = Duration::from_secs(1);
const PORT_READ_TIMEOUT: Duration = Duration::from_millis(50);

/// Microcontroller front end: one `a` per epoch.
pub struct SerialDeviceSource<L: SerialLink = Box<dyn SerialPort>> {
    name: String,
    client: ProtocolClient<L>,
    info: DeviceInfo,
    response_timeout: Duration,
    closed: bool,
}

impl SerialDeviceSource<Box<dyn SerialPort>> {
    pub fn open(port_name: &str, baud_rate: u32, config: &DeviceConfig) -> Result<Self, DeviceError> {
        let port = serialport::new(port_name, baud_rate)
            .timeout(PORT_READ_TIMEOUT)
            .open()?;
        info!("serial port {port_name} open at {baud_rate} baud, waiting for the board");
        thread::sleep(SETTLE_TIME);
        Self::with_link(port, format!("serial {port_name}"), config)
    }
}

impl<L: SerialLink> SerialDeviceSource<L> {
    /// Programs N and the sample period and verifies the echoes.
    pub fn with_link(link: L, name: String, config: &DeviceConfig) -> Result<Self, DeviceError> {
        let mut client = ProtocolClient::new(link);
        let before = client.info()?;
        debug!("{name} reports {before:?}");

        let count = client.set_sample_count(config.sample_count)?;
        if count != config.sample_count {
            return Err(DeviceError::Configuration(format!(
                "device applied sample count {count}, requested {}",
                config.sample_count
            )));
        }
        let period = client.set_sample_period(config.sample_period_us)?;
        if period != config.sample_period_us {
            return Err(DeviceError::Configuration(format!(
                "device applied sample period {period}us, requested {}us",
                config.sample_period_us
            )));
        }

        let info = client.info()?;
        if info.sample_count != count || info.sample_period_us != period {
            warn!("{name} info {info:?} disagrees with the echoed settings");
        }
        Ok(Self {
            name,
            client,
            info: DeviceInfo {
                sample_count: count,
                sample_period_us: period,
                data_ready: info.data_ready,
            },
            response_timeout: config.response_timeout(),
            closed: false,
        })
    }

    /// Fetches the last buffer again without a new acquisition.
    pub fn reread(&mut self) -> Result<Vec<f64>, DeviceError> {
        self.ensure_open()?;
        let values = self.client.reread(self.info.sample_count)?;
        Ok(values.into_iter().map(|v| v as f64).collect())
    }

    /// Averaged single reading, used to check the electrode baseline.
    pub fn mean_reading(&mut self) -> Result<i64, DeviceError> {
        self.ensure_open()?;
        self.client.mean_reading(COMMAND_TIMEOUT)
    }

    fn ensure_open(&self) -> Result<(), DeviceError> {
        if self.closed {
            return Err(DeviceError::Disconnected(format!("{} is closed", self.name)));
        }
        Ok(())
    }
}

impl<L: SerialLink> DeviceSource for SerialDeviceSource<L> {
    fn describe(&self) -> String {
        format!(
            "{} (N={}, {}us)",
            self.name, self.info.sample_count, self.info.sample_period_us
        )
    }
    fn sample_count(&self) -> usize {
        self.info.sample_count
    }
    fn sample_period_us(&self) -> u32 {
        self.info.sample_period_us
    }
    fn read_epoch(&mut self) -> Result<Vec<f64>, DeviceError> {
        self.ensure_open()?;
        let n = self.info.sample_count;
        let values = self.client.acquire(n, self.response_timeout)?;
        let samples: Vec<f64> = values.into_iter().map(|v| v as f64).collect();
        ensure_epoch_len(&samples, n)?;
        Ok(samples)
    }
    fn close(&mut self) -> Result<(), DeviceError> {
        if !self.closed {
            self.closed = true;
            // 丢弃未读的残留数据
            if let Err(e) = self.client.link_mut().discard_input() {
                debug!("{}: discard on close failed: {e}", self.name);
            }
            info!("{} closed", self.name);
        }
        Ok(())
    }
}

impl<L: SerialLink> Drop for SerialDeviceSource<L> {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
