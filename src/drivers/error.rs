use std::io;
use std::time::Duration;
use thiserror::Error;
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("device did not answer within {waited:?}")]
    Timeout { waited: Duration },
    #[error("malformed device response: {0}")]
    Framing(String),
    #[error("device disconnected: {0}")]
    Disconnected(String),
    #[error("invalid device configuration: {0}")]
    Configuration(String),
}
impl DeviceError {
    pub fn framing(msg: impl Into<String>) -> Self {
        DeviceError::Framing(msg.into())
    }
    /// Whether the scheduler may keep going after this error (counts toward the
    /// consecutive-failure threshold) or must stop immediately.
    pub fn is_epoch_local(&self) -> bool {
        matches!(self, DeviceError::Timeout { .. } | DeviceError::Framing(_))
    }
}
impl From<io::Error> for DeviceError {
    fn from(value: io::Error) -> Self {
        match value.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => DeviceError::Timeout {
                waited: Duration::ZERO,
            },
            _ => DeviceError::Disconnected(value.to_string()),
        }
    }
}
impl From<serialport::Error> for DeviceError {
    fn from(value: serialport::Error) -> Self {
        match value.kind() {
            serialport::ErrorKind::InvalidInput => DeviceError::Configuration(value.to_string()),
            _ => DeviceError::Disconnected(value.to_string()),
        }
    }
}
#[derive(Debug, Error)]
pub enum DetectorError {
    #[error("detector library unavailable: {0}")]
    Unavailable(String),
    #[error("detector failed with code {0}")]
    Code(i32),
    #[error("detector panicked: {0}")]
    Panicked(String),
    #[error("detector returned beat index {index} outside epoch of {len} samples")]
    OutOfRange { index: usize, len: usize },
}
impl From<libloading::Error> for DetectorError {
    fn from(value: libloading::Error) -> Self {
        DetectorError::Unavailable(value.to_string())
    }
}
