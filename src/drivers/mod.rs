// src/drivers/mod.rs
// 声明同级目录下的子模块文件
pub mod detector;
#[cfg(test)]
pub mod emulator;
pub mod error;
pub mod filter;
pub mod pipeline;
pub mod protocol;
pub mod serial;
pub mod soundcard;
pub mod source;
pub mod variability;
// 公开导出这些模块里的结构体，方便外部调用
pub use detector::{build_detector, BeatDetector, BeatDetectorAdapter, Detection, PeakDetector};
pub use error::{DetectorError, DeviceError};
pub use filter::FilterStage;
pub use pipeline::EpochPipeline;
pub use protocol::{DeviceInfo, ProtocolClient, SerialLink};
pub use serial::SerialDeviceSource;
pub use soundcard::SoundcardSource;
pub use source::{open_source, DeviceSource, PlaybackSource};
pub use variability::{IntervalHistory, VariabilityTracker};
