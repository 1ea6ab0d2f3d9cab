//! Supporting services: output encoding and model load progress

pub mod format;
pub mod progress;

pub use format::{decode_base64_payload, encode_base64, OutputFormatHandler};
pub use progress::{
    ChannelProgressReporter, ConsoleProgressReporter, LoadProgress, LoadStage,
    NoOpProgressReporter, ProgressReporter,
};
