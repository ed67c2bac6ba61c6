pub mod analysis;
pub mod anomaly;
pub mod auth;
pub mod capture;
pub mod checksum;
pub mod classifier;
pub mod config;
pub mod constants;
pub mod error;
pub mod frame;
pub mod session;
pub mod simulator;
pub mod state;

// Re-export the pipeline entry points for easy access
pub use analysis::{Analysis, Analyzer, CaptureReport};
pub use capture::{Capture, Device};
pub use config::{AnalyzerConfig, Validation};
pub use error::{FrameError, LinkError};
pub use frame::{Frame, FrameCodec, FrameType};
pub use state::State;
