// Transcode engine: hardware detection, encoder validation, planning and jobs

pub mod core;
pub mod error;
pub mod events;
pub mod exec;
pub mod hardware;
pub mod probe;
pub mod validate;
pub mod worker;

pub use self::core::*;
pub use error::{EngineError, EngineResult};
pub use events::{ProgressEvent, ProgressHub};
pub use hardware::{DecodeMethod, HardwareProfile, HardwareType};
pub use probe::MediaInfo;
pub use validate::ValidationCache;
pub use worker::{CancelOutcome, Capabilities, Orchestrator, OrchestratorSettings, PreparedJob};
