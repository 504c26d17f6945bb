pub mod backend;
pub mod synthetic;

pub use backend::{AcquiredSource, CaptureBackend, Constraints, SourceAcquirer};
pub use synthetic::{SyntheticBackend, SyntheticOptions};
