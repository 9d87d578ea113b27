mod error;
mod records;
mod runtime;

pub use error::{ErrorKind, GatewayError};
pub use records::{Session, TaskRecord, TaskStatus};
pub use runtime::{RunOptions, RunResult, StreamChunk};
