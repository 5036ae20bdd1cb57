//! Request execution core: error classification, the streaming pump, usage
//! accounting, and the manager that coordinates selection, execution, and
//! retry across providers.

pub mod error;
pub mod manager;
pub mod stream;
pub mod usage;

pub use error::{classify_status, parse_retry_after, Error, ErrorCategory};
pub use manager::{Execution, ExecutionStream, Manager, ManagerConfig};
pub use stream::{StreamDecoder, StreamPump};
pub use usage::{cost_usd, Counters, CounterSnapshot, UsageRecord, UsageSink};
