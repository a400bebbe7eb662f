//! Platform-adjacent facilities shared by the scheduler and network layers:
//! the fixed-size memory pool and the watchdog supervisor (`§2`).

mod mempool;
mod watchdog;

pub use mempool::{MemPool, PoolBlock};
pub use watchdog::{ProcessExitResetSink, RecordingResetSink, ResetSink, Watchdog};
