//! Shared error classification for the ECU runtime.
//!
//! Every fallible component operation returns a component-local error enum
//! (`SchedulerError`, `SessionError`, etc., one per crate) rather than a
//! shared error type, but each of those enums exposes a `kind() -> ErrorKind`
//! method so callers can recover the cross-cutting classification below
//! without downcasting.

/// The five error kinds the runtime distinguishes, independent of which
/// component raised them.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// Invalid configuration at init time. The component must refuse to
    /// initialize rather than partially initialize.
    Configuration,
    /// A single operation failed but the system can retry on the next cycle.
    Transient,
    /// A protocol-level violation (wrong session, sequence jump, locked
    /// security access). Produces a negative acknowledgement.
    Protocol,
    /// An integrity check failed (safety-data verify, memory self-test).
    /// Clears validity and invokes the component's callback.
    Integrity,
    /// Unrecoverable; must trigger a platform reset through the watchdog
    /// HAL.
    Fatal,
}

/// Implemented by every component error enum so callers can ask "what kind
/// of failure is this" without matching every variant.
pub trait ClassifiedError {
    fn kind(&self) -> ErrorKind;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_distinct() {
        let kinds = [
            ErrorKind::Configuration,
            ErrorKind::Transient,
            ErrorKind::Protocol,
            ErrorKind::Integrity,
            ErrorKind::Fatal,
        ];
        for (i, a) in kinds.iter().enumerate() {
            for (j, b) in kinds.iter().enumerate() {
                assert_eq!(i == j, a == b);
            }
        }
    }
}
