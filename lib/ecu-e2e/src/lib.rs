//! End-to-end (E2E) data protection (`§4.3`, `§6`, `§9`): sequence counters
//! plus a CRC computed over `header || payload`, used to detect loss,
//! repeat, reorder, or bit corruption of a protected stream.
//!
//! `§9` resolves an ambiguity in the original `E2E_Protect`/`calculate_crc`
//! pair (whether the header participates in the CRC) as "yes" — the only
//! reading under which `Check` can detect a payload swapped onto the same
//! header. Profiles 5 (CRC-64 ISO) and 6 (CUSTOM) are deliberately not
//! wired up; `E2eConfig::new` refuses to construct rather than silently
//! reporting VALID for an unimplemented profile (`§9`: "partial
//! implementations... must either be fully implemented or refuse to
//! initialise").

use ecu_crc::{Crc16, Crc32, Crc8, CrcParams};
use ecu_error::{ClassifiedError, ErrorKind};
use thiserror::Error;

ecu_ringbuf::ringbuf!(E2E_RINGBUF, E2eLogEvent, 64, E2eLogEvent::Idle);

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum E2eLogEvent {
    Idle,
    Protected { data_id: u16, sequence: u32 },
    CheckValid { data_id: u16 },
    CheckInvalid { data_id: u16 },
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum E2eProfile {
    Crc8SaeJ1850,
    Crc16Ccitt,
    Crc32Autosar,
    Crc64Iso,
    Custom,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum E2eError {
    #[error("profile is not implemented by this build")]
    NotImplemented,
    #[error("max_delta_counter must be nonzero")]
    InvalidMaxDeltaCounter,
    #[error("payload length {got} is shorter than the configured minimum {min}")]
    PayloadTooShort { min: usize, got: usize },
    #[error("payload length {got} exceeds the configured maximum {max}")]
    PayloadTooLong { max: usize, got: usize },
    #[error("frame of {got} bytes is too short to contain a header and CRC")]
    FrameTooShort { got: usize },
    #[error("frame data_id 0x{got:04X} does not match configured 0x{expected:04X}")]
    DataIdMismatch { expected: u16, got: u16 },
    #[error("frame is stale: older than the configured timeout")]
    Timeout,
    #[error("sequence counter mismatch")]
    Sequence,
    #[error("CRC mismatch")]
    Crc,
}

impl ClassifiedError for E2eError {
    fn kind(&self) -> ErrorKind {
        match self {
            E2eError::NotImplemented
            | E2eError::InvalidMaxDeltaCounter
            | E2eError::PayloadTooShort { .. }
            | E2eError::PayloadTooLong { .. }
            | E2eError::FrameTooShort { .. }
            | E2eError::DataIdMismatch { .. } => ErrorKind::Configuration,
            E2eError::Timeout => ErrorKind::Transient,
            E2eError::Sequence => ErrorKind::Protocol,
            E2eError::Crc => ErrorKind::Transient,
        }
    }
}

enum CrcEngine {
    Width8(Crc8),
    Width16(Crc16),
    Width32(Crc32),
}

impl CrcEngine {
    fn width_bytes(&self) -> usize {
        match self {
            CrcEngine::Width8(_) => 1,
            CrcEngine::Width16(_) => 2,
            CrcEngine::Width32(_) => 4,
        }
    }

    fn compute_be(&self, data: &[u8]) -> Vec<u8> {
        match self {
            CrcEngine::Width8(c) => vec![c.compute(data)],
            CrcEngine::Width16(c) => c.compute(data).to_be_bytes().to_vec(),
            CrcEngine::Width32(c) => c.compute(data).to_be_bytes().to_vec(),
        }
    }
}

/// Configuration for one protected stream (`§3`). Owns its own CRC table
/// rather than sharing a process-wide one (`§9`).
pub struct E2eConfig {
    pub data_id: u16,
    pub min_payload_len: usize,
    pub max_payload_len: usize,
    pub max_delta_counter: u32,
    pub timeout_ms: u64,
    pub include_length: bool,
    crc: CrcEngine,
}

impl E2eConfig {
    pub fn new(
        profile: E2eProfile,
        data_id: u16,
        min_payload_len: usize,
        max_payload_len: usize,
        max_delta_counter: u32,
        timeout_ms: u64,
        include_length: bool,
    ) -> Result<Self, E2eError> {
        if max_delta_counter == 0 {
            return Err(E2eError::InvalidMaxDeltaCounter);
        }
        let crc = match profile {
            E2eProfile::Crc8SaeJ1850 => CrcEngine::Width8(Crc8::new(CrcParams {
                poly: 0x07,
                init: 0x00,
                xor_out: 0x00,
            })),
            E2eProfile::Crc16Ccitt => CrcEngine::Width16(Crc16::new(CrcParams {
                poly: 0x1021,
                init: 0xFFFF,
                xor_out: 0x0000,
            })),
            E2eProfile::Crc32Autosar => CrcEngine::Width32(Crc32::new(CrcParams {
                poly: 0x04C1_1DB7,
                init: 0xFFFF_FFFF,
                xor_out: 0xFFFF_FFFF,
            })),
            E2eProfile::Crc64Iso | E2eProfile::Custom => return Err(E2eError::NotImplemented),
        };
        Ok(E2eConfig {
            data_id,
            min_payload_len,
            max_payload_len,
            max_delta_counter,
            timeout_ms,
            include_length,
            crc,
        })
    }

    fn header_len(&self) -> usize {
        6 + if self.include_length { 2 } else { 0 }
    }

    fn validate_len(&self, len: usize) -> Result<(), E2eError> {
        if len < self.min_payload_len {
            return Err(E2eError::PayloadTooShort {
                min: self.min_payload_len,
                got: len,
            });
        }
        if len > self.max_payload_len {
            return Err(E2eError::PayloadTooLong {
                max: self.max_payload_len,
                got: len,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum E2eFsmState {
    Init,
    Valid,
    Invalid,
    Error,
}

/// Runtime state for one protected stream (`§3`).
#[derive(Debug, Clone)]
pub struct E2eState {
    pub sequence_counter: u32,
    pub last_timestamp_ms: u64,
    pub fsm: E2eFsmState,
    pub error_count: u32,
}

impl E2eState {
    pub fn new() -> Self {
        E2eState {
            sequence_counter: 0,
            last_timestamp_ms: 0,
            fsm: E2eFsmState::Init,
            error_count: 0,
        }
    }
}

impl Default for E2eState {
    fn default() -> Self {
        Self::new()
    }
}

fn encode_header(data_id: u16, sequence: u32, length: Option<u16>) -> Vec<u8> {
    let mut v = Vec::with_capacity(8);
    v.extend_from_slice(&data_id.to_be_bytes());
    v.extend_from_slice(&sequence.to_be_bytes());
    if let Some(len) = length {
        v.extend_from_slice(&len.to_be_bytes());
    }
    v
}

/// Advances the sequence counter, builds the header, computes the CRC over
/// `header || payload`, and returns the full wire frame (`§4.3`, `§6`).
pub fn protect(
    cfg: &E2eConfig,
    state: &mut E2eState,
    payload: &[u8],
    now_ms: u64,
) -> Result<Vec<u8>, E2eError> {
    cfg.validate_len(payload.len())?;
    state.sequence_counter = (state.sequence_counter + 1) % cfg.max_delta_counter;
    let length = if cfg.include_length {
        Some(payload.len() as u16)
    } else {
        None
    };
    let header = encode_header(cfg.data_id, state.sequence_counter, length);

    let mut crc_input = header.clone();
    crc_input.extend_from_slice(payload);
    let crc_bytes = cfg.crc.compute_be(&crc_input);

    state.last_timestamp_ms = now_ms;
    state.fsm = E2eFsmState::Valid;

    ecu_ringbuf::ringbuf_entry!(
        E2E_RINGBUF,
        E2eLogEvent::Protected {
            data_id: cfg.data_id,
            sequence: state.sequence_counter,
        }
    );

    let mut frame = header;
    frame.extend_from_slice(&crc_bytes);
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Validates a received frame against `cfg`/`state` (`§4.3`).
pub fn check(
    cfg: &E2eConfig,
    state: &mut E2eState,
    frame: &[u8],
    now_ms: u64,
) -> Result<(), E2eError> {
    let h = cfg.header_len();
    let w = cfg.crc.width_bytes();
    if frame.len() < h + w {
        return Err(E2eError::FrameTooShort { got: frame.len() });
    }

    let data_id = u16::from_be_bytes([frame[0], frame[1]]);
    if data_id != cfg.data_id {
        ecu_ringbuf::ringbuf_entry!(E2E_RINGBUF, E2eLogEvent::CheckInvalid { data_id });
        return Err(E2eError::DataIdMismatch {
            expected: cfg.data_id,
            got: data_id,
        });
    }

    if now_ms.saturating_sub(state.last_timestamp_ms) > cfg.timeout_ms {
        state.error_count += 1;
        ecu_ringbuf::ringbuf_entry!(E2E_RINGBUF, E2eLogEvent::CheckInvalid { data_id });
        return Err(E2eError::Timeout);
    }

    let sequence = u32::from_be_bytes([frame[2], frame[3], frame[4], frame[5]]);
    let payload = &frame[h + w..];
    cfg.validate_len(payload.len())?;

    let expected_seq = (state.sequence_counter + 1) % cfg.max_delta_counter;
    if sequence != expected_seq {
        state.fsm = E2eFsmState::Invalid;
        state.error_count += 1;
        ecu_ringbuf::ringbuf_entry!(E2E_RINGBUF, E2eLogEvent::CheckInvalid { data_id });
        return Err(E2eError::Sequence);
    }

    let mut crc_input = frame[..h].to_vec();
    crc_input.extend_from_slice(payload);
    let computed = cfg.crc.compute_be(&crc_input);
    if computed != frame[h..h + w] {
        state.fsm = E2eFsmState::Invalid;
        state.error_count += 1;
        ecu_ringbuf::ringbuf_entry!(E2E_RINGBUF, E2eLogEvent::CheckInvalid { data_id });
        return Err(E2eError::Crc);
    }

    state.sequence_counter = sequence;
    state.last_timestamp_ms = now_ms;
    state.fsm = E2eFsmState::Valid;
    ecu_ringbuf::ringbuf_entry!(E2E_RINGBUF, E2eLogEvent::CheckValid { data_id });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> E2eConfig {
        E2eConfig::new(E2eProfile::Crc16Ccitt, 0x1234, 0, 64, 16, 1000, false).unwrap()
    }

    #[test]
    fn profile_5_and_6_refuse_to_construct() {
        assert_eq!(
            E2eConfig::new(E2eProfile::Crc64Iso, 1, 0, 8, 16, 100, false).unwrap_err(),
            E2eError::NotImplemented
        );
        assert_eq!(
            E2eConfig::new(E2eProfile::Custom, 1, 0, 8, 16, 100, false).unwrap_err(),
            E2eError::NotImplemented
        );
    }

    #[test]
    fn protect_then_check_round_trips() {
        let cfg = cfg();
        let mut writer = E2eState::new();
        let mut reader = E2eState::new();
        let frame = protect(&cfg, &mut writer, &[0xDE, 0xAD, 0xBE, 0xEF], 0).unwrap();
        check(&cfg, &mut reader, &frame, 0).unwrap();
        assert_eq!(reader.fsm, E2eFsmState::Valid);
        assert_eq!(reader.sequence_counter, 1);
    }

    #[test]
    fn example_vector_profile_2_sequence_zero() {
        // §8 scenario 2: data_id=0x1234, payload DE AD BE EF, initial
        // sequence 0 -> header becomes 12 34 00 00 00 01.
        let cfg = cfg();
        let mut state = E2eState::new();
        let frame = protect(&cfg, &mut state, &[0xDE, 0xAD, 0xBE, 0xEF], 0).unwrap();
        assert_eq!(&frame[0..6], &[0x12, 0x34, 0x00, 0x00, 0x00, 0x01]);
    }

    #[test]
    fn replayed_frame_is_sequence_invalid() {
        let cfg = cfg();
        let mut writer = E2eState::new();
        let mut reader = E2eState::new();
        let frame = protect(&cfg, &mut writer, &[1, 2, 3, 4], 0).unwrap();
        check(&cfg, &mut reader, &frame, 0).unwrap();
        let err = check(&cfg, &mut reader, &frame, 1).unwrap_err();
        assert_eq!(err, E2eError::Sequence);
        assert_eq!(reader.fsm, E2eFsmState::Invalid);
    }

    #[test]
    fn corrupted_payload_is_crc_invalid() {
        let cfg = cfg();
        let mut writer = E2eState::new();
        let mut reader = E2eState::new();
        let mut frame = protect(&cfg, &mut writer, &[1, 2, 3, 4], 0).unwrap();
        *frame.last_mut().unwrap() ^= 0xFF;
        let err = check(&cfg, &mut reader, &frame, 0).unwrap_err();
        assert_eq!(err, E2eError::Crc);
    }

    #[test]
    fn stale_frame_rejected_as_timeout() {
        let cfg = cfg();
        let mut writer = E2eState::new();
        let mut reader = E2eState::new();
        reader.last_timestamp_ms = 0;
        let frame = protect(&cfg, &mut writer, &[1, 2, 3, 4], 0).unwrap();
        let err = check(&cfg, &mut reader, &frame, cfg.timeout_ms + 1).unwrap_err();
        assert_eq!(err, E2eError::Timeout);
    }

    #[test]
    fn sequence_wraps_at_max_delta_counter() {
        let cfg = cfg();
        let mut state = E2eState::new();
        state.sequence_counter = cfg.max_delta_counter - 1;
        let frame = protect(&cfg, &mut state, &[1], 0).unwrap();
        let sequence = u32::from_be_bytes([frame[2], frame[3], frame[4], frame[5]]);
        assert_eq!(sequence, 0);
    }

    #[test]
    fn data_id_mismatch_rejected() {
        let cfg = cfg();
        let mut writer = E2eState::new();
        let mut reader = E2eState::new();
        let frame = protect(&cfg, &mut writer, &[1, 2, 3, 4], 0).unwrap();
        let other = E2eConfig::new(E2eProfile::Crc16Ccitt, 0x9999, 0, 64, 16, 1000, false).unwrap();
        let err = check(&other, &mut reader, &frame, 0).unwrap_err();
        assert!(matches!(err, E2eError::DataIdMismatch { .. }));
    }
}
