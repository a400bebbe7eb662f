//! Safety datum store (`§3`, `§4.4`): range-checked variables protected by
//! CRC/REDUNDANT/INVERSE/CHECKSUM/E2E, with verify/backup/restore.
//!
//! Grounded on `safety_data.c`'s `Safety_Data_*` family: one critical
//! section guards the whole table, `validate_value_range` gates every
//! write, and `update_redundant_copy`/`verify_redundant_copy` implement the
//! REDUNDANT/INVERSE methods byte-for-byte. The CHECKSUM method is not
//! elaborated in the original beyond its name; this store treats it as an
//! additive byte checksum stored in the same slot the CRC method uses, and
//! treats E2E identically to CRC, since the store has no independent notion
//! of a sequence stream (see `DESIGN.md`).

use ecu_crc::{Crc32, CrcParams};
use ecu_error::{ClassifiedError, ErrorKind};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;

ecu_ringbuf::ringbuf!(SAFETY_RINGBUF, SafetyLogEvent, 64, SafetyLogEvent::Idle);

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SafetyLogEvent {
    Idle,
    WriteRejected { id: u32 },
    VerifyFailed { id: u32 },
    Restored { id: u32 },
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SafetyType {
    I8,
    I16,
    I32,
    U8,
    U16,
    U32,
    F32,
    F64,
    Bool,
    Blob,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ProtectionMethod {
    Crc,
    Redundant,
    Inverse,
    Checksum,
    E2e,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AsilLevel {
    A,
    B,
    C,
    D,
}

#[derive(Debug, Copy, Clone)]
pub struct NumericLimits {
    pub min: f64,
    pub max: f64,
    pub default: f64,
    pub tolerance: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SafetyValue {
    I8(i8),
    I16(i16),
    I32(i32),
    U8(u8),
    U16(u16),
    U32(u32),
    F32(f32),
    F64(f64),
    Bool(bool),
    Blob(Vec<u8>),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SafetyError {
    #[error("duplicate safety datum id {0}")]
    DuplicateId(u32),
    #[error("no safety datum with id {0}")]
    UnknownDatum(u32),
    #[error("value outside configured range for datum {0}")]
    OutOfRange(u32),
    #[error("integrity verification failed for datum {0}")]
    VerifyFailed(u32),
    #[error("datum {0} has no redundant copy configured")]
    NoRedundantCopy(u32),
    #[error("blob of {got} bytes exceeds configured size {max}")]
    BlobTooLarge { max: usize, got: usize },
    #[error("value type does not match datum {0}'s configured type")]
    TypeMismatch(u32),
}

impl ClassifiedError for SafetyError {
    fn kind(&self) -> ErrorKind {
        match self {
            SafetyError::DuplicateId(_)
            | SafetyError::UnknownDatum(_)
            | SafetyError::NoRedundantCopy(_)
            | SafetyError::BlobTooLarge { .. }
            | SafetyError::TypeMismatch(_) => ErrorKind::Configuration,
            SafetyError::OutOfRange(_) | SafetyError::VerifyFailed(_) => ErrorKind::Integrity,
        }
    }
}

type ValidationCallback = dyn Fn(bool) + Send + Sync;

pub struct SafetyConfig {
    pub id: u32,
    pub ty: SafetyType,
    pub protection: ProtectionMethod,
    pub limits: NumericLimits,
    pub asil: AsilLevel,
    pub has_redundant: bool,
    pub blob_size: usize,
    pub callback: Option<Arc<ValidationCallback>>,
}

struct Datum {
    config: SafetyConfig,
    primary: SafetyValue,
    redundant: Option<Vec<u8>>,
    checksum: u32,
    error_count: u32,
    valid: bool,
}

/// Owns the primary and redundant storage for every datum it manages
/// (`§3`: "No component aliases another's owned memory").
pub struct SafetyStore {
    crc: Crc32,
    data: Mutex<HashMap<u32, Datum>>,
}

impl SafetyStore {
    pub fn new() -> Self {
        SafetyStore {
            crc: Crc32::new(CrcParams {
                poly: 0x04C1_1DB7,
                init: 0xFFFF_FFFF,
                xor_out: 0xFFFF_FFFF,
            }),
            data: Mutex::new(HashMap::new()),
        }
    }

    pub fn init(&self, configs: Vec<SafetyConfig>) -> Result<(), SafetyError> {
        let mut table = self.data.lock().unwrap();
        table.clear();
        for config in configs {
            if table.contains_key(&config.id) {
                return Err(SafetyError::DuplicateId(config.id));
            }
            let id = config.id;
            let primary = default_value(&config);
            let mut datum = Datum {
                config,
                primary,
                redundant: None,
                checksum: 0,
                error_count: 0,
                valid: true,
            };
            update_protection(&mut datum, &self.crc);
            table.insert(id, datum);
        }
        Ok(())
    }

    pub fn deinit(&self) {
        self.data.lock().unwrap().clear();
    }

    pub fn write(&self, id: u32, value: SafetyValue) -> Result<(), SafetyError> {
        let mut table = self.data.lock().unwrap();
        let datum = table.get_mut(&id).ok_or(SafetyError::UnknownDatum(id))?;
        if std::mem::discriminant(&value) != std::mem::discriminant(&datum.primary) {
            return Err(SafetyError::TypeMismatch(id));
        }
        if let SafetyValue::Blob(bytes) = &value {
            if bytes.len() > datum.config.blob_size {
                return Err(SafetyError::BlobTooLarge {
                    max: datum.config.blob_size,
                    got: bytes.len(),
                });
            }
        }
        if !validate_range(&datum.config.limits, &value) {
            datum.error_count += 1;
            fire_callback(datum, false);
            ecu_ringbuf::ringbuf_entry!(SAFETY_RINGBUF, SafetyLogEvent::WriteRejected { id });
            return Err(SafetyError::OutOfRange(id));
        }
        datum.primary = if let SafetyValue::Blob(bytes) = value {
            // `§9`: a BLOB write always fully re-zeroes storage first, so a
            // short write never leaves stale tail bytes from a prior value.
            let mut storage = vec![0u8; datum.config.blob_size];
            storage[..bytes.len()].copy_from_slice(&bytes);
            SafetyValue::Blob(storage)
        } else {
            value
        };
        update_protection(datum, &self.crc);
        datum.valid = true;
        fire_callback(datum, true);
        Ok(())
    }

    pub fn read(&self, id: u32) -> Result<SafetyValue, SafetyError> {
        self.verify(id)?;
        let table = self.data.lock().unwrap();
        let datum = table.get(&id).ok_or(SafetyError::UnknownDatum(id))?;
        Ok(datum.primary.clone())
    }

    pub fn verify(&self, id: u32) -> Result<(), SafetyError> {
        let mut table = self.data.lock().unwrap();
        let datum = table.get_mut(&id).ok_or(SafetyError::UnknownDatum(id))?;
        let ok = match datum.config.protection {
            ProtectionMethod::Crc | ProtectionMethod::E2e => {
                self.crc.compute(&to_bytes(&datum.primary)) == datum.checksum
            }
            ProtectionMethod::Checksum => additive_checksum(&to_bytes(&datum.primary)) == datum.checksum,
            ProtectionMethod::Redundant => match &datum.redundant {
                Some(r) => *r == to_bytes(&datum.primary),
                None => true,
            },
            ProtectionMethod::Inverse => match &datum.redundant {
                Some(r) => to_bytes(&datum.primary)
                    .iter()
                    .zip(r.iter())
                    .all(|(p, r)| (p ^ r) == 0xFF),
                None => true,
            },
        };
        if !ok {
            datum.error_count += 1;
            datum.valid = false;
            fire_callback(datum, false);
            ecu_ringbuf::ringbuf_entry!(SAFETY_RINGBUF, SafetyLogEvent::VerifyFailed { id });
            return Err(SafetyError::VerifyFailed(id));
        }
        Ok(())
    }

    pub fn reset(&self, id: u32) -> Result<(), SafetyError> {
        let mut table = self.data.lock().unwrap();
        let datum = table.get_mut(&id).ok_or(SafetyError::UnknownDatum(id))?;
        datum.primary = default_value(&datum.config);
        update_protection(datum, &self.crc);
        datum.error_count = 0;
        datum.valid = true;
        fire_callback(datum, true);
        Ok(())
    }

    pub fn backup(&self, id: u32) -> Result<(), SafetyError> {
        let mut table = self.data.lock().unwrap();
        let datum = table.get_mut(&id).ok_or(SafetyError::UnknownDatum(id))?;
        if !datum.config.has_redundant {
            return Err(SafetyError::NoRedundantCopy(id));
        }
        update_protection(datum, &self.crc);
        Ok(())
    }

    pub fn restore(&self, id: u32) -> Result<(), SafetyError> {
        let mut table = self.data.lock().unwrap();
        let datum = table.get_mut(&id).ok_or(SafetyError::UnknownDatum(id))?;
        let ty = datum.config.ty;
        let restored = match (datum.config.protection, &datum.redundant) {
            (ProtectionMethod::Redundant, Some(r)) => from_bytes(ty, r),
            (ProtectionMethod::Inverse, Some(r)) => {
                let inv: Vec<u8> = r.iter().map(|b| !b).collect();
                from_bytes(ty, &inv)
            }
            _ => return Err(SafetyError::NoRedundantCopy(id)),
        };
        datum.primary = restored;
        update_protection(datum, &self.crc);
        datum.valid = true;
        fire_callback(datum, true);
        ecu_ringbuf::ringbuf_entry!(SAFETY_RINGBUF, SafetyLogEvent::Restored { id });
        Ok(())
    }

    pub fn is_valid(&self, id: u32) -> bool {
        self.data
            .lock()
            .unwrap()
            .get(&id)
            .map(|d| d.valid)
            .unwrap_or(false)
    }

    pub fn get_error_count(&self, id: u32) -> u32 {
        self.data
            .lock()
            .unwrap()
            .get(&id)
            .map(|d| d.error_count)
            .unwrap_or(0)
    }

    pub fn get_status(&self, id: u32) -> Option<(bool, u32)> {
        self.data
            .lock()
            .unwrap()
            .get(&id)
            .map(|d| (d.valid, d.error_count))
    }
}

impl Default for SafetyStore {
    fn default() -> Self {
        Self::new()
    }
}

fn fire_callback(datum: &Datum, valid: bool) {
    if let Some(cb) = &datum.config.callback {
        cb(valid);
    }
}

fn validate_range(limits: &NumericLimits, value: &SafetyValue) -> bool {
    match as_f64(value) {
        Some(v) => v >= limits.min && v <= limits.max,
        None => true,
    }
}

fn as_f64(value: &SafetyValue) -> Option<f64> {
    match value {
        SafetyValue::I8(x) => Some(*x as f64),
        SafetyValue::I16(x) => Some(*x as f64),
        SafetyValue::I32(x) => Some(*x as f64),
        SafetyValue::U8(x) => Some(*x as f64),
        SafetyValue::U16(x) => Some(*x as f64),
        SafetyValue::U32(x) => Some(*x as f64),
        SafetyValue::F32(x) => Some(*x as f64),
        SafetyValue::F64(x) => Some(*x),
        SafetyValue::Bool(_) | SafetyValue::Blob(_) => None,
    }
}

fn to_bytes(value: &SafetyValue) -> Vec<u8> {
    match value {
        SafetyValue::I8(x) => vec![*x as u8],
        SafetyValue::I16(x) => x.to_le_bytes().to_vec(),
        SafetyValue::I32(x) => x.to_le_bytes().to_vec(),
        SafetyValue::U8(x) => vec![*x],
        SafetyValue::U16(x) => x.to_le_bytes().to_vec(),
        SafetyValue::U32(x) => x.to_le_bytes().to_vec(),
        SafetyValue::F32(x) => x.to_le_bytes().to_vec(),
        SafetyValue::F64(x) => x.to_le_bytes().to_vec(),
        SafetyValue::Bool(x) => vec![*x as u8],
        SafetyValue::Blob(b) => b.clone(),
    }
}

fn from_bytes(ty: SafetyType, bytes: &[u8]) -> SafetyValue {
    match ty {
        SafetyType::I8 => SafetyValue::I8(bytes[0] as i8),
        SafetyType::I16 => SafetyValue::I16(i16::from_le_bytes([bytes[0], bytes[1]])),
        SafetyType::I32 => SafetyValue::I32(i32::from_le_bytes(bytes[0..4].try_into().unwrap())),
        SafetyType::U8 => SafetyValue::U8(bytes[0]),
        SafetyType::U16 => SafetyValue::U16(u16::from_le_bytes([bytes[0], bytes[1]])),
        SafetyType::U32 => SafetyValue::U32(u32::from_le_bytes(bytes[0..4].try_into().unwrap())),
        SafetyType::F32 => SafetyValue::F32(f32::from_le_bytes(bytes[0..4].try_into().unwrap())),
        SafetyType::F64 => SafetyValue::F64(f64::from_le_bytes(bytes[0..8].try_into().unwrap())),
        SafetyType::Bool => SafetyValue::Bool(bytes[0] != 0),
        SafetyType::Blob => SafetyValue::Blob(bytes.to_vec()),
    }
}

fn default_value(config: &SafetyConfig) -> SafetyValue {
    let d = config.limits.default;
    match config.ty {
        SafetyType::I8 => SafetyValue::I8(d as i8),
        SafetyType::I16 => SafetyValue::I16(d as i16),
        SafetyType::I32 => SafetyValue::I32(d as i32),
        SafetyType::U8 => SafetyValue::U8(d as u8),
        SafetyType::U16 => SafetyValue::U16(d as u16),
        SafetyType::U32 => SafetyValue::U32(d as u32),
        SafetyType::F32 => SafetyValue::F32(d as f32),
        SafetyType::F64 => SafetyValue::F64(d),
        SafetyType::Bool => SafetyValue::Bool(false),
        SafetyType::Blob => SafetyValue::Blob(vec![0u8; config.blob_size]),
    }
}

fn additive_checksum(bytes: &[u8]) -> u32 {
    bytes.iter().fold(0u32, |acc, b| acc.wrapping_add(*b as u32))
}

fn update_protection(datum: &mut Datum, crc: &Crc32) {
    let bytes = to_bytes(&datum.primary);
    match datum.config.protection {
        ProtectionMethod::Redundant => datum.redundant = Some(bytes),
        ProtectionMethod::Inverse => {
            datum.redundant = Some(bytes.iter().map(|b| !b).collect());
        }
        ProtectionMethod::Crc | ProtectionMethod::E2e => {
            datum.checksum = crc.compute(&bytes);
        }
        ProtectionMethod::Checksum => {
            datum.checksum = additive_checksum(&bytes);
        }
    }
}
