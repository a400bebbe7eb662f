//! Table-driven CRC-8/16/32/64 with configurable polynomial, initial value,
//! and final XOR (`§2`, `§4.3`).
//!
//! Each width owns a 256-entry lookup table, built once at construction and
//! rebuilt only through [`Crc8::reconfigure`] and friends. Tables are
//! process-wide in the original source; here each E2E stream or safety datum
//! that needs one owns its own value (`§9`: "the CRC library becomes a value
//! owned by each E2E state... no process-wide mutable statics").

use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CrcError {
    #[error("profile is not implemented by this build")]
    NotImplemented,
}

impl ecu_error::ClassifiedError for CrcError {
    fn kind(&self) -> ecu_error::ErrorKind {
        match self {
            CrcError::NotImplemented => ecu_error::ErrorKind::Configuration,
        }
    }
}

/// Parameters shared by every width: the generator polynomial (in its
/// normal, non-reflected form), the initial register value, and the final
/// XOR mask.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CrcParams {
    pub poly: u64,
    pub init: u64,
    pub xor_out: u64,
}

fn build_table(params: CrcParams, width: u32) -> [u64; 256] {
    let top_bit: u64 = 1 << (width - 1);
    let mask: u64 = if width == 64 {
        u64::MAX
    } else {
        (1u64 << width) - 1
    };
    let poly = params.poly & mask;
    let mut table = [0u64; 256];
    for (i, slot) in table.iter_mut().enumerate() {
        let mut c = (i as u64) << (width - 8);
        for _ in 0..8 {
            c = if c & top_bit != 0 {
                ((c << 1) ^ poly) & mask
            } else {
                (c << 1) & mask
            };
        }
        *slot = c;
    }
    table
}

fn update(table: &[u64; 256], mut crc: u64, data: &[u8], width: u32, mask: u64) -> u64 {
    let top_shift = width - 8;
    for &byte in data {
        let index = (((crc >> top_shift) as u8) ^ byte) as usize;
        crc = ((crc << 8) ^ table[index]) & mask;
    }
    crc
}

macro_rules! crc_width {
    ($name:ident, $out:ty, $width:expr, $doc:expr) => {
        #[doc = $doc]
        pub struct $name {
            params: CrcParams,
            table: [u64; 256],
        }

        impl $name {
            const WIDTH: u32 = $width;
            const MASK: u64 = if $width == 64 {
                u64::MAX
            } else {
                (1u64 << $width) - 1
            };

            pub fn new(params: CrcParams) -> Self {
                let table = build_table(params, Self::WIDTH);
                $name { params, table }
            }

            pub fn params(&self) -> CrcParams {
                self.params
            }

            /// Rebuilds the table for a (possibly different) polynomial.
            /// Rebuilding with the same parameters produces a byte-identical
            /// table (`§8` round-trip law).
            pub fn reconfigure(&mut self, params: CrcParams) {
                self.table = build_table(params, Self::WIDTH);
                self.params = params;
            }

            pub fn table(&self) -> &[u64; 256] {
                &self.table
            }

            pub fn compute(&self, data: &[u8]) -> $out {
                let crc = update(
                    &self.table,
                    self.params.init & Self::MASK,
                    data,
                    Self::WIDTH,
                    Self::MASK,
                );
                ((crc ^ self.params.xor_out) & Self::MASK) as $out
            }
        }
    };
}

crc_width!(Crc8, u8, 8, "CRC-8, SAE-J1850 profile (`poly=0x07` by default).");
crc_width!(Crc16, u16, 16, "CRC-16/CCITT (`poly=0x1021` by default).");
crc_width!(Crc32, u32, 32, "CRC-32/AUTOSAR (`poly=0x04C11DB7` by default).");
crc_width!(Crc64, u64, 64, "CRC-64/ISO, available to the library but not wired into any E2E profile (see `CrcError::NotImplemented`).");

impl Default for Crc8 {
    fn default() -> Self {
        Crc8::new(CrcParams {
            poly: 0x07,
            init: 0x00,
            xor_out: 0x00,
        })
    }
}

impl Default for Crc16 {
    fn default() -> Self {
        Crc16::new(CrcParams {
            poly: 0x1021,
            init: 0xFFFF,
            xor_out: 0x0000,
        })
    }
}

impl Default for Crc32 {
    fn default() -> Self {
        Crc32::new(CrcParams {
            poly: 0x04C1_1DB7,
            init: 0xFFFF_FFFF,
            xor_out: 0xFFFF_FFFF,
        })
    }
}

/// Thread-safe wrapper for a CRC table that may be reconfigured at runtime.
/// Reconfiguration is only permitted while no `compute` call is in flight,
/// enforced by the mutex the same way every other long-lived table in this
/// workspace is guarded (`§4.3`, `§5`).
pub struct CrcTable<T> {
    inner: Mutex<T>,
}

impl<T> CrcTable<T> {
    pub fn new(value: T) -> Self {
        CrcTable {
            inner: Mutex::new(value),
        }
    }

    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.inner.lock().unwrap())
    }

    pub fn reconfigure_with(&self, f: impl FnOnce(&mut T)) {
        f(&mut self.inner.lock().unwrap());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn crc16_ccitt_false_matches_published_vector() {
        // CRC-16/CCITT-FALSE check value for ASCII "123456789" is 0x29B1.
        let crc = Crc16::default();
        assert_eq!(crc.compute(b"123456789"), 0x29B1);
    }

    #[test]
    fn crc32_is_sensitive_to_every_byte() {
        let crc = Crc32::default();
        let a = crc.compute(b"123456789");
        let b = crc.compute(b"123456788");
        assert_ne!(a, b);
        assert_eq!(a, crc.compute(b"123456789"));
    }

    #[test]
    fn reconfigure_with_same_params_is_identity() {
        let mut crc = Crc32::default();
        let before = *crc.table();
        crc.reconfigure(crc.params());
        assert_eq!(before, *crc.table());
    }

    proptest! {
        #[test]
        fn compute_is_deterministic(data in proptest::collection::vec(any::<u8>(), 0..256)) {
            let crc = Crc32::default();
            prop_assert_eq!(crc.compute(&data), crc.compute(&data));
        }

        #[test]
        fn crc8_table_rebuild_is_byte_identical(poly in any::<u8>()) {
            let params = CrcParams { poly: poly as u64, init: 0, xor_out: 0 };
            let mut crc = Crc8::new(params);
            let before = *crc.table();
            crc.reconfigure(params);
            prop_assert_eq!(before, *crc.table());
        }
    }
}
