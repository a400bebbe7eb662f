//! Background memory self-test engine (`§4.5`): March C, checkerboard,
//! walking-1/0, address-fault, flash-CRC and RAM-pattern tests, cycled
//! across configured regions by a rotating cursor.
//!
//! Grounded on `memory_test.c`'s `Memory_Test_*` family: one test per tick
//! of `process()`, rotating `current_pattern` 0..=6 before advancing
//! `current_region`, with destructive passes gated on `run_background_test`.
//!
//! ## Host test surface
//!
//! The original operates on raw pointers into real flash/RAM. There is no
//! such address space to test from a host process, so each [`MemoryRegion`]
//! owns its backing store as a `Vec<u32>` scratch buffer instead, and the
//! address-fault test writes each word's *index* rather than its address
//! (the property under test — "does every cell hold what was last written
//! to it, independent of its neighbors" — is identical either way).

use ecu_crc::Crc32;
use ecu_error::{ClassifiedError, ErrorKind};
use ecu_time::Clock;
use std::sync::{Arc, Mutex};
use thiserror::Error;

ecu_ringbuf::ringbuf!(MEMTEST_RINGBUF, MemTestLogEvent, 64, MemTestLogEvent::Idle);

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MemTestLogEvent {
    Idle,
    TestFailed { region: u32, kind: MemTestKind },
    TestPassed { region: u32, kind: MemTestKind },
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MemoryRegionType {
    Ram,
    Flash,
    Rom,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MemTestKind {
    MarchC,
    Checkerboard,
    Walking1,
    Walking0,
    AddressFault,
    FlashCrc,
    RamPattern,
}

const ROTATION: [MemTestKind; 7] = [
    MemTestKind::MarchC,
    MemTestKind::Checkerboard,
    MemTestKind::Walking1,
    MemTestKind::Walking0,
    MemTestKind::AddressFault,
    MemTestKind::FlashCrc,
    MemTestKind::RamPattern,
];

#[derive(Debug, Error, Copy, Clone, PartialEq, Eq)]
pub enum MemTestError {
    #[error("write to word {0} did not read back the value just written")]
    FailedWrite(usize),
    #[error("word {0} did not hold the expected value")]
    FailedRead(usize),
    #[error("word {0} did not match the expected pattern")]
    FailedPattern(usize),
    #[error("word {0} did not hold its own index")]
    FailedAddress(usize),
    #[error("computed CRC did not match the region's stored CRC")]
    FailedCrc,
    #[error("test does not apply to this region's memory type")]
    NotApplicable,
    #[error("unknown region index {0}")]
    UnknownRegion(usize),
}

impl ClassifiedError for MemTestError {
    fn kind(&self) -> ErrorKind {
        match self {
            MemTestError::UnknownRegion(_) | MemTestError::NotApplicable => {
                ErrorKind::Configuration
            }
            _ => ErrorKind::Integrity,
        }
    }
}

pub struct MemoryRegion {
    pub name: &'static str,
    pub region_type: MemoryRegionType,
    pub run_background_test: bool,
    storage: Vec<u32>,
}

impl MemoryRegion {
    pub fn new(name: &'static str, region_type: MemoryRegionType, word_count: usize) -> Self {
        MemoryRegion {
            name,
            region_type,
            run_background_test: true,
            storage: vec![0u32; word_count],
        }
    }

    /// Seeds a FLASH/ROM region's content and trailing stored CRC so
    /// [`MemTestKind::FlashCrc`] has something legitimate to check.
    pub fn seed_flash_image(&mut self, payload: &[u32]) {
        assert!(payload.len() + 1 <= self.storage.len());
        self.storage[..payload.len()].copy_from_slice(payload);
        let crc = Crc32::default();
        let crc_val = crc.compute(&words_to_bytes(payload));
        let last = self.storage.len() - 1;
        self.storage[last] = crc_val;
    }
}

fn words_to_bytes(words: &[u32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(words.len() * 4);
    for w in words {
        out.extend_from_slice(&w.to_le_bytes());
    }
    out
}

fn march_c_test(region: &mut MemoryRegion) -> Result<(), MemTestError> {
    for i in 0..region.storage.len() {
        region.storage[i] = 0;
        if region.storage[i] != 0 {
            return Err(MemTestError::FailedWrite(i));
        }
    }
    for i in 0..region.storage.len() {
        if region.storage[i] != 0 {
            return Err(MemTestError::FailedRead(i));
        }
        region.storage[i] = 0xFFFF_FFFF;
        if region.storage[i] != 0xFFFF_FFFF {
            return Err(MemTestError::FailedWrite(i));
        }
    }
    for i in 0..region.storage.len() {
        if region.storage[i] != 0xFFFF_FFFF {
            return Err(MemTestError::FailedRead(i));
        }
        region.storage[i] = 0;
        if region.storage[i] != 0 {
            return Err(MemTestError::FailedWrite(i));
        }
    }
    for (i, word) in region.storage.iter().enumerate() {
        if *word != 0 {
            return Err(MemTestError::FailedRead(i));
        }
    }
    Ok(())
}

fn checkerboard_test(region: &mut MemoryRegion) -> Result<(), MemTestError> {
    let len = region.storage.len();
    let mut i = 0;
    while i + 1 < len {
        region.storage[i] = 0x5555_5555;
        region.storage[i + 1] = 0xAAAA_AAAA;
        i += 2;
    }
    let mut i = 0;
    while i + 1 < len {
        if region.storage[i] != 0x5555_5555 || region.storage[i + 1] != 0xAAAA_AAAA {
            return Err(MemTestError::FailedPattern(i));
        }
        i += 2;
    }
    let mut i = 0;
    while i + 1 < len {
        region.storage[i] = 0xAAAA_AAAA;
        region.storage[i + 1] = 0x5555_5555;
        i += 2;
    }
    let mut i = 0;
    while i + 1 < len {
        if region.storage[i] != 0xAAAA_AAAA || region.storage[i + 1] != 0x5555_5555 {
            return Err(MemTestError::FailedPattern(i));
        }
        i += 2;
    }
    Ok(())
}

fn walking_1_test(region: &mut MemoryRegion) -> Result<(), MemTestError> {
    let mut pattern: u32 = 1;
    for _ in 0..32 {
        for word in region.storage.iter_mut() {
            *word = pattern;
        }
        for (i, word) in region.storage.iter().enumerate() {
            if *word != pattern {
                return Err(MemTestError::FailedRead(i));
            }
        }
        pattern = pattern.wrapping_shl(1);
    }
    Ok(())
}

fn walking_0_test(region: &mut MemoryRegion) -> Result<(), MemTestError> {
    let mut pattern: u32 = 0xFFFF_FFFE;
    for bit in 0..32u32 {
        for word in region.storage.iter_mut() {
            *word = pattern;
        }
        for (i, word) in region.storage.iter().enumerate() {
            if *word != pattern {
                return Err(MemTestError::FailedRead(i));
            }
        }
        pattern = !(1u32 << bit);
    }
    Ok(())
}

fn address_fault_test(region: &mut MemoryRegion) -> Result<(), MemTestError> {
    for (i, word) in region.storage.iter_mut().enumerate() {
        *word = i as u32;
    }
    for (i, word) in region.storage.iter().enumerate() {
        if *word != i as u32 {
            return Err(MemTestError::FailedAddress(i));
        }
    }
    Ok(())
}

fn flash_crc_test(region: &MemoryRegion, crc: &Crc32) -> Result<(), MemTestError> {
    if region.region_type != MemoryRegionType::Flash && region.region_type != MemoryRegionType::Rom {
        return Err(MemTestError::NotApplicable);
    }
    let len = region.storage.len();
    if len == 0 {
        return Err(MemTestError::FailedCrc);
    }
    let payload = &region.storage[..len - 1];
    let computed = crc.compute(&words_to_bytes(payload));
    let stored = region.storage[len - 1];
    if computed == stored {
        Ok(())
    } else {
        Err(MemTestError::FailedCrc)
    }
}

fn ram_pattern_test(region: &mut MemoryRegion, patterns: &[u32]) -> Result<(), MemTestError> {
    if region.region_type != MemoryRegionType::Ram {
        return Err(MemTestError::NotApplicable);
    }
    for &pattern in patterns {
        for word in region.storage.iter_mut() {
            *word = pattern;
        }
        for (i, word) in region.storage.iter().enumerate() {
            if *word != pattern {
                return Err(MemTestError::FailedPattern(i));
            }
        }
    }
    Ok(())
}

const DEFAULT_PATTERNS: [u32; 8] = [
    0x0000_0000,
    0xFFFF_FFFF,
    0x5555_5555,
    0xAAAA_AAAA,
    0x3333_3333,
    0xCCCC_CCCC,
    0x0F0F_0F0F,
    0xF0F0_F0F0,
];

type ErrorCallback = dyn Fn(MemTestKind, MemTestError, usize) + Send + Sync;

pub struct MemTestConfig {
    pub test_interval_ms: u64,
    pub patterns: Option<Vec<u32>>,
    pub error_callback: Option<Arc<ErrorCallback>>,
}

struct MutableState {
    regions: Vec<MemoryRegion>,
    current_region: usize,
    current_pattern: usize,
    total_errors: u32,
    last_results: Vec<Option<MemTestError>>,
    next_tick_ms: u64,
}

/// Rotates a single test across a single region on every elapsed interval,
/// so no one tick costs more than one region's worth of memory traffic
/// (`§4.5`: background self-test must not starve higher-priority tasks).
pub struct MemoryTester {
    clock: Arc<dyn Clock>,
    crc: Crc32,
    config: MemTestConfig,
    state: Mutex<MutableState>,
}

impl MemoryTester {
    pub fn new(
        clock: Arc<dyn Clock>,
        config: MemTestConfig,
        regions: Vec<MemoryRegion>,
    ) -> Result<Self, MemTestError> {
        if regions.is_empty() {
            return Err(MemTestError::UnknownRegion(0));
        }
        let now = clock.now_ms();
        let count = regions.len();
        let next_tick_ms = now + config.test_interval_ms;
        Ok(MemoryTester {
            clock,
            crc: Crc32::default(),
            config,
            state: Mutex::new(MutableState {
                regions,
                current_region: 0,
                current_pattern: 0,
                total_errors: 0,
                last_results: vec![None; count],
                next_tick_ms,
            }),
        })
    }

    fn patterns(&self) -> Vec<u32> {
        self.config
            .patterns
            .clone()
            .unwrap_or_else(|| DEFAULT_PATTERNS.to_vec())
    }

    fn dispatch(
        &self,
        kind: MemTestKind,
        region: &mut MemoryRegion,
    ) -> Result<(), MemTestError> {
        match kind {
            MemTestKind::MarchC => march_c_test(region),
            MemTestKind::Checkerboard => checkerboard_test(region),
            MemTestKind::Walking1 => walking_1_test(region),
            MemTestKind::Walking0 => walking_0_test(region),
            MemTestKind::AddressFault => address_fault_test(region),
            MemTestKind::FlashCrc => flash_crc_test(region, &self.crc),
            MemTestKind::RamPattern => ram_pattern_test(region, &self.patterns()),
        }
    }

    /// Runs one step of the rotation if `test_interval_ms` has elapsed.
    /// A region with `run_background_test == false` is skipped but the
    /// cursor still advances, matching the original's unconditional
    /// rotation regardless of whether a test actually ran.
    pub fn process(&self) {
        let now = self.clock.now_ms();
        let mut state = self.state.lock().unwrap();
        if now < state.next_tick_ms {
            return;
        }

        let region_idx = state.current_region;
        let kind = ROTATION[state.current_pattern];
        if state.regions[region_idx].run_background_test {
            let region_type = state.regions[region_idx].region_type;
            // Destructive kinds only ever run against RAM in background
            // rotation; FlashCrc is the only admissible test for FLASH/ROM.
            let applicable = match kind {
                MemTestKind::FlashCrc => {
                    matches!(region_type, MemoryRegionType::Flash | MemoryRegionType::Rom)
                }
                MemTestKind::RamPattern
                | MemTestKind::MarchC
                | MemTestKind::Checkerboard
                | MemTestKind::Walking1
                | MemTestKind::Walking0
                | MemTestKind::AddressFault => region_type == MemoryRegionType::Ram,
            };

            if applicable {
                let result = {
                    let region = &mut state.regions[region_idx];
                    self.dispatch(kind, region)
                };
                if let Err(err) = result {
                    state.total_errors += 1;
                    state.last_results[region_idx] = Some(err);
                    if let Some(cb) = &self.config.error_callback {
                        cb(kind, err, region_idx);
                    }
                    ecu_ringbuf::ringbuf_entry!(
                        MEMTEST_RINGBUF,
                        MemTestLogEvent::TestFailed {
                            region: region_idx as u32,
                            kind
                        }
                    );
                } else {
                    state.last_results[region_idx] = None;
                    ecu_ringbuf::ringbuf_entry!(
                        MEMTEST_RINGBUF,
                        MemTestLogEvent::TestPassed {
                            region: region_idx as u32,
                            kind
                        }
                    );
                }
            }
        }

        state.current_pattern += 1;
        if state.current_pattern >= ROTATION.len() {
            state.current_pattern = 0;
            state.current_region += 1;
            if state.current_region >= state.regions.len() {
                state.current_region = 0;
            }
        }
        state.next_tick_ms = now + self.config.test_interval_ms;
    }

    /// Runs a single named test against a single region immediately,
    /// bypassing the rotation cursor.
    pub fn run_test(&self, kind: MemTestKind, region_index: usize) -> Result<(), MemTestError> {
        let mut state = self.state.lock().unwrap();
        if region_index >= state.regions.len() {
            return Err(MemTestError::UnknownRegion(region_index));
        }
        let patterns = self.patterns();
        let result = {
            let region = &mut state.regions[region_index];
            match kind {
                MemTestKind::RamPattern => ram_pattern_test(region, &patterns),
                MemTestKind::FlashCrc => flash_crc_test(region, &self.crc),
                other => self.dispatch(other, region),
            }
        };
        if let Err(err) = result {
            state.total_errors += 1;
            state.last_results[region_index] = Some(err);
            if let Some(cb) = &self.config.error_callback {
                cb(kind, err, region_index);
            }
        } else {
            state.last_results[region_index] = None;
        }
        result
    }

    /// Runs every test applicable to the region's type back-to-back,
    /// short-circuiting on the first failure (`Memory_Test_VerifyRegion`).
    pub fn verify_region(&self, region_index: usize) -> Result<(), MemTestError> {
        let mut state = self.state.lock().unwrap();
        if region_index >= state.regions.len() {
            return Err(MemTestError::UnknownRegion(region_index));
        }
        let region_type = state.regions[region_index].region_type;
        let region = &mut state.regions[region_index];

        march_c_test(region)?;
        checkerboard_test(region)?;
        walking_1_test(region)?;
        walking_0_test(region)?;
        address_fault_test(region)?;
        if region_type == MemoryRegionType::Flash || region_type == MemoryRegionType::Rom {
            flash_crc_test(region, &self.crc)?;
        }
        if region_type == MemoryRegionType::Ram {
            let patterns = self.patterns();
            ram_pattern_test(region, &patterns)?;
        }
        Ok(())
    }

    pub fn is_region_healthy(&self, region_index: usize) -> bool {
        self.state
            .lock()
            .unwrap()
            .last_results
            .get(region_index)
            .map(|r| r.is_none())
            .unwrap_or(false)
    }

    pub fn get_error_count(&self) -> u32 {
        self.state.lock().unwrap().total_errors
    }

    pub fn reset_error_count(&self) {
        let mut state = self.state.lock().unwrap();
        state.total_errors = 0;
        state.last_results.iter_mut().for_each(|r| *r = None);
    }

    pub fn get_status(&self) -> Vec<Option<MemTestError>> {
        self.state.lock().unwrap().last_results.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ecu_time::FakeClock;

    fn tester_with_region(region_type: MemoryRegionType, words: usize) -> MemoryTester {
        let clock: Arc<dyn Clock> = Arc::new(FakeClock::new());
        let region = MemoryRegion::new("scratch", region_type, words);
        MemoryTester::new(
            clock,
            MemTestConfig {
                test_interval_ms: 10,
                patterns: None,
                error_callback: None,
            },
            vec![region],
        )
        .unwrap()
    }

    #[test]
    fn march_c_passes_on_clean_region() {
        let tester = tester_with_region(MemoryRegionType::Ram, 64);
        assert!(tester.run_test(MemTestKind::MarchC, 0).is_ok());
    }

    #[test]
    fn checkerboard_and_walking_patterns_pass() {
        let tester = tester_with_region(MemoryRegionType::Ram, 64);
        assert!(tester.run_test(MemTestKind::Checkerboard, 0).is_ok());
        assert!(tester.run_test(MemTestKind::Walking1, 0).is_ok());
        assert!(tester.run_test(MemTestKind::Walking0, 0).is_ok());
        assert!(tester.run_test(MemTestKind::AddressFault, 0).is_ok());
    }

    #[test]
    fn ram_pattern_test_rejected_on_flash_region() {
        let tester = tester_with_region(MemoryRegionType::Flash, 64);
        let err = tester.run_test(MemTestKind::RamPattern, 0).unwrap_err();
        assert_eq!(err, MemTestError::NotApplicable);
    }

    #[test]
    fn flash_crc_passes_for_seeded_image_and_fails_after_corruption() {
        let clock: Arc<dyn Clock> = Arc::new(FakeClock::new());
        let mut region = MemoryRegion::new("flash0", MemoryRegionType::Flash, 17);
        let payload: Vec<u32> = (0..16).collect();
        region.seed_flash_image(&payload);
        let tester = MemoryTester::new(
            clock,
            MemTestConfig {
                test_interval_ms: 10,
                patterns: None,
                error_callback: None,
            },
            vec![region],
        )
        .unwrap();
        assert!(tester.run_test(MemTestKind::FlashCrc, 0).is_ok());

        {
            let mut state = tester.state.lock().unwrap();
            state.regions[0].storage[0] ^= 1;
        }
        let err = tester.run_test(MemTestKind::FlashCrc, 0).unwrap_err();
        assert_eq!(err, MemTestError::FailedCrc);
    }

    #[test]
    fn unknown_region_rejected() {
        let tester = tester_with_region(MemoryRegionType::Ram, 8);
        assert_eq!(
            tester.run_test(MemTestKind::MarchC, 9).unwrap_err(),
            MemTestError::UnknownRegion(9)
        );
    }

    #[test]
    fn verify_region_runs_full_applicable_suite() {
        let clock: Arc<dyn Clock> = Arc::new(FakeClock::new());
        let mut region = MemoryRegion::new("flash0", MemoryRegionType::Flash, 9);
        let payload: Vec<u32> = (0..8).collect();
        region.seed_flash_image(&payload);
        let tester = MemoryTester::new(
            clock,
            MemTestConfig {
                test_interval_ms: 10,
                patterns: None,
                error_callback: None,
            },
            vec![region],
        )
        .unwrap();
        assert!(tester.verify_region(0).is_ok());
    }

    #[test]
    fn process_rotates_through_patterns_and_regions() {
        let clock = Arc::new(FakeClock::new());
        let clock_dyn: Arc<dyn Clock> = clock.clone();
        let region_a = MemoryRegion::new("a", MemoryRegionType::Ram, 16);
        let region_b = MemoryRegion::new("b", MemoryRegionType::Ram, 16);
        let tester = MemoryTester::new(
            clock_dyn,
            MemTestConfig {
                test_interval_ms: 5,
                patterns: None,
                error_callback: None,
            },
            vec![region_a, region_b],
        )
        .unwrap();

        for _ in 0..(ROTATION.len() * 2 + 1) {
            tester.process();
            clock.advance_ms(5);
        }
        assert_eq!(tester.get_error_count(), 0);
    }

    #[test]
    fn background_test_disabled_region_is_skipped_but_cursor_still_advances() {
        let clock = Arc::new(FakeClock::new());
        let clock_dyn: Arc<dyn Clock> = clock.clone();
        let mut region = MemoryRegion::new("a", MemoryRegionType::Ram, 16);
        region.run_background_test = false;
        let tester = MemoryTester::new(
            clock_dyn,
            MemTestConfig {
                test_interval_ms: 5,
                patterns: None,
                error_callback: None,
            },
            vec![region],
        )
        .unwrap();
        tester.process();
        clock.advance_ms(5);
        tester.process();
        assert_eq!(tester.get_error_count(), 0);
        assert!(tester.is_region_healthy(0));
    }
}
