//! TOML configuration schema for the runtime binary.
//!
//! Grounded on `xtask/src/config.rs`'s `RawConfig`: a single deserialized
//! struct, `kebab-case` field names, `deny_unknown_fields` so a typo in an
//! operator's config file is caught at load time rather than silently
//! ignored.

use serde::Deserialize;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Config {
    pub watchdog_timeout_ms: u64,
    pub scheduler: SchedulerSection,
    pub session: SessionSection,
    pub memtest: MemTestSection,
    pub network: NetworkSection,
    pub safety: SafetySection,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct SchedulerSection {
    pub tasks: Vec<TaskSpec>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct TaskSpec {
    pub name: String,
    pub period_us: u64,
    pub deadline_us: u64,
    pub priority: u8,
    pub kind: TaskKind,
}

#[derive(Debug, Copy, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskKind {
    SessionTimers,
    MemTest,
    Network,
    SafetyMonitor,
    E2eSelfCheck,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct SessionSection {
    pub capacity: usize,
    pub p2_ms: u64,
    pub p2_star_ms: u64,
    pub s3_ms: u64,
    pub max_error_count: u32,
    pub require_security_access: bool,
    pub allow_nested_response: bool,
    pub auto_session_cleanup: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct MemTestSection {
    pub test_interval_ms: u64,
    pub regions: Vec<MemRegionSpec>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct MemRegionSpec {
    pub name: String,
    pub region_type: String,
    pub word_count: usize,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct NetworkSection {
    pub rx_buffer_size: usize,
    pub tx_buffer_size: usize,
    pub heartbeat_interval_ms: u64,
    pub interfaces: Vec<InterfaceSpec>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct InterfaceSpec {
    pub name: String,
    pub interface_type: String,
    pub auto_connect: bool,
    pub reconnect_interval_ms: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct SafetySection {
    pub datums: Vec<SafetyDatumSpec>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct SafetyDatumSpec {
    pub id: u32,
    pub protection: String,
    pub min_value: f64,
    pub max_value: f64,
    pub default_value: f64,
}

pub fn load(path: &std::path::Path) -> anyhow::Result<Config> {
    use anyhow::Context;
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("parsing config file {}", path.display()))
}
