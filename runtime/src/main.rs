//! ECU runtime host binary: wires the scheduler, session FSM, E2E
//! protection, safety data store, memory self-test engine, and network
//! dispatch together from a single TOML configuration file.
//!
//! Grounded on `xtask/src/main.rs`'s CLI shape (`clap::Parser` over an
//! options struct, `anyhow::Result` throughout `main`) and the diagnostic
//! ring buffers each component already owns as the sole logging path.

mod config;

use anyhow::{Context, Result};
use clap::Parser;
use config::{Config, TaskKind};
use ecu_e2e::{E2eConfig, E2eProfile, E2eState};
use ecu_memtest::{MemTestConfig, MemoryRegion, MemoryRegionType, MemoryTester};
use ecu_network::{InterfaceConfig, InterfaceType, NetManagerConfig, NetworkManager, AlwaysUp};
use ecu_platform::{ProcessExitResetSink, Watchdog};
use ecu_safety_store::{
    AsilLevel, NumericLimits, ProtectionMethod, SafetyConfig, SafetyStore, SafetyType,
};
use ecu_scheduler::{Scheduler, TaskConfig};
use ecu_session::{SessionConfig, SessionManager};
use ecu_time::{Clock, SystemClock};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Parser)]
#[clap(about = "runs the ECU diagnostic/safety runtime against a TOML configuration")]
struct Args {
    /// Path to the runtime configuration file, in TOML.
    #[clap(long)]
    config: PathBuf,
    /// How long to run before shutting down cleanly. Absent means run until
    /// interrupted is not supported on this host build, so a duration is
    /// required.
    #[clap(long, default_value = "2000")]
    run_ms: u64,
}

fn region_type_from_str(s: &str) -> Result<MemoryRegionType> {
    match s {
        "ram" => Ok(MemoryRegionType::Ram),
        "flash" => Ok(MemoryRegionType::Flash),
        "rom" => Ok(MemoryRegionType::Rom),
        other => anyhow::bail!("unknown memory region type {other:?}"),
    }
}

fn interface_type_from_str(s: &str) -> Result<InterfaceType> {
    match s {
        "ethernet" => Ok(InterfaceType::Ethernet),
        "wifi" => Ok(InterfaceType::Wifi),
        "cellular" => Ok(InterfaceType::Cellular),
        "can" => Ok(InterfaceType::Can),
        other => anyhow::bail!("unknown interface type {other:?}"),
    }
}

fn protection_from_str(s: &str) -> Result<ProtectionMethod> {
    match s {
        "crc" => Ok(ProtectionMethod::Crc),
        "redundant" => Ok(ProtectionMethod::Redundant),
        "inverse" => Ok(ProtectionMethod::Inverse),
        "checksum" => Ok(ProtectionMethod::Checksum),
        "e2e" => Ok(ProtectionMethod::E2e),
        other => anyhow::bail!("unknown protection method {other:?}"),
    }
}

fn build_session_manager(cfg: &config::SessionSection) -> SessionManager {
    SessionManager::new(SessionConfig {
        capacity: cfg.capacity,
        p2_ms: cfg.p2_ms,
        p2_star_ms: cfg.p2_star_ms,
        s3_ms: cfg.s3_ms,
        max_error_count: cfg.max_error_count,
        require_security_access: cfg.require_security_access,
        allow_nested_response: cfg.allow_nested_response,
        auto_session_cleanup: cfg.auto_session_cleanup,
    })
}

fn build_memtest(clock: Arc<dyn Clock>, cfg: &config::MemTestSection) -> Result<MemoryTester> {
    let mut regions = Vec::with_capacity(cfg.regions.len());
    for region in &cfg.regions {
        let region_type = region_type_from_str(&region.region_type)
            .with_context(|| format!("memtest region {:?}", region.name))?;
        let mut built = MemoryRegion::new(
            Box::leak(region.name.clone().into_boxed_str()),
            region_type,
            region.word_count,
        );
        if matches!(region_type, MemoryRegionType::Flash | MemoryRegionType::Rom) {
            let payload: Vec<u32> = (0..region.word_count.saturating_sub(1) as u32).collect();
            built.seed_flash_image(&payload);
        }
        regions.push(built);
    }
    MemoryTester::new(
        clock,
        MemTestConfig {
            test_interval_ms: cfg.test_interval_ms,
            patterns: None,
            error_callback: None,
        },
        regions,
    )
    .map_err(|e| anyhow::anyhow!("memtest configuration rejected: {e}"))
}

fn build_network(clock: Arc<dyn Clock>, cfg: &config::NetworkSection) -> Result<NetworkManager> {
    let manager = NetworkManager::new(
        clock,
        NetManagerConfig {
            rx_buffer_size: cfg.rx_buffer_size,
            tx_buffer_size: cfg.tx_buffer_size,
            heartbeat_interval_ms: cfg.heartbeat_interval_ms,
        },
    );
    for iface in &cfg.interfaces {
        let iface_type = interface_type_from_str(&iface.interface_type)
            .with_context(|| format!("network interface {:?}", iface.name))?;
        manager
            .add_interface(InterfaceConfig {
                name: Box::leak(iface.name.clone().into_boxed_str()),
                iface_type,
                auto_connect: iface.auto_connect,
                reconnect_interval_ms: iface.reconnect_interval_ms,
                driver: Arc::new(AlwaysUp),
            })
            .map_err(|e| anyhow::anyhow!("network interface rejected: {e}"))?;
    }
    Ok(manager)
}

fn build_safety_store(cfg: &config::SafetySection) -> Result<SafetyStore> {
    let store = SafetyStore::new();
    let mut configs = Vec::with_capacity(cfg.datums.len());
    for datum in &cfg.datums {
        let protection = protection_from_str(&datum.protection)
            .with_context(|| format!("safety datum {}", datum.id))?;
        configs.push(SafetyConfig {
            id: datum.id,
            ty: SafetyType::F64,
            protection,
            limits: NumericLimits {
                min: datum.min_value,
                max: datum.max_value,
                default: datum.default_value,
                tolerance: 0.0,
            },
            asil: AsilLevel::C,
            has_redundant: true,
            blob_size: 0,
            callback: None,
        });
    }
    store
        .init(configs)
        .map_err(|e| anyhow::anyhow!("safety store configuration rejected: {e}"))?;
    Ok(store)
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config: Config = config::load(&args.config)?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
    let watchdog = Arc::new(Watchdog::new(
        config.watchdog_timeout_ms,
        Arc::new(ProcessExitResetSink),
    ));
    let scheduler = Scheduler::new(Arc::clone(&clock), Arc::clone(&watchdog));

    let sessions = Arc::new(build_session_manager(&config.session));
    let memtest = Arc::new(
        build_memtest(Arc::clone(&clock), &config.memtest).context("building memory self-test")?,
    );
    let network =
        Arc::new(build_network(Arc::clone(&clock), &config.network).context("building network manager")?);
    let safety = Arc::new(build_safety_store(&config.safety).context("building safety data store")?);

    let e2e_config = Arc::new(
        E2eConfig::new(E2eProfile::Crc32Autosar, 0x1234, 1, 64, 15, 500, true)
            .map_err(|e| anyhow::anyhow!("e2e configuration rejected: {e}"))?,
    );
    let e2e_state = Arc::new(Mutex::new(E2eState::default()));
    let e2e_payload_counter = Arc::new(AtomicU32::new(0));

    let safety_ids: Vec<u32> = config.safety.datums.iter().map(|d| d.id).collect();

    for task in &config.scheduler.tasks {
        let entry: Box<dyn FnMut() + Send + 'static> = match task.kind {
            TaskKind::SessionTimers => {
                let sessions = Arc::clone(&sessions);
                let clock = Arc::clone(&clock);
                Box::new(move || sessions.process_timers(clock.now_ms()))
            }
            TaskKind::MemTest => {
                let memtest = Arc::clone(&memtest);
                Box::new(move || memtest.process())
            }
            TaskKind::Network => {
                let network = Arc::clone(&network);
                Box::new(move || network.process())
            }
            TaskKind::SafetyMonitor => {
                let safety = Arc::clone(&safety);
                let ids = safety_ids.clone();
                Box::new(move || {
                    for id in &ids {
                        let _ = safety.verify(*id);
                    }
                })
            }
            TaskKind::E2eSelfCheck => {
                let cfg = Arc::clone(&e2e_config);
                let state = Arc::clone(&e2e_state);
                let clock = Arc::clone(&clock);
                let counter = Arc::clone(&e2e_payload_counter);
                Box::new(move || {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    let payload = n.to_le_bytes().to_vec();
                    let now = clock.now_ms();
                    let mut state = state.lock().unwrap();
                    if let Ok(frame) = ecu_e2e::protect(&cfg, &mut state, &payload, now) {
                        let _ = ecu_e2e::check(&cfg, &mut state, &frame, now);
                    }
                })
            }
        };
        scheduler
            .create_task(TaskConfig {
                name: task.name.clone(),
                period_us: task.period_us,
                deadline_us: task.deadline_us,
                priority: task.priority,
                entry,
            })
            .with_context(|| format!("registering scheduler task {:?}", task.name))?;
    }

    scheduler.start();
    std::thread::sleep(Duration::from_millis(args.run_ms));
    scheduler.stop();

    for task in &config.scheduler.tasks {
        let stats = scheduler
            .get_task_stats(&task.name)
            .with_context(|| format!("reading stats for task {:?}", task.name))?;
        println!(
            "{:<16} activations={:<8} misses={:<6} avg_us={:<8} max_us={}",
            task.name,
            stats.activation_count,
            stats.deadline_misses,
            stats.execution_time_avg_us,
            stats.execution_time_max_us,
        );
    }
    println!("memtest errors: {}", memtest.get_error_count());
    println!("safety store errors: {}", safety_error_total(&safety, &safety_ids));

    Ok(())
}

fn safety_error_total(store: &SafetyStore, ids: &[u32]) -> u32 {
    ids.iter().map(|id| store.get_error_count(*id)).sum()
}
