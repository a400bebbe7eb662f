//! Network interface table and dispatch (`§4.6`): per-interface connection
//! state and statistics, a protocol-to-interface compatibility matrix, and a
//! periodic `process()` driving heartbeats, auto-reconnect, and RX dispatch.
//!
//! Grounded on `net_core.c`'s `Net_*` family: a fixed interface table behind
//! one lock, event callbacks fired by category, and `Net_Process` walking
//! the table once per tick to send heartbeats and retry disconnected
//! auto-connect interfaces. Per-medium connect/disconnect hooks
//! (`NetInterface_ConnectEthernet` and siblings) become the [`InterfaceDriver`]
//! trait, so the manager never depends on concrete transport code.

use ecu_error::{ClassifiedError, ErrorKind};
use ecu_netbuf::NetBuffer;
use ecu_time::Clock;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;

ecu_ringbuf::ringbuf!(NET_RINGBUF, NetLogEvent, 64, NetLogEvent::Idle);

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum NetLogEvent {
    Idle,
    Connected { interface: InterfaceType },
    Disconnected { interface: InterfaceType },
    ConnectFailed { interface: InterfaceType },
    SendFailed { interface: InterfaceType },
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum InterfaceType {
    Ethernet,
    Wifi,
    Cellular,
    Can,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
    Can,
    Mqtt,
}

/// `§4.6`'s protocol-compatibility matrix: TCP/UDP ride Ethernet or WiFi,
/// CAN frames only ride the CAN interface, MQTT is cellular-only.
pub fn protocol_compatible(protocol: Protocol, iface: InterfaceType) -> bool {
    match protocol {
        Protocol::Tcp | Protocol::Udp => {
            matches!(iface, InterfaceType::Ethernet | InterfaceType::Wifi)
        }
        Protocol::Can => iface == InterfaceType::Can,
        Protocol::Mqtt => iface == InterfaceType::Cellular,
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
    Error,
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct InterfaceStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub successful_connections: u32,
    pub disconnections: u32,
    pub errors: u32,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum NetEvent {
    Connected(InterfaceType),
    Disconnected(InterfaceType),
    DataSent { interface: InterfaceType, length: usize },
    DataReceived { interface: InterfaceType, length: usize },
    Error(InterfaceType),
}

/// Medium-specific connect/disconnect hook, standing in for
/// `NetInterface_Connect{Ethernet,WiFi,Cellular,CAN}` and their disconnect
/// counterparts. A host test supplies a driver that always succeeds, always
/// fails, or fails after N attempts.
pub trait InterfaceDriver: Send + Sync {
    fn connect(&self) -> bool;
    fn disconnect(&self) -> bool;
}

pub struct AlwaysUp;
impl InterfaceDriver for AlwaysUp {
    fn connect(&self) -> bool {
        true
    }
    fn disconnect(&self) -> bool {
        true
    }
}

pub struct InterfaceConfig {
    pub name: &'static str,
    pub iface_type: InterfaceType,
    pub auto_connect: bool,
    pub reconnect_interval_ms: u64,
    pub driver: Arc<dyn InterfaceDriver>,
}

struct Interface {
    config: InterfaceConfig,
    state: ConnectionState,
    stats: InterfaceStats,
    last_heartbeat_ms: u64,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NetworkError {
    #[error("no free interface slot")]
    NoFreeSlot,
    #[error("no interface of type {0:?} is registered")]
    UnknownInterface(InterfaceType),
    #[error("protocol {protocol:?} cannot be carried by interface {iface:?}")]
    ProtocolIncompatible {
        protocol: Protocol,
        iface: InterfaceType,
    },
    #[error("no connected interface can carry protocol {0:?}")]
    NoRoute(Protocol),
    #[error("transport-level send failed")]
    SendFailed,
    #[error("tx buffer rejected the message")]
    BufferFull,
}

impl ClassifiedError for NetworkError {
    fn kind(&self) -> ErrorKind {
        match self {
            NetworkError::NoFreeSlot
            | NetworkError::UnknownInterface(_)
            | NetworkError::ProtocolIncompatible { .. } => ErrorKind::Configuration,
            NetworkError::NoRoute(_) | NetworkError::SendFailed | NetworkError::BufferFull => {
                ErrorKind::Transient
            }
        }
    }
}

pub struct Message {
    pub id: u32,
    pub protocol: Protocol,
    pub data: Vec<u8>,
}

pub struct NetManagerConfig {
    pub rx_buffer_size: usize,
    pub tx_buffer_size: usize,
    pub heartbeat_interval_ms: u64,
}

type EventCallback = dyn Fn(NetEvent) + Send + Sync;

struct ManagerState {
    interfaces: Vec<Interface>,
    rx_buffer: NetBuffer,
    tx_buffer: NetBuffer,
    callbacks: Vec<Arc<EventCallback>>,
}

/// Owns the interface table and TX/RX ring buffers behind a single lock,
/// mirroring the original's single `enter_critical`/`exit_critical` pair
/// wrapping each operation (`§5`).
pub struct NetworkManager {
    clock: Arc<dyn Clock>,
    config: NetManagerConfig,
    state: Mutex<ManagerState>,
}

impl NetworkManager {
    pub fn new(clock: Arc<dyn Clock>, config: NetManagerConfig) -> Self {
        let rx_buffer = NetBuffer::new(config.rx_buffer_size);
        let tx_buffer = NetBuffer::new(config.tx_buffer_size);
        NetworkManager {
            clock,
            config,
            state: Mutex::new(ManagerState {
                interfaces: Vec::new(),
                rx_buffer,
                tx_buffer,
                callbacks: Vec::new(),
            }),
        }
    }

    pub fn register_callback(&self, callback: Arc<EventCallback>) {
        self.state.lock().unwrap().callbacks.push(callback);
    }

    fn fire(&self, state: &ManagerState, event: NetEvent) {
        for cb in &state.callbacks {
            cb(event);
        }
    }

    pub fn add_interface(&self, config: InterfaceConfig) -> Result<(), NetworkError> {
        let mut state = self.state.lock().unwrap();
        if state.interfaces.iter().any(|i| i.config.iface_type == config.iface_type) {
            return Err(NetworkError::NoFreeSlot);
        }
        state.interfaces.push(Interface {
            config,
            state: ConnectionState::Disconnected,
            stats: InterfaceStats::default(),
            last_heartbeat_ms: self.clock.now_ms(),
        });
        Ok(())
    }

    pub fn remove_interface(&self, iface: InterfaceType) -> Result<(), NetworkError> {
        let mut state = self.state.lock().unwrap();
        let idx = state
            .interfaces
            .iter()
            .position(|i| i.config.iface_type == iface)
            .ok_or(NetworkError::UnknownInterface(iface))?;
        if state.interfaces[idx].state == ConnectionState::Connected {
            state.interfaces[idx].config.driver.disconnect();
        }
        state.interfaces.remove(idx);
        Ok(())
    }

    pub fn connect(&self, iface: InterfaceType) -> Result<(), NetworkError> {
        let mut state = self.state.lock().unwrap();
        let now = self.clock.now_ms();
        let idx = state
            .interfaces
            .iter()
            .position(|i| i.config.iface_type == iface)
            .ok_or(NetworkError::UnknownInterface(iface))?;
        if state.interfaces[idx].state == ConnectionState::Connected {
            return Ok(());
        }
        let ok = state.interfaces[idx].config.driver.connect();
        if ok {
            state.interfaces[idx].state = ConnectionState::Connected;
            state.interfaces[idx].stats.successful_connections += 1;
            state.interfaces[idx].last_heartbeat_ms = now;
            self.fire(&state, NetEvent::Connected(iface));
            ecu_ringbuf::ringbuf_entry!(NET_RINGBUF, NetLogEvent::Connected { interface: iface });
            Ok(())
        } else {
            state.interfaces[idx].state = ConnectionState::Error;
            state.interfaces[idx].stats.errors += 1;
            ecu_ringbuf::ringbuf_entry!(
                NET_RINGBUF,
                NetLogEvent::ConnectFailed { interface: iface }
            );
            Err(NetworkError::SendFailed)
        }
    }

    pub fn disconnect(&self, iface: InterfaceType) -> Result<(), NetworkError> {
        let mut state = self.state.lock().unwrap();
        let idx = state
            .interfaces
            .iter()
            .position(|i| i.config.iface_type == iface)
            .ok_or(NetworkError::UnknownInterface(iface))?;
        if state.interfaces[idx].state != ConnectionState::Connected {
            return Ok(());
        }
        let ok = state.interfaces[idx].config.driver.disconnect();
        if ok {
            state.interfaces[idx].state = ConnectionState::Disconnected;
            state.interfaces[idx].stats.disconnections += 1;
            self.fire(&state, NetEvent::Disconnected(iface));
            ecu_ringbuf::ringbuf_entry!(
                NET_RINGBUF,
                NetLogEvent::Disconnected { interface: iface }
            );
            Ok(())
        } else {
            state.interfaces[idx].state = ConnectionState::Error;
            state.interfaces[idx].stats.errors += 1;
            Err(NetworkError::SendFailed)
        }
    }

    /// Routes `message` to the first connected interface compatible with its
    /// protocol, buffers it on the TX ring, then hands it to the transport.
    pub fn send_message(&self, message: &Message) -> Result<(), NetworkError> {
        let mut state = self.state.lock().unwrap();
        let idx = state
            .interfaces
            .iter()
            .position(|i| {
                i.state == ConnectionState::Connected
                    && protocol_compatible(message.protocol, i.config.iface_type)
            })
            .ok_or(NetworkError::NoRoute(message.protocol))?;

        state
            .tx_buffer
            .write(&message.data)
            .map_err(|_| NetworkError::BufferFull)?;

        let iface = state.interfaces[idx].config.iface_type;
        state.interfaces[idx].stats.bytes_sent += message.data.len() as u64;
        state.interfaces[idx].stats.packets_sent += 1;
        self.fire(
            &state,
            NetEvent::DataSent {
                interface: iface,
                length: message.data.len(),
            },
        );
        Ok(())
    }

    /// Delivers bytes arriving on `iface`'s medium into the shared RX ring
    /// and fires `DataReceived`.
    pub fn receive_bytes(&self, iface: InterfaceType, data: &[u8]) -> Result<(), NetworkError> {
        let mut state = self.state.lock().unwrap();
        state
            .rx_buffer
            .write(data)
            .map_err(|_| NetworkError::BufferFull)?;
        let idx = state
            .interfaces
            .iter()
            .position(|i| i.config.iface_type == iface)
            .ok_or(NetworkError::UnknownInterface(iface))?;
        state.interfaces[idx].stats.bytes_received += data.len() as u64;
        state.interfaces[idx].stats.packets_received += 1;
        self.fire(
            &state,
            NetEvent::DataReceived {
                interface: iface,
                length: data.len(),
            },
        );
        Ok(())
    }

    /// Drains up to `max_len` bytes buffered on the RX ring.
    pub fn drain_received(&self, max_len: usize) -> Vec<u8> {
        let mut state = self.state.lock().unwrap();
        let n = state.rx_buffer.count().min(max_len);
        let mut out = vec![0u8; n];
        let _ = state.rx_buffer.read(&mut out);
        out
    }

    pub fn get_state(&self, iface: InterfaceType) -> ConnectionState {
        self.state
            .lock()
            .unwrap()
            .interfaces
            .iter()
            .find(|i| i.config.iface_type == iface)
            .map(|i| i.state)
            .unwrap_or(ConnectionState::Error)
    }

    pub fn get_statistics(&self, iface: InterfaceType) -> Option<InterfaceStats> {
        self.state
            .lock()
            .unwrap()
            .interfaces
            .iter()
            .find(|i| i.config.iface_type == iface)
            .map(|i| i.stats)
    }

    /// One tick: send heartbeats on connected interfaces whose interval has
    /// elapsed, and retry auto-connect on disconnected interfaces whose
    /// reconnect interval has elapsed.
    pub fn process(&self) {
        let now = self.clock.now_ms();
        let to_reconnect: Vec<InterfaceType>;
        let to_heartbeat: Vec<InterfaceType>;
        {
            let mut state = self.state.lock().unwrap();
            let heartbeat_interval = self.config.heartbeat_interval_ms;
            to_heartbeat = state
                .interfaces
                .iter()
                .filter(|i| {
                    i.state == ConnectionState::Connected
                        && heartbeat_interval > 0
                        && now.saturating_sub(i.last_heartbeat_ms) >= heartbeat_interval
                })
                .map(|i| i.config.iface_type)
                .collect();
            for iface in &to_heartbeat {
                if let Some(i) = state
                    .interfaces
                    .iter_mut()
                    .find(|i| i.config.iface_type == *iface)
                {
                    i.last_heartbeat_ms = now;
                }
            }

            to_reconnect = state
                .interfaces
                .iter()
                .filter(|i| {
                    i.state == ConnectionState::Disconnected
                        && i.config.auto_connect
                        && now.saturating_sub(i.last_heartbeat_ms) >= i.config.reconnect_interval_ms
                })
                .map(|i| i.config.iface_type)
                .collect();
        }

        for iface in to_heartbeat {
            let protocol = if iface == InterfaceType::Can {
                Protocol::Can
            } else {
                Protocol::Tcp
            };
            let _ = self.send_message(&Message {
                id: 0,
                protocol,
                data: Vec::new(),
            });
        }

        for iface in to_reconnect {
            let _ = self.connect(iface);
        }
    }
}

/// Grouped read of every interface's compatibility against a fixed protocol
/// set, used by configuration validation at start-up.
pub fn compatibility_table() -> HashMap<Protocol, Vec<InterfaceType>> {
    let protocols = [Protocol::Tcp, Protocol::Udp, Protocol::Can, Protocol::Mqtt];
    let ifaces = [
        InterfaceType::Ethernet,
        InterfaceType::Wifi,
        InterfaceType::Cellular,
        InterfaceType::Can,
    ];
    let mut table = HashMap::new();
    for &p in &protocols {
        table.insert(
            p,
            ifaces.iter().copied().filter(|&i| protocol_compatible(p, i)).collect(),
        );
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use ecu_time::FakeClock;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    struct FlakyDriver {
        succeed: AtomicBool,
    }
    impl InterfaceDriver for FlakyDriver {
        fn connect(&self) -> bool {
            self.succeed.load(Ordering::SeqCst)
        }
        fn disconnect(&self) -> bool {
            true
        }
    }

    fn manager() -> NetworkManager {
        let clock: Arc<dyn Clock> = Arc::new(FakeClock::new());
        NetworkManager::new(
            clock,
            NetManagerConfig {
                rx_buffer_size: 1024,
                tx_buffer_size: 1024,
                heartbeat_interval_ms: 0,
            },
        )
    }

    #[test]
    fn tcp_and_udp_are_compatible_with_ethernet_and_wifi_only() {
        assert!(protocol_compatible(Protocol::Tcp, InterfaceType::Ethernet));
        assert!(protocol_compatible(Protocol::Udp, InterfaceType::Wifi));
        assert!(!protocol_compatible(Protocol::Tcp, InterfaceType::Cellular));
        assert!(!protocol_compatible(Protocol::Udp, InterfaceType::Can));
    }

    #[test]
    fn can_is_compatible_only_with_can() {
        assert!(protocol_compatible(Protocol::Can, InterfaceType::Can));
        assert!(!protocol_compatible(Protocol::Can, InterfaceType::Ethernet));
    }

    #[test]
    fn mqtt_is_cellular_only() {
        assert!(protocol_compatible(Protocol::Mqtt, InterfaceType::Cellular));
        assert!(!protocol_compatible(Protocol::Mqtt, InterfaceType::Wifi));
        assert!(!protocol_compatible(Protocol::Mqtt, InterfaceType::Ethernet));
    }

    #[test]
    fn connect_then_send_routes_through_compatible_interface() {
        let mgr = manager();
        mgr.add_interface(InterfaceConfig {
            name: "eth0",
            iface_type: InterfaceType::Ethernet,
            auto_connect: false,
            reconnect_interval_ms: 1000,
            driver: Arc::new(AlwaysUp),
        })
        .unwrap();
        mgr.connect(InterfaceType::Ethernet).unwrap();
        mgr.send_message(&Message {
            id: 1,
            protocol: Protocol::Tcp,
            data: vec![1, 2, 3],
        })
        .unwrap();
        let stats = mgr.get_statistics(InterfaceType::Ethernet).unwrap();
        assert_eq!(stats.packets_sent, 1);
        assert_eq!(stats.bytes_sent, 3);
    }

    #[test]
    fn send_with_no_connected_compatible_interface_fails() {
        let mgr = manager();
        mgr.add_interface(InterfaceConfig {
            name: "can0",
            iface_type: InterfaceType::Can,
            auto_connect: false,
            reconnect_interval_ms: 1000,
            driver: Arc::new(AlwaysUp),
        })
        .unwrap();
        let err = mgr
            .send_message(&Message {
                id: 1,
                protocol: Protocol::Tcp,
                data: vec![1],
            })
            .unwrap_err();
        assert_eq!(err, NetworkError::NoRoute(Protocol::Tcp));
    }

    #[test]
    fn failed_connect_marks_interface_errored_and_counts_error() {
        let mgr = manager();
        mgr.add_interface(InterfaceConfig {
            name: "wifi0",
            iface_type: InterfaceType::Wifi,
            auto_connect: false,
            reconnect_interval_ms: 1000,
            driver: Arc::new(FlakyDriver {
                succeed: AtomicBool::new(false),
            }),
        })
        .unwrap();
        assert!(mgr.connect(InterfaceType::Wifi).is_err());
        assert_eq!(mgr.get_state(InterfaceType::Wifi), ConnectionState::Error);
        assert_eq!(mgr.get_statistics(InterfaceType::Wifi).unwrap().errors, 1);
    }

    #[test]
    fn duplicate_interface_type_rejected() {
        let mgr = manager();
        mgr.add_interface(InterfaceConfig {
            name: "eth0",
            iface_type: InterfaceType::Ethernet,
            auto_connect: false,
            reconnect_interval_ms: 1000,
            driver: Arc::new(AlwaysUp),
        })
        .unwrap();
        let err = mgr
            .add_interface(InterfaceConfig {
                name: "eth1",
                iface_type: InterfaceType::Ethernet,
                auto_connect: false,
                reconnect_interval_ms: 1000,
                driver: Arc::new(AlwaysUp),
            })
            .unwrap_err();
        assert_eq!(err, NetworkError::NoFreeSlot);
    }

    #[test]
    fn process_auto_reconnects_disconnected_interface_after_interval() {
        let clock = Arc::new(FakeClock::new());
        let clock_dyn: Arc<dyn Clock> = clock.clone();
        let mgr = NetworkManager::new(
            clock_dyn,
            NetManagerConfig {
                rx_buffer_size: 64,
                tx_buffer_size: 64,
                heartbeat_interval_ms: 0,
            },
        );
        mgr.add_interface(InterfaceConfig {
            name: "cell0",
            iface_type: InterfaceType::Cellular,
            auto_connect: true,
            reconnect_interval_ms: 100,
            driver: Arc::new(AlwaysUp),
        })
        .unwrap();
        assert_eq!(mgr.get_state(InterfaceType::Cellular), ConnectionState::Disconnected);
        clock.advance_ms(150);
        mgr.process();
        assert_eq!(mgr.get_state(InterfaceType::Cellular), ConnectionState::Connected);
    }

    #[test]
    fn process_sends_heartbeat_on_connected_interface() {
        let clock = Arc::new(FakeClock::new());
        let clock_dyn: Arc<dyn Clock> = clock.clone();
        let mgr = NetworkManager::new(
            clock_dyn,
            NetManagerConfig {
                rx_buffer_size: 64,
                tx_buffer_size: 64,
                heartbeat_interval_ms: 50,
            },
        );
        mgr.add_interface(InterfaceConfig {
            name: "eth0",
            iface_type: InterfaceType::Ethernet,
            auto_connect: false,
            reconnect_interval_ms: 1000,
            driver: Arc::new(AlwaysUp),
        })
        .unwrap();
        mgr.connect(InterfaceType::Ethernet).unwrap();
        clock.advance_ms(60);
        mgr.process();
        let stats = mgr.get_statistics(InterfaceType::Ethernet).unwrap();
        assert_eq!(stats.packets_sent, 1);
    }

    #[test]
    fn event_callback_observes_connect_and_send() {
        let mgr = manager();
        let seen = Arc::new(AtomicU32::new(0));
        let seen_clone = Arc::clone(&seen);
        mgr.register_callback(Arc::new(move |_event: NetEvent| {
            seen_clone.fetch_add(1, Ordering::SeqCst);
        }));
        mgr.add_interface(InterfaceConfig {
            name: "eth0",
            iface_type: InterfaceType::Ethernet,
            auto_connect: false,
            reconnect_interval_ms: 1000,
            driver: Arc::new(AlwaysUp),
        })
        .unwrap();
        mgr.connect(InterfaceType::Ethernet).unwrap();
        mgr.send_message(&Message {
            id: 1,
            protocol: Protocol::Tcp,
            data: vec![9],
        })
        .unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn receive_bytes_then_drain_round_trips() {
        let mgr = manager();
        mgr.add_interface(InterfaceConfig {
            name: "can0",
            iface_type: InterfaceType::Can,
            auto_connect: false,
            reconnect_interval_ms: 1000,
            driver: Arc::new(AlwaysUp),
        })
        .unwrap();
        mgr.receive_bytes(InterfaceType::Can, &[1, 2, 3, 4]).unwrap();
        let out = mgr.drain_received(16);
        assert_eq!(out, vec![1, 2, 3, 4]);
    }

    #[test]
    fn compatibility_table_matches_matrix() {
        let table = compatibility_table();
        assert_eq!(
            table[&Protocol::Mqtt],
            vec![InterfaceType::Cellular]
        );
        assert_eq!(table[&Protocol::Can], vec![InterfaceType::Can]);
    }
}
