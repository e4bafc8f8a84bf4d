//! Name service node: owns the UDP socket, runs the receive loop, and
//! dispatches decoded datagrams by opcode.

use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, warn};

use super::codec::{self, Message};
use super::listener::Listeners;
use super::name::{LocalNameTable, NetBiosName, OwnedName, RemoteNameTable, SUFFIX_ADAPTER_STATUS};
use super::refresh::RefreshScheduler;
use super::request::{self, RequestEngine, RequestOutcome, RequestQueue, TransactionIdAllocator};
use crate::config::Config;
use crate::error::Result;

/// Grace period the shutdown path waits for queued deletes to drain
/// before giving up and closing anyway.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

struct Tables {
    local: Arc<Mutex<LocalNameTable>>,
    remote: Mutex<RemoteNameTable>,
}

/// The running name service: receive loop thread, request engine thread,
/// and refresh scheduler thread, sharing one socket and one set of tables.
pub struct NameServiceNode {
    config: Config,
    tables: Arc<Tables>,
    listeners: Arc<Listeners>,
    queue: Arc<RequestQueue>,
    tid_alloc: Arc<TransactionIdAllocator>,
    socket: UdpSocket,
    shutdown: Arc<AtomicBool>,
    receive_handle: Option<std::thread::JoinHandle<()>>,
    request_engine: Option<RequestEngine>,
    refresh: Option<RefreshScheduler>,
}

impl NameServiceNode {
    /// Binds the configured port (or an ephemeral one in tests, when
    /// `config.naming_port == 0`) and starts the receive loop.
    pub fn start(config: Config) -> Result<Self> {
        let bind_addr = SocketAddr::new(config.bind_addr, config.naming_port);
        let socket = UdpSocket::bind(bind_addr)?;
        socket.set_read_timeout(Some(Duration::from_millis(250)))?;
        let recv_socket = socket.try_clone()?;
        let send_socket = socket.try_clone()?;

        let tables =
            Arc::new(Tables { local: Arc::new(Mutex::new(LocalNameTable::new())), remote: Mutex::new(RemoteNameTable::new()) });
        let listeners = Arc::new(Listeners::new());
        let queue = Arc::new(RequestQueue::new());
        let tid_alloc = Arc::new(TransactionIdAllocator::default());
        let shutdown = Arc::new(AtomicBool::new(false));

        let receive_handle = {
            let tables = tables.clone();
            let listeners = listeners.clone();
            let queue = queue.clone();
            let shutdown = shutdown.clone();
            std::thread::Builder::new()
                .name("netbios-receive-loop".into())
                .spawn(move || receive_loop(recv_socket, tables, listeners, queue, shutdown))
                .expect("failed to spawn receive loop thread")
        };

        let request_engine = RequestEngine::spawn(config.clone(), send_socket, queue.clone(), listeners.clone());
        let refresh = RefreshScheduler::spawn(config.clone(), tables.local.clone(), queue.clone(), tid_alloc.clone());

        Ok(Self {
            config,
            tables,
            listeners,
            queue,
            tid_alloc,
            socket,
            shutdown,
            receive_handle: Some(receive_handle),
            request_engine: Some(request_engine),
            refresh: Some(refresh),
        })
    }

    pub fn add_add_name_listener(&self, listener: super::listener::AddNameListener) {
        self.listeners.add_add_name_listener(listener);
    }

    pub fn add_query_name_listener(&self, listener: super::listener::QueryNameListener) {
        self.listeners.add_query_name_listener(listener);
    }

    pub fn add_remote_name_listener(&self, listener: super::listener::RemoteNameListener) {
        self.listeners.add_register_remote_listener(listener);
    }

    /// Registers a name owned by this host.
    pub fn add_name(&self, name: NetBiosName, addresses: Vec<Ipv4Addr>, ttl_secs: u32) {
        let owned = OwnedName::new(
            name.clone(),
            addresses.iter().cloned().map(std::net::IpAddr::V4).collect(),
            Duration::from_secs(ttl_secs as u64),
        );
        self.tables.local.lock().unwrap().upsert(owned);
        let tid = self.tid_alloc.next();
        let wins_configured = self.config.wins_primary.is_some();
        self.queue.enqueue(request::new_add_request(tid, name, addresses, ttl_secs, wins_configured));
    }

    /// Releases a name owned by this host.
    pub fn delete_name(&self, name: NetBiosName, addresses: Vec<Ipv4Addr>) {
        self.tables.local.lock().unwrap().remove(&name);
        let tid = self.tid_alloc.next();
        let wins_configured = self.config.wins_primary.is_some();
        self.queue.enqueue(request::new_delete_request(tid, name, addresses, wins_configured));
    }

    pub fn find_local(&self, name: &NetBiosName) -> Option<OwnedName> {
        self.tables.local.lock().unwrap().find(name).cloned()
    }

    pub fn find_remote(&self, name: &NetBiosName) -> Option<Vec<std::net::IpAddr>> {
        self.tables.remote.lock().unwrap().owners(name)
    }

    /// Cooperative shutdown. If `immediate` is false, queues
    /// `DeleteName` for every owned name first and waits up to the grace
    /// period for the queue to drain.
    pub fn shutdown(mut self, immediate: bool) {
        if !immediate {
            let owned = self.tables.local.lock().unwrap().snapshot();
            for entry in owned {
                let addresses: Vec<Ipv4Addr> = entry
                    .addresses
                    .iter()
                    .filter_map(|addr| match addr {
                        std::net::IpAddr::V4(v4) => Some(*v4),
                        std::net::IpAddr::V6(_) => None,
                    })
                    .collect();
                self.delete_name(entry.name, addresses);
            }
            let deadline = std::time::Instant::now() + SHUTDOWN_GRACE;
            while !self.queue.is_drained() && std::time::Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(50));
            }
        }
        self.shutdown.store(true, Ordering::Release);
        // The receive loop polls `shutdown` every read-timeout tick rather than
        // blocking forever, so there is no socket to force-close here.
        if let Some(engine) = self.request_engine.take() {
            engine.shutdown();
        }
        if let Some(refresh) = self.refresh.take() {
            refresh.shutdown();
        }
        if let Some(handle) = self.receive_handle.take() {
            let _ = handle.join();
        }
    }
}

fn receive_loop(
    socket: UdpSocket,
    tables: Arc<Tables>,
    listeners: Arc<Listeners>,
    queue: Arc<RequestQueue>,
    shutdown: Arc<AtomicBool>,
) {
    let mut buf = [0u8; 576];
    loop {
        if shutdown.load(Ordering::Acquire) {
            return;
        }
        match socket.recv_from(&mut buf) {
            Ok((len, from)) => {
                if let Err(err) = dispatch(&buf[..len], from, &socket, &tables, &listeners, &queue) {
                    debug!(error = %err, "dropping malformed netbios datagram");
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock || err.kind() == std::io::ErrorKind::TimedOut => {
                continue;
            }
            Err(err) => {
                if shutdown.load(Ordering::Acquire) {
                    return;
                }
                warn!(error = %err, "netbios socket recv error");
            }
        }
    }
}

fn dispatch(
    bytes: &[u8],
    from: SocketAddr,
    socket: &UdpSocket,
    tables: &Tables,
    listeners: &Listeners,
    queue: &RequestQueue,
) -> Result<()> {
    let message = codec::decode(bytes)?;
    match message {
        Message::NameQuery { tid, name } => {
            listeners.fire_query(&name);
            if name.display_name() == "*" && name.suffix == SUFFIX_ADAPTER_STATUS {
                let addresses = local_adapter_addresses(tables);
                send_query_response(socket, from, tid, addresses);
            } else if let Some(owned) = tables.local.lock().unwrap().find(&name) {
                let addresses: Vec<Ipv4Addr> = owned
                    .addresses
                    .iter()
                    .filter_map(|addr| match addr {
                        std::net::IpAddr::V4(v4) => Some(*v4),
                        std::net::IpAddr::V6(_) => None,
                    })
                    .collect();
                send_query_response(socket, from, tid, addresses);
            }
        }
        Message::Register { name, addresses, .. } | Message::Refresh { name, addresses, .. } => {
            let owners: Vec<std::net::IpAddr> = addresses.into_iter().map(std::net::IpAddr::V4).collect();
            tables.remote.lock().unwrap().upsert(name.clone(), owners);
            listeners.fire_register_remote(&name);
        }
        Message::Release { name, .. } => {
            tables.remote.lock().unwrap().remove(&name);
            listeners.fire_release_remote(&name);
        }
        Message::RegisterResponse { tid, positive } => {
            if let Some(request) = queue.take_pending(tid) {
                match (request.kind, positive) {
                    (request::RequestKind::Refresh, true) => {
                        tables.local.lock().unwrap().mark_refreshed(&request.name, std::time::Instant::now());
                    }
                    (request::RequestKind::Refresh, false) => {
                        listeners.fire_outcome(&RequestOutcome::RefreshIoError(request.name));
                    }
                    (_, true) => {
                        listeners.fire_outcome(&RequestOutcome::AddSuccess(request.name));
                    }
                    (_, false) => {
                        tables.local.lock().unwrap().remove(&request.name);
                        listeners.fire_outcome(&RequestOutcome::AddFailed(request.name));
                    }
                }
            }
            // No matching pending request: dropped without side effect.
        }
        Message::QueryResponse { .. } | Message::ReleaseResponse { .. } | Message::Wack { .. } => {
            // Accepted but ignored by the core dispatch.
        }
    }
    Ok(())
}

/// Union of every IPv4 address owned by this node, across all locally
/// registered names, for the adapter-status well-known query.
fn local_adapter_addresses(tables: &Tables) -> Vec<Ipv4Addr> {
    let local = tables.local.lock().unwrap();
    let mut addresses = Vec::new();
    for entry in local.snapshot() {
        for addr in entry.addresses {
            if let std::net::IpAddr::V4(v4) = addr {
                if !addresses.contains(&v4) {
                    addresses.push(v4);
                }
            }
        }
    }
    addresses
}

fn send_query_response(socket: &UdpSocket, to: SocketAddr, tid: u16, addresses: Vec<Ipv4Addr>) {
    let response = Message::QueryResponse { tid, addresses };
    let bytes = codec::encode(&response);
    if let Err(err) = socket.send_to(&bytes, to) {
        warn!(error = %err, "failed to send netbios query response");
    }
}
