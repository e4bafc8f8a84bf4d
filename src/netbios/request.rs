//! Outgoing request queue and retry engine.
//!
//! A single FIFO of pending requests behind one mutex + condition variable,
//! drained by a dedicated worker thread that chooses WINS-unicast or
//! broadcast transport and retries on its own schedule.

use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use tracing::{debug, warn};

use super::codec::{self, Message};
use super::listener::Listeners;
use super::name::NetBiosName;
use crate::config::Config;

/// Kind of outgoing request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Add,
    Delete,
    Refresh,
}

impl RequestKind {
    fn base_retry_interval(self, wins_configured: bool) -> Duration {
        match (self, wins_configured) {
            (RequestKind::Delete, _) => Duration::from_millis(200),
            (_, true) => Duration::from_millis(250),
            (_, false) => Duration::from_secs(2),
        }
    }
}

/// A request awaiting network confirmation.
#[derive(Debug, Clone)]
pub struct NetBiosRequest {
    pub tid: u16,
    pub kind: RequestKind,
    pub name: NetBiosName,
    pub addresses: Vec<std::net::Ipv4Addr>,
    pub ttl_secs: u32,
    pub retries_remaining: u32,
    pub retry_interval: Duration,
    pub error: bool,
}

/// Process-wide transaction id counter; wraps silently at 16 bits.
#[derive(Debug, Default)]
pub struct TransactionIdAllocator(AtomicU16);

impl TransactionIdAllocator {
    pub fn next(&self) -> u16 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

/// Thread-safe FIFO of outgoing requests with its own mutex + condvar,
/// matching the single-consumer worker-thread model.
pub struct RequestQueue {
    inner: Mutex<std::collections::VecDeque<NetBiosRequest>>,
    cv: Condvar,
    /// Requests currently in flight, indexed by transaction id, so a
    /// matching response (or none) can complete them.
    pending: Mutex<std::collections::HashMap<u16, NetBiosRequest>>,
}

impl Default for RequestQueue {
    fn default() -> Self {
        Self {
            inner: Mutex::new(std::collections::VecDeque::new()),
            cv: Condvar::new(),
            pending: Mutex::new(std::collections::HashMap::new()),
        }
    }
}

impl RequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, request: NetBiosRequest) {
        let mut guard = self.inner.lock().unwrap();
        guard.push_back(request);
        self.cv.notify_one();
    }

    pub(crate) fn pop_blocking(&self, shutdown: &std::sync::atomic::AtomicBool) -> Option<NetBiosRequest> {
        let mut guard = self.inner.lock().unwrap();
        loop {
            if let Some(request) = guard.pop_front() {
                return Some(request);
            }
            if shutdown.load(Ordering::Acquire) {
                return None;
            }
            let (g, _timeout) =
                self.cv.wait_timeout(guard, Duration::from_millis(200)).unwrap();
            guard = g;
            if shutdown.load(Ordering::Acquire) && guard.is_empty() {
                return None;
            }
        }
    }

    /// True once every outstanding request has drained, used by shutdown's
    /// grace-period wait.
    pub fn is_drained(&self) -> bool {
        self.inner.lock().unwrap().is_empty() && self.pending.lock().unwrap().is_empty()
    }

    pub(crate) fn track_pending(&self, request: NetBiosRequest) {
        self.pending.lock().unwrap().insert(request.tid, request);
    }

    pub(crate) fn take_pending(&self, tid: u16) -> Option<NetBiosRequest> {
        self.pending.lock().unwrap().remove(&tid)
    }
}

/// Outcome of a completed request, reported to the registered listeners.
#[derive(Debug, Clone)]
pub enum RequestOutcome {
    AddSuccess(NetBiosName),
    AddFailed(NetBiosName),
    AddIoError(NetBiosName),
    RefreshIoError(NetBiosName),
}

/// Drains the queue on a dedicated worker thread, transmitting via WINS
/// (if configured) or broadcast, retrying per the configured policy.
pub struct RequestEngine {
    shutdown: Arc<std::sync::atomic::AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl RequestEngine {
    pub fn spawn(
        config: Config,
        socket: UdpSocket,
        queue: Arc<RequestQueue>,
        listeners: Arc<Listeners>,
    ) -> Self {
        let shutdown = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let shutdown_for_thread = shutdown.clone();
        let handle = std::thread::Builder::new()
            .name("netbios-request-engine".into())
            .spawn(move || run(config, socket, queue, listeners, shutdown_for_thread))
            .expect("failed to spawn request engine thread");
        Self { shutdown, handle: Some(handle) }
    }

    pub fn shutdown(mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run(
    config: Config,
    socket: UdpSocket,
    queue: Arc<RequestQueue>,
    listeners: Arc<Listeners>,
    shutdown: Arc<std::sync::atomic::AtomicBool>,
) {
    let wins_configured = config.wins_primary.is_some();
    while let Some(mut request) = queue.pop_blocking(&shutdown) {
        let destination = transport_for(&config, wins_configured);
        match transmit(&socket, destination, &request) {
            Ok(()) => {
                debug!(tid = request.tid, kind = ?request.kind, "transmitted netbios request");
                if wins_configured {
                    queue.track_pending(request);
                } else {
                    broadcast_retry(&config, &socket, &mut request, &shutdown);
                    complete_broadcast_only(&request, &listeners);
                }
            }
            Err(err) => {
                warn!(tid = request.tid, error = %err, "netbios send failed");
                request.error = true;
                listeners.fire_outcome(&RequestOutcome::AddIoError(request.name.clone()));
                continue;
            }
        }
        if wins_configured {
            wait_and_retry(&config, &socket, &queue, &listeners, &mut request, &shutdown);
        }
    }
}

fn transport_for(config: &Config, wins_configured: bool) -> SocketAddr {
    if wins_configured {
        config.wins_primary.unwrap()
    } else {
        config.broadcast_addr
    }
}

fn transmit(socket: &UdpSocket, destination: SocketAddr, request: &NetBiosRequest) -> std::io::Result<()> {
    let message = to_wire_message(request);
    let bytes = codec::encode(&message);
    socket.send_to(&bytes, destination).map(|_| ())
}

fn to_wire_message(request: &NetBiosRequest) -> Message {
    match request.kind {
        RequestKind::Add => Message::Register {
            tid: request.tid,
            name: request.name.clone(),
            addresses: request.addresses.clone(),
            ttl: request.ttl_secs,
            multi_homed: request.addresses.len() > 1,
        },
        RequestKind::Refresh => Message::Refresh {
            tid: request.tid,
            name: request.name.clone(),
            addresses: request.addresses.clone(),
            ttl: request.ttl_secs,
        },
        RequestKind::Delete => Message::Release {
            tid: request.tid,
            name: request.name.clone(),
            addresses: request.addresses.clone(),
        },
    }
}

/// RFC1001 B-node: no reply is ever expected on broadcast transport, so the
/// only way to give a conflicting node a chance to object is to keep
/// broadcasting across the full retry budget before declaring success.
fn broadcast_retry(
    config: &Config,
    socket: &UdpSocket,
    request: &mut NetBiosRequest,
    shutdown: &std::sync::atomic::AtomicBool,
) {
    while request.retries_remaining > 1 {
        std::thread::sleep(request.retry_interval);
        if shutdown.load(Ordering::Acquire) {
            return;
        }
        let destination = transport_for(config, false);
        let _ = transmit(socket, destination, request);
        request.retries_remaining -= 1;
    }
    request.retries_remaining = 0;
}

fn complete_broadcast_only(request: &NetBiosRequest, listeners: &Listeners) {
    match request.kind {
        RequestKind::Add => listeners.fire_outcome(&RequestOutcome::AddSuccess(request.name.clone())),
        RequestKind::Refresh | RequestKind::Delete => {}
    }
}

/// Waits out one retry interval. If a `RegisterResponse` already completed
/// this transaction on the receive loop (see [`super::node::dispatch`]), the
/// pending entry is gone and we stop; otherwise we retransmit.
fn wait_and_retry(
    config: &Config,
    socket: &UdpSocket,
    queue: &Arc<RequestQueue>,
    listeners: &Arc<Listeners>,
    request: &mut NetBiosRequest,
    shutdown: &std::sync::atomic::AtomicBool,
) {
    while request.retries_remaining > 0 {
        std::thread::sleep(request.retry_interval);
        if shutdown.load(Ordering::Acquire) {
            queue.take_pending(request.tid);
            return;
        }
        // If the receive loop already resolved this tid, stop retrying.
        if queue.take_pending(request.tid).is_none() {
            return;
        }
        request.retries_remaining -= 1;
        if request.retries_remaining == 0 {
            break;
        }
        let destination = transport_for(config, true);
        if transmit(socket, destination, request).is_err() {
            request.error = true;
            listeners.fire_outcome(&RequestOutcome::AddIoError(request.name.clone()));
            return;
        }
        queue.track_pending(request.clone());
    }
    // Retries exhausted without a positive WINS reply.
    match request.kind {
        RequestKind::Add => listeners.fire_outcome(&RequestOutcome::AddFailed(request.name.clone())),
        RequestKind::Refresh => listeners.fire_outcome(&RequestOutcome::RefreshIoError(request.name.clone())),
        RequestKind::Delete => {}
    }
}

/// Builds a new `Add` request with the kind-appropriate default retry
/// policy.
pub fn new_add_request(
    tid: u16,
    name: NetBiosName,
    addresses: Vec<std::net::Ipv4Addr>,
    ttl_secs: u32,
    wins_configured: bool,
) -> NetBiosRequest {
    NetBiosRequest {
        tid,
        kind: RequestKind::Add,
        name,
        addresses,
        ttl_secs,
        retries_remaining: 5,
        retry_interval: RequestKind::Add.base_retry_interval(wins_configured),
        error: false,
    }
}

pub fn new_delete_request(
    tid: u16,
    name: NetBiosName,
    addresses: Vec<std::net::Ipv4Addr>,
    wins_configured: bool,
) -> NetBiosRequest {
    NetBiosRequest {
        tid,
        kind: RequestKind::Delete,
        name,
        addresses,
        ttl_secs: 0,
        retries_remaining: 1,
        retry_interval: RequestKind::Delete.base_retry_interval(wins_configured),
        error: false,
    }
}

pub fn new_refresh_request(
    tid: u16,
    name: NetBiosName,
    addresses: Vec<std::net::Ipv4Addr>,
    ttl_secs: u32,
    wins_configured: bool,
) -> NetBiosRequest {
    NetBiosRequest {
        tid,
        kind: RequestKind::Refresh,
        name,
        addresses,
        ttl_secs,
        retries_remaining: 2,
        retry_interval: RequestKind::Refresh.base_retry_interval(wins_configured),
        error: false,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn transaction_id_wraps_silently() {
        let counter = TransactionIdAllocator(AtomicU16::new(u16::MAX));
        assert_eq!(counter.next(), u16::MAX);
        assert_eq!(counter.next(), 0);
    }

    #[test]
    fn queue_is_fifo() {
        let queue = RequestQueue::new();
        let name = NetBiosName::new("A", 0x20, false);
        queue.enqueue(new_add_request(1, name.clone(), vec![], 300, false));
        queue.enqueue(new_add_request(2, name, vec![], 300, false));
        let shutdown = std::sync::atomic::AtomicBool::new(false);
        assert_eq!(queue.pop_blocking(&shutdown).unwrap().tid, 1);
        assert_eq!(queue.pop_blocking(&shutdown).unwrap().tid, 2);
    }
}
