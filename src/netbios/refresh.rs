//! Periodic refresh scheduler.
//!
//! Wakes on a fixed interval, finds every local name that falls inside the
//! next wakeup window, and enqueues a `Refresh` request for each. Positive
//! `RegisterResponse` completions renew the name's expiry back in
//! [`super::node::dispatch`]; this thread only decides *when* to ask.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tracing::debug;

use super::name::LocalNameTable;
use super::request::{self, RequestQueue, TransactionIdAllocator};
use crate::config::Config;

/// Background timer thread driving name refresh.
pub struct RefreshScheduler {
    shutdown: Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl RefreshScheduler {
    pub fn spawn(
        config: Config,
        local_table: Arc<Mutex<LocalNameTable>>,
        queue: Arc<RequestQueue>,
        tid_alloc: Arc<TransactionIdAllocator>,
    ) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_for_thread = shutdown.clone();
        let handle = std::thread::Builder::new()
            .name("netbios-refresh".into())
            .spawn(move || run(config, local_table, queue, tid_alloc, shutdown_for_thread))
            .expect("failed to spawn refresh scheduler thread");
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
    local_table: Arc<Mutex<LocalNameTable>>,
    queue: Arc<RequestQueue>,
    tid_alloc: Arc<TransactionIdAllocator>,
    shutdown: Arc<AtomicBool>,
) {
    let wins_configured = config.wins_primary.is_some();
    loop {
        if wait_or_shutdown(config.refresh_interval, &shutdown) {
            return;
        }
        let now = Instant::now();
        let due = local_table.lock().unwrap().due_for_refresh(now, config.refresh_interval);
        for name in due {
            let owned_ttl = {
                let table = local_table.lock().unwrap();
                table.find(&name).map(|entry| entry.ttl)
            };
            let Some(ttl) = owned_ttl else { continue };
            let addresses = {
                let table = local_table.lock().unwrap();
                table
                    .find(&name)
                    .map(|entry| {
                        entry
                            .addresses
                            .iter()
                            .filter_map(|addr| match addr {
                                std::net::IpAddr::V4(v4) => Some(*v4),
                                std::net::IpAddr::V6(_) => None,
                            })
                            .collect::<Vec<_>>()
                    })
                    .unwrap_or_default()
            };
            let tid = tid_alloc.next();
            debug!(name = %name, "scheduling refresh");
            queue.enqueue(request::new_refresh_request(
                tid,
                name,
                addresses,
                ttl.as_secs() as u32,
                wins_configured,
            ));
        }
    }
}

/// Sleeps in short ticks so shutdown is noticed promptly; returns true if
/// shutdown fired during the wait.
fn wait_or_shutdown(interval: std::time::Duration, shutdown: &AtomicBool) -> bool {
    let deadline = Instant::now() + interval;
    while Instant::now() < deadline {
        if shutdown.load(Ordering::Acquire) {
            return true;
        }
        std::thread::sleep(std::time::Duration::from_millis(200).min(interval));
    }
    shutdown.load(Ordering::Acquire)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::netbios::name::{NetBiosName, OwnedName};
    use std::time::Duration;

    #[test]
    fn due_names_are_enqueued_as_refresh_requests() {
        let table = Arc::new(Mutex::new(LocalNameTable::new()));
        let name = NetBiosName::new("JFILESRV", super::super::name::SUFFIX_FILE_SERVER, false);
        table.lock().unwrap().upsert(OwnedName::new(name.clone(), vec![], Duration::from_millis(1)));
        let queue = Arc::new(RequestQueue::new());
        let tid_alloc = Arc::new(TransactionIdAllocator::default());
        let mut config = Config::demo("JFILESRV".into());
        config.refresh_interval = Duration::from_millis(20);
        let scheduler = RefreshScheduler::spawn(config, table, queue.clone(), tid_alloc);
        std::thread::sleep(Duration::from_millis(100));
        scheduler.shutdown();
        let shutdown = AtomicBool::new(false);
        let request = queue.pop_blocking(&shutdown).expect("refresh request should have been queued");
        assert_eq!(request.kind, super::super::request::RequestKind::Refresh);
        assert_eq!(request.name, name);
    }
}
