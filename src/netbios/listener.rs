//! Listener fan-out for the name service.
//!
//! Each listener kind is a vector of boxed closures. Firing copies the
//! vector's contents to a local slice first so callbacks never run while
//! the owning table's lock is held.

use std::sync::Mutex;

use super::name::NetBiosName;
use super::request::RequestOutcome;

pub type AddNameListener = Box<dyn Fn(&RequestOutcome) + Send + Sync>;
pub type QueryNameListener = Box<dyn Fn(&NetBiosName) + Send + Sync>;
pub type RemoteNameListener = Box<dyn Fn(&NetBiosName) + Send + Sync>;

#[derive(Default)]
pub struct Listeners {
    add: Mutex<Vec<AddNameListener>>,
    query: Mutex<Vec<QueryNameListener>>,
    register_remote: Mutex<Vec<RemoteNameListener>>,
    release_remote: Mutex<Vec<RemoteNameListener>>,
}

impl Listeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_add_name_listener(&self, listener: AddNameListener) {
        self.add.lock().unwrap().push(listener);
    }

    pub fn add_query_name_listener(&self, listener: QueryNameListener) {
        self.query.lock().unwrap().push(listener);
    }

    pub fn add_register_remote_listener(&self, listener: RemoteNameListener) {
        self.register_remote.lock().unwrap().push(listener);
    }

    pub fn add_release_remote_listener(&self, listener: RemoteNameListener) {
        self.release_remote.lock().unwrap().push(listener);
    }

    pub fn fire_outcome(&self, outcome: &RequestOutcome) {
        let snapshot: Vec<_> = { std::mem::take(&mut *self.add.lock().unwrap()) };
        for listener in &snapshot {
            listener(outcome);
        }
        self.add.lock().unwrap().extend(snapshot);
    }

    pub fn fire_query(&self, name: &NetBiosName) {
        let snapshot: Vec<_> = { std::mem::take(&mut *self.query.lock().unwrap()) };
        for listener in &snapshot {
            listener(name);
        }
        self.query.lock().unwrap().extend(snapshot);
    }

    pub fn fire_register_remote(&self, name: &NetBiosName) {
        let snapshot: Vec<_> = { std::mem::take(&mut *self.register_remote.lock().unwrap()) };
        for listener in &snapshot {
            listener(name);
        }
        self.register_remote.lock().unwrap().extend(snapshot);
    }

    pub fn fire_release_remote(&self, name: &NetBiosName) {
        let snapshot: Vec<_> = { std::mem::take(&mut *self.release_remote.lock().unwrap()) };
        for listener in &snapshot {
            listener(name);
        }
        self.release_remote.lock().unwrap().extend(snapshot);
    }
}
