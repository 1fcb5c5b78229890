//! [`DeviceRegistry`] – serial number → live endpoint bindings.
//!
//! The registry is the only state shared between connection tasks.  Every
//! access goes through one [`RwLock`]; the lock is never held across an
//! `.await`, so broadcast callers take a snapshot and send after releasing it.
//!
//! # Compare-and-delete
//!
//! A device that reconnects binds its serial to a new endpoint while the old
//! connection may still be tearing down.  [`DeviceRegistry::unbind`] only
//! removes the entry when it still points at the caller's own endpoint, so
//! the old connection cannot evict the new one.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use homewire_endpoint::Endpoint;
use homewire_types::DeviceClass;
use tracing::debug;

/// Shared handle to a bound peer.
pub type PeerRef = Arc<dyn Endpoint>;

/// `true` when both handles point at the same endpoint instance.
pub fn same_endpoint(a: &PeerRef, b: &PeerRef) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// One registry entry.
#[derive(Clone)]
pub struct Binding {
    pub endpoint: PeerRef,
    pub class: DeviceClass,
}

/// Lock-guarded table of live bindings, at most one per serial number.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use homewire_hub::DeviceRegistry;
///
/// let registry = Arc::new(DeviceRegistry::new());
/// assert!(registry.lookup("X1").is_none());
/// assert!(registry.is_empty());
/// ```
#[derive(Default)]
pub struct DeviceRegistry {
    bindings: RwLock<HashMap<String, Binding>>,
}

impl DeviceRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `serial` to `endpoint`, atomically replacing any earlier binding.
    ///
    /// Returns the endpoint that was bound before, if any.  The registry does
    /// not terminate it; its own connection owns that teardown.
    pub fn bind(&self, serial: &str, endpoint: PeerRef, class: DeviceClass) -> Option<PeerRef> {
        let previous = self
            .write()
            .insert(serial.to_string(), Binding { endpoint, class })
            .map(|b| b.endpoint);
        debug!(serial, replaced = previous.is_some(), "registry: bind");
        previous
    }

    /// Bind `serial` and list the devices bound at that same instant.
    ///
    /// Both happen under one write lock, so a device binding concurrently is
    /// either in the list or binds strictly afterwards.
    pub fn bind_and_list_devices(
        &self,
        serial: &str,
        endpoint: PeerRef,
        class: DeviceClass,
    ) -> Vec<(String, DeviceClass)> {
        let mut bindings = self.write();
        let replaced = bindings
            .insert(serial.to_string(), Binding { endpoint, class })
            .is_some();
        debug!(serial, replaced, "registry: bind");
        bindings
            .iter()
            .filter(|(_, b)| !b.class.is_rest())
            .map(|(name, b)| (name.clone(), b.class.clone()))
            .collect()
    }

    /// The endpoint currently bound to `serial`.
    pub fn lookup(&self, serial: &str) -> Option<PeerRef> {
        self.read().get(serial).map(|b| Arc::clone(&b.endpoint))
    }

    /// Remove the binding for `serial` only if it is still `expected`.
    ///
    /// Returns the class of the removed binding, or `None` when nothing was
    /// removed (no binding, or a newer endpoint holds the serial).
    pub fn unbind(&self, serial: &str, expected: &PeerRef) -> Option<DeviceClass> {
        let mut bindings = self.write();
        let current = bindings.get(serial)?;
        if !same_endpoint(&current.endpoint, expected) {
            debug!(serial, "registry: unbind skipped, binding superseded");
            return None;
        }
        bindings.remove(serial).map(|b| b.class)
    }

    /// Point-in-time copy of every binding matching `predicate`.
    ///
    /// The copy is taken under the read lock and returned after releasing
    /// it, so callers can send to the peers without blocking binds.
    pub fn snapshot<F>(&self, predicate: F) -> Vec<(String, Binding)>
    where
        F: Fn(&str, &Binding) -> bool,
    {
        self.read()
            .iter()
            .filter(|(serial, binding)| predicate(serial, binding))
            .map(|(serial, binding)| (serial.clone(), binding.clone()))
            .collect()
    }

    /// Every bound aggregator (`c_type = "rest"`) peer.
    pub fn rest_peers(&self) -> Vec<(String, PeerRef)> {
        self.snapshot(|_, b| b.class.is_rest())
            .into_iter()
            .map(|(serial, b)| (serial, b.endpoint))
            .collect()
    }

    /// Every bound device (non-`rest`) with its class.
    pub fn devices(&self) -> Vec<(String, DeviceClass)> {
        self.snapshot(|_, b| !b.class.is_rest())
            .into_iter()
            .map(|(serial, b)| (serial, b.class))
            .collect()
    }

    /// Number of bound serials.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    // A panic while holding the lock cannot leave the map half-written
    // (every mutation is a single insert/remove), so poisoning is ignored.
    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Binding>> {
        self.bindings.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Binding>> {
        self.bindings.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    // ────────────────────────────────────────────────────────────────────────
    // Test double
    // ────────────────────────────────────────────────────────────────────────

    /// Endpoint that records every message sent to it.
    #[derive(Default)]
    pub(crate) struct RecordingEndpoint {
        sent: Mutex<Vec<String>>,
        pub(crate) reject: AtomicBool,
    }

    impl RecordingEndpoint {
        pub(crate) fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub(crate) fn sent(&self) -> Vec<String> {
            self.sent.lock().unwrap().clone()
        }

        pub(crate) fn sent_json(&self) -> Vec<serde_json::Value> {
            self.sent()
                .iter()
                .map(|s| serde_json::from_str(s).unwrap())
                .collect()
        }
    }

    #[async_trait]
    impl Endpoint for RecordingEndpoint {
        fn start_reading(&self) {}

        async fn recv(&self) -> Option<String> {
            None
        }

        async fn send(&self, message: &str) -> bool {
            if self.reject.load(Ordering::SeqCst) {
                return false;
            }
            self.sent.lock().unwrap().push(message.to_string());
            true
        }

        async fn terminate(&self) {}
    }

    pub(crate) fn peer(ep: &Arc<RecordingEndpoint>) -> PeerRef {
        Arc::clone(ep) as PeerRef
    }

    // ────────────────────────────────────────────────────────────────────────
    // Tests
    // ────────────────────────────────────────────────────────────────────────

    #[test]
    fn bind_then_lookup() {
        let registry = DeviceRegistry::new();
        let a = RecordingEndpoint::new();
        assert!(registry.bind("X1", peer(&a), DeviceClass::from("light")).is_none());

        let found = registry.lookup("X1").unwrap();
        assert!(same_endpoint(&found, &peer(&a)));
        assert!(registry.lookup("X2").is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn rebind_replaces_and_returns_previous() {
        let registry = DeviceRegistry::new();
        let a = RecordingEndpoint::new();
        let b = RecordingEndpoint::new();
        registry.bind("X1", peer(&a), DeviceClass::from("light"));

        let previous = registry.bind("X1", peer(&b), DeviceClass::from("light")).unwrap();
        assert!(same_endpoint(&previous, &peer(&a)));
        assert!(same_endpoint(&registry.lookup("X1").unwrap(), &peer(&b)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn stale_unbind_does_not_remove_newer_binding() {
        let registry = DeviceRegistry::new();
        let a = RecordingEndpoint::new();
        let b = RecordingEndpoint::new();
        registry.bind("X1", peer(&a), DeviceClass::from("light"));
        registry.bind("X1", peer(&b), DeviceClass::from("light"));

        assert_eq!(registry.unbind("X1", &peer(&a)), None);
        assert!(same_endpoint(&registry.lookup("X1").unwrap(), &peer(&b)));

        assert_eq!(registry.unbind("X1", &peer(&b)), Some(DeviceClass::from("light")));
        assert!(registry.is_empty());
    }

    #[test]
    fn unbind_unknown_serial_is_noop() {
        let registry = DeviceRegistry::new();
        let a = RecordingEndpoint::new();
        assert_eq!(registry.unbind("nope", &peer(&a)), None);
    }

    #[test]
    fn snapshots_split_rest_peers_from_devices() {
        let registry = DeviceRegistry::new();
        let ctl = RecordingEndpoint::new();
        let lamp = RecordingEndpoint::new();
        let tv = RecordingEndpoint::new();
        registry.bind("CTL", peer(&ctl), DeviceClass::Rest);
        registry.bind("L1", peer(&lamp), DeviceClass::from("light"));
        registry.bind("T1", peer(&tv), DeviceClass::from("tv"));

        let rest: Vec<String> = registry.rest_peers().into_iter().map(|(s, _)| s).collect();
        assert_eq!(rest, vec!["CTL".to_string()]);

        let mut devices = registry.devices();
        devices.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            devices,
            vec![
                ("L1".to_string(), DeviceClass::from("light")),
                ("T1".to_string(), DeviceClass::from("tv")),
            ]
        );
    }

    #[test]
    fn bind_and_list_devices_sees_devices_but_not_controllers() {
        let registry = DeviceRegistry::new();
        let lamp = RecordingEndpoint::new();
        let other = RecordingEndpoint::new();
        let ctl = RecordingEndpoint::new();
        registry.bind("L1", peer(&lamp), DeviceClass::from("light"));
        registry.bind("CTL-A", peer(&other), DeviceClass::Rest);

        let devices = registry.bind_and_list_devices("CTL-B", peer(&ctl), DeviceClass::Rest);
        assert_eq!(devices, vec![("L1".to_string(), DeviceClass::from("light"))]);
        assert!(same_endpoint(&registry.lookup("CTL-B").unwrap(), &peer(&ctl)));
    }

    #[test]
    fn concurrent_bind_unbind_on_one_serial_always_drains() {
        let registry = Arc::new(DeviceRegistry::new());
        let threads: Vec<_> = (0..16)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        let ep = peer(&RecordingEndpoint::new());
                        registry.bind("shared", Arc::clone(&ep), DeviceClass::from("light"));
                        let _ = registry.lookup("shared");
                        registry.unbind("shared", &ep);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        // The last binder always unbinds itself after every other bind.
        assert!(registry.is_empty());
    }

    #[test]
    fn concurrent_snapshots_never_see_torn_state() {
        let registry = Arc::new(DeviceRegistry::new());
        let writers: Vec<_> = (0..8)
            .map(|i| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    let serial = format!("dev-{i}");
                    for _ in 0..200 {
                        let ep = peer(&RecordingEndpoint::new());
                        registry.bind(&serial, Arc::clone(&ep), DeviceClass::from("light"));
                        registry.unbind(&serial, &ep);
                    }
                })
            })
            .collect();

        for _ in 0..500 {
            let snapshot = registry.snapshot(|_, _| true);
            assert!(snapshot.len() <= 8);
            let mut serials: Vec<_> = snapshot.iter().map(|(s, _)| s.clone()).collect();
            serials.sort();
            serials.dedup();
            assert_eq!(serials.len(), snapshot.len());
            assert!(snapshot.iter().all(|(s, _)| s.starts_with("dev-")));
        }

        for w in writers {
            w.join().unwrap();
        }
        assert!(registry.is_empty());
    }
}
