//! Handshake scenarios driven from the frontend side.
//!
//! 1. Full cycle: Initialising, InitWait, Initialised with one bound ring,
//!    Connected, Closing with teardown, Closed and back to InitWait, then a
//!    new handler for the same frontend.
//! 2. Missing ring configuration: the bind fails and the backend closes
//!    without ever reaching Connected.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::Mutex;
use xen_be::XenbusState;

use crate::common::start_backend;
use crate::common::wait_until;
use crate::common::Frontend;
use crate::common::WAIT_TIMEOUT;

#[test]
fn test_handshake_round_trip() {
    let (_mem, backend) = start_backend();
    let info = backend.add_frontend(1, 0).unwrap();
    let frontend = Frontend::new(backend.store().clone(), 1, 0);
    assert_eq!(frontend.backend_state(), Some(XenbusState::Initialising));

    frontend.set_state(XenbusState::Initialising);
    assert!(frontend.wait_backend_state(XenbusState::InitWait));

    frontend.set_state(XenbusState::InitWait);
    assert!(wait_until(WAIT_TIMEOUT, || {
        backend.frontend(1, 0).map(|h| h.frontend_state()) == Some(XenbusState::InitWait)
    }));

    frontend.publish_ring(8, 13);
    frontend.set_state(XenbusState::Initialised);
    assert!(frontend.wait_backend_state(XenbusState::Connected));
    assert_eq!(backend.frontend(1, 0).map(|h| h.channel_count()), Some(1));

    frontend.set_state(XenbusState::Connected);
    assert!(wait_until(WAIT_TIMEOUT, || {
        backend
            .frontend(1, 0)
            .is_some_and(|h| h.with_device(|device| device.connected.load(Ordering::SeqCst)))
    }));

    let ring = backend.factory().handle(1, 0);
    frontend.set_state(XenbusState::Closing);
    assert!(frontend.wait_backend_state(XenbusState::Closed));
    assert!(ring.is_released());
    assert_eq!(backend.frontend(1, 0).map(|h| h.channel_count()), Some(0));

    // Closed without channels: housekeeping drops the handler.
    frontend.set_state(XenbusState::Closed);
    assert!(frontend.wait_backend_state(XenbusState::InitWait));
    assert!(wait_until(WAIT_TIMEOUT, || backend.frontend_count() == 0));
    assert!(!backend.watches().is_watched(&info.frontend_state_path));

    // Reconnect: the frontend starts over and a new handler binds a new ring.
    frontend.set_state(XenbusState::Initialising);
    backend.add_frontend(1, 0).unwrap();
    frontend.set_state(XenbusState::Initialised);
    assert!(frontend.wait_backend_state(XenbusState::Connected));
    assert_eq!(backend.frontend(1, 0).map(|h| h.channel_count()), Some(1));
    assert!(!backend.factory().handle(1, 0).is_released());

    backend.stop();
}

#[test]
fn test_missing_ring_config_closes_without_connecting() {
    let (_mem, backend) = start_backend();
    let frontend = Frontend::new(backend.store().clone(), 2, 0);
    let seen = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = seen.clone();
        let store = backend.store().clone();
        let info = backend.add_frontend(2, 0).unwrap();
        let path = info.backend_state_path.clone();
        backend
            .watches()
            .set_watch(
                &info.backend_state_path,
                Arc::new(move || {
                    if let Ok(value) = store.read_uint(&path) {
                        seen.lock().push(value);
                    }
                }),
                false,
            )
            .unwrap();
    }

    frontend.set_state(XenbusState::Initialised);

    assert!(frontend.wait_backend_state(XenbusState::Closing));
    assert_eq!(backend.frontend(2, 0).map(|h| h.channel_count()), Some(0));
    assert!(!seen.lock().contains(&XenbusState::Connected.code()));

    frontend.set_state(XenbusState::Closing);
    assert!(frontend.wait_backend_state(XenbusState::Closed));
    assert!(!seen.lock().contains(&XenbusState::Connected.code()));
    backend.stop();
}

#[test]
fn test_terminated_frontend_is_removed() {
    let (_mem, backend) = start_backend();
    backend.add_frontend(3, 0).unwrap();
    let frontend = Frontend::new(backend.store().clone(), 3, 0);
    frontend.publish_ring(1, 2);
    frontend.set_state(XenbusState::Initialised);
    assert!(frontend.wait_backend_state(XenbusState::Connected));

    let ring = backend.factory().handle(3, 0);
    ring.terminate();

    assert!(wait_until(WAIT_TIMEOUT, || backend.frontend_count() == 0));
    assert!(ring.is_released());
    backend.stop();
}
