//! One hundred frontends sharing a single watch dispatcher, added and removed
//! from several threads while state changes keep flowing.

use std::thread;

use xen_be::XenbusState;

use crate::common::start_backend;
use crate::common::wait_until;
use crate::common::Frontend;
use crate::common::WAIT_TIMEOUT;

const FRONTENDS: u16 = 100;
const WORKERS: u16 = 4;

fn key(dev_id: u16) -> (u16, u16) {
    (dev_id / 10 + 1, dev_id % 10)
}

#[test]
fn test_hundred_frontends_connect_and_close() {
    let (_mem, backend) = start_backend();
    let store = backend.store().clone();

    thread::scope(|s| {
        for worker in 0..WORKERS {
            let backend = &backend;
            let store = store.clone();
            s.spawn(move || {
                for dev_id in (worker..FRONTENDS).step_by(WORKERS as usize) {
                    let (dom, dev) = key(dev_id);
                    let frontend = Frontend::new(store.clone(), dom, dev);

                    backend.add_frontend(dom, dev).unwrap();
                    frontend.publish_ring(u32::from(dev_id), u32::from(dev_id) + 1000);
                    frontend.set_state(XenbusState::Initialised);
                    assert!(frontend.wait_backend_state(XenbusState::Connected), "{dom}/{dev} never connected");

                    if dev_id % 5 == 0 {
                        assert!(backend.remove_frontend(dom, dev));
                        assert!(backend.factory().handle(dom, dev).is_released());
                        backend.add_frontend(dom, dev).unwrap();
                        assert!(frontend.wait_backend_state(XenbusState::Connected), "{dom}/{dev} never reconnected");
                    }
                    assert_eq!(backend.frontend(dom, dev).map(|h| h.channel_count()), Some(1));

                    frontend.set_state(XenbusState::Closing);
                    assert!(frontend.wait_backend_state(XenbusState::Closed));
                    frontend.set_state(XenbusState::Closed);

                    // Housekeeping only ever drops terminated frontends.
                    assert!(wait_until(WAIT_TIMEOUT, || backend
                        .frontend(dom, dev)
                        .map_or(true, |h| h.is_terminated())));
                }
            });
        }
    });

    assert!(wait_until(WAIT_TIMEOUT, || backend.frontend_count() == 0));
    assert_eq!(backend.watches().watch_count(), 0);
    assert!(backend.is_running());
    backend.stop();
}

#[test]
fn test_adds_and_removes_race_with_state_changes() {
    let (_mem, backend) = start_backend();
    let store = backend.store().clone();

    thread::scope(|s| {
        for worker in 0..WORKERS {
            let backend = &backend;
            let store = store.clone();
            s.spawn(move || {
                let (dom, dev) = (worker + 1, 0);
                let frontend = Frontend::new(store, dom, dev);
                for round in 0..20 {
                    backend.add_frontend(dom, dev).unwrap();
                    let state = if round % 2 == 0 {
                        XenbusState::Initialising
                    } else {
                        XenbusState::InitWait
                    };
                    frontend.set_state(state);
                    assert!(backend.remove_frontend(dom, dev));
                }

                // The last registration must still follow the frontend.
                backend.add_frontend(dom, dev).unwrap();
                frontend.set_state(XenbusState::Initialising);
                assert!(frontend.wait_backend_state(XenbusState::InitWait));
                frontend.set_state(XenbusState::Closed);
                assert!(wait_until(WAIT_TIMEOUT, || backend
                    .frontend(dom, dev)
                    .map_or(true, |h| h.is_terminated())));
            });
        }
    });

    assert!(wait_until(WAIT_TIMEOUT, || backend.frontend_count() == 0));
    assert_eq!(backend.watches().watch_count(), 0);
    backend.stop();
}
