//! Backend shutdown, explicit and after losing the store.

use xen_be::XenbusState;

use crate::common::start_backend;
use crate::common::wait_until;
use crate::common::Frontend;
use crate::common::WAIT_TIMEOUT;

#[test]
fn test_stop_releases_connected_frontends() {
    let (_mem, backend) = start_backend();
    backend.add_frontend(1, 0).unwrap();
    let frontend = Frontend::new(backend.store().clone(), 1, 0);
    frontend.publish_ring(8, 13);
    frontend.set_state(XenbusState::Initialised);
    assert!(frontend.wait_backend_state(XenbusState::Connected));
    let ring = backend.factory().handle(1, 0);

    backend.stop();

    assert!(ring.is_released());
    assert_eq!(backend.frontend_count(), 0);
    assert!(!backend.is_running());
    assert!(!backend.watches().is_running());
}

#[test]
fn test_store_loss_stops_backend() {
    let (mem, backend) = start_backend();
    backend.add_frontend(1, 0).unwrap();
    backend.add_frontend(1, 1).unwrap();

    mem.disconnect();

    assert!(wait_until(WAIT_TIMEOUT, || backend.frontend_count() == 0));
    assert!(wait_until(WAIT_TIMEOUT, || !backend.is_running()));
    assert!(!backend.watches().is_running());
}
