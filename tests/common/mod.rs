//! Shared fixtures for the integration tests.
//!
//! Every test runs against `DeterministicBackend`; the helpers here build
//! the small catalogs and coordinators the tests share.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use waypoint::Coordinator;
use waypoint::DeterministicBackend;
use waypoint::ServiceFragment;
use waypoint::WaypointConfig;
use waypoint::config::WatchConfig;

/// Upper bound on any single await in a test.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_env_filter("waypoint=debug").with_test_writer().try_init();
}

/// Config with a short long-poll wait so idle watches cycle quickly.
pub fn test_config() -> WaypointConfig {
    WaypointConfig {
        watch: WatchConfig {
            wait_ms: 2_000,
            channel_capacity: 8,
        },
        ..WaypointConfig::default()
    }
}

pub fn setup() -> (Arc<DeterministicBackend>, Coordinator) {
    init_tracing();
    let backend = DeterministicBackend::new();
    let coordinator = Coordinator::new(backend.clone(), test_config());
    (backend, coordinator)
}

/// n1 {web 10.0.0.1:8080}, n2 {web 10.0.0.2:8080, db 10.0.0.3:5432}
pub fn register_web_and_db(backend: &DeterministicBackend) {
    backend.register_service("n1", "web-1", ServiceFragment::new("web", "10.0.0.1", 8080).with_tags(["v1"]));
    backend.register_service("n2", "web-2", ServiceFragment::new("web", "10.0.0.2", 8080).with_tags(["v1"]));
    backend.register_service("n2", "db-1", ServiceFragment::new("db", "10.0.0.3", 5432));
}

/// Await `fut`, failing the test if it takes longer than [`TEST_TIMEOUT`].
pub async fn within<F: std::future::Future>(fut: F) -> F::Output {
    match tokio::time::timeout(TEST_TIMEOUT, fut).await {
        Ok(output) => output,
        Err(_) => panic!("timed out after {TEST_TIMEOUT:?}"),
    }
}
