//! Reusable test doubles for remora test suites.
//!
//! # Key Types
//!
//! - [`EchoHandler`], [`DelayHandler`], [`FailingHandler`], [`PanickingHandler`]:
//!   server handlers with fixed behavior
//! - [`CallbackSourceHandler`]: keeps registered callback listeners and emits
//!   callbacks to them on demand
//! - [`RecordingConnectionListener`], [`RecordingCallbackHandler`]: capture
//!   what was delivered, with async waits for tests
//!
//! Call [`init_tracing`] at the top of a test to see logs with `RUST_LOG`.

pub mod handlers;
pub mod recorders;

pub use handlers::CallbackSourceHandler;
pub use handlers::DelayHandler;
pub use handlers::EchoHandler;
pub use handlers::FailingHandler;
pub use handlers::PanickingHandler;
pub use recorders::RecordingCallbackHandler;
pub use recorders::RecordingConnectionListener;

/// Install a test subscriber filtered by `RUST_LOG` (default `remora=info`).
/// Safe to call from every test.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("remora=info,remora_lease=info,remora_client=info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_test_writer().try_init();
}
