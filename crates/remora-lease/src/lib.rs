//! Liveness tracking for remora.
//!
//! - [`TimerService`]: the shared timer facility every periodic task runs on
//! - [`Lease`]: server-side countdown for one remote client
//! - [`LeasePinger`]: client-side batching refresher for one physical invoker
//! - [`ConnectionNotifier`] / [`ConnectionListener`]: connection-lost fan-out

pub mod lease;
pub mod notifier;
pub mod pinger;
pub mod timer;

pub use lease::Lease;
pub use lease::LeasePhase;
pub use notifier::ConnectionListener;
pub use notifier::ConnectionLostEvent;
pub use notifier::ConnectionNotifier;
pub use notifier::LossCause;
pub use notifier::same_listener;
pub use pinger::LeasePinger;
pub use pinger::PingSender;
pub use timer::TickOutcome;
pub use timer::TimerService;
pub use timer::TimerTask;
