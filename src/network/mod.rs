//! Connectivity tracking.
//!
//! The host feeds connectivity signals through a [`ConnectivityObserver`]
//! (pushed over a channel or polled with a [`Probe`]); the [`NetworkMonitor`]
//! turns them into a [`NetworkState`] and publishes recovery and loss events.

mod monitor;
mod observer;
mod probe;
mod state;

pub use monitor::{NetworkHandle, NetworkMonitor};
pub use observer::{ChannelObserver, ConnectivityObserver, PollingObserver, SignalSender};
pub use probe::{HttpProbe, Probe, StaticProbe};
pub use state::{ConnectionQuality, ConnectivitySignal, DataSource, NetworkEvent, NetworkState};
