//! Network state monitor actor.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::observer::ConnectivityObserver;
use super::probe::Probe;
use super::state::{ConnectionQuality, ConnectivitySignal, NetworkEvent, NetworkState};

const EVENT_CAPACITY: usize = 64;
const MIN_RECONFIRM_DELAY: Duration = Duration::from_millis(500);
const MAX_RECONFIRM_DELAY: Duration = Duration::from_secs(30);

/// Owns the connectivity state machine.
///
/// Offline transitions take effect immediately. An online signal only becomes a
/// recovery after the stabilization delay passes without a contrary signal and,
/// if a probe is configured, the probe confirms the server is reachable. An
/// unconfirmed signal is re-probed with a growing delay until it confirms or
/// an offline signal arrives.
pub struct NetworkMonitor {
  observer: Box<dyn ConnectivityObserver>,
  probe: Option<Arc<dyn Probe>>,
  stabilization: Duration,
  state: watch::Sender<NetworkState>,
  events: broadcast::Sender<NetworkEvent>,
}

/// Read side of the monitor, cheap to clone.
#[derive(Clone)]
pub struct NetworkHandle {
  state: watch::Receiver<NetworkState>,
  events: broadcast::Sender<NetworkEvent>,
}

impl NetworkHandle {
  pub fn is_online(&self) -> bool {
    self.state.borrow().is_online
  }

  pub fn state(&self) -> NetworkState {
    self.state.borrow().clone()
  }

  pub fn subscribe(&self) -> broadcast::Receiver<NetworkEvent> {
    self.events.subscribe()
  }

  /// Watch channel that changes with every state update.
  pub fn watch(&self) -> watch::Receiver<NetworkState> {
    self.state.clone()
  }
}

impl NetworkMonitor {
  pub fn new(
    observer: Box<dyn ConnectivityObserver>,
    probe: Option<Arc<dyn Probe>>,
    stabilization: Duration,
    initially_online: bool,
  ) -> (Self, NetworkHandle) {
    let now = Utc::now();
    let initial = if initially_online {
      NetworkState::online(ConnectionQuality::Unknown, now)
    } else {
      NetworkState::offline(ConnectionQuality::Unknown, now)
    };
    let (state, state_rx) = watch::channel(initial);
    let (events, _) = broadcast::channel(EVENT_CAPACITY);

    let handle = NetworkHandle {
      state: state_rx,
      events: events.clone(),
    };
    let monitor = Self {
      observer,
      probe,
      stabilization,
      state,
      events,
    };
    (monitor, handle)
  }

  pub fn spawn(self) -> JoinHandle<()> {
    tokio::spawn(self.run())
  }

  /// Process signals until the observer goes away.
  pub async fn run(mut self) {
    let mut recovery_at: Option<Instant> = None;
    let mut unconfirmed: u32 = 0;

    loop {
      let deadline = recovery_at;
      tokio::select! {
        signal = self.observer.next_signal() => match signal {
          Some(ConnectivitySignal::Online) => {
            if !self.is_online() && recovery_at.is_none() {
              tracing::debug!(delay = ?self.stabilization, "Online signal, waiting for stabilization");
              recovery_at = Some(Instant::now() + self.stabilization);
            }
          }
          Some(ConnectivitySignal::Offline) => {
            recovery_at = None;
            unconfirmed = 0;
            if self.is_online() {
              self.go_offline();
            }
          }
          Some(ConnectivitySignal::Quality(effective_type)) => {
            self.set_quality(ConnectionQuality::from_effective_type(&effective_type));
          }
          None => {
            tracing::debug!("Connectivity observer closed, stopping network monitor");
            break;
          }
        },
        _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
          recovery_at = None;
          if confirm(self.probe.clone()).await {
            unconfirmed = 0;
            self.go_online();
          } else {
            // The online signal will not repeat, so keep checking
            unconfirmed = unconfirmed.saturating_add(1);
            let delay = self.reconfirm_delay(unconfirmed);
            tracing::info!(?delay, "Online signal not confirmed by probe, checking again");
            recovery_at = Some(Instant::now() + delay);
          }
        }
      }
    }
  }

  /// Wait before re-probing after `failures` unconfirmed attempts.
  fn reconfirm_delay(&self, failures: u32) -> Duration {
    let factor = 1u32 << failures.min(16);
    self
      .stabilization
      .max(MIN_RECONFIRM_DELAY)
      .saturating_mul(factor)
      .min(MAX_RECONFIRM_DELAY)
  }

  fn is_online(&self) -> bool {
    self.state.borrow().is_online
  }

  fn go_online(&self) {
    self.state.send_modify(|state| {
      *state = NetworkState::online(state.quality, Utc::now());
    });
    tracing::info!("Network recovered, reading from network");
    let _ = self.events.send(NetworkEvent::Recovered);
  }

  fn go_offline(&self) {
    self.state.send_modify(|state| {
      *state = NetworkState::offline(state.quality, Utc::now());
    });
    tracing::info!("Network lost, reading from cache");
    let _ = self.events.send(NetworkEvent::Lost);
  }

  fn set_quality(&self, quality: ConnectionQuality) {
    let changed = self.state.send_if_modified(|state| {
      if state.quality == quality {
        return false;
      }
      state.quality = quality;
      true
    });
    if changed {
      tracing::debug!(?quality, "Connection quality changed");
      let _ = self.events.send(NetworkEvent::QualityChanged(quality));
    }
  }
}

async fn confirm(probe: Option<Arc<dyn Probe>>) -> bool {
  match probe {
    Some(probe) => probe.check().await,
    None => true,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::network::observer::{ChannelObserver, SignalSender};
  use crate::network::probe::StaticProbe;
  use crate::network::state::DataSource;
  use futures::future::BoxFuture;
  use std::sync::atomic::{AtomicUsize, Ordering};

  const STABILIZE: Duration = Duration::from_millis(500);

  fn start(
    probe: Option<Arc<dyn Probe>>,
    online: bool,
  ) -> (SignalSender, NetworkHandle, JoinHandle<()>) {
    let (sender, observer) = ChannelObserver::new();
    let (monitor, handle) = NetworkMonitor::new(Box::new(observer), probe, STABILIZE, online);
    (sender, handle, monitor.spawn())
  }

  #[tokio::test(start_paused = true)]
  async fn test_recovery_waits_for_stabilization() {
    let (signals, network, _task) = start(None, false);
    let mut events = network.subscribe();
    assert_eq!(network.state().data_source, DataSource::Cache);

    signals.online();
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(!network.is_online());

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(network.is_online());
    assert_eq!(network.state().data_source, DataSource::Network);
    assert_eq!(events.recv().await.unwrap(), NetworkEvent::Recovered);
  }

  #[tokio::test(start_paused = true)]
  async fn test_offline_during_stabilization_cancels_recovery() {
    let (signals, network, _task) = start(None, false);
    let mut events = network.subscribe();

    signals.online();
    tokio::time::sleep(Duration::from_millis(200)).await;
    signals.offline();
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert!(!network.is_online());
    assert!(events.try_recv().is_err());
  }

  #[tokio::test(start_paused = true)]
  async fn test_loss_is_immediate() {
    let (signals, network, _task) = start(None, true);
    let mut events = network.subscribe();

    signals.offline();
    assert_eq!(events.recv().await.unwrap(), NetworkEvent::Lost);
    let state = network.state();
    assert!(!state.is_online);
    assert_eq!(state.data_source, DataSource::Cache);
  }

  #[tokio::test(start_paused = true)]
  async fn test_failed_probe_blocks_recovery() {
    let (signals, network, _task) = start(Some(Arc::new(StaticProbe(false))), false);

    signals.online();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(!network.is_online());
  }

  /// Unreachable for the first `failures` checks.
  struct FlakyProbe {
    failures: AtomicUsize,
  }

  impl Probe for FlakyProbe {
    fn check(&self) -> BoxFuture<'_, bool> {
      let reachable = self
        .failures
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_err();
      Box::pin(async move { reachable })
    }
  }

  #[tokio::test(start_paused = true)]
  async fn test_unconfirmed_recovery_is_rechecked() {
    let probe = Arc::new(FlakyProbe {
      failures: AtomicUsize::new(1),
    });
    let (signals, network, _task) = start(Some(probe), false);
    let mut events = network.subscribe();

    // One online signal only; the first check fails, the recheck succeeds
    signals.online();
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(!network.is_online());

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(network.is_online());
    assert_eq!(events.recv().await.unwrap(), NetworkEvent::Recovered);
  }

  #[tokio::test(start_paused = true)]
  async fn test_offline_signal_stops_rechecks() {
    let probe = Arc::new(FlakyProbe {
      failures: AtomicUsize::new(1),
    });
    let (signals, network, _task) = start(Some(probe), false);

    signals.online();
    tokio::time::sleep(Duration::from_millis(600)).await;
    signals.offline();
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(!network.is_online());
  }

  #[tokio::test(start_paused = true)]
  async fn test_quality_changes_are_published_once() {
    let (signals, network, _task) = start(None, true);
    let mut events = network.subscribe();

    signals.send(ConnectivitySignal::Quality("3g".into()));
    signals.send(ConnectivitySignal::Quality("3g".into()));
    signals.send(ConnectivitySignal::Quality("4g".into()));

    assert_eq!(
      events.recv().await.unwrap(),
      NetworkEvent::QualityChanged(ConnectionQuality::Fair)
    );
    assert_eq!(
      events.recv().await.unwrap(),
      NetworkEvent::QualityChanged(ConnectionQuality::Good)
    );
    assert_eq!(network.state().quality, ConnectionQuality::Good);
  }

  #[tokio::test(start_paused = true)]
  async fn test_monitor_stops_when_observer_closes() {
    let (signals, _network, task) = start(None, true);
    drop(signals);
    task.await.unwrap();
  }
}
