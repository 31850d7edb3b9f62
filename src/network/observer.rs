use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Interval, MissedTickBehavior};

use super::probe::Probe;
use super::state::ConnectivitySignal;

/// Source of connectivity signals. `None` means the source is gone.
pub trait ConnectivityObserver: Send {
  fn next_signal(&mut self) -> BoxFuture<'_, Option<ConnectivitySignal>>;
}

/// Push-style observer fed through a channel.
pub struct ChannelObserver {
  rx: mpsc::UnboundedReceiver<ConnectivitySignal>,
}

/// Sending half of a [`ChannelObserver`].
#[derive(Clone)]
pub struct SignalSender {
  tx: mpsc::UnboundedSender<ConnectivitySignal>,
}

impl SignalSender {
  /// Returns false once the observer has been dropped.
  pub fn send(&self, signal: ConnectivitySignal) -> bool {
    self.tx.send(signal).is_ok()
  }

  pub fn online(&self) -> bool {
    self.send(ConnectivitySignal::Online)
  }

  pub fn offline(&self) -> bool {
    self.send(ConnectivitySignal::Offline)
  }
}

impl ChannelObserver {
  pub fn new() -> (SignalSender, Self) {
    let (tx, rx) = mpsc::unbounded_channel();
    (SignalSender { tx }, Self { rx })
  }
}

impl ConnectivityObserver for ChannelObserver {
  fn next_signal(&mut self) -> BoxFuture<'_, Option<ConnectivitySignal>> {
    Box::pin(self.rx.recv())
  }
}

/// Poll-style observer: runs a probe periodically and reports changes.
pub struct PollingObserver {
  probe: Arc<dyn Probe>,
  ticker: Interval,
  last: Option<bool>,
}

impl PollingObserver {
  pub fn new(probe: Arc<dyn Probe>, every: Duration) -> Self {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    Self {
      probe,
      ticker,
      last: None,
    }
  }
}

impl ConnectivityObserver for PollingObserver {
  fn next_signal(&mut self) -> BoxFuture<'_, Option<ConnectivitySignal>> {
    Box::pin(async move {
      loop {
        self.ticker.tick().await;
        let reachable = self.probe.check().await;
        if self.last != Some(reachable) {
          self.last = Some(reachable);
          return Some(if reachable {
            ConnectivitySignal::Online
          } else {
            ConnectivitySignal::Offline
          });
        }
      }
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicBool, Ordering};

  struct FlagProbe(AtomicBool);

  impl Probe for FlagProbe {
    fn check(&self) -> BoxFuture<'_, bool> {
      let up = self.0.load(Ordering::SeqCst);
      Box::pin(async move { up })
    }
  }

  #[tokio::test(start_paused = true)]
  async fn test_polling_reports_only_changes() {
    let probe = Arc::new(FlagProbe(AtomicBool::new(true)));
    let mut observer = PollingObserver::new(probe.clone(), Duration::from_secs(1));

    assert_eq!(observer.next_signal().await, Some(ConnectivitySignal::Online));

    let next = tokio::spawn(async move {
      let signal = observer.next_signal().await;
      (signal, tokio::time::Instant::now())
    });
    let started = tokio::time::Instant::now();
    tokio::time::sleep(Duration::from_millis(3500)).await;
    probe.0.store(false, Ordering::SeqCst);

    let (signal, at) = next.await.unwrap();
    assert_eq!(signal, Some(ConnectivitySignal::Offline));
    assert!(at - started >= Duration::from_secs(4));
  }

  #[tokio::test]
  async fn test_channel_observer_ends_with_sender() {
    let (sender, mut observer) = ChannelObserver::new();
    assert!(sender.online());
    drop(sender);
    assert_eq!(observer.next_signal().await, Some(ConnectivitySignal::Online));
    assert_eq!(observer.next_signal().await, None);
  }
}
