use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

use crate::network::{NetworkEvent, NetworkHandle};
use crate::sync::{SyncController, SyncEvent};

/// Application events
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
  /// Connectivity transition
  Network(NetworkEvent),
  /// Progress of a queue drain or retry
  Sync(SyncEvent),
  /// Periodic tick for status refresh
  Tick,
}

/// Merges network and sync notifications into one stream
pub struct EventHandler {
  rx: mpsc::UnboundedReceiver<Event>,
}

impl EventHandler {
  /// Create a new event handler, optionally ticking at `tick_rate`
  pub fn new(network: &NetworkHandle, sync: &SyncController, tick_rate: Option<Duration>) -> Self {
    let (tx, rx) = mpsc::unbounded_channel();

    forward(network.subscribe(), tx.clone(), Event::Network);
    forward(sync.subscribe(), tx.clone(), Event::Sync);

    if let Some(rate) = tick_rate {
      tokio::spawn(async move {
        let mut ticker = tokio::time::interval(rate);
        ticker.tick().await;
        loop {
          ticker.tick().await;
          if tx.send(Event::Tick).is_err() {
            break;
          }
        }
      });
    }

    Self { rx }
  }

  /// Receive the next event
  pub async fn next(&mut self) -> Option<Event> {
    self.rx.recv().await
  }
}

fn forward<T>(
  mut source: broadcast::Receiver<T>,
  tx: mpsc::UnboundedSender<Event>,
  wrap: fn(T) -> Event,
) where
  T: Clone + Send + 'static,
{
  tokio::spawn(async move {
    loop {
      match source.recv().await {
        Ok(event) => {
          if tx.send(wrap(event)).is_err() {
            break;
          }
        }
        Err(broadcast::error::RecvError::Lagged(missed)) => {
          tracing::warn!(missed, "Event consumer fell behind");
        }
        Err(broadcast::error::RecvError::Closed) => break,
      }
    }
  });
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::http::testing::ScriptedFetcher;
  use crate::network::{ChannelObserver, NetworkMonitor};
  use crate::queue::MutationQueue;
  use crate::sync::SyncConfig;
  use std::sync::Arc;

  #[tokio::test(start_paused = true)]
  async fn test_merges_network_and_sync_events() {
    let (signals, observer) = ChannelObserver::new();
    let (monitor, network) =
      NetworkMonitor::new(Box::new(observer), None, Duration::from_millis(500), true);
    monitor.spawn();
    let sync = SyncController::new(
      Arc::new(MutationQueue::open_in_memory().unwrap()),
      Arc::new(ScriptedFetcher::offline()),
      network.clone(),
      SyncConfig::default(),
    );
    let mut events = EventHandler::new(&network, &sync, None);

    sync.trigger_sync().await.unwrap();
    assert_eq!(events.next().await, Some(Event::Sync(SyncEvent::Started)));
    assert!(matches!(
      events.next().await,
      Some(Event::Sync(SyncEvent::Completed(report))) if report.results.is_empty()
    ));

    signals.offline();
    assert_eq!(events.next().await, Some(Event::Network(NetworkEvent::Lost)));
  }

  #[tokio::test(start_paused = true)]
  async fn test_ticks() {
    let (_signals, observer) = ChannelObserver::new();
    let (_monitor, network) =
      NetworkMonitor::new(Box::new(observer), None, Duration::from_millis(500), true);
    let sync = SyncController::new(
      Arc::new(MutationQueue::open_in_memory().unwrap()),
      Arc::new(ScriptedFetcher::offline()),
      network.clone(),
      SyncConfig::default(),
    );
    let mut events = EventHandler::new(&network, &sync, Some(Duration::from_secs(1)));
    assert_eq!(events.next().await, Some(Event::Tick));
  }
}
