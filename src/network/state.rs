use chrono::{DateTime, Utc};
use serde::Serialize;

/// Advisory connection quality. Never gates behavior.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionQuality {
  #[default]
  Unknown,
  Poor,
  Fair,
  Good,
}

impl ConnectionQuality {
  /// Map an effective connection type ("4g", "3g", ...) to a quality.
  pub fn from_effective_type(effective_type: &str) -> Self {
    match effective_type.trim().to_ascii_lowercase().as_str() {
      "4g" => Self::Good,
      "3g" => Self::Fair,
      "2g" | "slow-2g" => Self::Poor,
      _ => Self::Unknown,
    }
  }
}

/// Where the application should read data from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DataSource {
  Network,
  Cache,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NetworkState {
  pub is_online: bool,
  pub quality: ConnectionQuality,
  /// Always `Cache` while offline
  pub data_source: DataSource,
  pub last_transition_at: DateTime<Utc>,
}

impl NetworkState {
  pub fn online(quality: ConnectionQuality, at: DateTime<Utc>) -> Self {
    Self {
      is_online: true,
      quality,
      data_source: DataSource::Network,
      last_transition_at: at,
    }
  }

  pub fn offline(quality: ConnectionQuality, at: DateTime<Utc>) -> Self {
    Self {
      is_online: false,
      quality,
      data_source: DataSource::Cache,
      last_transition_at: at,
    }
  }
}

/// Transitions published by the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkEvent {
  /// Connectivity confirmed after the stabilization delay
  Recovered,
  Lost,
  QualityChanged(ConnectionQuality),
}

/// Raw input from the host runtime or a poller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectivitySignal {
  Online,
  Offline,
  /// Effective connection type, e.g. "4g"
  Quality(String),
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_effective_type_mapping() {
    assert_eq!(ConnectionQuality::from_effective_type("4g"), ConnectionQuality::Good);
    assert_eq!(ConnectionQuality::from_effective_type("3G"), ConnectionQuality::Fair);
    assert_eq!(ConnectionQuality::from_effective_type("2g"), ConnectionQuality::Poor);
    assert_eq!(ConnectionQuality::from_effective_type("slow-2g"), ConnectionQuality::Poor);
    assert_eq!(ConnectionQuality::from_effective_type("wifi"), ConnectionQuality::Unknown);
  }

  #[test]
  fn test_offline_state_reads_from_cache() {
    let state = NetworkState::offline(ConnectionQuality::Good, Utc::now());
    assert!(!state.is_online);
    assert_eq!(state.data_source, DataSource::Cache);
  }
}
