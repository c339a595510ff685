//! Connectivity state model

use serde::{Deserialize, Serialize};
use std::fmt;

/// Physical link reported by the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
    Wifi,
    Cellular,
    Ethernet,
    None,
    Unknown,
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Wifi => "wifi",
            Self::Cellular => "cellular",
            Self::Ethernet => "ethernet",
            Self::None => "none",
            Self::Unknown => "unknown",
        };
        f.write_str(label)
    }
}

/// Coarse link quality, used to size drain batches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkQuality {
    Good,
    Degraded,
    Poor,
}

impl NetworkQuality {
    /// Batch size to request for a caller-provided maximum
    pub fn batch_size(self, max: usize) -> usize {
        match self {
            Self::Good => max,
            Self::Degraded => (max / 2).max(1).min(max),
            Self::Poor => max.min(1),
        }
    }
}

/// Snapshot of connectivity
///
/// Invariants: `is_internet_reachable => is_online` and
/// `is_online => connection_type != None`. Use [`NetworkState::normalized`]
/// to enforce them on platform-supplied values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkState {
    pub is_online: bool,
    pub is_internet_reachable: bool,
    pub connection_type: ConnectionType,
    pub last_online_time: Option<i64>,
    pub last_offline_time: Option<i64>,
}

impl NetworkState {
    /// Conservative default when the platform cannot tell us anything
    pub const fn assumed_online() -> Self {
        Self {
            is_online: true,
            is_internet_reachable: false,
            connection_type: ConnectionType::Unknown,
            last_online_time: None,
            last_offline_time: None,
        }
    }

    pub const fn offline() -> Self {
        Self {
            is_online: false,
            is_internet_reachable: false,
            connection_type: ConnectionType::None,
            last_online_time: None,
            last_offline_time: None,
        }
    }

    pub const fn online(connection_type: ConnectionType) -> Self {
        Self {
            is_online: true,
            is_internet_reachable: true,
            connection_type,
            last_online_time: None,
            last_offline_time: None,
        }
    }

    /// Repair values that violate the state invariants
    #[must_use]
    pub fn normalized(mut self) -> Self {
        if self.connection_type == ConnectionType::None {
            self.is_online = false;
        }
        if !self.is_online {
            self.is_internet_reachable = false;
        }
        self
    }

    /// Compare connectivity, ignoring transition timestamps
    pub fn same_connectivity(&self, other: &Self) -> bool {
        self.is_online == other.is_online
            && self.is_internet_reachable == other.is_internet_reachable
            && self.connection_type == other.connection_type
    }

    pub const fn quality(&self) -> NetworkQuality {
        if !self.is_online {
            return NetworkQuality::Poor;
        }
        match self.connection_type {
            ConnectionType::Wifi | ConnectionType::Ethernet if self.is_internet_reachable => {
                NetworkQuality::Good
            }
            ConnectionType::Cellular | ConnectionType::Unknown => NetworkQuality::Degraded,
            _ => NetworkQuality::Poor,
        }
    }
}

impl Default for NetworkState {
    fn default() -> Self {
        Self::assumed_online()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalized_enforces_invariants() {
        let state = NetworkState {
            is_online: true,
            is_internet_reachable: true,
            connection_type: ConnectionType::None,
            last_online_time: None,
            last_offline_time: None,
        }
        .normalized();
        assert!(!state.is_online);
        assert!(!state.is_internet_reachable);
    }

    #[test]
    fn default_is_optimistic() {
        let state = NetworkState::default();
        assert!(state.is_online);
        assert_eq!(state.connection_type, ConnectionType::Unknown);
    }

    #[test]
    fn quality_follows_link_type() {
        assert_eq!(
            NetworkState::online(ConnectionType::Wifi).quality(),
            NetworkQuality::Good
        );
        assert_eq!(
            NetworkState::online(ConnectionType::Cellular).quality(),
            NetworkQuality::Degraded
        );
        assert_eq!(NetworkState::assumed_online().quality(), NetworkQuality::Degraded);

        let mut captive = NetworkState::online(ConnectionType::Wifi);
        captive.is_internet_reachable = false;
        assert_eq!(captive.quality(), NetworkQuality::Poor);
    }

    #[test]
    fn batch_size_shrinks_with_quality() {
        assert_eq!(NetworkQuality::Good.batch_size(10), 10);
        assert_eq!(NetworkQuality::Degraded.batch_size(10), 5);
        assert_eq!(NetworkQuality::Degraded.batch_size(1), 1);
        assert_eq!(NetworkQuality::Poor.batch_size(10), 1);
        assert_eq!(NetworkQuality::Poor.batch_size(0), 0);
    }
}
