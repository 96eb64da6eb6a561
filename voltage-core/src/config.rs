//! Centralized configuration for Voltage.
//!
//! All tunable parameters and settings are defined here to avoid
//! hard-coded values scattered throughout the codebase.

use std::str::FromStr;
use std::time::Duration;

/// Central configuration for all Voltage components.
///
/// Groups related configuration settings into logical sections.
/// Supports environment variable overrides for runtime customization.
#[derive(Debug, Clone, Default)]
pub struct VoltageConfig {
    pub torrent: TorrentConfig,
    pub network: NetworkConfig,
    pub storage: StorageConfig,
}

/// BitTorrent protocol-specific configuration.
///
/// Controls peer identity and how block requests are sized and pipelined.
#[derive(Debug, Clone)]
pub struct TorrentConfig {
    /// BitTorrent client identifier
    pub client_id: &'static str,
    /// Size of a single block request
    pub request_chunk_size: u32,
    /// Requests kept outstanding per peer
    pub max_requests_in_flight: usize,
}

impl Default for TorrentConfig {
    fn default() -> Self {
        Self {
            client_id: "-VT0001-",
            request_chunk_size: 16384, // 16 KiB
            max_requests_in_flight: 5,
        }
    }
}

/// Network communication and tracker configuration.
///
/// Controls tracker timeouts and retry pacing, peer connection limits and
/// the readiness wait of the event loop.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// HTTP request timeout for tracker communication
    pub tracker_timeout: Duration,
    /// Delay before retrying a tracker after an announce attempt
    pub tracker_retry_interval: Duration,
    /// User agent for HTTP requests
    pub user_agent: &'static str,
    /// Maximum concurrent peer connections
    pub max_peer_connections: usize,
    /// Upper bound of a single readiness wait
    pub poll_timeout: Duration,
    /// Receive buffer for tracker datagrams
    pub udp_receive_buffer: usize,
    /// How long a UDP tracker connection id stays valid
    pub udp_connection_lifetime: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            tracker_timeout: Duration::from_secs(30),
            tracker_retry_interval: Duration::from_secs(180),
            user_agent: "voltage/0.1.0",
            max_peer_connections: 20,
            poll_timeout: Duration::from_millis(50),
            udp_receive_buffer: 4096,
            udp_connection_lifetime: Duration::from_secs(60),
        }
    }
}

/// Piece cache and disk I/O configuration.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Memory available to buffered pieces in bytes (None = unbounded)
    pub memory_budget: Option<u64>,
    /// Period between forced flushes of every buffered piece
    pub force_flush_interval: Duration,
    /// Open file handles kept cached
    pub max_open_files: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            memory_budget: None,
            force_flush_interval: Duration::from_secs(30),
            max_open_files: 64,
        }
    }
}

impl VoltageConfig {
    /// Creates configuration with environment variable overrides.
    ///
    /// Allows runtime configuration via environment variables while
    /// maintaining sensible defaults. Unparseable values are ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(seconds) = env_value::<u64>("VOLTAGE_TRACKER_TIMEOUT") {
            config.network.tracker_timeout = Duration::from_secs(seconds);
        }

        if let Some(count) = env_value::<usize>("VOLTAGE_MAX_PEERS") {
            config.network.max_peer_connections = count;
        }

        if let Some(bytes) = env_value::<u64>("VOLTAGE_MEMORY_BUDGET") {
            config.storage.memory_budget = Some(bytes);
        }

        if let Some(seconds) = env_value::<u64>("VOLTAGE_FLUSH_INTERVAL") {
            config.storage.force_flush_interval = Duration::from_secs(seconds);
        }

        config
    }

    /// Creates a configuration optimized for testing.
    pub fn for_testing() -> Self {
        Self {
            network: NetworkConfig {
                tracker_timeout: Duration::from_secs(2),
                poll_timeout: Duration::from_millis(10),
                ..Default::default()
            },
            storage: StorageConfig {
                max_open_files: 4,
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

fn env_value<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let config = VoltageConfig::default();

        assert_eq!(config.torrent.client_id, "-VT0001-");
        assert_eq!(config.torrent.request_chunk_size, 16384);
        assert_eq!(config.torrent.max_requests_in_flight, 5);
        assert_eq!(config.network.max_peer_connections, 20);
        assert_eq!(config.network.poll_timeout, Duration::from_millis(50));
        assert_eq!(config.network.tracker_retry_interval, Duration::from_secs(180));
        assert_eq!(config.storage.memory_budget, None);
        assert_eq!(config.storage.force_flush_interval, Duration::from_secs(30));
        assert_eq!(config.storage.max_open_files, 64);
    }

    #[test]
    fn test_testing_preset() {
        let config = VoltageConfig::for_testing();
        assert!(config.network.poll_timeout < NetworkConfig::default().poll_timeout);
        assert_eq!(config.torrent.max_requests_in_flight, 5);
    }

    #[test]
    fn test_env_override() {
        unsafe {
            std::env::set_var("VOLTAGE_TRACKER_TIMEOUT", "60");
            std::env::set_var("VOLTAGE_MAX_PEERS", "8");
            std::env::set_var("VOLTAGE_MEMORY_BUDGET", "67108864");
            std::env::set_var("VOLTAGE_FLUSH_INTERVAL", "not-a-number");
        }

        let config = VoltageConfig::from_env();

        assert_eq!(config.network.tracker_timeout, Duration::from_secs(60));
        assert_eq!(config.network.max_peer_connections, 8);
        assert_eq!(config.storage.memory_budget, Some(64 * 1024 * 1024));
        assert_eq!(config.storage.force_flush_interval, Duration::from_secs(30));

        unsafe {
            std::env::remove_var("VOLTAGE_TRACKER_TIMEOUT");
            std::env::remove_var("VOLTAGE_MAX_PEERS");
            std::env::remove_var("VOLTAGE_MEMORY_BUDGET");
            std::env::remove_var("VOLTAGE_FLUSH_INTERVAL");
        }
    }
}
