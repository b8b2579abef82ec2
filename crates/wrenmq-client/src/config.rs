//! Engine configuration.

use std::path::PathBuf;
use std::time::Duration;

use wrenmq_core::validate::MAX_MESSAGE_SIZE;

/// Protocol-level configuration, passed to the engine at construction.
///
/// Every engine carries its own copy; there is no process-wide settings
/// object.
#[derive(Debug, Clone)]
pub struct ProtocolConfig {
    /// Default broker port for plaintext connections.
    pub port: u16,
    /// Default broker port for TLS connections.
    pub secure_port: u16,
    /// Keep-alive interval advertised in CONNECT, in seconds.
    pub keep_alive_secs: u16,
    /// How long a pending request may wait for its response.
    pub network_timeout: Duration,
    /// Upper bound on the remaining length of any packet, in or out.
    pub max_message_size: usize,
    /// Retry budget carried on pending entries. 0 means no retransmission.
    pub max_retry_count: u32,
    /// Read-poll granularity of the reference transport's receiver thread.
    pub receiver_poll_interval: Duration,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            port: 1883,
            secure_port: 8883,
            keep_alive_secs: 60,
            network_timeout: Duration::from_secs(20),
            max_message_size: MAX_MESSAGE_SIZE,
            max_retry_count: 0,
            receiver_poll_interval: Duration::from_millis(100),
        }
    }
}

impl ProtocolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn secure_port(mut self, port: u16) -> Self {
        self.secure_port = port;
        self
    }

    pub fn keep_alive_secs(mut self, secs: u16) -> Self {
        self.keep_alive_secs = secs;
        self
    }

    pub fn network_timeout(mut self, timeout: Duration) -> Self {
        self.network_timeout = timeout;
        self
    }

    pub fn max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    pub fn max_retry_count(mut self, count: u32) -> Self {
        self.max_retry_count = count;
        self
    }

    pub fn receiver_poll_interval(mut self, interval: Duration) -> Self {
        self.receiver_poll_interval = interval;
        self
    }

    /// Keep-alive interval as a [`Duration`].
    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.keep_alive_secs))
    }
}

/// TLS configuration for the reference transport.
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    /// Custom CA certificate (PEM). When absent, the bundled webpki roots
    /// are used.
    pub ca_cert: Option<PathBuf>,
    /// Client certificate for mutual TLS (PEM).
    pub client_cert: Option<PathBuf>,
    /// Private key matching `client_cert` (PEM).
    pub client_key: Option<PathBuf>,
    /// Override the server name used for certificate verification.
    pub server_name: Option<String>,
    /// Skip certificate verification. Only for testing against
    /// self-signed brokers.
    pub accept_invalid_certs: bool,
}
