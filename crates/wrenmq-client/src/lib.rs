//! MQTT 3.1 client protocol engine.
//!
//! The engine drives the packet-level protocol against any [`Transport`]:
//! session lifecycle, QoS 1/2 handshakes in both directions, pending-request
//! timeouts, keep-alive, and subscription dispatch. Completions are
//! delivered on channels, one per category.
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use wrenmq_client::{
//!     ConnectOptions, Encryption, ProtocolConfig, ProtocolEngine, QoS, TcpTransport, Token,
//! };
//!
//! let config = ProtocolConfig::default();
//! let transport = Arc::new(TcpTransport::new(&config, Default::default()));
//! let (engine, events) = ProtocolEngine::new(config, transport);
//!
//! engine.connect(
//!     ConnectOptions::new("sensor-7"),
//!     "broker.example.com",
//!     1883,
//!     Encryption::None,
//!     Token(1),
//! )?;
//! let connected = events
//!     .connect_complete
//!     .recv_timeout(Duration::from_secs(30))
//!     .expect("connect outcome");
//! connected.result?;
//!
//! engine.subscribe(
//!     "sensors/+/temp",
//!     QoS::AtLeastOnce,
//!     Token(2),
//!     Arc::new(|publish| println!("{}: {:?}", publish.topic, publish.payload)),
//! )?;
//! # Ok::<(), wrenmq_client::ClientError>(())
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod store;
pub mod subscription;
pub mod timer;
pub mod tls;
pub mod transport;

pub use config::{ProtocolConfig, TlsConfig};
pub use engine::{ConnectOptions, ProtocolEngine};
pub use error::{ClientError, Result};
pub use events::{
    ConnectComplete, EngineEvents, NetworkError, SendComplete, SessionId, SessionState,
    SubscribeComplete, Token,
};
pub use subscription::PublishHandler;
pub use transport::{Encryption, ReceiveCallback, TcpTransport, Transport};
pub use wrenmq_core::packet::{ConnectReturnCode, Publish, QoS, Will};
