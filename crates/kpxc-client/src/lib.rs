//! Client for the KeePassXC browser integration, spoken through
//! `keepassxc-proxy`.
//!
//! Layers, bottom up:
//!
//! - [`secure_memory`]: page-protected buffers for every secret we hold.
//! - [`crypto`]: NaCl box over those buffers.
//! - [`codec`] and [`channel`]: framing, key exchange and the nonce-checked
//!   request/reply layer.
//! - [`transport`]: the proxy child process.
//! - [`session`]: database pairing and the commands an application uses.
//!
//! ```no_run
//! use kpxc_client::{Client, ClientConfig, ClientEvent, CryptoInit, MemoryRegistry};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let init = CryptoInit::init()?;
//! let mut client = Client::new(init, &ClientConfig::from_env(), Box::new(MemoryRegistry::new()));
//! client.connect();
//! while let Some(event) = client.next_event().await {
//!     if let ClientEvent::DatabaseOpened(_) = event {
//!         client.generate_password();
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod codec;
pub mod config;
pub mod crypto;
pub mod entry;
pub mod error;
pub mod paths;
pub mod protocol;
pub mod registry;
pub mod secure_memory;
pub mod session;
pub mod transport;

pub use config::{ClientConfig, ClientOptions};
pub use crypto::{CryptoBox, CryptoError, CryptoInit};
pub use entry::Entry;
pub use error::{ClientError, ErrorEvent};
pub use protocol::ProxyErrorCode;
pub use registry::{ClientId, DatabaseRegistry, FileRegistry, MemoryRegistry, RegistryError};
pub use secure_memory::{MemoryError, MemoryState, SecureBuffer};
pub use session::{Client, ClientEvent, ClientState, LoginQuery, Session};
pub use transport::{Link, Transport, TransportEvent};
