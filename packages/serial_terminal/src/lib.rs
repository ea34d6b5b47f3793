//! Serial Terminal - multi-port serial console with relay sync
//!
//! Lines read from any open device are logged and published to a relay so
//! other viewers see them; lines other viewers publish are shown here. A shared
//! [`relay_protocol::DedupCache`] keeps a body from being shown or published
//! twice when it comes back around through the relay.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use port_manager::{LoopbackTransport, PortManager};
//! use relay_protocol::DedupCache;
//! use serial_terminal::{RelayClient, TerminalSession};
//! use tokio::sync::Mutex;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let transport = LoopbackTransport::new();
//!     let _device = transport.device("/dev/ttyUSB0");
//!     let ports = Arc::new(PortManager::new(Arc::new(transport)));
//!
//!     let dedup = Arc::new(Mutex::new(DedupCache::unbounded()));
//!     let relay = RelayClient::connect("ws://127.0.0.1:3000/ws", dedup).await?;
//!
//!     let session = Arc::new(TerminalSession::new(ports, Some(relay)));
//!     session.set_baud_rate(9600);
//!     session.connect("/dev/ttyUSB0").await?;
//!     session.send("status").await?;
//!
//!     session.run(CancellationToken::new()).await;
//!     Ok(())
//! }
//! ```

mod error;
pub mod messages;
pub mod relay_client;
pub mod session;

pub use error::{RelayClientError, SessionError};
pub use messages::{ExportedMessage, LoggedMessage, MessageKind, MessageLog, MessageSource};
pub use relay_client::{RelayClient, RelayEvent};
pub use session::{DEFAULT_BAUD_RATE, SessionEvent, TerminalSession};
