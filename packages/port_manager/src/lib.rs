//! Port Manager - serial connection lifecycle and newline framing
//!
//! Tracks every open serial connection in a terminal session, keeps them on one
//! baud rate, and turns their byte streams into trimmed text lines. The OS
//! serial interface sits behind [`SerialTransport`]; enable the `serial`
//! feature for a `serialport`-backed implementation.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use port_manager::{LoopbackTransport, PortConfig, PortEvent, PortManager};
//!
//! #[tokio::main]
//! async fn main() {
//!     let transport = LoopbackTransport::new();
//!     let device = transport.device("/dev/ttyUSB0");
//!     let manager = PortManager::new(Arc::new(transport));
//!
//!     let mut rx = manager.subscribe();
//!     let id = manager
//!         .open(PortConfig {
//!             path: "/dev/ttyUSB0".to_string(),
//!             baud_rate: 9600,
//!         })
//!         .await
//!         .unwrap();
//!
//!     device.push("temp=21.5\n");
//!     manager.write_line("status").await.unwrap();
//!
//!     while let Ok(event) = rx.recv().await {
//!         if let PortEvent::Line { id: from, text, .. } = event {
//!             println!("{}: {}", from, text);
//!             break;
//!         }
//!     }
//!     manager.close(id).await;
//! }
//! ```

mod error;
pub mod framer;
mod manager;
pub mod port;
pub mod transport;

pub use error::PortError;
pub use framer::LineFramer;
pub use manager::{CloseReason, PortEvent, PortId, PortInfo, PortManager};
pub use port::{PortConfig, PortHandle, PortOutput, PortState};
#[cfg(feature = "serial")]
pub use transport::{SerialPortTransport, available_ports};
pub use transport::{LoopbackDevice, LoopbackTransport, SerialStreams, SerialTransport};
