//! # mbtcp
//!
//! A from-scratch Modbus TCP engine: MBAP frame codec, register PDU
//! handling, an in-memory register store, a multi-connection async server
//! and a client with concurrent transaction correlation.
//!
//! ## Quick start
//!
//! ```no_run
//! use mbtcp::{
//!     ModbusClient, ModbusTcpClient, ModbusTcpClientConfig, ModbusTcpServer,
//!     ModbusTcpServerConfig,
//! };
//!
//! #[tokio::main]
//! async fn main() -> mbtcp::ModbusResult<()> {
//!     let mut server = ModbusTcpServer::new(ModbusTcpServerConfig {
//!         bind_address: "127.0.0.1:5020".to_string(),
//!         ..Default::default()
//!     });
//!     server.start().await?;
//!
//!     let client = ModbusTcpClient::connect(ModbusTcpClientConfig {
//!         port: 5020,
//!         ..Default::default()
//!     })
//!     .await?;
//!
//!     client.write_registers(1, 0, &[123, 456], None).await?;
//!     let values = client.read_holding_registers(1, 0, 4, None).await?;
//!     assert_eq!(values, vec![123, 456, 0, 0]);
//!
//!     client.close().await;
//!     server.stop().await;
//!     Ok(())
//! }
//! ```

/// Protocol constants (sizes, limits, function codes)
pub mod constants;

/// Error types
pub mod error;

/// MBAP frame encoding and decoding
pub mod frame;

/// PDU parsing and building
pub mod pdu;

/// In-memory register store
pub mod store;

/// TCP server
pub mod server;

/// TCP client
pub mod client;

// Re-export the commonly used types
pub use client::{ModbusClient, ModbusTcpClient, ModbusTcpClientConfig};
pub use constants::DEFAULT_TCP_PORT;
pub use error::{ModbusError, ModbusResult};
pub use frame::MbapHeader;
pub use pdu::{ExceptionCode, FunctionCode};
pub use server::{ModbusTcpServer, ModbusTcpServerConfig, ServerStats};
pub use store::DataStore;
