//! Modbus TCP server
//!
//! A listener that accepts TCP connections and serves register requests
//! from a shared [`DataStore`]. Each connection runs its own session task;
//! shutdown is signalled over a watch channel and in-flight sessions get a
//! bounded grace period to finish before being aborted.

use bytes::BytesMut;
use log::{debug, info, trace, warn};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};

use crate::constants::{
    DEFAULT_TCP_PORT, EXCEPTION_FLAG, MAX_READ_REGISTERS, MAX_WRITE_REGISTERS,
};
use crate::error::{ModbusError, ModbusResult};
use crate::frame;
use crate::pdu::{self, ExceptionCode, FunctionCode};
use crate::store::DataStore;

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModbusTcpServerConfig {
    /// Address to listen on
    pub bind_address: String,
    /// Holding register bank size
    pub holding_register_count: u16,
    /// Input register bank size
    pub input_register_count: u16,
    /// Advertised unit identifier. Requests are served whatever unit id
    /// they carry; the id in the request is echoed back.
    pub unit_id: u8,
    /// Maximum concurrent client connections
    pub max_connections: usize,
    /// How long to wait for sessions to drain on shutdown
    pub shutdown_grace: Duration,
}

impl Default for ModbusTcpServerConfig {
    fn default() -> Self {
        Self {
            bind_address: format!("0.0.0.0:{DEFAULT_TCP_PORT}"),
            holding_register_count: 100,
            input_register_count: 100,
            unit_id: 1,
            max_connections: 10,
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

/// Snapshot of server counters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerStats {
    pub total_requests: u64,
    pub successful_responses: u64,
    pub exception_responses: u64,
    pub connected_clients: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
}

#[derive(Debug, Default)]
struct StatsInner {
    total_requests: AtomicU64,
    successful_responses: AtomicU64,
    exception_responses: AtomicU64,
    connected_clients: AtomicU64,
    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,
}

impl StatsInner {
    fn snapshot(&self) -> ServerStats {
        ServerStats {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            successful_responses: self.successful_responses.load(Ordering::Relaxed),
            exception_responses: self.exception_responses.load(Ordering::Relaxed),
            connected_clients: self.connected_clients.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
        }
    }
}

/// Modbus TCP server instance
pub struct ModbusTcpServer {
    config: ModbusTcpServerConfig,
    store: Arc<DataStore>,
    stats: Arc<StatsInner>,
    shutdown_tx: watch::Sender<bool>,
    accept_task: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

impl ModbusTcpServer {
    pub fn new(config: ModbusTcpServerConfig) -> Self {
        let store = Arc::new(DataStore::new(
            config.holding_register_count,
            config.input_register_count,
        ));
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            store,
            stats: Arc::new(StatsInner::default()),
            shutdown_tx,
            accept_task: None,
            local_addr: None,
        }
    }

    /// Shared register store, for host-side reads and writes
    pub fn store(&self) -> Arc<DataStore> {
        Arc::clone(&self.store)
    }

    /// Current counter snapshot
    pub fn stats(&self) -> ServerStats {
        self.stats.snapshot()
    }

    /// Address the listener is bound to, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Bind the listener and start accepting connections.
    ///
    /// Returns the bound address, which matters when the configured port
    /// is 0.
    pub async fn start(&mut self) -> ModbusResult<SocketAddr> {
        if self.accept_task.is_some() {
            return Err(ModbusError::InvalidArgument(
                "server already started".to_string(),
            ));
        }

        let listener = TcpListener::bind(&self.config.bind_address)
            .await
            .map_err(|e| ModbusError::Bind(format!("{}: {e}", self.config.bind_address)))?;
        let local_addr = listener.local_addr().map_err(|e| ModbusError::Bind(e.to_string()))?;
        info!(
            "Modbus TCP server listening on {local_addr} (unit {})",
            self.config.unit_id
        );

        self.local_addr = Some(local_addr);
        let store = Arc::clone(&self.store);
        let stats = Arc::clone(&self.stats);
        let shutdown_rx = self.shutdown_tx.subscribe();
        let max_connections = self.config.max_connections;
        let shutdown_grace = self.config.shutdown_grace;

        self.accept_task = Some(tokio::spawn(accept_loop(
            listener,
            store,
            stats,
            shutdown_rx,
            max_connections,
            shutdown_grace,
        )));

        Ok(local_addr)
    }

    /// Stop accepting, drain sessions within the grace period, then abort
    /// whatever is left. Safe to call more than once.
    pub async fn stop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.accept_task.take() {
            if let Err(e) = task.await {
                warn!("Accept loop task failed: {e}");
            }
        }
        info!("Modbus TCP server stopped");
    }
}

async fn accept_loop(
    listener: TcpListener,
    store: Arc<DataStore>,
    stats: Arc<StatsInner>,
    mut shutdown_rx: watch::Receiver<bool>,
    max_connections: usize,
    shutdown_grace: Duration,
) {
    let mut sessions: JoinSet<()> = JoinSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        // Reap finished sessions so the count stays accurate
                        while sessions.try_join_next().is_some() {}

                        if sessions.len() >= max_connections {
                            warn!("Connection limit ({max_connections}) reached, dropping {peer}");
                            drop(stream);
                            continue;
                        }

                        debug!("Client connected: {peer}");
                        stats.connected_clients.fetch_add(1, Ordering::Relaxed);
                        let store = Arc::clone(&store);
                        let stats = Arc::clone(&stats);
                        let shutdown_rx = shutdown_rx.clone();
                        sessions.spawn(async move {
                            if let Err(e) = run_session(stream, peer, &store, &stats, shutdown_rx).await {
                                debug!("Session {peer} ended: {e}");
                            }
                            stats.connected_clients.fetch_sub(1, Ordering::Relaxed);
                            debug!("Client disconnected: {peer}");
                        });
                    }
                    Err(e) => {
                        warn!("Accept failed: {e}");
                    }
                }
            }
            _ = shutdown_rx.changed() => {
                break;
            }
        }
    }

    drop(listener);
    if sessions.is_empty() {
        return;
    }

    info!("Waiting up to {shutdown_grace:?} for {} session(s) to drain", sessions.len());
    let deadline = tokio::time::sleep(shutdown_grace);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            joined = sessions.join_next() => {
                if joined.is_none() {
                    break;
                }
            }
            _ = &mut deadline => {
                warn!("Shutdown grace expired, aborting {} session(s)", sessions.len());
                sessions.abort_all();
                while sessions.join_next().await.is_some() {}
                break;
            }
        }
    }
}

async fn run_session(
    mut stream: TcpStream,
    peer: SocketAddr,
    store: &DataStore,
    stats: &StatsInner,
    mut shutdown_rx: watch::Receiver<bool>,
) -> ModbusResult<()> {
    let mut buffer = BytesMut::with_capacity(512);

    loop {
        // Drain every complete frame already buffered before reading more
        while let Some(frame_len) = frame::complete_frame_len(&buffer)? {
            let adu = buffer.split_to(frame_len);
            handle_frame(&mut stream, &adu, store, stats).await?;
        }

        tokio::select! {
            read = stream.read_buf(&mut buffer) => {
                let n = read?;
                if n == 0 {
                    return Ok(());
                }
                stats.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
            }
            _ = shutdown_rx.changed() => {
                debug!("Shutdown requested, closing session {peer}");
                let _ = stream.shutdown().await;
                return Ok(());
            }
        }
    }
}

async fn handle_frame(
    stream: &mut TcpStream,
    adu: &[u8],
    store: &DataStore,
    stats: &StatsInner,
) -> ModbusResult<()> {
    let (header, function_code, payload) = frame::decode_frame(adu)?;
    trace!(
        "Request tx={} unit={}: {}",
        header.transaction_id,
        header.unit_id,
        hex::encode(adu)
    );

    stats.total_requests.fetch_add(1, Ordering::Relaxed);
    let response_pdu = dispatch(store, function_code, &payload);
    if response_pdu
        .first()
        .is_some_and(|fc| fc & EXCEPTION_FLAG != 0)
    {
        stats.exception_responses.fetch_add(1, Ordering::Relaxed);
    } else {
        stats.successful_responses.fetch_add(1, Ordering::Relaxed);
    }

    let response = frame::encode_frame(header.transaction_id, header.unit_id, &response_pdu);
    trace!("Response tx={}: {}", header.transaction_id, hex::encode(&response));
    stream.write_all(&response).await?;
    stats
        .bytes_sent
        .fetch_add(response.len() as u64, Ordering::Relaxed);
    Ok(())
}

/// Execute one request against the store, producing a response PDU.
///
/// Store and validation failures become exception responses here; only
/// transport-level problems propagate to the session loop.
fn dispatch(store: &DataStore, raw_fc: u8, payload: &[u8]) -> Vec<u8> {
    match execute(store, raw_fc, payload) {
        Ok(response) => response,
        Err(e) => {
            let code = e.exception_code().unwrap_or(ExceptionCode::ServerDeviceFailure);
            debug!("Request fc=0x{raw_fc:02X} rejected: {e}");
            pdu::build_exception(raw_fc, code)
        }
    }
}

fn execute(store: &DataStore, raw_fc: u8, payload: &[u8]) -> ModbusResult<Vec<u8>> {
    let function_code = FunctionCode::try_from(raw_fc)?;

    match function_code {
        FunctionCode::ReadHoldingRegisters | FunctionCode::ReadInputRegisters => {
            let request = pdu::parse_read_request(payload)?;
            if request.quantity == 0 || request.quantity > MAX_READ_REGISTERS {
                return Err(ModbusError::Exception(ExceptionCode::IllegalDataValue));
            }
            let values = match function_code {
                FunctionCode::ReadHoldingRegisters => {
                    store.read_holding(request.start_address, request.quantity)?
                }
                _ => store.read_input(request.start_address, request.quantity)?,
            };
            Ok(pdu::build_read_response(function_code, &values))
        }
        FunctionCode::WriteSingleRegister => {
            let request = pdu::parse_write_single_request(payload)?;
            store.write_holding(request.address, &[request.value])?;
            Ok(pdu::build_write_single_response(request.address, request.value))
        }
        FunctionCode::WriteMultipleRegisters => {
            let request = pdu::parse_write_multiple_request(payload)?;
            if request.quantity == 0 || request.quantity > MAX_WRITE_REGISTERS {
                return Err(ModbusError::Exception(ExceptionCode::IllegalDataValue));
            }
            store.write_holding(request.start_address, &request.values)?;
            Ok(pdu::build_write_multiple_response(
                request.start_address,
                request.quantity,
            ))
        }
    }
}
