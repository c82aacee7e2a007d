//! Modbus TCP client
//!
//! One TCP connection, many concurrent logical requests. A background
//! reader task pulls frames off the socket and routes each response to the
//! caller waiting on its transaction id; callers suspend on a oneshot
//! channel until their response arrives, the timeout fires, or the
//! connection dies.

use async_trait::async_trait;
use bytes::BytesMut;
use log::{debug, trace, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

use crate::constants::{
    DEFAULT_TCP_PORT, EXCEPTION_FLAG, MAX_PDU_SIZE, MAX_READ_REGISTERS, MAX_WRITE_REGISTERS,
};
use crate::error::{ModbusError, ModbusResult};
use crate::frame;
use crate::pdu::{self, ExceptionCode, FunctionCode};

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModbusTcpClientConfig {
    pub host: String,
    pub port: u16,
    /// Unit id used by callers that do not pick their own
    pub unit_id: u8,
    /// Default per-request timeout, also bounds the initial connect
    pub timeout: Duration,
}

impl Default for ModbusTcpClientConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_TCP_PORT,
            unit_id: 1,
            timeout: Duration::from_secs(1),
        }
    }
}

/// Register operations every Modbus client flavour exposes
#[async_trait]
pub trait ModbusClient: Send + Sync {
    async fn read_holding_registers(
        &self,
        unit_id: u8,
        start: u16,
        quantity: u16,
        timeout: Option<Duration>,
    ) -> ModbusResult<Vec<u16>>;

    async fn read_input_registers(
        &self,
        unit_id: u8,
        start: u16,
        quantity: u16,
        timeout: Option<Duration>,
    ) -> ModbusResult<Vec<u16>>;

    async fn write_register(
        &self,
        unit_id: u8,
        address: u16,
        value: u16,
        timeout: Option<Duration>,
    ) -> ModbusResult<()>;

    async fn write_registers(
        &self,
        unit_id: u8,
        start: u16,
        values: &[u16],
        timeout: Option<Duration>,
    ) -> ModbusResult<()>;
}

type Waiter = oneshot::Sender<ModbusResult<(u8, Vec<u8>)>>;

/// Wait-table shared between callers and the reader task
struct TransactionTable {
    next_id: u16,
    pending: HashMap<u16, Waiter>,
}

impl TransactionTable {
    fn new() -> Self {
        Self {
            next_id: 0,
            pending: HashMap::new(),
        }
    }

    /// Next free transaction id, skipping ids still in flight
    fn allocate(&mut self) -> ModbusResult<u16> {
        for _ in 0..=u16::MAX {
            let id = self.next_id;
            self.next_id = self.next_id.wrapping_add(1);
            if !self.pending.contains_key(&id) {
                return Ok(id);
            }
        }
        Err(ModbusError::Connection(
            "all transaction ids in flight".to_string(),
        ))
    }

    fn fail_all(&mut self, reason: &str) {
        for (_, waiter) in self.pending.drain() {
            let _ = waiter.send(Err(ModbusError::Connection(reason.to_string())));
        }
    }
}

/// Modbus TCP client handle
pub struct ModbusTcpClient {
    config: ModbusTcpClientConfig,
    writer: Mutex<OwnedWriteHalf>,
    table: Arc<Mutex<TransactionTable>>,
    reader_task: JoinHandle<()>,
}

impl ModbusTcpClient {
    /// Connect to the configured server, bounded by the configured timeout
    pub async fn connect(config: ModbusTcpClientConfig) -> ModbusResult<Self> {
        let addr = format!("{}:{}", config.host, config.port);
        let stream = tokio::time::timeout(config.timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| ModbusError::Timeout(config.timeout))?
            .map_err(|e| ModbusError::Connection(format!("connect to {addr} failed: {e}")))?;
        let _ = stream.set_nodelay(true);
        debug!("Connected to {addr}");

        let (read_half, write_half) = stream.into_split();
        let table = Arc::new(Mutex::new(TransactionTable::new()));
        let reader_task = tokio::spawn(reader_loop(read_half, Arc::clone(&table)));

        Ok(Self {
            config,
            writer: Mutex::new(write_half),
            table,
            reader_task,
        })
    }

    pub fn config(&self) -> &ModbusTcpClientConfig {
        &self.config
    }

    /// Send one request PDU and wait for the matching response payload.
    ///
    /// Allocates a fresh transaction id, writes the framed request and
    /// suspends until the reader task delivers the response with the same
    /// id. The returned bytes are the response payload after the function
    /// code; exception responses surface as [`ModbusError::Exception`].
    pub async fn send(
        &self,
        unit_id: u8,
        function_code: u8,
        payload: &[u8],
        timeout: Duration,
    ) -> ModbusResult<Vec<u8>> {
        if payload.len() + 1 > MAX_PDU_SIZE {
            return Err(ModbusError::InvalidArgument(format!(
                "PDU would be {} bytes, limit is {MAX_PDU_SIZE}",
                payload.len() + 1
            )));
        }

        let (transaction_id, response_rx) = {
            let mut table = self.table.lock().await;
            let transaction_id = table.allocate()?;
            let (tx, rx) = oneshot::channel();
            table.pending.insert(transaction_id, tx);
            (transaction_id, rx)
        };

        let request = frame::encode_request(unit_id, transaction_id, function_code, payload);
        trace!("Request tx={transaction_id}: {}", hex::encode(&request));

        {
            let mut writer = self.writer.lock().await;
            if let Err(e) = writer.write_all(&request).await {
                self.table.lock().await.pending.remove(&transaction_id);
                return Err(ModbusError::Connection(e.to_string()));
            }
        }

        let (response_fc, response_payload) =
            match tokio::time::timeout(timeout, response_rx).await {
                Ok(Ok(delivered)) => delivered?,
                // Waiter dropped without a value, reader task is gone
                Ok(Err(_)) => {
                    return Err(ModbusError::Connection("client closed".to_string()));
                }
                Err(_) => {
                    self.table.lock().await.pending.remove(&transaction_id);
                    debug!("Request tx={transaction_id} timed out after {timeout:?}");
                    return Err(ModbusError::Timeout(timeout));
                }
            };

        if response_fc == (function_code | EXCEPTION_FLAG) {
            let code_byte = response_payload.first().copied().ok_or_else(|| {
                ModbusError::MalformedFrame("exception response missing code byte".to_string())
            })?;
            let code = ExceptionCode::try_from(code_byte)?;
            warn!("Request tx={transaction_id} failed: {code}");
            return Err(ModbusError::Exception(code));
        }
        if response_fc != function_code {
            return Err(ModbusError::MalformedFrame(format!(
                "response function code 0x{response_fc:02X} does not match request 0x{function_code:02X}"
            )));
        }

        Ok(response_payload)
    }

    /// Tear the connection down. Pending requests fail with a connection
    /// error. Safe to call more than once.
    pub async fn close(&self) {
        self.reader_task.abort();
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
        self.table.lock().await.fail_all("client closed");
        debug!("Connection to {}:{} closed", self.config.host, self.config.port);
    }

    fn effective_timeout(&self, timeout: Option<Duration>) -> Duration {
        timeout.unwrap_or(self.config.timeout)
    }
}

impl Drop for ModbusTcpClient {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

#[async_trait]
impl ModbusClient for ModbusTcpClient {
    async fn read_holding_registers(
        &self,
        unit_id: u8,
        start: u16,
        quantity: u16,
        timeout: Option<Duration>,
    ) -> ModbusResult<Vec<u16>> {
        check_read_quantity(quantity)?;
        let request = pdu::build_read_request(FunctionCode::ReadHoldingRegisters, start, quantity);
        let response = self
            .send(unit_id, request[0], &request[1..], self.effective_timeout(timeout))
            .await?;
        pdu::parse_read_response(&response, quantity)
    }

    async fn read_input_registers(
        &self,
        unit_id: u8,
        start: u16,
        quantity: u16,
        timeout: Option<Duration>,
    ) -> ModbusResult<Vec<u16>> {
        check_read_quantity(quantity)?;
        let request = pdu::build_read_request(FunctionCode::ReadInputRegisters, start, quantity);
        let response = self
            .send(unit_id, request[0], &request[1..], self.effective_timeout(timeout))
            .await?;
        pdu::parse_read_response(&response, quantity)
    }

    async fn write_register(
        &self,
        unit_id: u8,
        address: u16,
        value: u16,
        timeout: Option<Duration>,
    ) -> ModbusResult<()> {
        let request = pdu::build_write_single_request(address, value);
        let response = self
            .send(unit_id, request[0], &request[1..], self.effective_timeout(timeout))
            .await?;

        let echo = pdu::parse_write_single_request(&response)?;
        if echo.address != address || echo.value != value {
            return Err(ModbusError::MalformedFrame(
                "write echo does not match request".to_string(),
            ));
        }
        Ok(())
    }

    async fn write_registers(
        &self,
        unit_id: u8,
        start: u16,
        values: &[u16],
        timeout: Option<Duration>,
    ) -> ModbusResult<()> {
        if values.is_empty() || values.len() > MAX_WRITE_REGISTERS as usize {
            return Err(ModbusError::InvalidArgument(format!(
                "write quantity {} outside 1..={MAX_WRITE_REGISTERS}",
                values.len()
            )));
        }

        let request = pdu::build_write_multiple_request(start, values);
        let response = self
            .send(unit_id, request[0], &request[1..], self.effective_timeout(timeout))
            .await?;

        if response.len() != 4 {
            return Err(ModbusError::MalformedFrame(
                "short write response".to_string(),
            ));
        }
        let echo_start = u16::from_be_bytes([response[0], response[1]]);
        let echo_quantity = u16::from_be_bytes([response[2], response[3]]);
        if echo_start != start || echo_quantity as usize != values.len() {
            return Err(ModbusError::MalformedFrame(
                "write echo does not match request".to_string(),
            ));
        }
        Ok(())
    }
}

fn check_read_quantity(quantity: u16) -> ModbusResult<()> {
    if quantity == 0 || quantity > MAX_READ_REGISTERS {
        return Err(ModbusError::InvalidArgument(format!(
            "read quantity {quantity} outside 1..={MAX_READ_REGISTERS}"
        )));
    }
    Ok(())
}

/// Pull frames off the socket and route each to its waiter.
///
/// Responses whose transaction id has no waiter (late arrivals after a
/// timeout) are logged and dropped. Any fatal condition fails every
/// pending transaction before the task exits.
async fn reader_loop(mut reader: OwnedReadHalf, table: Arc<Mutex<TransactionTable>>) {
    let mut buffer = BytesMut::with_capacity(512);

    let reason = 'conn: loop {
        loop {
            match frame::complete_frame_len(&buffer) {
                Ok(Some(frame_len)) => {
                    let adu = buffer.split_to(frame_len);
                    if let Err(e) = deliver(&table, &adu).await {
                        break 'conn e.to_string();
                    }
                }
                Ok(None) => break,
                Err(e) => break 'conn e.to_string(),
            }
        }

        match reader.read_buf(&mut buffer).await {
            Ok(0) => break "connection closed by peer".to_string(),
            Ok(_) => {}
            Err(e) => break e.to_string(),
        }
    };

    debug!("Reader task stopping: {reason}");
    table.lock().await.fail_all(&reason);
}

async fn deliver(table: &Mutex<TransactionTable>, adu: &[u8]) -> ModbusResult<()> {
    let (header, function_code, payload) = frame::decode_frame(adu)?;
    trace!("Response tx={}: {}", header.transaction_id, hex::encode(adu));

    let mut table = table.lock().await;
    match table.pending.remove(&header.transaction_id) {
        Some(waiter) => {
            let _ = waiter.send(Ok((function_code, payload)));
        }
        None => {
            debug!(
                "Discarding response with unknown transaction id {}",
                header.transaction_id
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ModbusTcpClientConfig::default();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 502);
        assert_eq!(config.unit_id, 1);
        assert_eq!(config.timeout, Duration::from_secs(1));
    }

    #[test]
    fn test_transaction_id_allocation_skips_in_flight() {
        let mut table = TransactionTable::new();
        assert_eq!(table.allocate().unwrap(), 0);
        assert_eq!(table.allocate().unwrap(), 1);

        // Park a waiter on the id about to come up
        let (tx, _rx) = oneshot::channel();
        table.pending.insert(2, tx);
        assert_eq!(table.allocate().unwrap(), 3);
    }

    #[test]
    fn test_transaction_id_wraps() {
        let mut table = TransactionTable::new();
        table.next_id = u16::MAX;
        assert_eq!(table.allocate().unwrap(), u16::MAX);
        assert_eq!(table.allocate().unwrap(), 0);
    }

    #[test]
    fn test_fail_all_drains_waiters() {
        let mut table = TransactionTable::new();
        let (tx, mut rx) = oneshot::channel();
        table.pending.insert(7, tx);

        table.fail_all("gone");
        assert!(table.pending.is_empty());
        match rx.try_recv() {
            Ok(Err(ModbusError::Connection(msg))) => assert_eq!(msg, "gone"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_read_quantity_validation() {
        assert!(check_read_quantity(1).is_ok());
        assert!(check_read_quantity(125).is_ok());
        assert!(check_read_quantity(0).is_err());
        assert!(check_read_quantity(126).is_err());
    }
}
