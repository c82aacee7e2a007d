//! End-to-end client/server scenarios over real TCP sockets.
//!
//! Servers bind 127.0.0.1:0 so tests never collide on a port. A few tests
//! stand in a hand-rolled raw socket for one side to force conditions a
//! well-behaved peer never produces (stalls, reordered responses, bad
//! protocol ids).

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use mbtcp::{
    frame, pdu, ExceptionCode, FunctionCode, ModbusClient, ModbusError, ModbusTcpClient,
    ModbusTcpClientConfig, ModbusTcpServer, ModbusTcpServerConfig,
};

async fn start_server(holding: u16, input: u16) -> (ModbusTcpServer, SocketAddr) {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut server = ModbusTcpServer::new(ModbusTcpServerConfig {
        bind_address: "127.0.0.1:0".to_string(),
        holding_register_count: holding,
        input_register_count: input,
        ..Default::default()
    });
    let addr = server.start().await.unwrap();
    (server, addr)
}

async fn connect(addr: SocketAddr) -> ModbusTcpClient {
    ModbusTcpClient::connect(ModbusTcpClientConfig {
        host: addr.ip().to_string(),
        port: addr.port(),
        ..Default::default()
    })
    .await
    .unwrap()
}

#[tokio::test]
async fn write_then_read_holding_registers() {
    let (mut server, addr) = start_server(16, 0).await;
    let client = connect(addr).await;

    client.write_registers(1, 0, &[123, 456], None).await.unwrap();
    let values = client.read_holding_registers(1, 0, 4, None).await.unwrap();
    assert_eq!(values, vec![123, 456, 0, 0]);

    client.close().await;
    server.stop().await;
}

#[tokio::test]
async fn write_single_then_read_back() {
    let (mut server, addr) = start_server(16, 0).await;
    let client = connect(addr).await;

    client.write_register(1, 7, 0xBEEF, None).await.unwrap();
    let values = client.read_holding_registers(1, 7, 1, None).await.unwrap();
    assert_eq!(values, vec![0xBEEF]);

    client.close().await;
    server.stop().await;
}

#[tokio::test]
async fn host_set_input_registers_visible_to_client() {
    let (mut server, addr) = start_server(0, 8).await;
    server.store().set_input(2, &[11, 22]).unwrap();

    let client = connect(addr).await;
    let values = client.read_input_registers(1, 0, 4, None).await.unwrap();
    assert_eq!(values, vec![0, 0, 11, 22]);

    client.close().await;
    server.stop().await;
}

#[tokio::test]
async fn oversized_read_rejected_by_server() {
    let (mut server, addr) = start_server(16, 0).await;
    let client = connect(addr).await;

    // quantity 200 bypasses client-side validation via the raw send path
    let err = client
        .send(1, 0x03, &[0x00, 0x00, 0x00, 0xC8], Duration::from_secs(1))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ModbusError::Exception(ExceptionCode::IllegalDataValue)
    ));

    // the connection survives the exception
    let values = client.read_holding_registers(1, 0, 1, None).await.unwrap();
    assert_eq!(values, vec![0]);

    client.close().await;
    server.stop().await;
}

#[tokio::test]
async fn unknown_function_code_rejected() {
    let (mut server, addr) = start_server(16, 0).await;
    let client = connect(addr).await;

    let err = client
        .send(1, 0x2B, &[0x0E, 0x01, 0x00], Duration::from_secs(1))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ModbusError::Exception(ExceptionCode::IllegalFunction)
    ));

    client.close().await;
    server.stop().await;
}

#[tokio::test]
async fn out_of_range_read_rejected() {
    let (mut server, addr) = start_server(16, 0).await;
    let client = connect(addr).await;

    // start + quantity == capacity succeeds
    let values = client.read_holding_registers(1, 14, 2, None).await.unwrap();
    assert_eq!(values, vec![0, 0]);

    // one past the end fails
    let err = client
        .read_holding_registers(1, 15, 2, None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ModbusError::Exception(ExceptionCode::IllegalDataAddress)
    ));

    client.close().await;
    server.stop().await;
}

#[tokio::test]
async fn invalid_arguments_fail_before_io() {
    let (mut server, addr) = start_server(16, 0).await;
    let client = connect(addr).await;

    let err = client
        .read_holding_registers(1, 0, 0, None)
        .await
        .unwrap_err();
    assert!(matches!(err, ModbusError::InvalidArgument(_)));

    let err = client
        .read_holding_registers(1, 0, 126, None)
        .await
        .unwrap_err();
    assert!(matches!(err, ModbusError::InvalidArgument(_)));

    let err = client
        .write_registers(1, 0, &[0; 124], None)
        .await
        .unwrap_err();
    assert!(matches!(err, ModbusError::InvalidArgument(_)));

    client.close().await;
    server.stop().await;
}

#[tokio::test]
async fn timeout_then_late_response_is_discarded() {
    let _ = env_logger::builder().is_test(true).try_init();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let stall_task = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut raw = [0u8; 12];
        socket.read_exact(&mut raw).await.unwrap();
        let (header, _, _) = frame::decode_frame(&raw).unwrap();

        // Sit on the first request until well past the client's timeout,
        // then answer it anyway
        tokio::time::sleep(Duration::from_millis(300)).await;
        let late = frame::encode_frame(
            header.transaction_id,
            header.unit_id,
            &pdu::build_read_response(FunctionCode::ReadHoldingRegisters, &[0xDEAD]),
        );
        socket.write_all(&late).await.unwrap();

        // Serve the follow-up request properly
        socket.read_exact(&mut raw).await.unwrap();
        let (header, _, _) = frame::decode_frame(&raw).unwrap();
        let response = frame::encode_frame(
            header.transaction_id,
            header.unit_id,
            &pdu::build_read_response(FunctionCode::ReadHoldingRegisters, &[0x0042]),
        );
        socket.write_all(&response).await.unwrap();
        socket
    });

    let client = connect(addr).await;
    let err = client
        .read_holding_registers(1, 0, 1, Some(Duration::from_millis(100)))
        .await
        .unwrap_err();
    assert!(matches!(err, ModbusError::Timeout(_)));

    // The late answer to the timed-out transaction must not leak into
    // this fresh one
    let values = client
        .read_holding_registers(1, 0, 1, Some(Duration::from_millis(500)))
        .await
        .unwrap();
    assert_eq!(values, vec![0x0042]);

    let socket = stall_task.await.unwrap();
    client.close().await;
    drop(socket);
}

#[tokio::test]
async fn concurrent_requests_matched_out_of_order() {
    let _ = env_logger::builder().is_test(true).try_init();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let reorder_task = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut first = [0u8; 12];
        socket.read_exact(&mut first).await.unwrap();
        let mut second = [0u8; 12];
        socket.read_exact(&mut second).await.unwrap();

        // Answer in reverse arrival order
        for raw in [second, first] {
            let (header, _, payload) = frame::decode_frame(&raw).unwrap();
            let request = pdu::parse_read_request(&payload).unwrap();
            let value: u16 = match request.start_address {
                10 => 0xAAAA,
                _ => 0xBBBB,
            };
            let response = frame::encode_frame(
                header.transaction_id,
                header.unit_id,
                &pdu::build_read_response(FunctionCode::ReadHoldingRegisters, &[value]),
            );
            socket.write_all(&response).await.unwrap();
        }
        socket
    });

    let client = connect(addr).await;
    let (a, b) = tokio::join!(
        client.read_holding_registers(1, 10, 1, None),
        client.read_holding_registers(1, 20, 1, None),
    );
    assert_eq!(a.unwrap(), vec![0xAAAA]);
    assert_eq!(b.unwrap(), vec![0xBBBB]);

    let socket = reorder_task.await.unwrap();
    client.close().await;
    drop(socket);
}

#[tokio::test]
async fn malformed_protocol_id_closes_connection() {
    let (mut server, addr) = start_server(16, 0).await;

    let mut socket = TcpStream::connect(addr).await.unwrap();
    let bad = [
        0x00, 0x01, 0xDE, 0xAD, 0x00, 0x06, 0x01, 0x03, 0x00, 0x00, 0x00, 0x01,
    ];
    socket.write_all(&bad).await.unwrap();

    let mut buf = [0u8; 16];
    let n = socket.read(&mut buf).await.unwrap();
    assert_eq!(n, 0, "server should close without responding");

    // A fresh, well-formed connection still works
    let client = connect(addr).await;
    let values = client.read_holding_registers(1, 0, 1, None).await.unwrap();
    assert_eq!(values, vec![0]);

    client.close().await;
    server.stop().await;
}

#[tokio::test]
async fn server_counts_requests() {
    let (mut server, addr) = start_server(16, 0).await;
    let client = connect(addr).await;

    client.write_register(1, 0, 1, None).await.unwrap();
    let _ = client.read_holding_registers(1, 0, 1, None).await.unwrap();
    let _ = client
        .send(1, 0x03, &[0x00, 0x00, 0x00, 0xC8], Duration::from_secs(1))
        .await
        .unwrap_err();

    let stats = server.stats();
    assert_eq!(stats.total_requests, 3);
    assert_eq!(stats.successful_responses, 2);
    assert_eq!(stats.exception_responses, 1);
    assert_eq!(stats.connected_clients, 1);
    assert!(stats.bytes_received > 0);
    assert!(stats.bytes_sent > 0);

    client.close().await;
    server.stop().await;
}

#[tokio::test]
async fn stop_is_graceful_and_idempotent() {
    let (mut server, addr) = start_server(16, 0).await;
    let client = connect(addr).await;
    client.write_register(1, 0, 5, None).await.unwrap();

    server.stop().await;
    server.stop().await;

    // The listener is gone
    assert!(TcpStream::connect(addr).await.is_err());
    client.close().await;
}

#[tokio::test]
async fn connection_limit_drops_excess_clients() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut server = ModbusTcpServer::new(ModbusTcpServerConfig {
        bind_address: "127.0.0.1:0".to_string(),
        holding_register_count: 16,
        max_connections: 1,
        ..Default::default()
    });
    let addr = server.start().await.unwrap();

    let first = connect(addr).await;
    first.write_register(1, 0, 1, None).await.unwrap();

    // The TCP handshake still succeeds (backlog), but the server drops the
    // socket instead of serving it
    let second = connect(addr).await;
    let err = second
        .read_holding_registers(1, 0, 1, Some(Duration::from_millis(300)))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ModbusError::Connection(_) | ModbusError::Timeout(_)
    ));

    first.close().await;
    second.close().await;
    server.stop().await;
}
