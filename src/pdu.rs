//! Modbus PDU (Protocol Data Unit) handling
//!
//! Parses requests and builds responses for the four supported register
//! function codes, plus exception responses. All multi-byte integers are
//! big-endian per the Modbus Application Protocol specification.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::constants::{
    EXCEPTION_FLAG, FC_READ_HOLDING_REGISTERS, FC_READ_INPUT_REGISTERS,
    FC_WRITE_MULTIPLE_REGISTERS, FC_WRITE_SINGLE_REGISTER,
};
use crate::error::{ModbusError, ModbusResult};

/// Supported Modbus function codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum FunctionCode {
    ReadHoldingRegisters = FC_READ_HOLDING_REGISTERS,
    ReadInputRegisters = FC_READ_INPUT_REGISTERS,
    WriteSingleRegister = FC_WRITE_SINGLE_REGISTER,
    WriteMultipleRegisters = FC_WRITE_MULTIPLE_REGISTERS,
}

impl From<FunctionCode> for u8 {
    fn from(code: FunctionCode) -> u8 {
        code as u8
    }
}

impl TryFrom<u8> for FunctionCode {
    type Error = ModbusError;

    fn try_from(value: u8) -> ModbusResult<Self> {
        match value {
            FC_READ_HOLDING_REGISTERS => Ok(FunctionCode::ReadHoldingRegisters),
            FC_READ_INPUT_REGISTERS => Ok(FunctionCode::ReadInputRegisters),
            FC_WRITE_SINGLE_REGISTER => Ok(FunctionCode::WriteSingleRegister),
            FC_WRITE_MULTIPLE_REGISTERS => Ok(FunctionCode::WriteMultipleRegisters),
            _ => Err(ModbusError::Exception(ExceptionCode::IllegalFunction)),
        }
    }
}

/// Modbus exception codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ExceptionCode {
    IllegalFunction = 0x01,
    IllegalDataAddress = 0x02,
    IllegalDataValue = 0x03,
    ServerDeviceFailure = 0x04,
}

impl From<ExceptionCode> for u8 {
    fn from(code: ExceptionCode) -> u8 {
        code as u8
    }
}

impl TryFrom<u8> for ExceptionCode {
    type Error = ModbusError;

    fn try_from(value: u8) -> ModbusResult<Self> {
        match value {
            0x01 => Ok(ExceptionCode::IllegalFunction),
            0x02 => Ok(ExceptionCode::IllegalDataAddress),
            0x03 => Ok(ExceptionCode::IllegalDataValue),
            0x04 => Ok(ExceptionCode::ServerDeviceFailure),
            _ => Err(ModbusError::MalformedFrame(format!(
                "invalid exception code: 0x{value:02X}"
            ))),
        }
    }
}

impl fmt::Display for ExceptionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ExceptionCode::IllegalFunction => "illegal function (0x01)",
            ExceptionCode::IllegalDataAddress => "illegal data address (0x02)",
            ExceptionCode::IllegalDataValue => "illegal data value (0x03)",
            ExceptionCode::ServerDeviceFailure => "server device failure (0x04)",
        };
        f.write_str(text)
    }
}

/// Read request payload (FC03/FC04)
#[derive(Debug, Clone, Copy)]
pub struct ReadRequest {
    pub start_address: u16,
    pub quantity: u16,
}

/// Write single register payload (FC06); echoed unchanged in the response
#[derive(Debug, Clone, Copy)]
pub struct WriteSingleRequest {
    pub address: u16,
    pub value: u16,
}

/// Write multiple registers payload (FC16)
#[derive(Debug, Clone)]
pub struct WriteMultipleRequest {
    pub start_address: u16,
    pub quantity: u16,
    pub values: Vec<u16>,
}

/// Parse a read request payload: {startAddress:16, quantity:16}
pub fn parse_read_request(data: &[u8]) -> ModbusResult<ReadRequest> {
    if data.len() != 4 {
        return Err(ModbusError::Exception(ExceptionCode::IllegalDataValue));
    }

    Ok(ReadRequest {
        start_address: u16::from_be_bytes([data[0], data[1]]),
        quantity: u16::from_be_bytes([data[2], data[3]]),
    })
}

/// Parse a write single register payload: {address:16, value:16}
pub fn parse_write_single_request(data: &[u8]) -> ModbusResult<WriteSingleRequest> {
    if data.len() != 4 {
        return Err(ModbusError::Exception(ExceptionCode::IllegalDataValue));
    }

    Ok(WriteSingleRequest {
        address: u16::from_be_bytes([data[0], data[1]]),
        value: u16::from_be_bytes([data[2], data[3]]),
    })
}

/// Parse a write multiple registers payload:
/// {startAddress:16, quantity:16, byteCount:8, values: quantity x 16}
///
/// The declared byte count must be exactly `2 * quantity` and match the
/// remaining payload length.
pub fn parse_write_multiple_request(data: &[u8]) -> ModbusResult<WriteMultipleRequest> {
    if data.len() < 5 {
        return Err(ModbusError::Exception(ExceptionCode::IllegalDataValue));
    }

    let start_address = u16::from_be_bytes([data[0], data[1]]);
    let quantity = u16::from_be_bytes([data[2], data[3]]);
    let byte_count = data[4] as usize;

    if byte_count != quantity as usize * 2 || data.len() != 5 + byte_count {
        return Err(ModbusError::Exception(ExceptionCode::IllegalDataValue));
    }

    let values = data[5..]
        .chunks_exact(2)
        .map(|chunk| u16::from_be_bytes([chunk[0], chunk[1]]))
        .collect();

    Ok(WriteMultipleRequest {
        start_address,
        quantity,
        values,
    })
}

/// Build a read request PDU (FC03/FC04)
pub fn build_read_request(function_code: FunctionCode, start_address: u16, quantity: u16) -> Vec<u8> {
    let mut pdu = Vec::with_capacity(5);
    pdu.push(function_code.into());
    pdu.extend_from_slice(&start_address.to_be_bytes());
    pdu.extend_from_slice(&quantity.to_be_bytes());
    pdu
}

/// Build a write single register request PDU (FC06)
pub fn build_write_single_request(address: u16, value: u16) -> Vec<u8> {
    let mut pdu = Vec::with_capacity(5);
    pdu.push(FunctionCode::WriteSingleRegister.into());
    pdu.extend_from_slice(&address.to_be_bytes());
    pdu.extend_from_slice(&value.to_be_bytes());
    pdu
}

/// Build a write multiple registers request PDU (FC16)
pub fn build_write_multiple_request(start_address: u16, values: &[u16]) -> Vec<u8> {
    let mut pdu = Vec::with_capacity(6 + values.len() * 2);
    pdu.push(FunctionCode::WriteMultipleRegisters.into());
    pdu.extend_from_slice(&start_address.to_be_bytes());
    pdu.extend_from_slice(&(values.len() as u16).to_be_bytes());
    pdu.push((values.len() * 2) as u8);
    for &value in values {
        pdu.extend_from_slice(&value.to_be_bytes());
    }
    pdu
}

/// Build a read response PDU: {byteCount:8, registers: quantity x 16}
pub fn build_read_response(function_code: FunctionCode, values: &[u16]) -> Vec<u8> {
    let mut pdu = Vec::with_capacity(2 + values.len() * 2);
    pdu.push(function_code.into());
    pdu.push((values.len() * 2) as u8);
    for &value in values {
        pdu.extend_from_slice(&value.to_be_bytes());
    }
    pdu
}

/// Build a write single register response PDU (request echoed unchanged)
pub fn build_write_single_response(address: u16, value: u16) -> Vec<u8> {
    build_write_single_request(address, value)
}

/// Build a write multiple registers response PDU: {startAddress:16, quantity:16}
pub fn build_write_multiple_response(start_address: u16, quantity: u16) -> Vec<u8> {
    let mut pdu = Vec::with_capacity(5);
    pdu.push(FunctionCode::WriteMultipleRegisters.into());
    pdu.extend_from_slice(&start_address.to_be_bytes());
    pdu.extend_from_slice(&quantity.to_be_bytes());
    pdu
}

/// Build an exception response PDU: function code with high bit set plus code
pub fn build_exception(function_code: u8, exception_code: ExceptionCode) -> Vec<u8> {
    vec![function_code | EXCEPTION_FLAG, exception_code.into()]
}

/// Parse a read response payload (after the function code byte), checking
/// the declared byte count against the expected register quantity.
pub fn parse_read_response(payload: &[u8], expected_quantity: u16) -> ModbusResult<Vec<u16>> {
    if payload.is_empty() {
        return Err(ModbusError::MalformedFrame(
            "read response missing byte count".to_string(),
        ));
    }

    let byte_count = payload[0] as usize;
    if byte_count != expected_quantity as usize * 2 || payload.len() != 1 + byte_count {
        return Err(ModbusError::MalformedFrame(format!(
            "read response byte count mismatch: declared {}, expected {} for {} registers",
            byte_count,
            expected_quantity * 2,
            expected_quantity
        )));
    }

    Ok(payload[1..]
        .chunks_exact(2)
        .map(|chunk| u16::from_be_bytes([chunk[0], chunk[1]]))
        .collect())
}
