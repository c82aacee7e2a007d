//! MBAP framing for Modbus TCP
//!
//! An ADU (Application Data Unit) on the wire is a 7-byte MBAP header
//! followed by the PDU. The header length field counts the unit identifier
//! plus the PDU, so it is always `pdu_len + 1`.

use crate::constants::{MAX_MBAP_LENGTH, MBAP_HEADER_LEN};
use crate::error::{ModbusError, ModbusResult};
use crate::pdu::ExceptionCode;

/// MBAP (Modbus Application Protocol) header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    /// Transaction identifier, echoed by the server
    pub transaction_id: u16,
    /// Protocol identifier, always 0 for Modbus
    pub protocol_id: u16,
    /// Number of following bytes (unit id + PDU)
    pub length: u16,
    /// Unit identifier (slave address, pass-through on TCP)
    pub unit_id: u8,
}

impl MbapHeader {
    /// Create a header for a PDU of `pdu_len` bytes
    pub fn new(transaction_id: u16, unit_id: u8, pdu_len: u16) -> Self {
        Self {
            transaction_id,
            protocol_id: 0,
            length: pdu_len + 1,
            unit_id,
        }
    }

    /// Serialize to the 7-byte wire form
    pub fn to_bytes(&self) -> [u8; MBAP_HEADER_LEN] {
        let mut bytes = [0u8; MBAP_HEADER_LEN];
        bytes[0..2].copy_from_slice(&self.transaction_id.to_be_bytes());
        bytes[2..4].copy_from_slice(&self.protocol_id.to_be_bytes());
        bytes[4..6].copy_from_slice(&self.length.to_be_bytes());
        bytes[6] = self.unit_id;
        bytes
    }

    /// Parse a header from the first 7 bytes of `data`
    pub fn from_bytes(data: &[u8]) -> ModbusResult<Self> {
        if data.len() < MBAP_HEADER_LEN {
            return Err(ModbusError::MalformedFrame(format!(
                "MBAP header needs {} bytes, got {}",
                MBAP_HEADER_LEN,
                data.len()
            )));
        }

        let protocol_id = u16::from_be_bytes([data[2], data[3]]);
        if protocol_id != 0 {
            return Err(ModbusError::MalformedFrame(format!(
                "invalid protocol id: {protocol_id}"
            )));
        }

        let length = u16::from_be_bytes([data[4], data[5]]);
        if length == 0 || length as usize > MAX_MBAP_LENGTH {
            return Err(ModbusError::MalformedFrame(format!(
                "invalid MBAP length: {length}"
            )));
        }

        Ok(Self {
            transaction_id: u16::from_be_bytes([data[0], data[1]]),
            protocol_id,
            length,
            unit_id: data[6],
        })
    }

    /// Total frame length in bytes (header + PDU)
    pub fn frame_length(&self) -> usize {
        MBAP_HEADER_LEN + self.length as usize - 1
    }

    /// PDU length in bytes
    pub fn pdu_length(&self) -> usize {
        self.length as usize - 1
    }
}

/// Encode a complete ADU from header fields and a PDU
pub fn encode_frame(transaction_id: u16, unit_id: u8, pdu: &[u8]) -> Vec<u8> {
    let header = MbapHeader::new(transaction_id, unit_id, pdu.len() as u16);
    let mut frame = Vec::with_capacity(MBAP_HEADER_LEN + pdu.len());
    frame.extend_from_slice(&header.to_bytes());
    frame.extend_from_slice(pdu);
    frame
}

/// Encode a request ADU from a function code and its payload
pub fn encode_request(
    unit_id: u8,
    transaction_id: u16,
    function_code: u8,
    payload: &[u8],
) -> Vec<u8> {
    let header = MbapHeader::new(transaction_id, unit_id, payload.len() as u16 + 1);
    let mut frame = Vec::with_capacity(MBAP_HEADER_LEN + 1 + payload.len());
    frame.extend_from_slice(&header.to_bytes());
    frame.push(function_code);
    frame.extend_from_slice(payload);
    frame
}

/// Encode an exception response ADU for the given request function code
pub fn encode_exception(
    unit_id: u8,
    transaction_id: u16,
    function_code: u8,
    exception_code: ExceptionCode,
) -> Vec<u8> {
    encode_frame(
        transaction_id,
        unit_id,
        &crate::pdu::build_exception(function_code, exception_code),
    )
}

/// Decode a complete ADU into its header, function code and payload.
///
/// The buffer must contain exactly the bytes the header declares, and the
/// PDU must carry at least the function code byte.
pub fn decode_frame(data: &[u8]) -> ModbusResult<(MbapHeader, u8, Vec<u8>)> {
    let header = MbapHeader::from_bytes(data)?;
    if data.len() != header.frame_length() {
        return Err(ModbusError::MalformedFrame(format!(
            "frame length mismatch: header declares {} bytes, got {}",
            header.frame_length(),
            data.len()
        )));
    }
    if header.pdu_length() == 0 {
        return Err(ModbusError::MalformedFrame("empty PDU".to_string()));
    }

    let function_code = data[MBAP_HEADER_LEN];
    let payload = data[MBAP_HEADER_LEN + 1..].to_vec();
    Ok((header, function_code, payload))
}

/// Determine whether `buffer` starts with a complete ADU.
///
/// Returns `Ok(None)` when more bytes are needed, `Ok(Some(len))` with the
/// total frame length once the declared frame is fully buffered, and an
/// error when the buffered header is invalid.
pub fn complete_frame_len(buffer: &[u8]) -> ModbusResult<Option<usize>> {
    if buffer.len() < MBAP_HEADER_LEN {
        return Ok(None);
    }

    let header = MbapHeader::from_bytes(buffer)?;
    let frame_len = header.frame_length();
    if buffer.len() < frame_len {
        return Ok(None);
    }

    Ok(Some(frame_len))
}
