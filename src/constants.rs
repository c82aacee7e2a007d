//! Modbus protocol constants based on the official specification
//!
//! Register limits are derived from the maximum PDU size of 253 bytes
//! (inherited from the RS485 ADU limit of 256 bytes).

/// MBAP header length: Transaction ID(2) + Protocol ID(2) + Length(2) + Unit ID(1)
pub const MBAP_HEADER_LEN: usize = 7;

/// Maximum PDU (Protocol Data Unit) size per Modbus specification
pub const MAX_PDU_SIZE: usize = 253;

/// Maximum value of the MBAP length field (Unit ID + PDU)
pub const MAX_MBAP_LENGTH: usize = 1 + MAX_PDU_SIZE;

/// Maximum number of registers for FC03/FC04 (Read Holding/Input Registers)
///
/// Response PDU: function code (1) + byte count (1) + N * 2 <= 253,
/// therefore N <= 125.
pub const MAX_READ_REGISTERS: u16 = 125;

/// Maximum number of registers for FC16 (Write Multiple Registers)
///
/// Request PDU: function code (1) + address (2) + quantity (2) +
/// byte count (1) + N * 2 <= 253, therefore N <= 123.
pub const MAX_WRITE_REGISTERS: u16 = 123;

/// Read Holding Registers (FC03)
pub const FC_READ_HOLDING_REGISTERS: u8 = 0x03;

/// Read Input Registers (FC04)
pub const FC_READ_INPUT_REGISTERS: u8 = 0x04;

/// Write Single Register (FC06)
pub const FC_WRITE_SINGLE_REGISTER: u8 = 0x06;

/// Write Multiple Registers (FC16)
pub const FC_WRITE_MULTIPLE_REGISTERS: u8 = 0x10;

/// Exception flag: set on the function code of an exception response
pub const EXCEPTION_FLAG: u8 = 0x80;

/// Modbus TCP default port
pub const DEFAULT_TCP_PORT: u16 = 502;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_limits_fit_pdu() {
        let read_pdu = 1 + 1 + (MAX_READ_REGISTERS as usize * 2);
        assert!(read_pdu <= MAX_PDU_SIZE);

        let write_pdu = 1 + 2 + 2 + 1 + (MAX_WRITE_REGISTERS as usize * 2);
        assert!(write_pdu <= MAX_PDU_SIZE);
    }
}
