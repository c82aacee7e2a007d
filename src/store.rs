//! In-memory register store
//!
//! Two independent banks of 16-bit registers: holding (read/write over the
//! wire) and input (read-only over the wire, writable by the host
//! application). Banks are sized at construction and never grow.

use std::sync::RwLock;

use crate::error::{ModbusError, ModbusResult};
use crate::pdu::ExceptionCode;

/// Thread-safe register banks backing a Modbus server
#[derive(Debug)]
pub struct DataStore {
    holding: RwLock<Vec<u16>>,
    input: RwLock<Vec<u16>>,
}

impl DataStore {
    /// Create a store with the given bank sizes, all registers zeroed
    pub fn new(holding_count: u16, input_count: u16) -> Self {
        Self {
            holding: RwLock::new(vec![0; holding_count as usize]),
            input: RwLock::new(vec![0; input_count as usize]),
        }
    }

    /// Number of holding registers
    pub fn holding_len(&self) -> usize {
        match self.holding.read() {
            Ok(bank) => bank.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    /// Number of input registers
    pub fn input_len(&self) -> usize {
        match self.input.read() {
            Ok(bank) => bank.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    /// Read `quantity` holding registers starting at `start`
    pub fn read_holding(&self, start: u16, quantity: u16) -> ModbusResult<Vec<u16>> {
        Self::read_bank(&self.holding, start, quantity)
    }

    /// Read `quantity` input registers starting at `start`
    pub fn read_input(&self, start: u16, quantity: u16) -> ModbusResult<Vec<u16>> {
        Self::read_bank(&self.input, start, quantity)
    }

    /// Write a contiguous run of holding registers starting at `start`.
    ///
    /// The write is atomic: it either lands entirely in bounds or fails
    /// without touching the bank.
    pub fn write_holding(&self, start: u16, values: &[u16]) -> ModbusResult<()> {
        Self::write_bank(&self.holding, start, values)
    }

    /// Host-side write to input registers (not reachable over the wire)
    pub fn set_input(&self, start: u16, values: &[u16]) -> ModbusResult<()> {
        Self::write_bank(&self.input, start, values)
    }

    fn read_bank(bank: &RwLock<Vec<u16>>, start: u16, quantity: u16) -> ModbusResult<Vec<u16>> {
        let guard = bank
            .read()
            .map_err(|_| ModbusError::Exception(ExceptionCode::ServerDeviceFailure))?;
        let range = Self::check_range(guard.len(), start, quantity as usize)?;
        Ok(guard[range].to_vec())
    }

    fn write_bank(bank: &RwLock<Vec<u16>>, start: u16, values: &[u16]) -> ModbusResult<()> {
        let mut guard = bank
            .write()
            .map_err(|_| ModbusError::Exception(ExceptionCode::ServerDeviceFailure))?;
        let range = Self::check_range(guard.len(), start, values.len())?;
        guard[range].copy_from_slice(values);
        Ok(())
    }

    fn check_range(
        len: usize,
        start: u16,
        count: usize,
    ) -> ModbusResult<std::ops::Range<usize>> {
        let start = start as usize;
        let end = start + count;
        if end > len {
            return Err(ModbusError::Exception(ExceptionCode::IllegalDataAddress));
        }
        Ok(start..end)
    }
}
