//! CDC-ACM class requests and the serial properties carried over them.

use bitflags::bitflags;

use crate::{Error, Result};

// ---------- Class requests

#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
/// Values to assign to bRequest
pub enum ClassRequest {
    /// Configure baud rate, stop bits, parity and data bits
    SetLineCoding = 0x20,
    /// Read back the current line coding
    GetLineCoding = 0x21,
    /// Drive the DTR and RTS lines
    SetControlLineState = 0x22,
    /// Generate a break of wValue milliseconds (0xFFFF: until cleared)
    SendBreak = 0x23,
}

/// wValue for SEND_BREAK that holds the break until cleared
pub(crate) const BREAK_ON: u16 = 0xFFFF;
pub(crate) const BREAK_OFF: u16 = 0x0000;

/// Size of the LINE_CODING structure
pub(crate) const LINE_CODING_SIZE: usize = 7;

#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum StopBits {
    #[default]
    One = 0,
    OnePointFive = 1,
    Two = 2,
}

impl TryFrom<u8> for StopBits {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(StopBits::One),
            1 => Ok(StopBits::OnePointFive),
            2 => Ok(StopBits::Two),
            _ => Err(Error::InvalidParameter("stop bits")),
        }
    }
}

#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum Parity {
    #[default]
    None = 0,
    Odd = 1,
    Even = 2,
    Mark = 3,
    Space = 4,
}

impl TryFrom<u8> for Parity {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Parity::None),
            1 => Ok(Parity::Odd),
            2 => Ok(Parity::Even),
            3 => Ok(Parity::Mark),
            4 => Ok(Parity::Space),
            _ => Err(Error::InvalidParameter("parity")),
        }
    }
}

/// Stop bits, parity and word length
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct LineControl {
    pub stop_bits: StopBits,
    pub parity: Parity,
    pub word_length: u8,
}

impl Default for LineControl {
    fn default() -> Self {
        Self {
            stop_bits: StopBits::One,
            parity: Parity::None,
            word_length: 8,
        }
    }
}

impl LineControl {
    pub(crate) fn validate(&self) -> Result<()> {
        match self.word_length {
            5..=8 | 16 => Ok(()),
            _ => Err(Error::InvalidParameter("word length")),
        }
    }
}

/// CDC LINE_CODING: line control plus the data terminal rate
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct LineCoding {
    pub baud_rate: u32,
    pub line_control: LineControl,
}

impl Default for LineCoding {
    fn default() -> Self {
        Self {
            baud_rate: 9600,
            line_control: LineControl::default(),
        }
    }
}

impl LineCoding {
    pub(crate) fn pack(&self) -> [u8; LINE_CODING_SIZE] {
        let rate = self.baud_rate.to_le_bytes();
        [
            rate[0],
            rate[1],
            rate[2],
            rate[3],
            self.line_control.stop_bits as u8,
            self.line_control.parity as u8,
            self.line_control.word_length,
        ]
    }

    pub(crate) fn try_from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < LINE_CODING_SIZE {
            return Err(Error::BadData);
        }
        let baud_rate = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        Ok(Self {
            baud_rate,
            line_control: LineControl {
                stop_bits: StopBits::try_from(bytes[4]).map_err(|_| Error::BadData)?,
                parity: Parity::try_from(bytes[5]).map_err(|_| Error::BadData)?,
                word_length: bytes[6],
            },
        })
    }
}

bitflags! {
    /// Output lines driven through SET_CONTROL_LINE_STATE
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DtrRts: u32 {
        const Dtr = 0x01;
        const Rts = 0x02;
    }
}

impl DtrRts {
    /// wValue for SET_CONTROL_LINE_STATE
    pub(crate) fn control_line_state(self) -> u16 {
        // Bit positions line up with the CDC bitmap
        self.bits() as u16
    }
}

// ---------- Locally held properties

/// Special characters
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct SerialChars {
    pub eof_char: u8,
    pub error_char: u8,
    pub break_char: u8,
    /// Raises `RxFlag` when received
    pub event_char: u8,
    pub xon_char: u8,
    pub xoff_char: u8,
}

/// Bits of `control_handshake` that have no meaning
const CONTROL_INVALID: u32 = 0x7fff_ff84;
/// Bits of `flow_replace` that have no meaning
const FLOW_INVALID: u32 = 0x7fff_ff20;

/// Flow-control handshake settings
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct Handflow {
    pub control_handshake: u32,
    pub flow_replace: u32,
    pub xon_limit: i32,
    pub xoff_limit: i32,
}

impl Handflow {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.control_handshake & CONTROL_INVALID != 0 || self.flow_replace & FLOW_INVALID != 0 {
            return Err(Error::InvalidParameter("handflow"));
        }
        Ok(())
    }
}

bitflags! {
    /// What a purge should discard
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PurgeFlags: u32 {
        /// Cancel outstanding writes
        const TxAbort = 0x01;
        /// Cancel outstanding reads
        const RxAbort = 0x02;
        const TxClear = 0x04;
        /// Discard the receive store
        const RxClear = 0x08;
        // Callers may pass any bits, they are validated
        const _ = !0;
    }
}

/// Static capabilities reported by `get_properties`
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SerialProperties {
    pub max_baud: u32,
    pub max_rx_queue: u32,
    pub current_rx_queue: u32,
    /// 6 = modem
    pub provider_subtype: u32,
    pub settable_data: u16,
    pub settable_stop_parity: u16,
}
