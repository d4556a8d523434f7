//! Serial events, modem status and CDC serial-state notifications.

use bitflags::bitflags;

bitflags! {
    /// Events a caller can wait for with `wait_on_mask`
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SerialEvents: u32 {
        /// A character was received
        const RxChar = 0x0001;
        /// The event character was received
        const RxFlag = 0x0002;
        /// The last outstanding write completed
        const TxEmpty = 0x0004;
        const Cts = 0x0008;
        const Dsr = 0x0010;
        /// Receive line signal detect (carrier) changed
        const Rlsd = 0x0020;
        const Break = 0x0040;
        /// Framing, overrun or parity error
        const Err = 0x0080;
        const Ring = 0x0100;
        const PErr = 0x0200;
        /// The receive store is 80% full
        const Rx80Full = 0x0400;
        const Event1 = 0x0800;
        const Event2 = 0x1000;
    }
}

bitflags! {
    /// Modem status lines, as reported by `get_modem_status`
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ModemStatus: u32 {
        const Cts = 0x10;
        const Dsr = 0x20;
        const Ri = 0x40;
        const Dcd = 0x80;
    }
}

bitflags! {
    /// Line errors accumulated since the last `get_comm_status`
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SerialErrors: u32 {
        const Break = 0x01;
        const Framing = 0x02;
        const Overrun = 0x04;
        const QueueOverrun = 0x08;
        const Parity = 0x10;
    }
}

bitflags! {
    /// UART state bitmap carried by a CDC SERIAL_STATE notification
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SerialState: u16 {
        /// DCD
        const RxCarrier = 0x0001;
        /// DSR
        const TxCarrier = 0x0002;
        const Break = 0x0004;
        const RingSignal = 0x0008;
        const Framing = 0x0010;
        const Parity = 0x0020;
        const OverRun = 0x0040;
        // Devices may set reserved bits
        const _ = !0;
    }
}

/// Performance statistics, as reported by `get_stats`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PerfStats {
    pub received_count: u32,
    pub transmitted_count: u32,
    pub frame_error_count: u32,
    pub serial_overrun_error_count: u32,
    pub buffer_overrun_error_count: u32,
    pub parity_error_count: u32,
}

/// Queue and error state, as reported by `get_comm_status`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CommStatus {
    pub errors: SerialErrors,
    pub hold_reasons: u32,
    /// Bytes waiting in the receive store
    pub amount_in_in_queue: u32,
    /// Bytes handed to writes that have not completed yet
    pub amount_in_out_queue: u32,
    pub eof_received: bool,
    pub wait_for_immediate: bool,
}

// ---------- Notification decoding

/// bmRequestType of a class notification sent to the interface
const NOTIFICATION_REQUEST_TYPE: u8 = 0xA1;
/// bNotification for SERIAL_STATE
const SERIAL_STATE: u8 = 0x20;
/// Size of the notification header preceding the data stage
const NOTIFICATION_HEADER_SIZE: usize = 8;
/// A SERIAL_STATE notification carries a two byte bitmap
const SERIAL_STATE_LENGTH: u16 = 2;

/// Size of a complete SERIAL_STATE notification
pub(crate) const SERIAL_STATE_NOTIFICATION_SIZE: usize =
    NOTIFICATION_HEADER_SIZE + SERIAL_STATE_LENGTH as usize;

/// Extract the UART bitmap from an interrupt-in packet. Anything that isn't a
/// well formed SERIAL_STATE notification yields `None`.
pub(crate) fn parse_serial_state(packet: &[u8]) -> Option<SerialState> {
    if packet.len() < SERIAL_STATE_NOTIFICATION_SIZE {
        return None;
    }
    if packet[0] != NOTIFICATION_REQUEST_TYPE || packet[1] != SERIAL_STATE {
        return None;
    }
    let length = u16::from_le_bytes([packet[6], packet[7]]);
    if length != SERIAL_STATE_LENGTH {
        return None;
    }
    Some(SerialState::from_bits_retain(u16::from_le_bytes([
        packet[8], packet[9],
    ])))
}

impl SerialState {
    /// Modem lines this state implies
    pub fn modem_status(self) -> ModemStatus {
        let mut status = ModemStatus::empty();
        if self.contains(SerialState::RxCarrier) {
            status |= ModemStatus::Dcd;
        }
        if self.contains(SerialState::TxCarrier) {
            status |= ModemStatus::Dsr;
        }
        if self.contains(SerialState::RingSignal) {
            status |= ModemStatus::Ri;
        }
        status
    }
}

/// What a serial-state transition means to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct StateTransition {
    pub events: SerialEvents,
    pub errors: SerialErrors,
}

/// Compare two UART states and derive events, line errors and statistics.
pub(crate) fn transition(
    previous: SerialState,
    current: SerialState,
    stats: &mut PerfStats,
) -> StateTransition {
    let changed = previous ^ current;
    let mut out = StateTransition::default();

    if changed.contains(SerialState::RxCarrier) {
        out.events |= SerialEvents::Rlsd;
    }
    if changed.contains(SerialState::TxCarrier) {
        out.events |= SerialEvents::Dsr;
    }
    if changed.contains(SerialState::RingSignal) {
        out.events |= SerialEvents::Ring;
    }

    // Irregularity bits are one-shot, only count them on the rising edge
    let raised = changed & current;
    if raised.contains(SerialState::Break) {
        out.events |= SerialEvents::Break;
        out.errors |= SerialErrors::Break;
    }
    if raised.contains(SerialState::Framing) {
        out.events |= SerialEvents::Err;
        out.errors |= SerialErrors::Framing;
        stats.frame_error_count = stats.frame_error_count.wrapping_add(1);
    }
    if raised.contains(SerialState::OverRun) {
        out.events |= SerialEvents::Err;
        out.errors |= SerialErrors::Overrun;
        stats.serial_overrun_error_count = stats.serial_overrun_error_count.wrapping_add(1);
    }
    if raised.contains(SerialState::Parity) {
        out.events |= SerialEvents::Err;
        out.errors |= SerialErrors::Parity;
        stats.parity_error_count = stats.parity_error_count.wrapping_add(1);
    }

    out
}

/// Events raised by freshly received bytes.
///
/// `event_char` is only scanned for when the subscription asks for it.
pub(crate) fn rx_events(
    data: &[u8],
    event_char: u8,
    subscribed: SerialEvents,
    occupied: usize,
    capacity: usize,
) -> SerialEvents {
    let mut events = SerialEvents::empty();
    if data.is_empty() {
        return events;
    }
    events |= SerialEvents::RxChar;
    if subscribed.contains(SerialEvents::RxFlag) && data.contains(&event_char) {
        events |= SerialEvents::RxFlag;
    }
    if occupied * 5 >= capacity * 4 {
        events |= SerialEvents::Rx80Full;
    }
    events
}

#[cfg(test)]
pub(crate) fn serial_state_packet(state: SerialState, interface: u16) -> Vec<u8> {
    let mut packet = vec![NOTIFICATION_REQUEST_TYPE, SERIAL_STATE, 0, 0];
    packet.extend_from_slice(&interface.to_le_bytes());
    packet.extend_from_slice(&SERIAL_STATE_LENGTH.to_le_bytes());
    packet.extend_from_slice(&state.bits().to_le_bytes());
    packet
}
