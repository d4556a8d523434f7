//! Device-control surface of an open port: line settings, control lines,
//! purge, status and statistics.

use std::{sync::Arc, time::Duration};

use crate::{
    cdc::{
        ClassRequest, DtrRts, Handflow, LineCoding, LineControl, PurgeFlags, SerialChars,
        SerialProperties, BREAK_OFF, BREAK_ON, LINE_CODING_SIZE,
    },
    events::{CommStatus, ModemStatus, PerfStats, SerialErrors},
    request::{acquire_cancel_lock, Status},
    timeouts::SerialTimeouts,
    transport::Pipe,
    Error, Result,
};

use super::{SerialPort, Shared};

/// SERIAL_SP_MODEM
const PROVIDER_SUBTYPE_MODEM: u32 = 0x0000_0006;
/// Data bits 5 through 8
const SETTABLE_DATA: u16 = 0x000F;
/// 1, 1.5 and 2 stop bits with none, odd, even, mark and space parity
const SETTABLE_STOP_PARITY: u16 = 0x1F07;

impl Shared {
    /// Read the line coding back from the device and cache it
    pub(super) fn refresh_line_coding(&self) -> Result<LineCoding> {
        let bytes =
            self.transport
                .control_in(ClassRequest::GetLineCoding, 0, LINE_CODING_SIZE as u16)?;
        let coding = LineCoding::try_from_bytes(&bytes)?;
        tracing::trace!(device = %self.name, ?coding, "line coding");
        self.state().line_coding = coding;
        Ok(coding)
    }

    fn push_line_coding(&self, coding: LineCoding) -> Result<()> {
        tracing::debug!(device = %self.name, ?coding, "setting line coding");
        self.transport
            .control_out(ClassRequest::SetLineCoding, 0, &coding.pack())?;
        self.state().line_coding = coding;
        Ok(())
    }

    /// The device is asked for its line coding, falling back to the cached one.
    fn line_coding(&self) -> LineCoding {
        match self.refresh_line_coding() {
            Ok(coding) => coding,
            Err(err) => {
                tracing::debug!(device = %self.name, "GET_LINE_CODING failed: {err}");
                self.state().line_coding
            }
        }
    }

    /// The cached lines only change once the device accepted them
    fn update_control_lines(&self, update: impl FnOnce(&mut DtrRts)) -> Result<()> {
        let mut lines = self.state().dtr_rts;
        update(&mut lines);
        tracing::debug!(device = %self.name, ?lines, "setting control lines");
        self.transport.control_out(
            ClassRequest::SetControlLineState,
            lines.control_line_state(),
            &[],
        )?;
        self.state().dtr_rts = lines;
        Ok(())
    }

    pub(super) fn clear_dtr(&self) -> Result<()> {
        self.update_control_lines(|lines| lines.remove(DtrRts::Dtr))
    }

    fn purge(self: &Arc<Self>, flags: PurgeFlags) -> Result<()> {
        let known = PurgeFlags::TxAbort | PurgeFlags::RxAbort | PurgeFlags::TxClear | PurgeFlags::RxClear;
        if flags.is_empty() || !known.contains(flags) {
            return Err(Error::InvalidParameter("purge flags"));
        }
        tracing::debug!(device = %self.name, ?flags, "purge");

        {
            let cancel = acquire_cancel_lock();
            let mut st = self.state();
            if flags.contains(PurgeFlags::RxAbort) {
                self.kill_all_reads(&cancel, &mut st, Status::Cancelled);
            }
            if flags.contains(PurgeFlags::RxClear) && st.rx.clear() > 0 {
                self.kick_read_pump(&mut st);
            }
        }
        if flags.contains(PurgeFlags::TxAbort) {
            self.transport.abort_pipe(Pipe::DataOut);
        }
        Ok(())
    }
}

impl SerialPort {
    /// Discard buffered data and/or cancel outstanding requests
    pub fn purge(&self, flags: PurgeFlags) -> Result<()> {
        self.shared.power_gate()?;
        self.shared.purge(flags)
    }

    pub fn get_baud_rate(&self) -> Result<u32> {
        self.shared.power_gate()?;
        Ok(self.shared.line_coding().baud_rate)
    }

    pub fn set_baud_rate(&self, baud_rate: u32) -> Result<()> {
        self.shared.power_gate()?;
        if baud_rate == 0 {
            return Err(Error::InvalidParameter("baud rate"));
        }
        let coding = LineCoding {
            baud_rate,
            ..self.shared.state().line_coding
        };
        self.shared.push_line_coding(coding)
    }

    pub fn get_line_control(&self) -> Result<LineControl> {
        self.shared.power_gate()?;
        Ok(self.shared.line_coding().line_control)
    }

    pub fn set_line_control(&self, line_control: LineControl) -> Result<()> {
        self.shared.power_gate()?;
        line_control.validate()?;
        let coding = LineCoding {
            line_control,
            ..self.shared.state().line_coding
        };
        self.shared.push_line_coding(coding)
    }

    pub fn get_chars(&self) -> Result<SerialChars> {
        self.shared.power_gate()?;
        Ok(self.shared.state().chars)
    }

    pub fn set_chars(&self, chars: SerialChars) -> Result<()> {
        self.shared.power_gate()?;
        self.shared.state().chars = chars;
        Ok(())
    }

    pub fn get_handflow(&self) -> Result<Handflow> {
        self.shared.power_gate()?;
        Ok(self.shared.state().handflow)
    }

    pub fn set_handflow(&self, handflow: Handflow) -> Result<()> {
        self.shared.power_gate()?;
        handflow.validate()?;
        self.shared.state().handflow = handflow;
        Ok(())
    }

    pub fn get_timeouts(&self) -> Result<SerialTimeouts> {
        self.shared.power_gate()?;
        Ok(self.shared.state().timeouts)
    }

    /// Applies to reads and writes issued from now on
    pub fn set_timeouts(&self, timeouts: SerialTimeouts) -> Result<()> {
        self.shared.power_gate()?;
        self.shared.state().timeouts = timeouts;
        Ok(())
    }

    pub fn set_dtr(&self) -> Result<()> {
        self.shared.power_gate()?;
        self.shared
            .update_control_lines(|lines| lines.insert(DtrRts::Dtr))
    }

    pub fn clr_dtr(&self) -> Result<()> {
        self.shared.power_gate()?;
        self.shared.clear_dtr()
    }

    pub fn set_rts(&self) -> Result<()> {
        self.shared.power_gate()?;
        self.shared
            .update_control_lines(|lines| lines.insert(DtrRts::Rts))
    }

    pub fn clr_rts(&self) -> Result<()> {
        self.shared.power_gate()?;
        self.shared
            .update_control_lines(|lines| lines.remove(DtrRts::Rts))
    }

    pub fn get_dtr_rts(&self) -> Result<DtrRts> {
        self.shared.power_gate()?;
        Ok(self.shared.state().dtr_rts)
    }

    pub fn set_break_on(&self) -> Result<()> {
        self.shared.power_gate()?;
        self.shared
            .transport
            .control_out(ClassRequest::SendBreak, BREAK_ON, &[])
    }

    pub fn set_break_off(&self) -> Result<()> {
        self.shared.power_gate()?;
        self.shared
            .transport
            .control_out(ClassRequest::SendBreak, BREAK_OFF, &[])
    }

    /// Modem lines from the most recent serial-state notification
    pub fn get_modem_status(&self) -> Result<ModemStatus> {
        self.shared.power_gate()?;
        Ok(self.shared.state().modem_status)
    }

    /// Queue sizes and accumulated errors. Reading clears the errors.
    pub fn get_comm_status(&self) -> Result<CommStatus> {
        self.shared.power_gate()?;
        let mut st = self.shared.state();
        Ok(CommStatus {
            errors: std::mem::replace(&mut st.errors, SerialErrors::empty()),
            hold_reasons: 0,
            amount_in_in_queue: st.rx.len() as u32,
            amount_in_out_queue: st.out_queue_bytes as u32,
            eof_received: false,
            wait_for_immediate: false,
        })
    }

    pub fn get_stats(&self) -> Result<PerfStats> {
        self.shared.power_gate()?;
        Ok(self.shared.state().stats)
    }

    pub fn clear_stats(&self) -> Result<()> {
        self.shared.power_gate()?;
        self.shared.state().stats = PerfStats::default();
        Ok(())
    }

    /// Accepted for compatibility. The receive store keeps its configured size.
    pub fn set_queue_size(&self, in_size: u32, out_size: u32) -> Result<()> {
        self.shared.power_gate()?;
        tracing::trace!(device = %self.shared.name, in_size, out_size, "ignoring queue size");
        Ok(())
    }

    pub fn get_properties(&self) -> Result<SerialProperties> {
        self.shared.power_gate()?;
        let capacity = self.shared.config.rx_capacity as u32;
        Ok(SerialProperties {
            max_baud: u32::MAX,
            max_rx_queue: capacity,
            current_rx_queue: capacity,
            provider_subtype: PROVIDER_SUBTYPE_MODEM,
            settable_data: SETTABLE_DATA,
            settable_stop_parity: SETTABLE_STOP_PARITY,
        })
    }

    pub fn reset_device(&self) -> Result<()> {
        self.shared.power_gate()?;
        Err(Error::NotImplemented("reset device"))
    }

    /// Wait for every outstanding write to finish. `false` on timeout.
    pub fn flush(&self, timeout: Duration) -> bool {
        self.shared.pending.wait_drained(Pipe::DataOut, timeout)
    }
}
