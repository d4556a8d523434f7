//! Host-side driver core for USB CDC-ACM modems and serial adapters.
//!
//! A [`Device`] pumps the function's bulk-in and interrupt-in pipes into a
//! receive store and serial-state history, and a [`SerialPort`] handle exposes
//! the classic serial request surface on top: timed reads, writes, event
//! waits, purges and line settings. Every read, write and wait returns an
//! [`IoRequest`] that completes exactly once, whichever of data arrival,
//! timeout, cancellation or teardown gets there first.
//!
//! ```no_run
//! use nusbser::{Config, Device};
//!
//! let device = Device::connect(0x1234, 0x5678, Config::default())?;
//! device.start()?;
//! let port = device.open()?;
//! port.write(b"AT\r".to_vec()).wait();
//! let reply = port.read(64).wait();
//! # Ok::<(), nusbser::Error>(())
//! ```

pub mod cdc;
mod device;
pub mod events;
#[cfg(test)]
mod mock;
pub mod request;
mod ring;
pub mod slots;
pub mod timeouts;
pub mod timer;
pub mod transport;
pub mod usb;
pub mod work;

pub use device::{global_slots, Config, Device, PowerState, SerialPort, Services};
pub use request::{Completion, IoRequest, RequestKind, Status};
pub use transport::Pipe;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Requested vid/pid device was not found or is not a CDC-ACM function")]
    DeviceNotFound,
    /// `nusb::Error` is `std::io::Error`, so thread spawn failures land here too
    #[error("Lower-level USB driver or OS error")]
    Driver(#[from] nusb::Error),
    #[error("Error encountered during USB transfer")]
    Transfer(#[from] nusb::transfer::TransferError),
    #[error("USB device is unconfigured")]
    Unconfigured(#[from] nusb::descriptors::ActiveConfigurationError),
    #[error("The port is already open")]
    AlreadyOpen,
    #[error("The device is not running")]
    NotRunning,
    #[error("The device is not in D0")]
    PowerOff,
    #[error("Invalid parameter: {0}")]
    InvalidParameter(&'static str),
    #[error("A wait-on-mask request is already pending")]
    WaitPending,
    #[error("No free device slot")]
    NoSlot,
    #[error("Returned data was invalid")]
    BadData,
    #[error("Outstanding transfers on {0:?} did not drain")]
    AbortTimeout(Pipe),
    #[error("Not implemented: {0}")]
    NotImplemented(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn os_errors_convert_to_driver() {
        let spawn_failure = std::io::Error::from(std::io::ErrorKind::WouldBlock);
        let err: Error = spawn_failure.into();
        assert!(matches!(err, Error::Driver(_)));
    }
}
