use futures_lite::future::block_on;
use nusbser::{
    timeouts::SerialTimeouts,
    Config, Device, Status,
};

// A CDC-ACM adapter with TX wired to RX
const VID: u16 = 0x2e8a;
const PID: u16 = 0x000a;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Setup logging
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .init();

    // Setup the device
    let device = Device::connect(VID, PID, Config::default())?;
    device.start()?;
    let port = device.open()?;
    println!("{} opened", port.name());

    port.set_baud_rate(115_200)?;
    port.set_dtr()?;
    port.set_timeouts(SerialTimeouts {
        read_interval_timeout: 50,
        read_total_timeout_constant: 1000,
        write_total_timeout_constant: 1000,
        ..Default::default()
    })?;

    // Send a line and read back whatever loops around
    let sent = block_on(port.write(b"hello, loopback\r\n".to_vec()));
    if sent.status != Status::Success {
        eprintln!("write failed: {}", sent.status);
    }
    let echo = block_on(port.read(64));
    println!(
        "{} ({} bytes): {:?}",
        echo.status,
        echo.information,
        String::from_utf8_lossy(&echo.data)
    );

    port.close();
    device.remove()?;
    Ok(())
}
