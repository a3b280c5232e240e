//! Serial-port discovery for the Bluefruit adapter
//!
//! The adapter is hot-pluggable: the supervisor polls for a matching USB
//! serial device, opens it, and re-discovers after a session failure.
//! Matching is by a regex over the `vvvv:pppp` vendor/product string.

use regex::Regex;
use tokio_serial::SerialPortType;
use tracing::debug;

use crate::error::TransportError;

/// Default pattern: any Adafruit (Bluefruit) USB serial device.
pub const DEFAULT_PORT_PATTERN: &str = "^239a:";

/// Find the first serial port whose USB `vvvv:pppp` id matches `pattern`.
pub fn find_adapter_port(pattern: &Regex) -> Result<Option<String>, TransportError> {
    for port in tokio_serial::available_ports()? {
        if let SerialPortType::UsbPort(usb) = &port.port_type {
            if id_matches(usb.vid, usb.pid, pattern) {
                debug!(
                    "Adapter candidate {} ({:04x}:{:04x})",
                    port.port_name, usb.vid, usb.pid
                );
                return Ok(Some(port.port_name));
            }
        }
    }
    Ok(None)
}

fn id_matches(vid: u16, pid: u16, pattern: &Regex) -> bool {
    pattern.is_match(&format!("{vid:04x}:{pid:04x}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_vendor_product_string() {
        let bluefruit = Regex::new(DEFAULT_PORT_PATTERN).unwrap();
        assert!(id_matches(0x239a, 0x8029, &bluefruit));
        assert!(!id_matches(0x0403, 0x6001, &bluefruit));

        let exact = Regex::new("^0403:6001$").unwrap();
        assert!(id_matches(0x0403, 0x6001, &exact));
        assert!(!id_matches(0x0403, 0x6015, &exact));
    }
}
