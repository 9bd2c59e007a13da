use serde::Serialize;
use serialport::{SerialPortInfo, SerialPortType};
use std::collections::HashSet;

/// A serial device the station could talk to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortEntry {
    pub name: String,
    pub kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usb_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product: Option<String>,
}

impl From<SerialPortInfo> for PortEntry {
    fn from(info: SerialPortInfo) -> Self {
        match info.port_type {
            SerialPortType::UsbPort(usb) => Self {
                name: info.port_name,
                kind: "usb",
                usb_id: Some(format!("{:04x}:{:04x}", usb.vid, usb.pid)),
                product: usb.product,
            },
            SerialPortType::PciPort => Self::plain(info.port_name, "pci"),
            SerialPortType::BluetoothPort => Self::plain(info.port_name, "bluetooth"),
            SerialPortType::Unknown => Self::plain(info.port_name, "unknown"),
        }
    }
}

impl PortEntry {
    fn plain(name: String, kind: &'static str) -> Self {
        Self {
            name,
            kind,
            usb_id: None,
            product: None,
        }
    }
}

/// Available serial ports, USB adapters first. Enumeration failures yield an empty list.
pub fn available_ports() -> Vec<PortEntry> {
    let raw = match serialport::available_ports() {
        Ok(ports) => ports,
        Err(err) => {
            log::warn!("Failed to enumerate serial ports: {err}");
            Vec::new()
        }
    };
    sort_and_dedup(raw.into_iter().map(PortEntry::from).collect())
}

// USB serial adapters and CDC-ACM boards are what a test jig plugs in.
fn priority(name: &str) -> u8 {
    let n = name.to_lowercase();
    if n.contains("usb") {
        0
    } else if n.contains("acm") {
        1
    } else if n.contains("ttys") || n.contains("serial") {
        2
    } else {
        10
    }
}

pub(crate) fn sort_and_dedup(ports: Vec<PortEntry>) -> Vec<PortEntry> {
    let mut seen = HashSet::new();
    let mut unique: Vec<PortEntry> = ports
        .into_iter()
        .filter(|port| seen.insert(port.name.clone()))
        .collect();
    unique.sort_by(|a, b| {
        priority(&a.name)
            .cmp(&priority(&b.name))
            .then_with(|| a.name.cmp(&b.name))
    });
    unique
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make(name: &str) -> PortEntry {
        PortEntry::plain(name.to_string(), "unknown")
    }

    #[test]
    fn test_usb_and_acm_first() {
        let ports = sort_and_dedup(vec![
            make("/dev/ttyS1"),
            make("/dev/ttyACM0"),
            make("/dev/ttyS0"),
            make("/dev/ttyUSB0"),
            make("/dev/ttyS0"),
            make("/tmp/ttyMBT01"),
        ]);
        let names: Vec<&str> = ports.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "/dev/ttyUSB0",
                "/dev/ttyACM0",
                "/dev/ttyS0",
                "/dev/ttyS1",
                "/tmp/ttyMBT01"
            ]
        );
    }
}
