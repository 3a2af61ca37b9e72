//! Heuristic recognition of ODrive-like serial ports.

use crate::serial::PortDescriptor;

const NAME_HINTS: [&str; 5] = ["odrive", "usb serial", "cp210", "ftdi", "ch340"];

/// pid.codes VID used by ODrive Robotics, with the native and DFU PIDs
const USB_IDS: [(u16, u16); 2] = [(0x1209, 0x0D32), (0x1209, 0x0D33)];

/// True when the port looks like it could be an ODrive or a common USB-UART
/// bridge in front of one. False negatives are fine: any port can still be
/// connected by path.
pub fn is_candidate(port: &PortDescriptor) -> bool {
    let name_matches = [&port.manufacturer, &port.product].into_iter().flatten().any(|text| {
        let text = text.to_lowercase();
        NAME_HINTS.iter().any(|hint| text.contains(hint))
    });
    if name_matches {
        return true;
    }

    matches!((port.vid, port.pid), (Some(vid), Some(pid)) if USB_IDS.contains(&(vid, pid)))
}

/// Filter an enumeration down to candidates, keeping its order.
pub fn discover_candidates(ports: &[PortDescriptor]) -> Vec<PortDescriptor> {
    ports.iter().filter(|p| is_candidate(p)).cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usb(vid: u16, pid: u16, manufacturer: Option<&str>, product: Option<&str>) -> PortDescriptor {
        PortDescriptor {
            port_name: "/dev/ttyACM0".into(),
            vid: Some(vid),
            pid: Some(pid),
            serial_number: None,
            manufacturer: manufacturer.map(String::from),
            product: product.map(String::from),
        }
    }

    #[test]
    fn matches_known_usb_ids() {
        assert!(is_candidate(&usb(0x1209, 0x0D32, None, None)));
        assert!(is_candidate(&usb(0x1209, 0x0D33, None, None)));
        assert!(!is_candidate(&usb(0x1209, 0x0D34, None, None)));
    }

    #[test]
    fn matches_names_case_insensitively() {
        assert!(is_candidate(&usb(0x1234, 0x0001, Some("ODrive Robotics"), None)));
        assert!(is_candidate(&usb(0x10C4, 0xEA60, Some("Silicon Labs"), Some("cp2102 USB to UART"))));
        assert!(is_candidate(&usb(0x0403, 0x6001, Some("ftdi"), None)));
        assert!(is_candidate(&usb(0x1A86, 0x7523, None, Some("USB-SERIAL CH340"))));
        assert!(!is_candidate(&usb(0x046D, 0xC52B, Some("Logitech"), Some("Unifying Receiver"))));
    }

    #[test]
    fn bare_paths_are_not_candidates() {
        assert!(!is_candidate(&PortDescriptor::from_path("/dev/ttyS0")));
    }

    #[test]
    fn discovery_keeps_order() {
        let ports = vec![
            usb(0x1209, 0x0D32, None, None),
            PortDescriptor::from_path("/dev/ttyS0"),
            usb(0x0403, 0x6001, Some("FTDI"), None),
        ];
        let found = discover_candidates(&ports);
        assert_eq!(found.len(), 2);
        assert_eq!(found[1].manufacturer.as_deref(), Some("FTDI"));
    }
}
