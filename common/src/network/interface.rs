use pnet::datalink::{self, NetworkInterface};
use pnet::ipnetwork::IpNetwork;
#[cfg(target_os = "macos")]
use macos_impl::{is_physical, is_wireless};
#[cfg(target_os = "linux")]
use linux_impl::{is_physical, is_wireless};
#[cfg(not(any(target_os = "linux", target_os = "macos")))]
use fallback_impl::{is_physical, is_wireless};

use crate::error::{Error, Result};

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ViabilityError {
    /// The interface is operationally down.
    IsDown,
    /// Loopback or virtual device.
    NotPhysical,
    /// The interface does not have a MAC address.
    NoMacAddress,
    /// The interface is a point-to-point link (e.g., a VPN).
    IsPointToPoint,
    /// No IPv4 address, so ARP discovery cannot run from it.
    NoIpv4,
}

/// Validates an interface name supplied by the operator.
///
/// Only the shape of the name is checked here; whether the device exists is
/// left to [`find_interface`] so callers without device access (tests, dry
/// runs) can still validate arguments.
pub fn validate_name(interface: &str) -> Result<()> {
    let trimmed = interface.trim();
    if trimmed.is_empty() {
        return Err(Error::invalid_argument("interface", "interface name is empty"));
    }
    if trimmed.len() > 15 || trimmed.chars().any(|c| c.is_whitespace() || c == '/') {
        return Err(Error::invalid_argument(
            "interface",
            format!("'{interface}' is not a valid interface name"),
        ));
    }
    Ok(())
}

pub fn find_interface(name: &str) -> Option<NetworkInterface> {
    datalink::interfaces().into_iter().find(|i| i.name == name)
}

/// Picks the interface an assessment should run on when none was given:
/// viable wireless devices first, then any viable device.
pub fn select_assessment_interface() -> Result<NetworkInterface> {
    let viable: Vec<NetworkInterface> = datalink::interfaces()
        .into_iter()
        .filter(|i| is_viable_interface(i, is_physical).is_ok())
        .collect();

    select_best_interface(viable, is_wireless).ok_or_else(|| {
        Error::invalid_argument("interface", "no viable interface available for assessment")
    })
}

/// The first private IPv4 network configured on `interface`.
pub fn primary_ipv4_network(interface: &NetworkInterface) -> Option<IpNetwork> {
    interface
        .ips
        .iter()
        .find(|net| matches!(net, IpNetwork::V4(v4) if v4.ip().is_private()))
        .copied()
}

fn is_viable_interface(
    interface: &NetworkInterface,
    is_physical: impl Fn(&NetworkInterface) -> bool,
) -> std::result::Result<(), ViabilityError> {
    if !interface.is_up() {
        return Err(ViabilityError::IsDown);
    }
    if interface.is_loopback() || !is_physical(interface) {
        return Err(ViabilityError::NotPhysical);
    }
    if interface.mac.is_none() {
        return Err(ViabilityError::NoMacAddress);
    }
    if interface.is_point_to_point() {
        return Err(ViabilityError::IsPointToPoint);
    }
    if !interface.ips.iter().any(|net| net.is_ipv4()) {
        return Err(ViabilityError::NoIpv4);
    }
    Ok(())
}

fn select_best_interface(
    interfaces: Vec<NetworkInterface>,
    is_wireless: impl Fn(&NetworkInterface) -> bool,
) -> Option<NetworkInterface> {
    interfaces
        .iter()
        .find(|interface| is_wireless(interface))
        .or_else(|| interfaces.first())
        .cloned()
}

#[cfg(target_os = "linux")]
mod linux_impl {
    use super::*;
    use std::path::Path;

    pub fn is_physical(interface: &NetworkInterface) -> bool {
        Path::new(&format!("/sys/class/net/{}/device", interface.name)).exists()
    }

    pub fn is_wireless(interface: &NetworkInterface) -> bool {
        Path::new(&format!("/sys/class/net/{}/wireless", interface.name)).exists()
    }
}

#[cfg(target_os = "macos")]
mod macos_impl {
    use super::*;
    use std::collections::HashSet;
    use std::process::Command;
    use std::sync::OnceLock;

    struct HardwareInfo {
        physical_devices: HashSet<String>,
        wireless_devices: HashSet<String>,
    }

    /// Runs `networksetup` once on first access.
    fn get_hardware_info() -> &'static HardwareInfo {
        static HARDWARE_INFO: OnceLock<HardwareInfo> = OnceLock::new();

        HARDWARE_INFO.get_or_init(|| {
            let mut physical = HashSet::new();
            let mut wireless = HashSet::new();

            if let Ok(output) = Command::new("networksetup").arg("-listallhardwareports").output() {
                let stdout = String::from_utf8_lossy(&output.stdout);
                for line in stdout.lines() {
                    if let Some(device) = line.strip_prefix("Device: ") {
                        physical.insert(device.trim().to_string());
                    }
                }
            }

            for device in &physical {
                let is_wifi = Command::new("networksetup")
                    .arg("-getairportnetwork")
                    .arg(device)
                    .output()
                    .map(|out| out.status.success())
                    .unwrap_or(false);

                if is_wifi {
                    wireless.insert(device.clone());
                }
            }

            HardwareInfo {
                physical_devices: physical,
                wireless_devices: wireless,
            }
        })
    }

    pub fn is_physical(interface: &NetworkInterface) -> bool {
        get_hardware_info().physical_devices.contains(&interface.name)
    }

    pub fn is_wireless(interface: &NetworkInterface) -> bool {
        get_hardware_info().wireless_devices.contains(&interface.name)
    }
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
mod fallback_impl {
    use super::*;

    pub fn is_physical(interface: &NetworkInterface) -> bool {
        !interface.is_loopback()
    }

    pub fn is_wireless(interface: &NetworkInterface) -> bool {
        interface.name.starts_with("wl")
    }
}

// ╔════════════════════════════════════════════╗
// ║ ████████╗███████╗███████╗████████╗███████╗ ║
// ║ ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝██╔════╝ ║
// ║    ██║   █████╗  ███████╗   ██║   ███████╗ ║
// ║    ██║   ██╔══╝  ╚════██║   ██║   ╚════██║ ║
// ║    ██║   ███████╗███████║   ██║   ███████║ ║
// ║    ╚═╝   ╚══════╝╚══════╝   ╚═╝   ╚══════╝ ║
// ╚════════════════════════════════════════════╝
