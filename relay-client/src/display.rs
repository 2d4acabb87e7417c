//! Plain-text rendering of discovery results, bridge status and devices.

use std::fmt::Write;

use relay_core::RemoteDeviceSnapshot;
use relay_core::beacon::LocationSet;
use relay_core::protocol::{StatusText, TrackingState};

pub fn render_locations(locations: &LocationSet) -> String {
    if locations.is_empty() {
        return "no relay servers found\n".into();
    }
    let mut out = String::new();
    for location in locations.iter() {
        let _ = writeln!(out, "{:<24} payload {:?}", location.address, location.payload);
    }
    out
}

/// One line per status part, as the host shows them.
pub fn render_status(status: &StatusText, hostname: Option<&str>, ping_ms: Option<u64>) -> String {
    let mut out = format!("{} [{}]\n  {}\n", status.header, status.code, status.description);
    if let Some(hostname) = hostname {
        let _ = writeln!(out, "  server: {hostname}");
    }
    if let Some(ping) = ping_ms {
        let _ = writeln!(out, "  ping: {ping} ms");
    }
    out
}

pub fn render_devices(devices: &[(String, RemoteDeviceSnapshot)]) -> String {
    let mut out = String::new();
    for (key, device) in devices {
        let status = device.status();
        let tracked = device.joints.iter().filter(|j| j.tracking_state == TrackingState::Tracked).count();
        let _ = writeln!(
            out,
            "{key}\n  {} ({}) {} joints, {tracked} tracked, {}",
            device.name,
            if device.initialized { "initialized" } else { "idle" },
            device.joints.len(),
            status.code,
        );
    }
    if out.is_empty() {
        out.push_str("no devices\n");
    }
    out
}
