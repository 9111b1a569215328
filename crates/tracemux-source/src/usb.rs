use std::time::Duration;

use rusb::{Context, DeviceHandle, UsbContext};
use tracing::{debug, info};

use crate::error::{Result, SourceError};
use crate::ByteSource;

/// Bulk transfer timeout. A timeout is an empty cycle, not an error.
const BULK_TIMEOUT: Duration = Duration::from_millis(10);

/// CoreSight trace interface class triple used for autodiscovery.
const TRACE_CLASS: u8 = 0xFF;
const TRACE_SUBCLASS: u8 = 0x54;

/// Known trace probes, tried in order.
struct ProbeSpec {
    vid: u16,
    pid: u16,
    autodiscover: bool,
    iface: u8,
    ep: u8,
    name: &'static str,
}

const PROBE_TABLE: &[ProbeSpec] = &[
    ProbeSpec {
        vid: 0x1209,
        pid: 0x3443,
        autodiscover: true,
        iface: 0,
        ep: 0x81,
        name: "Orbtrace",
    },
    ProbeSpec {
        vid: 0x1d50,
        pid: 0x6018,
        autodiscover: false,
        iface: 5,
        ep: 0x85,
        name: "Blackmagic Probe",
    },
    ProbeSpec {
        vid: 0x2b3e,
        pid: 0xc610,
        autodiscover: false,
        iface: 3,
        ep: 0x85,
        name: "Phywhisperer-UDT",
    },
];

struct Claimed {
    handle: DeviceHandle<Context>,
    iface: u8,
    ep: u8,
    name: &'static str,
}

/// Reads trace bytes from a USB probe's bulk endpoint.
///
/// The probe table is rescanned whenever no device is claimed, so probes may
/// come and go; the feeder's retry backoff paces the scans.
pub struct UsbSource {
    context: Context,
    claimed: Option<Claimed>,
}

impl UsbSource {
    pub fn new() -> Result<Self> {
        Ok(Self {
            context: Context::new()?,
            claimed: None,
        })
    }

    fn claim(&mut self) -> Result<()> {
        for spec in PROBE_TABLE {
            debug!(name = spec.name, vid = spec.vid, pid = spec.pid, "probing");
            let Some(handle) = self.context.open_device_with_vid_pid(spec.vid, spec.pid) else {
                continue;
            };

            let (iface, altsetting, alternatives, ep) = match discover_interface(&handle, spec) {
                Some(found) => found,
                None => (spec.iface, 0, 1, spec.ep),
            };

            handle.claim_interface(iface)?;
            if alternatives > 1 {
                handle.set_alternate_setting(iface, altsetting)?;
            }

            info!(name = spec.name, iface, ep, "claimed trace probe");
            self.claimed = Some(Claimed {
                handle,
                iface,
                ep,
                name: spec.name,
            });
            return Ok(());
        }

        Err(SourceError::NoProbe)
    }
}

/// Scan the active configuration for a trace interface: vendor class,
/// CoreSight subclass, protocol 0 or 1, exactly one endpoint. Returns
/// `(interface, altsetting, altsetting count, endpoint)`.
fn discover_interface(
    handle: &DeviceHandle<Context>,
    spec: &ProbeSpec,
) -> Option<(u8, u8, usize, u8)> {
    if !spec.autodiscover {
        return None;
    }
    let config = handle.device().active_config_descriptor().ok()?;

    for interface in config.interfaces() {
        let alternatives = interface.descriptors().count();
        for desc in interface.descriptors() {
            if desc.class_code() != TRACE_CLASS
                || desc.sub_class_code() != TRACE_SUBCLASS
                || desc.protocol_code() > 0x01
                || desc.num_endpoints() != 1
            {
                continue;
            }
            let ep = desc.endpoint_descriptors().next()?.address();
            debug!(
                iface = desc.interface_number(),
                alt = desc.setting_number(),
                ep,
                "autodiscovered trace interface"
            );
            return Some((
                desc.interface_number(),
                desc.setting_number(),
                alternatives,
                ep,
            ));
        }
    }

    debug!("no matching interface, falling back to the probe table entry");
    None
}

impl ByteSource for UsbSource {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.claimed.is_none() {
            self.claim()?;
        }

        let Some(claimed) = self.claimed.as_mut() else {
            return Err(SourceError::NoProbe);
        };

        match claimed.handle.read_bulk(claimed.ep, buf, BULK_TIMEOUT) {
            Ok(n) => Ok(n),
            Err(rusb::Error::Timeout) => Ok(0),
            Err(err) => {
                let claimed = self.claimed.take();
                if let Some(c) = claimed {
                    let _ = c.handle.release_interface(c.iface);
                    info!(name = c.name, "usb probe lost");
                }
                Err(SourceError::Usb(err))
            }
        }
    }

    fn describe(&self) -> String {
        match &self.claimed {
            Some(c) => format!("usb probe {} (ep {:#04x})", c.name, c.ep),
            None => "usb probe (scanning)".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_table_matches_known_devices() {
        assert_eq!(PROBE_TABLE.len(), 3);
        let orbtrace = &PROBE_TABLE[0];
        assert!((orbtrace.vid, orbtrace.pid) == (0x1209, 0x3443) && orbtrace.autodiscover);
        assert!(PROBE_TABLE[1..].iter().all(|p| !p.autodiscover));
    }

    #[test]
    fn usb_errors_are_transient() {
        let err = SourceError::Usb(rusb::Error::Io);
        assert!(err.is_transient());
        assert!(SourceError::NoProbe.is_transient());
    }
}
