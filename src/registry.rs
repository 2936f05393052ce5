//! In-memory table of the known sensor devices: connectivity, the most
//! recent RTC snapshot, and the per-device capture flags. Slots are
//! created once at startup in a fixed registration order and never
//! destroyed; that order decides which status indicator a device drives
//! and the column order of the final record.

use std::fmt::{self, Display};
use std::time::Instant;

/// Whether a device has answered a liveness probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    /// No liveness reply seen since the last probe.
    Disconnected,
    /// The device answered a `ping`/`pong` on its topic.
    Connected,
}

/// A device RTC reading paired with the local instant it arrived, so the
/// current device time can be estimated later.
#[derive(Debug, Clone, Copy)]
pub struct ClockSnapshot {
    /// Raw device clock value, in seconds.
    pub rtc_secs: u32,
    /// Local monotonic time when the report was received.
    pub read_at: Instant,
}

#[derive(Debug)]
struct DeviceSlot {
    name: String,
    connectivity: Connectivity,
    clock: Option<ClockSnapshot>,
    // armed: configuration sent, waiting for START/FAIL.
    // active: START received, samples expected until END.
    armed: bool,
    active: bool,
}

impl DeviceSlot {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            connectivity: Connectivity::Disconnected,
            clock: None,
            armed: false,
            active: false,
        }
    }
}

/// Returned when a caller names a device that was never registered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownDevice(pub String);

impl Display for UnknownDevice {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "unknown device {:?}", self.0)
    }
}

impl std::error::Error for UnknownDevice {}

/// The fixed-order device table. All queries iterate in registration
/// order, not in the order runtime events happened to arrive.
#[derive(Debug)]
pub struct DeviceRegistry {
    slots: Vec<DeviceSlot>,
}

impl DeviceRegistry {
    /// Builds a registry with one disconnected slot per name, in the
    /// order given.
    pub fn new(names: &[String]) -> Self {
        Self {
            slots: names.iter().map(|n| DeviceSlot::new(n)).collect(),
        }
    }

    fn slot(&self, name: &str) -> Option<&DeviceSlot> {
        self.slots.iter().find(|s| s.name == name)
    }

    fn slot_mut(&mut self, name: &str) -> Result<&mut DeviceSlot, UnknownDevice> {
        self.slots
            .iter_mut()
            .find(|s| s.name == name)
            .ok_or_else(|| UnknownDevice(name.to_owned()))
    }

    /// True if `name` was registered at construction.
    pub fn contains(&self, name: &str) -> bool {
        self.slot(name).is_some()
    }

    /// All registered device names, in registration order.
    pub fn names(&self) -> Vec<String> {
        self.slots.iter().map(|s| s.name.clone()).collect()
    }

    /// Marks a device as having answered a liveness probe.
    pub fn set_connected(&mut self, name: &str) -> Result<(), UnknownDevice> {
        self.slot_mut(name)?.connectivity = Connectivity::Connected;
        Ok(())
    }

    /// Marks a device as unreachable, e.g. when a fresh probe round begins.
    pub fn set_disconnected(&mut self, name: &str) -> Result<(), UnknownDevice> {
        self.slot_mut(name)?.connectivity = Connectivity::Disconnected;
        Ok(())
    }

    /// True if the device has answered a probe since the last reset.
    pub fn is_connected(&self, name: &str) -> bool {
        self.slot(name)
            .map(|s| s.connectivity == Connectivity::Connected)
            .unwrap_or(false)
    }

    /// Names of all connected devices, in registration order.
    pub fn connected_devices(&self) -> Vec<String> {
        self.slots
            .iter()
            .filter(|s| s.connectivity == Connectivity::Connected)
            .map(|s| s.name.clone())
            .collect()
    }

    /// Stores the latest RTC report for a device.
    pub fn record_clock_snapshot(
        &mut self,
        name: &str,
        rtc_secs: u32,
        read_at: Instant,
    ) -> Result<(), UnknownDevice> {
        self.slot_mut(name)?.clock = Some(ClockSnapshot { rtc_secs, read_at });
        Ok(())
    }

    /// The most recent RTC report for a device, if one has arrived.
    pub fn clock_snapshot(&self, name: &str) -> Option<ClockSnapshot> {
        self.slot(name).and_then(|s| s.clock)
    }

    /// Sets the waiting-for-START flag for a device.
    pub fn set_armed(&mut self, name: &str, armed: bool) -> Result<(), UnknownDevice> {
        self.slot_mut(name)?.armed = armed;
        Ok(())
    }

    /// Sets the streaming flag for a device.
    pub fn set_active(&mut self, name: &str, active: bool) -> Result<(), UnknownDevice> {
        self.slot_mut(name)?.active = active;
        Ok(())
    }

    /// True while a configuration reply is outstanding for the device.
    pub fn is_armed(&self, name: &str) -> bool {
        self.slot(name).map(|s| s.armed).unwrap_or(false)
    }

    /// True while the device is expected to be streaming samples.
    pub fn is_active(&self, name: &str) -> bool {
        self.slot(name).map(|s| s.active).unwrap_or(false)
    }

    /// True when no device is still streaming: every slot is either
    /// disconnected or has finished (or never started) its capture. Used
    /// to decide session-wide completion.
    pub fn all_disconnected_or_ended(&self) -> bool {
        self.slots
            .iter()
            .all(|s| s.connectivity == Connectivity::Disconnected || !s.active)
    }
}
