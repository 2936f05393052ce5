//! The boundary the session core presents to whatever front end is
//! attached. The core never renders anything; it emits [`UiEvent`]s and
//! the binaries decide whether those become log lines or TUI updates.
//! Send failures are ignored on purpose: a departed front end must never
//! take the session down.

use std::sync::mpsc::Sender;

/// Everything the front end can be told about.
#[derive(Debug, Clone, PartialEq)]
pub enum UiEvent {
    /// A status line for the operator, mirroring the serial-output pane
    /// of the original bench tool.
    Status(String),
    /// A device's connection indicator changed.
    Connectivity {
        /// Device name.
        device: String,
        /// New indicator state.
        connected: bool,
    },
    /// A capture started (true) or finished/aborted (false).
    CaptureActive(bool),
    /// The start control should be enabled or disabled.
    StartControl(bool),
    /// Freshly decoded voltages for live plotting, one inner vector per
    /// channel.
    LiveSamples {
        /// Device the batch came from.
        device: String,
        /// Per-channel voltage batches, integer channel order.
        channels: Vec<Vec<f32>>,
    },
}

/// Cheap cloneable handle the coordinator uses to talk to the front end.
#[derive(Debug, Clone)]
pub struct UiLink {
    tx: Sender<UiEvent>,
}

impl UiLink {
    /// Wraps the sending half of the front end's event channel.
    pub fn new(tx: Sender<UiEvent>) -> Self {
        Self { tx }
    }

    /// Emits a status line.
    pub fn status(&self, text: impl Into<String>) {
        let _ = self.tx.send(UiEvent::Status(text.into()));
    }

    /// Updates a device's connection indicator.
    pub fn connectivity(&self, device: &str, connected: bool) {
        let _ = self.tx.send(UiEvent::Connectivity {
            device: device.to_owned(),
            connected,
        });
    }

    /// Flags the start or end of a capture.
    pub fn capture_active(&self, active: bool) {
        let _ = self.tx.send(UiEvent::CaptureActive(active));
    }

    /// Enables or disables the start control.
    pub fn start_control(&self, enabled: bool) {
        let _ = self.tx.send(UiEvent::StartControl(enabled));
    }

    /// Forwards a batch of decoded voltages for live display.
    pub fn live_samples(&self, device: &str, channels: Vec<Vec<f32>>) {
        let _ = self.tx.send(UiEvent::LiveSamples {
            device: device.to_owned(),
            channels,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::channel;

    #[test]
    fn events_arrive_in_order() {
        let (tx, rx) = channel();
        let ui = UiLink::new(tx);
        ui.status("hello");
        ui.connectivity("sensor1", true);
        ui.capture_active(true);

        assert_eq!(rx.recv().unwrap(), UiEvent::Status("hello".to_owned()));
        assert_eq!(
            rx.recv().unwrap(),
            UiEvent::Connectivity {
                device: "sensor1".to_owned(),
                connected: true
            }
        );
        assert_eq!(rx.recv().unwrap(), UiEvent::CaptureActive(true));
    }

    #[test]
    fn a_dropped_front_end_is_harmless() {
        let (tx, rx) = channel();
        let ui = UiLink::new(tx);
        drop(rx);
        ui.status("nobody is listening");
        ui.start_control(true);
    }
}
