//! Headless capture controller. Probes the configured devices, starts a
//! capture as soon as the whole fleet has checked in, and exits once the
//! record has been written (or the capture was refused or aborted).

use clap::Parser;
use emglink::{
    args::EmgArgs,
    dummy_link::DummyLinkBuilder,
    mqtt_link::MqttLink,
    registry::DeviceRegistry,
    session::{CaptureParameters, Coordinator, Event, SessionConfig},
    transport::{NullPublisher, Publisher},
    ui::{UiEvent, UiLink},
};
use log::{info, warn};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::mpsc;
use std::thread;

/// What the main loop should do after feeding one event to the pilot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    /// Keep draining events.
    Continue,
    /// The fleet is up; issue the start request now.
    StartCapture,
    /// The capture ran to completion (or aborted); time to exit.
    Done,
    /// The start request was refused; exit instead of waiting forever.
    Refused,
}

/// Decides when to start the capture and when to give up, from the UI
/// event stream alone.
struct AutoPilot {
    fleet_size: usize,
    connected: HashSet<String>,
    start_enabled: bool,
    started: bool,
    capture_seen: bool,
}

impl AutoPilot {
    fn new(fleet_size: usize) -> Self {
        Self {
            fleet_size,
            connected: HashSet::new(),
            start_enabled: false,
            started: false,
            capture_seen: false,
        }
    }

    fn observe(&mut self, event: &UiEvent) -> Verdict {
        match event {
            UiEvent::Connectivity { device, connected } => {
                if *connected {
                    self.connected.insert(device.clone());
                } else {
                    self.connected.remove(device);
                }
            }
            UiEvent::StartControl(enabled) => {
                // The control coming back on after our start request but
                // before any capture began means the request was refused
                // (skew, no clocks); a retry would only fail the same way.
                if *enabled && self.started && !self.capture_seen {
                    return Verdict::Refused;
                }
                self.start_enabled = *enabled;
            }
            UiEvent::CaptureActive(active) => {
                if *active {
                    self.capture_seen = true;
                } else if self.capture_seen {
                    return Verdict::Done;
                }
            }
            UiEvent::Status(_) | UiEvent::LiveSamples { .. } => {}
        }

        if !self.started && self.start_enabled && self.connected.len() == self.fleet_size {
            self.started = true;
            return Verdict::StartCapture;
        }
        Verdict::Continue
    }
}

fn main() {
    env_logger::init();
    let args = EmgArgs::parse();

    let (event_tx, event_rx) = mpsc::channel();
    let (ui_tx, ui_rx) = mpsc::channel();

    let mut dummy = None;
    let publisher: Box<dyn Publisher> = if args.demo {
        let link = DummyLinkBuilder::new()
            .devices(&args.devices)
            .build(event_tx.clone());
        let publisher = Box::new(link.publisher());
        dummy = Some(link);
        publisher
    } else {
        match MqttLink::connect(
            &args.client_id,
            &args.broker_host,
            args.broker_port,
            event_tx.clone(),
        ) {
            Ok(link) => Box::new(link),
            Err(e) => {
                warn!("{e}; continuing without a broker");
                Box::new(NullPublisher)
            }
        }
    };

    let registry = DeviceRegistry::new(&args.devices);
    let config = SessionConfig {
        forward_offset_secs: args.forward_offset,
        skew_limit_secs: args.skew_limit.unwrap_or(args.forward_offset as f64),
        output_dir: PathBuf::from("."),
        analysis_command: args.analysis.clone(),
    };
    let coordinator = Coordinator::new(registry, publisher, UiLink::new(ui_tx), config);
    let session_thread = thread::spawn(move || coordinator.run(event_rx));

    info!("probing {} devices", args.devices.len());
    let _ = event_tx.send(Event::Probe);

    let params = CaptureParameters {
        duration_s: args.duration,
        frequency_hz: args.frequency,
        channel_count: args.channels,
        label: args.label.clone(),
    };

    let mut pilot = AutoPilot::new(args.devices.len());
    for event in ui_rx.iter() {
        if let UiEvent::Status(line) = &event {
            info!("{line}");
        }
        match pilot.observe(&event) {
            Verdict::Continue => {}
            Verdict::StartCapture => {
                info!("all {} devices up, starting capture", args.devices.len());
                let _ = event_tx.send(Event::Start(params.clone()));
            }
            Verdict::Done => break,
            Verdict::Refused => {
                warn!("capture start was refused, giving up");
                break;
            }
        }
    }

    let _ = event_tx.send(Event::Shutdown);
    drop(event_tx);
    let _ = session_thread.join();
    if let Some(link) = dummy {
        link.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn up(device: &str) -> UiEvent {
        UiEvent::Connectivity {
            device: device.to_owned(),
            connected: true,
        }
    }

    fn bring_fleet_up(pilot: &mut AutoPilot) -> Verdict {
        assert_eq!(pilot.observe(&up("sensor1")), Verdict::Continue);
        assert_eq!(pilot.observe(&UiEvent::StartControl(true)), Verdict::Continue);
        pilot.observe(&up("sensor2"))
    }

    #[test]
    fn starts_once_when_the_whole_fleet_is_up() {
        let mut pilot = AutoPilot::new(2);
        assert_eq!(bring_fleet_up(&mut pilot), Verdict::StartCapture);
        // More connectivity chatter never starts a second capture.
        assert_eq!(pilot.observe(&up("sensor1")), Verdict::Continue);
    }

    #[test]
    fn waits_while_any_device_is_still_down() {
        let mut pilot = AutoPilot::new(2);
        assert_eq!(pilot.observe(&UiEvent::StartControl(true)), Verdict::Continue);
        assert_eq!(pilot.observe(&up("sensor1")), Verdict::Continue);
    }

    #[test]
    fn a_refused_start_gives_up_instead_of_waiting() {
        let mut pilot = AutoPilot::new(2);
        assert_eq!(bring_fleet_up(&mut pilot), Verdict::StartCapture);
        // The session re-enables the start control without ever flagging
        // an active capture: the request was refused.
        assert_eq!(
            pilot.observe(&UiEvent::Status("capture start refused: device clocks".to_owned())),
            Verdict::Continue
        );
        assert_eq!(pilot.observe(&UiEvent::StartControl(true)), Verdict::Refused);
    }

    #[test]
    fn a_completed_capture_is_done_not_refused() {
        let mut pilot = AutoPilot::new(2);
        assert_eq!(bring_fleet_up(&mut pilot), Verdict::StartCapture);
        assert_eq!(pilot.observe(&UiEvent::StartControl(false)), Verdict::Continue);
        assert_eq!(pilot.observe(&UiEvent::CaptureActive(true)), Verdict::Continue);
        assert_eq!(pilot.observe(&UiEvent::CaptureActive(false)), Verdict::Done);
        // The start control coming back after completion is routine.
        let mut after = AutoPilot::new(2);
        assert_eq!(bring_fleet_up(&mut after), Verdict::StartCapture);
        assert_eq!(after.observe(&UiEvent::CaptureActive(true)), Verdict::Continue);
        assert_eq!(after.observe(&UiEvent::StartControl(true)), Verdict::Continue);
    }

    #[test]
    fn enabling_the_control_before_any_start_is_not_a_refusal() {
        let mut pilot = AutoPilot::new(1);
        assert_eq!(pilot.observe(&UiEvent::StartControl(true)), Verdict::Continue);
        assert_eq!(pilot.observe(&up("sensor1")), Verdict::StartCapture);
    }
}
