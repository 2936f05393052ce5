//! An in-process stand-in for a fleet of wireless sensor devices. Each
//! simulated device runs on its own thread, speaks the same control
//! vocabulary as the firmware, and feeds the coordinator's event queue
//! directly, so the whole session can be exercised without a broker or
//! any hardware on the bench.

use crate::frame::{self, SampleFrame};
use crate::session::Event;
use crate::transport::{InboundMessage, Publisher, TransportError};

use log::debug;
use rand::prelude::*;
use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;
use std::time::{Duration, Instant};

/// Behavior knobs for one simulated device.
#[derive(Debug, Clone)]
pub struct DummyDeviceSpec {
    /// Device name, matched against the controller's registry.
    pub name: String,
    /// Answer every configuration with `FAIL` instead of capturing.
    pub fail_configuration: bool,
    /// RTC value at simulator startup, seconds.
    pub rtc_base: u32,
    /// Samples produced beyond (or short of) what the configuration asks
    /// for, to exercise reconciliation.
    pub extra_samples: i64,
    /// Add per-sample noise to the ramp.
    pub jitter: bool,
    /// Pace the stream at roughly the configured frequency instead of
    /// delivering it as fast as possible.
    pub paced: bool,
}

impl DummyDeviceSpec {
    /// A well-behaved device: accurate clock, exact sample count.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fail_configuration: false,
            rtc_base: 0,
            extra_samples: 0,
            jitter: false,
            paced: false,
        }
    }
}

/// Builds a [`DummyLink`] one device at a time.
#[derive(Default)]
pub struct DummyLinkBuilder {
    specs: Vec<DummyDeviceSpec>,
}

impl DummyLinkBuilder {
    /// An empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one device with explicit behavior.
    pub fn device(mut self, spec: DummyDeviceSpec) -> Self {
        self.specs.push(spec);
        self
    }

    /// Adds a well-behaved device for each name.
    pub fn devices(mut self, names: &[String]) -> Self {
        for name in names {
            self.specs.push(DummyDeviceSpec::new(name));
        }
        self
    }

    /// Spawns the device threads. Inbound traffic lands on `events`.
    pub fn build(self, events: Sender<Event>) -> DummyLink {
        let mut txs = HashMap::new();
        let mut handles = Vec::new();
        for spec in self.specs {
            let (tx, rx) = mpsc::channel();
            txs.insert(spec.name.clone(), tx);
            let events = events.clone();
            handles.push(thread::spawn(move || device_loop(spec, rx, events)));
        }
        DummyLink { txs, handles }
    }
}

/// Handle to the running simulator.
pub struct DummyLink {
    txs: HashMap<String, Sender<Vec<u8>>>,
    handles: Vec<thread::JoinHandle<()>>,
}

impl DummyLink {
    /// The outbound half the coordinator publishes into.
    pub fn publisher(&self) -> DummyPublisher {
        DummyPublisher {
            txs: self.txs.clone(),
        }
    }

    /// Shuts the device threads down and waits for them. Call after the
    /// coordinator has stopped publishing.
    pub fn stop(mut self) {
        self.txs.clear();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

/// Routes published payloads to the matching device thread.
#[derive(Clone)]
pub struct DummyPublisher {
    txs: HashMap<String, Sender<Vec<u8>>>,
}

impl Publisher for DummyPublisher {
    fn publish(&self, device: &str, payload: &[u8]) -> Result<(), TransportError> {
        match self.txs.get(device) {
            Some(tx) => {
                let _ = tx.send(payload.to_vec());
                Ok(())
            }
            None => Err(TransportError::Publish(format!(
                "no simulated device named {device}"
            ))),
        }
    }
}

fn send_inbound(events: &Sender<Event>, device: &str, payload: Vec<u8>) -> bool {
    events
        .send(Event::Inbound(InboundMessage {
            device: device.to_owned(),
            payload,
        }))
        .is_ok()
}

fn device_loop(spec: DummyDeviceSpec, rx: Receiver<Vec<u8>>, events: Sender<Event>) {
    let booted = Instant::now();
    while let Ok(payload) = rx.recv() {
        let text = String::from_utf8_lossy(&payload);
        let text = text.trim();

        if text == "pong" {
            // Liveness probe: announce ourselves and report the RTC.
            if !send_inbound(&events, &spec.name, b"ping".to_vec()) {
                return;
            }
            let rtc = spec.rtc_base + booted.elapsed().as_secs() as u32;
            let mut report = b"TIME".to_vec();
            report.extend_from_slice(&rtc.to_le_bytes());
            if !send_inbound(&events, &spec.name, report) {
                return;
            }
        } else if text == "ping" {
            // The controller echoing our own announcement.
        } else if let Some((duration_s, frequency_hz, channel_count, _start)) =
            frame::decode_configuration(text)
        {
            if spec.fail_configuration {
                let _ = send_inbound(&events, &spec.name, b"FAIL".to_vec());
                continue;
            }
            if !send_inbound(&events, &spec.name, b"START".to_vec()) {
                return;
            }
            stream_capture(&spec, &events, duration_s, frequency_hz, channel_count);
            if !send_inbound(&events, &spec.name, b"END".to_vec()) {
                return;
            }
        } else {
            debug!("{}: ignoring unrecognized payload {text:?}", spec.name);
        }
    }
}

/// Streams a linear 0 -> full-scale ramp across the capture, batched the
/// way the firmware flushes its double buffer.
fn stream_capture(
    spec: &DummyDeviceSpec,
    events: &Sender<Event>,
    duration_s: u32,
    frequency_hz: u32,
    channel_count: u8,
) {
    let nominal = duration_s as i64 * frequency_hz as i64;
    let total = (nominal + spec.extra_samples).max(0) as usize;
    let batch_size = ((frequency_hz / 20) as usize).max(1);
    let mut rng = rand::thread_rng();

    let mut batch = Vec::new();
    for i in 0..total {
        let mut raw = if total > 1 {
            (i * 1023 / (total - 1)) as i32
        } else {
            0
        };
        if spec.jitter {
            raw = (raw + rng.gen_range(-1..=1)).clamp(0, 1023);
        }
        batch.extend(frame::encode_sample_frame(&SampleFrame {
            timestamp: (i % 65536) as u16,
            channels: vec![raw as u16; channel_count as usize],
        }));

        if batch.len() >= batch_size * frame::record_width(channel_count) || i + 1 == total {
            if !send_inbound(events, &spec.name, std::mem::take(&mut batch)) {
                return;
            }
            if spec.paced {
                spin_sleep::sleep(Duration::from_secs_f64(
                    batch_size as f64 / frequency_hz as f64,
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::DeviceRegistry;
    use crate::session::{CaptureParameters, Coordinator, SessionConfig, SessionPhase};
    use crate::ui::UiLink;
    use std::time::Duration;

    fn drain_until_idle(
        coordinator: &mut Coordinator,
        rx: &Receiver<Event>,
        deadline: Duration,
    ) -> bool {
        let until = Instant::now() + deadline;
        while Instant::now() < until {
            match rx.recv_timeout(Duration::from_millis(100)) {
                Ok(event) => {
                    coordinator.handle_event(event);
                    if coordinator.phase() == SessionPhase::Idle
                        || coordinator.phase() == SessionPhase::Aborted
                    {
                        return true;
                    }
                }
                Err(_) => continue,
            }
        }
        false
    }

    fn drive(
        specs: Vec<DummyDeviceSpec>,
        params: CaptureParameters,
    ) -> (Coordinator, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let names: Vec<String> = specs.iter().map(|s| s.name.clone()).collect();
        let (event_tx, event_rx) = mpsc::channel();

        let mut builder = DummyLinkBuilder::new();
        for spec in specs {
            builder = builder.device(spec);
        }
        let link = builder.build(event_tx.clone());

        let registry = DeviceRegistry::new(&names);
        let (ui_tx, _ui_rx) = mpsc::channel();
        let config = SessionConfig {
            output_dir: dir.path().to_path_buf(),
            ..SessionConfig::default()
        };
        let mut coordinator = Coordinator::new(
            registry,
            Box::new(link.publisher()),
            UiLink::new(ui_tx),
            config,
        );

        coordinator.handle_event(Event::Probe);
        // Let every device answer the probe and report its clock before
        // starting.
        let probe_deadline = Instant::now() + Duration::from_secs(2);
        let fleet_ready = |c: &Coordinator| {
            names.iter().all(|name| {
                c.registry().is_connected(name) && c.registry().clock_snapshot(name).is_some()
            })
        };
        while Instant::now() < probe_deadline && !fleet_ready(&coordinator) {
            if let Ok(event) = event_rx.recv_timeout(Duration::from_millis(100)) {
                coordinator.handle_event(event);
            }
        }

        coordinator.handle_event(Event::Start(params));
        assert!(drain_until_idle(
            &mut coordinator,
            &event_rx,
            Duration::from_secs(5)
        ));

        drop(event_tx);
        link.stop();
        (coordinator, dir)
    }

    fn params() -> CaptureParameters {
        CaptureParameters {
            duration_s: 1,
            frequency_hz: 200,
            channel_count: 2,
            label: "sim".to_owned(),
        }
    }

    #[test]
    fn a_simulated_fleet_completes_a_capture() {
        let specs = vec![
            DummyDeviceSpec::new("sensor1"),
            DummyDeviceSpec::new("sensor2"),
        ];
        let (coordinator, dir) = drive(specs, params());

        assert_eq!(coordinator.phase(), SessionPhase::Idle);
        let text = std::fs::read_to_string(dir.path().join("sim.csv")).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "sensor1,,,sensor2,,");
        assert_eq!(lines[1], "Time,CH1,CH2,Time,CH1,CH2");
        assert_eq!(lines.len(), 2 + 200);
    }

    #[test]
    fn an_over_reporting_device_is_truncated() {
        let mut eager = DummyDeviceSpec::new("sensor1");
        eager.extra_samples = 17;
        let specs = vec![eager, DummyDeviceSpec::new("sensor2")];
        let (_, dir) = drive(specs, params());

        let text = std::fs::read_to_string(dir.path().join("sim.csv")).unwrap();
        assert_eq!(text.lines().count(), 2 + 200);
    }

    #[test]
    fn a_fleet_that_fails_configuration_aborts() {
        let mut bad1 = DummyDeviceSpec::new("sensor1");
        bad1.fail_configuration = true;
        let mut bad2 = DummyDeviceSpec::new("sensor2");
        bad2.fail_configuration = true;
        let (coordinator, dir) = drive(vec![bad1, bad2], params());

        assert_eq!(coordinator.phase(), SessionPhase::Aborted);
        assert!(!dir.path().join("sim.csv").exists());
    }

    #[test]
    fn publishing_to_an_unknown_device_is_an_error() {
        let (event_tx, _event_rx) = mpsc::channel();
        let link = DummyLinkBuilder::new()
            .devices(&["sensor1".to_owned()])
            .build(event_tx);
        let publisher = link.publisher();
        assert!(publisher.publish("sensor9", b"pong").is_err());
        link.stop();
    }
}
