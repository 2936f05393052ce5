//! The capture session state machine. A single [`Coordinator`] owns the
//! device registry and the in-flight session, and drains one event queue
//! that carries both inbound broker messages and operator actions. That
//! one queue is the whole concurrency story: every state mutation happens
//! on the coordinator's thread, in arrival order.

use crate::analysis;
use crate::clock::{self, ClockError};
use crate::frame::{self, InboundKind};
use crate::record::{self, CaptureRecord, RecordError};
use crate::registry::DeviceRegistry;
use crate::transport::{InboundMessage, Publisher};
use crate::ui::UiLink;

use log::{debug, info, warn};
use std::fmt::{self, Display};
use std::path::PathBuf;
use std::sync::mpsc::Receiver;
use std::time::Instant;

/// Operator-supplied parameters for one capture. Read once when the
/// capture starts and latched for its whole duration; in particular the
/// channel count fixes the binary record width until the capture ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureParameters {
    /// Capture length in seconds.
    pub duration_s: u32,
    /// Sampling frequency in Hz.
    pub frequency_hz: u32,
    /// ADC channels recorded per device, 1 to 3.
    pub channel_count: u8,
    /// Output label; the record is written as `<label>.csv`.
    pub label: String,
}

/// Where one device is in its capture lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceCaptureState {
    /// Not part of a capture.
    Idle,
    /// Configuration sent, waiting for `START` or `FAIL`.
    Configured,
    /// `START` received, samples expected.
    Armed,
    /// `END` received, stream complete.
    Ended,
}

/// The session phase derived from the per-device states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// No capture in flight.
    Idle,
    /// Configurations sent, no device streaming yet.
    Starting,
    /// At least one device is streaming.
    Active,
    /// Every participant has ended; reconciliation is due.
    Completing,
    /// The last configured device failed; no record was produced.
    Aborted,
}

/// Everything the coordinator reacts to, in one queue so that operator
/// actions and network delivery cannot race.
#[derive(Debug)]
pub enum Event {
    /// A payload arrived from a device topic.
    Inbound(InboundMessage),
    /// The operator asked to start a capture.
    Start(CaptureParameters),
    /// The operator asked to stop and finalize the capture.
    Stop,
    /// The operator asked to re-probe device liveness.
    Probe,
    /// Drain no further events; the coordinator thread returns.
    Shutdown,
}

/// Why a capture start was refused. Refusal is atomic: no configuration
/// is sent and no state changes.
#[derive(Debug)]
pub enum SessionError {
    /// No device has answered a liveness probe.
    NoConnectedDevices,
    /// The clock synchronizer could not pick a start instant.
    Clock(ClockError),
    /// The finished record could not be written.
    Record(RecordError),
}

impl Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SessionError::NoConnectedDevices => write!(f, "no connected devices"),
            SessionError::Clock(e) => write!(f, "{e}"),
            SessionError::Record(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<ClockError> for SessionError {
    fn from(value: ClockError) -> Self {
        Self::Clock(value)
    }
}

impl From<RecordError> for SessionError {
    fn from(value: RecordError) -> Self {
        Self::Record(value)
    }
}

/// Append-only storage for one device's decoded capture data.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleBuffer {
    /// Raw device timestamps, one per decoded record.
    pub time_base: Vec<f64>,
    /// Voltages per channel, integer channel order.
    pub channels: Vec<Vec<f32>>,
}

impl SampleBuffer {
    /// An empty buffer with one channel vector per configured channel.
    pub fn new(channel_count: u8) -> Self {
        Self {
            time_base: Vec::new(),
            channels: vec![Vec::new(); channel_count as usize],
        }
    }

    /// Number of complete samples stored.
    pub fn len(&self) -> usize {
        self.time_base.len()
    }

    /// True when no samples have been stored.
    pub fn is_empty(&self) -> bool {
        self.time_base.is_empty()
    }
}

#[derive(Debug)]
struct Participant {
    name: String,
    state: DeviceCaptureState,
    buffer: SampleBuffer,
}

#[derive(Debug)]
struct ActiveSession {
    params: CaptureParameters,
    start_instant: u32,
    participants: Vec<Participant>,
}

impl ActiveSession {
    fn participant_mut(&mut self, device: &str) -> Option<&mut Participant> {
        self.participants.iter_mut().find(|p| p.name == device)
    }
}

/// Tuning and wiring for a [`Coordinator`].
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Seconds added to device clocks when scheduling a start.
    pub forward_offset_secs: u32,
    /// Largest tolerated clock spread, seconds.
    pub skew_limit_secs: f64,
    /// Directory the record file is written into.
    pub output_dir: PathBuf,
    /// Optional external command handed each finished channel.
    pub analysis_command: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            forward_offset_secs: clock::DEFAULT_FORWARD_OFFSET_SECS,
            skew_limit_secs: clock::DEFAULT_FORWARD_OFFSET_SECS as f64,
            output_dir: PathBuf::from("."),
            analysis_command: None,
        }
    }
}

/// Owns all session state and processes [`Event`]s one at a time.
pub struct Coordinator {
    registry: DeviceRegistry,
    publisher: Box<dyn Publisher>,
    ui: UiLink,
    config: SessionConfig,
    session: Option<ActiveSession>,
    aborted: bool,
}

impl Coordinator {
    /// Builds a coordinator around a registry and a broker link.
    pub fn new(
        registry: DeviceRegistry,
        publisher: Box<dyn Publisher>,
        ui: UiLink,
        config: SessionConfig,
    ) -> Self {
        Self {
            registry,
            publisher,
            ui,
            config,
            session: None,
            aborted: false,
        }
    }

    /// The current session phase, derived from the per-device states.
    pub fn phase(&self) -> SessionPhase {
        match &self.session {
            None if self.aborted => SessionPhase::Aborted,
            None => SessionPhase::Idle,
            Some(session) => {
                let states: Vec<DeviceCaptureState> =
                    session.participants.iter().map(|p| p.state).collect();
                if states.iter().all(|s| *s == DeviceCaptureState::Ended) {
                    SessionPhase::Completing
                } else if states.iter().any(|s| *s == DeviceCaptureState::Armed) {
                    SessionPhase::Active
                } else {
                    SessionPhase::Starting
                }
            }
        }
    }

    /// Read-only view of the registry, for status displays.
    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    /// The start instant negotiated for the capture in flight, if any.
    pub fn scheduled_start(&self) -> Option<u32> {
        self.session.as_ref().map(|s| s.start_instant)
    }

    /// Drains events until [`Event::Shutdown`] arrives or every sender is
    /// gone. This is the only thread that ever mutates session state.
    pub fn run(mut self, events: Receiver<Event>) {
        while let Ok(event) = events.recv() {
            if !self.handle_event(event) {
                break;
            }
        }
        info!("session coordinator terminated");
    }

    /// Processes one event. Returns false when the coordinator should
    /// stop. Never panics and never lets an error escape: anything that
    /// goes wrong inside becomes a status line, so one bad message cannot
    /// take the session down for the other devices.
    pub fn handle_event(&mut self, event: Event) -> bool {
        match event {
            Event::Inbound(message) => self.handle_inbound(message),
            Event::Start(params) => self.start_capture(params),
            Event::Stop => self.stop_capture(),
            Event::Probe => self.probe(),
            Event::Shutdown => return false,
        }
        true
    }

    fn handle_inbound(&mut self, message: InboundMessage) {
        if !self.registry.contains(&message.device) {
            debug!("message from unregistered device {:?}, ignored", message.device);
            return;
        }

        match frame::classify_message(&message.payload) {
            InboundKind::Time(rtc_secs) => {
                debug!("clock report from {}: rtc={rtc_secs}", message.device);
                let _ = self
                    .registry
                    .record_clock_snapshot(&message.device, rtc_secs, Instant::now());
                // A fresh clock report means the device is ready for a new
                // capture; let the operator press start again.
                self.ui.start_control(true);
            }
            InboundKind::Ping | InboundKind::Pong => self.on_liveness(&message.device),
            InboundKind::Start => self.on_start_ack(&message.device),
            InboundKind::Fail => self.on_fail(&message.device),
            InboundKind::End => self.on_end(&message.device),
            InboundKind::Text(text) => self.on_unclassified_text(&message.device, &text),
            InboundKind::Samples(bytes) => self.on_samples(&message.device, &bytes),
        }
    }

    /// Liveness updates never disturb an in-flight capture; they only
    /// touch the registry and the connection indicator.
    fn on_liveness(&mut self, device: &str) {
        if let Err(e) = self.publisher.publish(device, b"ping") {
            warn!("failed to answer liveness message from {device}: {e}");
        }
        let _ = self.registry.set_connected(device);
        self.ui.connectivity(device, true);
    }

    fn on_start_ack(&mut self, device: &str) {
        let Some(session) = self.session.as_mut() else {
            debug!("START from {device} with no capture in flight, ignored");
            return;
        };
        let Some(participant) = session.participant_mut(device) else {
            debug!("START from non-participant {device}, ignored");
            return;
        };
        if participant.state != DeviceCaptureState::Configured {
            debug!("START from {device} in state {:?}, ignored", participant.state);
            return;
        }
        participant.state = DeviceCaptureState::Armed;
        let _ = self.registry.set_armed(device, false);
        let _ = self.registry.set_active(device, true);
        self.ui
            .status(format!("received the start signal from {device}"));
    }

    fn on_fail(&mut self, device: &str) {
        let abort = {
            let Some(session) = self.session.as_mut() else {
                debug!("FAIL from {device} with no capture in flight, ignored");
                return;
            };
            let Some(index) = session.participants.iter().position(|p| p.name == device) else {
                debug!("FAIL from non-participant {device}, ignored");
                return;
            };
            let state = session.participants[index].state;
            if state != DeviceCaptureState::Configured {
                debug!("FAIL from {device} in state {state:?}, ignored");
                return;
            }
            // A failed device is out of the capture entirely. Leaving it
            // in the participant list would hold completion hostage and
            // drag an empty buffer into the record.
            session.participants.remove(index);
            session.participants.is_empty()
        };

        let _ = self.registry.set_armed(device, false);
        self.ui
            .status(format!("received the failure signal from {device}"));

        if abort {
            self.session = None;
            self.aborted = true;
            self.ui.status("capture aborted, no record written");
            self.ui.capture_active(false);
            self.ui.start_control(true);
        } else {
            // The failed device may have been the only one still pending;
            // its siblings could all have ended already.
            self.maybe_finalize();
        }
    }

    fn on_end(&mut self, device: &str) {
        {
            let Some(session) = self.session.as_mut() else {
                debug!("END from {device} with no capture in flight, ignored");
                return;
            };
            let Some(participant) = session.participant_mut(device) else {
                debug!("END from non-participant {device}, ignored");
                return;
            };
            if participant.state != DeviceCaptureState::Armed {
                debug!("END from {device} in state {:?}, ignored", participant.state);
                return;
            }
            participant.state = DeviceCaptureState::Ended;
        }

        let _ = self.registry.set_active(device, false);
        self.ui
            .status(format!("data capture from {device} ended"));

        self.maybe_finalize();
    }

    /// Reconcile only when the last streaming participant has ended; a
    /// device finishing early must not cut its siblings short.
    fn maybe_finalize(&mut self) {
        let all_ended = self
            .session
            .as_ref()
            .map(|s| {
                !s.participants.is_empty()
                    && s.participants
                        .iter()
                        .all(|p| p.state == DeviceCaptureState::Ended)
            })
            .unwrap_or(false);
        if all_ended && self.registry.all_disconnected_or_ended() {
            self.finalize_session();
        }
    }

    fn on_unclassified_text(&mut self, device: &str, text: &str) {
        let waiting = self.session.as_ref().is_some_and(|s| {
            s.participants
                .iter()
                .any(|p| p.name == device && p.state == DeviceCaptureState::Configured)
        });
        if waiting {
            // Stale chatter while a configuration reply is outstanding;
            // keep waiting for START/FAIL.
            self.ui.status(format!("waiting for response... {device}"));
        } else {
            debug!("unclassified text from {device}: {text:?}");
        }
    }

    fn on_samples(&mut self, device: &str, bytes: &[u8]) {
        let Some(session) = self.session.as_mut() else {
            debug!("sample payload from {device} with no capture in flight, dropped");
            return;
        };
        // Record width comes from the parameters latched at start, never
        // from whatever the operator controls say now.
        let channel_count = session.params.channel_count;
        let Some(participant) = session.participant_mut(device) else {
            debug!("sample payload from non-participant {device}, dropped");
            return;
        };
        if participant.state != DeviceCaptureState::Armed {
            debug!(
                "sample payload from {device} in state {:?}, dropped",
                participant.state
            );
            return;
        }

        let frames = frame::decode_sample_stream(bytes, channel_count);
        if frames.is_empty() {
            debug!("payload from {device} held no complete sample record");
            return;
        }

        let mut batch: Vec<Vec<f32>> = vec![Vec::with_capacity(frames.len()); channel_count as usize];
        for sample in &frames {
            participant.buffer.time_base.push(sample.timestamp as f64);
            for (ch, &raw) in sample.channels.iter().enumerate() {
                let voltage = frame::raw_to_voltage(raw);
                participant.buffer.channels[ch].push(voltage);
                batch[ch].push(voltage);
            }
        }

        self.ui.live_samples(device, batch);
    }

    fn start_capture(&mut self, params: CaptureParameters) {
        if let Err(e) = self.try_start(params) {
            self.ui.status(format!("capture start refused: {e}"));
            self.ui.start_control(true);
        }
    }

    fn try_start(&mut self, params: CaptureParameters) -> Result<(), SessionError> {
        if self.session.is_some() {
            // Matching the bench tool: a second press while running is a
            // no-op, not an error.
            debug!("capture already in progress, start ignored");
            return Ok(());
        }

        let connected = self.registry.connected_devices();
        if connected.is_empty() {
            return Err(SessionError::NoConnectedDevices);
        }

        let start_instant = clock::compute_start_instant(
            &self.registry,
            Instant::now(),
            self.config.forward_offset_secs,
            self.config.skew_limit_secs,
        )?;

        // Past this point the start is committed.
        let configuration = frame::encode_configuration(
            params.duration_s,
            params.frequency_hz,
            params.channel_count,
            start_instant,
        );

        let mut participants = Vec::with_capacity(connected.len());
        for name in &connected {
            if let Err(e) = self.publisher.publish(name, configuration.as_bytes()) {
                warn!("failed to send configuration to {name}: {e}");
            }
            let _ = self.registry.set_armed(name, true);
            self.ui.status(format!("sent configuration to {name}"));
            participants.push(Participant {
                name: name.clone(),
                state: DeviceCaptureState::Configured,
                buffer: SampleBuffer::new(params.channel_count),
            });
        }

        info!(
            "capture configured: {} devices, start instant {start_instant}, {configuration}",
            participants.len()
        );

        self.session = Some(ActiveSession {
            params,
            start_instant,
            participants,
        });
        self.aborted = false;
        self.ui.start_control(false);
        self.ui.capture_active(true);
        Ok(())
    }

    /// Manual stop: finalize with whatever has been buffered so far. This
    /// is also the only way out when a device goes silent mid-capture and
    /// its `END` never arrives.
    fn stop_capture(&mut self) {
        if self.session.is_none() {
            debug!("stop requested with no capture in flight");
            return;
        }
        self.ui.status("manual stop, finalizing record");
        self.finalize_session();
    }

    fn probe(&mut self) {
        for name in self.registry.names() {
            if let Err(e) = self.publisher.publish(&name, b"pong") {
                warn!("failed to probe {name}: {e}");
            }
            let _ = self.registry.set_disconnected(&name);
            self.ui.connectivity(&name, false);
        }
        self.ui.status("probing for devices");
    }

    fn finalize_session(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        for participant in &session.participants {
            let _ = self.registry.set_armed(&participant.name, false);
            let _ = self.registry.set_active(&participant.name, false);
        }

        let ActiveSession {
            params,
            participants,
            ..
        } = session;
        // Only devices that actually started streaming contribute. One
        // still waiting on its configuration reply has an empty buffer
        // that would truncate every other device to zero rows.
        let buffers: Vec<(String, SampleBuffer)> = participants
            .into_iter()
            .filter(|p| {
                matches!(
                    p.state,
                    DeviceCaptureState::Armed | DeviceCaptureState::Ended
                )
            })
            .map(|p| (p.name, p.buffer))
            .collect();

        let record = record::reconcile(buffers, params.duration_s, params.frequency_hz);
        let path = self
            .config
            .output_dir
            .join(format!("{}.csv", params.label));
        match record.write_to_path(&path) {
            Ok(()) => {
                self.ui
                    .status(format!("wrote capture record to {}", path.display()));
                self.run_analysis(&record);
            }
            Err(e) => {
                self.ui
                    .status(format!("failed to write capture record: {e}"));
            }
        }

        self.aborted = false;
        self.ui.capture_active(false);
        self.ui.start_control(true);
    }

    fn run_analysis(&self, record: &CaptureRecord) {
        let Some(command) = &self.config.analysis_command else {
            return;
        };
        for trace in &record.traces {
            for (ch, samples) in trace.channels.iter().enumerate() {
                let label = format!("{} CH {}", trace.name, ch + 1);
                if let Err(e) =
                    analysis::spawn_analysis(command, record.frequency_hz, &label, samples)
                {
                    warn!("analysis handoff failed for {label}: {e}");
                }
            }
        }
    }
}
