//! Interactive bench monitor. Shows per-device connectivity and sample
//! counts while the operator drives the session from the keyboard.

mod gui;

use clap::Parser;
use emglink::{
    args::EmgArgs,
    dummy_link::DummyLinkBuilder,
    mqtt_link::MqttLink,
    registry::DeviceRegistry,
    session::{CaptureParameters, Coordinator, Event, SessionConfig},
    transport::{NullPublisher, Publisher},
    ui::UiLink,
};
use gui::engage_gui;
use log::warn;
use std::path::PathBuf;
use std::sync::mpsc;
use std::thread;

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

    let _ = event_tx.send(Event::Probe);

    let params = CaptureParameters {
        duration_s: args.duration,
        frequency_hz: args.frequency,
        channel_count: args.channels,
        label: args.label.clone(),
    };

    if let Err(e) = engage_gui(&args.devices, params, event_tx.clone(), ui_rx) {
        eprintln!("{e:?}");
    }

    let _ = event_tx.send(Event::Shutdown);
    drop(event_tx);
    let _ = session_thread.join();
    if let Some(link) = dummy {
        link.stop();
    }
}
