//! The broker-backed transport. One background thread drives the MQTT
//! event loop and forwards device publishes onto the coordinator's event
//! queue; the [`MqttLink`] itself is the outbound [`Publisher`] half.
//!
//! The link subscribes to the broker's full topic tree and filters by
//! topic name, mirroring the firmware's convention: devices publish on
//! `<name>/...` topics and listen on `<name>/CONFIG/`.

use crate::session::Event;
use crate::transport::{self, InboundMessage, Publisher, TransportError};

use log::{debug, info, warn};
use rumqttc::{Client, Event as BrokerEvent, MqttOptions, Packet, QoS};
use std::sync::mpsc::Sender;
use std::thread;
use std::time::Duration;

/// A connected broker client plus its receive thread.
pub struct MqttLink {
    client: Client,
}

impl MqttLink {
    /// Connects to the broker, subscribes to the full topic tree, and
    /// starts forwarding device traffic onto `events`.
    pub fn connect(
        client_id: &str,
        host: &str,
        port: u16,
        events: Sender<Event>,
    ) -> Result<Self, TransportError> {
        let mut options = MqttOptions::new(client_id, host, port);
        options.set_keep_alive(Duration::from_secs(30));

        let (client, mut connection) = Client::new(options, 64);
        client
            .subscribe("#", QoS::AtLeastOnce)
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        thread::spawn(move || {
            let mut reported_error = false;
            for notification in connection.iter() {
                match notification {
                    Ok(BrokerEvent::Incoming(Packet::ConnAck(_))) => {
                        reported_error = false;
                        info!("broker connection established");
                    }
                    Ok(BrokerEvent::Incoming(Packet::Publish(publish))) => {
                        let Some(device) = transport::device_from_topic(&publish.topic) else {
                            continue;
                        };
                        let inbound = InboundMessage {
                            device: device.to_owned(),
                            payload: publish.payload.to_vec(),
                        };
                        if events.send(Event::Inbound(inbound)).is_err() {
                            debug!("session gone, stopping broker receive thread");
                            return;
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        if !reported_error {
                            warn!("broker connection lost, retrying: {e}");
                            reported_error = true;
                        }
                        thread::sleep(Duration::from_secs(1));
                    }
                }
            }
        });

        Ok(Self { client })
    }
}

impl Publisher for MqttLink {
    fn publish(&self, device: &str, payload: &[u8]) -> Result<(), TransportError> {
        let topic = format!("{device}/CONFIG/");
        self.client
            .publish(topic, QoS::ExactlyOnce, false, payload.to_vec())
            .map_err(|e| TransportError::Publish(e.to_string()))
    }
}
