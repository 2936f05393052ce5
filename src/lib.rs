//! emglink coordinates short-lived capture sessions across a small fleet
//! of wireless EMG sensor devices. The devices publish binary sample
//! frames and short control strings over an MQTT broker; this controller
//! discovers them, negotiates a shared start instant despite their
//! loosely synchronized real-time clocks, decodes and buffers each
//! device's stream, and reconciles the per-device buffers into a single
//! time-aligned CSV record at the end of the capture.
//!
//! The firmware side lives on Teensy-class boards with WiFi radios; this
//! crate is the host-side bench tool. A full session can also be run
//! entirely in-process against [`dummy_link`] simulated devices, which is
//! how most of the tests here work.

#![warn(missing_docs)]
pub mod analysis;
pub mod args;
pub mod clock;
pub mod dummy_link;
pub mod frame;
pub mod mqtt_link;
pub mod record;
pub mod registry;
pub mod session;
pub mod transport;
pub mod ui;
