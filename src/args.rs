// Commandline argument parser using clap for the capture controller

use crate::clock::DEFAULT_FORWARD_OFFSET_SECS;
use clap::Parser;

/// Options shared by the headless controller and the bench monitor.
#[derive(Debug, Parser, Clone)]
#[clap(version, about)]
pub struct EmgArgs {
    /// Hostname or address of the MQTT broker
    #[arg(long = "broker", default_value = "127.0.0.1")]
    pub broker_host: String,

    /// Port of the MQTT broker
    #[arg(long = "port", default_value_t = 1883)]
    pub broker_port: u16,

    /// Client id announced to the broker
    #[arg(long = "id", default_value = "emglink")]
    pub client_id: String,

    /// Names of the sensor devices taking part in captures
    #[arg(short = 'd', long = "devices", num_args = 1.., default_values_t = ["sensor1".to_owned(), "sensor2".to_owned()])]
    pub devices: Vec<String>,

    /// Capture length, in seconds
    #[arg(short = 't', long = "duration", default_value_t = 5)]
    pub duration: u32,

    /// Sampling frequency, in Hz
    #[arg(short = 'f', long = "frequency", default_value_t = 2000)]
    pub frequency: u32,

    /// ADC channels recorded per device
    #[arg(short = 'c', long = "channels", default_value_t = 1, value_parser = clap::value_parser!(u8).range(1..=3))]
    pub channels: u8,

    /// Label for the capture; the record is written as <label>.csv
    #[arg(short = 'o', long = "out", default_value = "test")]
    pub label: String,

    /// Seconds added to device clocks when scheduling a start
    #[arg(long = "forward-offset", default_value_t = DEFAULT_FORWARD_OFFSET_SECS)]
    pub forward_offset: u32,

    /// Largest tolerated device clock spread, in seconds; defaults to the
    /// forward offset
    #[arg(long = "skew-limit")]
    pub skew_limit: Option<f64>,

    /// Run against simulated devices instead of a broker
    #[arg(long = "demo")]
    pub demo: bool,

    /// Command each finished channel is piped to for analysis
    #[arg(long = "analysis")]
    pub analysis: Option<String>,
}
