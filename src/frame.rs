//! Decoding and encoding of everything that crosses the broker link: the
//! fixed-width binary sample records streamed by the sensors, the 8-byte
//! RTC report, the short textual control replies, and the comma-joined
//! configuration string the controller publishes.

use nom::{
    bytes::complete::tag,
    multi::count,
    number::complete::{be_u16, le_u32},
    sequence::preceded,
    Finish, IResult,
};

use log::warn;
use std::fmt::{self, Display};

/// Full-scale voltage of the sensor ADCs.
pub const VOLTAGE_FULL_SCALE: f32 = 3.3;

/// Largest raw reading a 10-bit ADC can produce.
pub const ADC_MAX: u16 = 1023;

/// One decoded sample record: a device timestamp followed by one raw
/// reading per configured channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleFrame {
    /// Wrapping 16-bit counter stamped by the device at sample time.
    pub timestamp: u16,
    /// Raw ADC readings, one per channel, in channel order.
    pub channels: Vec<u16>,
}

/// Returned when a payload cannot be decoded as sample data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The buffer was shorter than one full record.
    MalformedFrame {
        /// Bytes actually present.
        have: usize,
        /// Bytes one record requires.
        need: usize,
    },
}

impl Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CodecError::MalformedFrame { have, need } => {
                write!(f, "malformed sample frame: {have} bytes, need {need}")
            }
        }
    }
}

impl std::error::Error for CodecError {}

/// Classification of an inbound payload, decided by [`classify_message`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundKind {
    /// Liveness message from a device.
    Ping,
    /// Liveness reply from a device.
    Pong,
    /// Device accepted a configuration and armed its capture.
    Start,
    /// Device rejected a configuration.
    Fail,
    /// Device finished streaming its capture window.
    End,
    /// RTC report carrying the device clock in seconds.
    Time(u32),
    /// Valid UTF-8 that matched no control word.
    Text(String),
    /// Not text at all: raw sample records.
    Samples(Vec<u8>),
}

/// Width in bytes of one binary sample record for the given channel count.
pub fn record_width(channel_count: u8) -> usize {
    2 + 2 * channel_count as usize
}

fn sample_frame_parser(channel_count: u8) -> impl Fn(&[u8]) -> IResult<&[u8], SampleFrame> {
    move |input| {
        let (input, timestamp) = be_u16(input)?;
        let (input, channels) = count(be_u16, channel_count as usize)(input)?;
        Ok((input, SampleFrame { timestamp, channels }))
    }
}

fn time_parser(input: &[u8]) -> IResult<&[u8], u32> {
    // The firmware writes its RTC value least-significant byte first, so
    // bytes 4..8 assemble as b7<<24 | b6<<16 | b5<<8 | b4.
    preceded(tag(&b"TIME"[..]), le_u32)(input)
}

/// Decodes a single big-endian sample record from the front of `bytes`.
pub fn decode_sample_frame(bytes: &[u8], channel_count: u8) -> Result<SampleFrame, CodecError> {
    let need = record_width(channel_count);
    if bytes.len() < need {
        return Err(CodecError::MalformedFrame {
            have: bytes.len(),
            need,
        });
    }

    match sample_frame_parser(channel_count)(bytes).finish() {
        Ok((_rest, frame)) => Ok(frame),
        Err(_) => Err(CodecError::MalformedFrame {
            have: bytes.len(),
            need,
        }),
    }
}

/// Decodes a concatenation of sample records. Devices batch many records
/// into one published payload; a trailing partial record is discarded.
pub fn decode_sample_stream(bytes: &[u8], channel_count: u8) -> Vec<SampleFrame> {
    let width = record_width(channel_count);
    bytes
        .chunks_exact(width)
        .filter_map(|chunk| match decode_sample_frame(chunk, channel_count) {
            Ok(frame) => Some(frame),
            Err(e) => {
                warn!("skipping undecodable sample record: {e}");
                None
            }
        })
        .collect()
}

/// Encodes a [`SampleFrame`] back into its wire form. Used by the device
/// simulator and by tests.
pub fn encode_sample_frame(frame: &SampleFrame) -> Vec<u8> {
    let mut out = Vec::with_capacity(record_width(frame.channels.len() as u8));
    out.extend_from_slice(&frame.timestamp.to_be_bytes());
    for raw in &frame.channels {
        out.extend_from_slice(&raw.to_be_bytes());
    }
    out
}

/// Sorts an inbound payload into one of the closed set of control
/// messages, an RTC report, or raw sample data.
///
/// The 8-byte `TIME` structure is checked first because its trailing four
/// bytes are arbitrary. After that, any payload that decodes as UTF-8 is
/// control text and is never treated as samples; sample data is only ever
/// the fallback for non-text payloads. Control words must match exactly
/// after trimming, so payload garbage that merely contains `"START"`
/// cannot arm a device.
pub fn classify_message(payload: &[u8]) -> InboundKind {
    if payload.len() == 8 {
        if let Ok((rest, rtc)) = time_parser(payload).finish() {
            if rest.is_empty() {
                return InboundKind::Time(rtc);
            }
        }
    }

    match std::str::from_utf8(payload) {
        Ok(text) => match text.trim() {
            "ping" => InboundKind::Ping,
            "pong" => InboundKind::Pong,
            "START" => InboundKind::Start,
            "FAIL" => InboundKind::Fail,
            "END" => InboundKind::End,
            other => InboundKind::Text(other.to_owned()),
        },
        Err(_) => InboundKind::Samples(payload.to_vec()),
    }
}

/// Builds the configuration string published to a device: capture length
/// in seconds, sampling frequency in Hz, channel count, and the shared
/// start instant in device RTC seconds, comma-joined. All fields are
/// decimal integers so no escaping is needed.
pub fn encode_configuration(
    duration_s: u32,
    frequency_hz: u32,
    channel_count: u8,
    start_instant: u32,
) -> String {
    format!("{duration_s},{frequency_hz},{channel_count},{start_instant}")
}

/// Parses a configuration string back into its fields. The device
/// simulator uses this to honor configurations the way the firmware does.
pub fn decode_configuration(text: &str) -> Option<(u32, u32, u8, u32)> {
    let mut parts = text.split(',');
    let duration_s = parts.next()?.trim().parse().ok()?;
    let frequency_hz = parts.next()?.trim().parse().ok()?;
    let channel_count = parts.next()?.trim().parse().ok()?;
    let start_instant = parts.next()?.trim().parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((duration_s, frequency_hz, channel_count, start_instant))
}

/// Converts a raw ADC reading to volts. Readings above full scale happen
/// occasionally when line noise corrupts a record; they are logged and
/// passed through rather than treated as an error.
pub fn raw_to_voltage(raw: u16) -> f32 {
    let voltage = raw as f32 / ADC_MAX as f32 * VOLTAGE_FULL_SCALE;
    if voltage > VOLTAGE_FULL_SCALE {
        warn!("voltage {voltage:.3} exceeds full scale (raw value {raw})");
    }
    voltage
}
