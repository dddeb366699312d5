//! Shared instrument emulators for the integration tests.
//!
//! Each emulator is a [`MockTransport`] responder that answers the bytes a
//! driver writes the way the real instrument would.

#![allow(dead_code)]

use labctl::adapters::MockTransport;
use labctl::channel::{Channel, ChannelParams};
use labctl::protocol::lprotocol::{checksum, Access, Frame, Function, ACK, NAK};
use labctl::protocol::lrc;
use labctl::{DeviceRegistry, Dispatcher, ServerConfig};
use std::sync::Arc;

/// Reply frame from `address` carrying `data`.
pub fn lprotocol_reply(address: u8, function: Function, data: &[u8]) -> Vec<u8> {
    let mut frame = Frame::write(address, function, data.to_vec()).encode().unwrap();
    frame[2] = Access::Read.code();
    let last = frame.len() - 1;
    frame[last] = checksum(&frame[1..last]);
    frame
}

/// L-protocol controllers that acknowledge every write and answer every read
/// with `code`, from whichever address was asked.
pub fn brooks_bus(channel: &str, code: u16) -> MockTransport {
    MockTransport::new(channel).with_responder(move |w: &[u8]| {
        if w == [ACK] {
            return Vec::new();
        }
        if w[2] == Access::Write.code() {
            vec![vec![ACK, ACK]]
        } else {
            let function = Function::new(w[4], w[5], w[6]);
            let mut chunk = vec![ACK];
            chunk.extend(lprotocol_reply(w[0], function, &code.to_le_bytes()));
            vec![chunk]
        }
    })
}

/// Controller that rejects the first `naks` frames with a lone NAK and
/// acknowledges everything after.
pub fn flaky_brooks(channel: &str, naks: u32) -> MockTransport {
    let mut seen = 0;
    MockTransport::new(channel).with_responder(move |w: &[u8]| {
        if w == [ACK] {
            return Vec::new();
        }
        seen += 1;
        if seen <= naks {
            vec![vec![NAK]]
        } else {
            vec![vec![ACK, ACK]]
        }
    })
}

/// Sierra controller whose flow reading follows its setpoint, starting at
/// `flow`.
pub fn sierra(channel: &str, flow: &str) -> MockTransport {
    let mut reading = flow.to_string();
    MockTransport::new(channel).with_responder(move |w: &[u8]| {
        let text = String::from_utf8_lossy(w);
        let body = &text[1..text.len() - 4];
        let value = match &body[..4] {
            "Setr" => {
                reading = body[4..].to_string();
                reading.clone()
            }
            "Flow" => reading.clone(),
            "Fscl" => "50.0".to_string(),
            "Gnam" => "N2".to_string(),
            _ => return Vec::new(),
        };
        let line = format!("{}{value}", &body[..4]);
        let mut reply = line.clone().into_bytes();
        reply.extend_from_slice(&lrc::encode_command(&line)[line.len()..]);
        vec![reply]
    })
}

/// Serial-style link settings with a small retry budget.
pub fn serial_params() -> ChannelParams {
    ChannelParams {
        retry_budget: 5,
        max_unmonitored_attempts: 5,
        ..ChannelParams::default()
    }
}

/// Dispatcher over `config`. Channels without a mock in `mocks` get a silent
/// one.
pub fn dispatcher(config: &str, mocks: &[(&str, &MockTransport)]) -> Dispatcher {
    let config = ServerConfig::from_toml_str(config).unwrap();
    config.validate().unwrap();
    let channels = config
        .channels
        .iter()
        .map(|channel| {
            let mock = mocks
                .iter()
                .find(|(id, _)| *id == channel.id)
                .map(|(_, mock)| (*mock).clone())
                .unwrap_or_else(|| MockTransport::new(&channel.id));
            Channel::new(channel.id.clone(), Box::new(mock), serial_params())
        })
        .collect();
    let registry = DeviceRegistry::with_channels(&config, channels).unwrap();
    Dispatcher::new(Arc::new(registry))
}
