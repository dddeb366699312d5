//! Binary L-protocol used by the RS-485 mass-flow controllers.
//!
//! Frame layout:
//!
//! ```text
//! address | STX | rw | len | class | instance | attribute | data.. | PAD | checksum
//! ```
//!
//! `len` counts the function code and data (`data.len() + 3`). The checksum is
//! the 8-bit sum of every byte from STX through PAD; the address byte is not
//! summed, so replies are additionally checked against the address the request
//! was sent to.
//!
//! An exchange opens with a lone ACK, sends the frame and then hunts for the
//! device's ACK or NAK token in whatever comes back. Everything after an ACK is
//! the reply. Garbled, short or silent replies restart the exchange until the
//! retry policy runs out.

use crate::adapters::Transport;
use crate::error::{to_hex, CtlResult, ProtocolError, ValidationError};
use tracing::{debug, trace, warn};

/// Start of a frame.
pub const STX: u8 = 0x02;
/// Positive handshake token.
pub const ACK: u8 = 0x06;
/// Negative handshake token.
pub const NAK: u8 = 0x16;
/// Byte between data and checksum.
pub const PAD: u8 = 0x00;

/// Most data bytes the length byte can announce.
pub const MAX_DATA: usize = u8::MAX as usize - 3;

/// Size of a reply frame that carries no data.
pub const MIN_PACKET: usize = 9;

/// Short reads granted to each phase of one attempt.
const READS_PER_PHASE: usize = 3;
/// Size of the first read, which looks for the ACK/NAK token.
const TOKEN_READ: usize = 100;

/// Read or write request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Query a variable
    Read,
    /// Set a variable
    Write,
}

impl Access {
    /// Command byte following STX.
    pub fn code(self) -> u8 {
        match self {
            Access::Read => 0x80,
            Access::Write => 0x81,
        }
    }
}

/// Class / instance / attribute triple addressing one device variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Function {
    /// Object class
    pub class: u8,
    /// Instance within the class
    pub instance: u8,
    /// Attribute of the instance
    pub attribute: u8,
}

impl Function {
    /// Address `attribute` of `instance` in `class`.
    pub const fn new(class: u8, instance: u8, attribute: u8) -> Self {
        Self {
            class,
            instance,
            attribute,
        }
    }

    /// Wire order: class, instance, attribute.
    pub fn bytes(self) -> [u8; 3] {
        [self.class, self.instance, self.attribute]
    }
}

/// Device variables used by the flow controller driver.
pub mod functions {
    use super::Function;

    /// Bus address
    pub const MAC_ID: Function = Function::new(0x03, 0x01, 0x01);
    /// Line speed, u32 little-endian
    pub const BAUD_RATE: Function = Function::new(0x03, 0x01, 0x65);
    /// Manufacturer string
    pub const MANUFACTURER: Function = Function::new(0x03, 0x01, 0xC5);
    /// Firmware revision string
    pub const FIRMWARE: Function = Function::new(0x03, 0x01, 0xC6);
    /// Full scale, gas id and calibration words
    pub const DETAILS: Function = Function::new(0x03, 0x01, 0xC7);
    /// Serial number string
    pub const SERIAL_NUMBER: Function = Function::new(0x03, 0x01, 0xC8);
    /// Selected gas calibration
    pub const GAS_ID: Function = Function::new(0x66, 0x00, 0x65);
    /// Setpoint source
    pub const IO_MODE: Function = Function::new(0x69, 0x01, 0x03);
    /// freeze flag, setpoint code, ramp time (ms)
    pub const SETPOINT_IMMEDIATE: Function = Function::new(0x69, 0x01, 0xA6);
    /// Measured flow
    pub const FLOW: Function = Function::new(0x6A, 0x01, 0xA9);
    /// Setpoint after ramping
    pub const FILTERED_SETPOINT: Function = Function::new(0x6A, 0x01, 0xA6);
    /// Valve drive current
    pub const VALVE_CURRENT: Function = Function::new(0x6A, 0x01, 0xB6);
}

/// 8-bit additive checksum.
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

/// One outgoing request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// MAC id of the addressed controller
    pub address: u8,
    /// Read or write
    pub access: Access,
    /// Variable addressed
    pub function: Function,
    /// At most [`MAX_DATA`] bytes
    pub data: Vec<u8>,
}

impl Frame {
    /// Read request for `function`.
    pub fn read(address: u8, function: Function) -> Self {
        Self {
            address,
            access: Access::Read,
            function,
            data: Vec::new(),
        }
    }

    /// Write request carrying `data`.
    pub fn write(address: u8, function: Function, data: impl Into<Vec<u8>>) -> Self {
        Self {
            address,
            access: Access::Write,
            function,
            data: data.into(),
        }
    }

    /// Serialize, appending the checksum. Data longer than [`MAX_DATA`] does
    /// not fit the length byte and is rejected.
    pub fn encode(&self) -> Result<Vec<u8>, ValidationError> {
        let len = u8::try_from(self.data.len() + 3).map_err(|_| {
            ValidationError::range("frame data length", self.data.len(), 0.0, MAX_DATA as f64)
        })?;
        let mut bytes = Vec::with_capacity(MIN_PACKET + self.data.len());
        bytes.push(self.address);
        bytes.push(STX);
        bytes.push(self.access.code());
        bytes.push(len);
        bytes.extend_from_slice(&self.function.bytes());
        bytes.extend_from_slice(&self.data);
        bytes.push(PAD);
        bytes.push(checksum(&bytes[1..]));
        Ok(bytes)
    }
}

/// A validated reply frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Sender's MAC id
    pub address: u8,
    /// Command byte echoed by the device
    pub command: u8,
    /// Variable the reply carries
    pub function: Function,
    /// Value bytes
    pub data: Vec<u8>,
}

/// Total frame size announced by a (possibly partial) frame, once the length
/// byte has arrived.
fn announced_len(bytes: &[u8]) -> Option<usize> {
    bytes.get(3).map(|len| *len as usize + 6)
}

/// Validate and decode one reply frame sent by `address`.
///
/// Bytes past the announced frame length are ignored.
pub fn parse_reply(bytes: &[u8], address: u8) -> Result<Reply, ProtocolError> {
    let total = announced_len(bytes).ok_or_else(|| ProtocolError::malformed("short reply", bytes))?;
    if bytes[3] < 3 {
        return Err(ProtocolError::malformed("length below function code size", bytes));
    }
    if bytes.len() < total {
        return Err(ProtocolError::malformed("short reply", bytes));
    }
    let frame = &bytes[..total];
    let expected = checksum(&frame[1..total - 1]);
    let actual = frame[total - 1];
    if expected != actual {
        return Err(ProtocolError::Checksum { expected, actual });
    }
    if frame[0] != address {
        return Err(ProtocolError::malformed("reply from another address", frame));
    }
    if frame[1] != STX {
        return Err(ProtocolError::malformed("missing STX", frame));
    }
    Ok(Reply {
        address: frame[0],
        command: frame[2],
        function: Function::new(frame[4], frame[5], frame[6]),
        data: frame[7..total - 2].to_vec(),
    })
}

/// True if `bytes` is exactly one well-formed frame from `address`.
pub fn validate(bytes: &[u8], address: u8) -> bool {
    announced_len(bytes) == Some(bytes.len()) && parse_reply(bytes, address).is_ok()
}

/// `round((0xC000 - 0x4000) * value / full_scale + 0x4000)`
pub fn encode_setpoint(value: f64, full_scale: f64) -> u16 {
    let code = f64::from(0xC000u32 - 0x4000) * value / full_scale + f64::from(0x4000u32);
    code.round().clamp(0.0, f64::from(u16::MAX)) as u16
}

/// Inverse of [`encode_setpoint`].
pub fn decode_setpoint(code: u16, full_scale: f64) -> f64 {
    (f64::from(code) - f64::from(0x4000u32)) * full_scale / f64::from(0xC000u32 - 0x4000)
}

/// How many attempts an exchange may make.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    /// The caller watches the attempt count against a budget.
    Monitored(u32),
    /// Retry until the device answers, bounded by a safety cap.
    UntilAnswered(u32),
}

impl RetryPolicy {
    /// Attempts allowed; never less than one.
    pub fn limit(self) -> u32 {
        match self {
            RetryPolicy::Monitored(n) | RetryPolicy::UntilAnswered(n) => n.max(1),
        }
    }
}

/// What the device is expected to send after its ACK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expect {
    /// Acknowledgement of a write
    Ack,
    /// Reply frame carrying at least `data_len` bytes of data
    Packet {
        /// Minimum data bytes in the reply
        data_len: usize,
    },
}

impl Expect {
    fn wanted(self, rest: &[u8]) -> usize {
        match self {
            Expect::Ack => 1,
            Expect::Packet { data_len } => {
                announced_len(rest).unwrap_or(MIN_PACKET + data_len)
            }
        }
    }
}

/// Result of a successful exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exchange {
    /// Everything received after the device's ACK
    pub reply: Vec<u8>,
    /// Attempts consumed, including the successful one
    pub attempts: u32,
}

/// Split at the first ACK or NAK: the token and what follows it.
fn split_at_token(bytes: &[u8]) -> Option<(u8, Vec<u8>)> {
    bytes
        .iter()
        .position(|b| *b == ACK || *b == NAK)
        .map(|i| (bytes[i], bytes[i + 1..].to_vec()))
}

enum Attempt {
    Done(Vec<u8>),
    Retry(ProtocolError),
}

/// Send `frame` and collect the reply, retrying per `policy`.
///
/// A NAK followed by a complete reply means the device rejected the command;
/// that is not retried. A lone NAK, a short or garbled reply and silence are.
pub async fn exchange(
    port: &mut dyn Transport,
    frame: &Frame,
    expect: Expect,
    policy: RetryPolicy,
) -> CtlResult<Exchange> {
    let bytes = frame.encode()?;
    let limit = policy.limit();
    let mut last = ProtocolError::NoResponse { attempts: limit };

    for attempt in 1..=limit {
        match attempt_once(port, &bytes, frame.address, expect).await? {
            Attempt::Done(reply) => {
                port.write(&[ACK]).await?;
                debug!(
                    address = frame.address,
                    attempts = attempt,
                    reply = %to_hex(&reply),
                    "L-protocol exchange complete"
                );
                return Ok(Exchange {
                    reply,
                    attempts: attempt,
                });
            }
            Attempt::Retry(reason) => {
                trace!(address = frame.address, attempt, %reason, "L-protocol retry");
                last = reason;
            }
        }
    }

    warn!(address = frame.address, attempts = limit, error = %last, "L-protocol exchange failed");
    Err(match last {
        ProtocolError::Malformed { .. } | ProtocolError::NoResponse { .. } => {
            ProtocolError::NoResponse { attempts: limit }
        }
        other => other,
    }
    .into())
}

async fn attempt_once(
    port: &mut dyn Transport,
    frame: &[u8],
    address: u8,
    expect: Expect,
) -> CtlResult<Attempt> {
    let no_response = || Attempt::Retry(ProtocolError::NoResponse { attempts: 1 });

    port.write(&[ACK]).await?;
    port.write(frame).await?;

    let mut head = Vec::new();
    for _ in 0..READS_PER_PHASE {
        head = port.read(TOKEN_READ).await?;
        if !head.is_empty() {
            break;
        }
    }
    if head.is_empty() {
        return Ok(no_response());
    }

    // Leftovers of an earlier attempt may precede the token, or the token may
    // not have arrived yet
    let (mut token, mut rest) = match split_at_token(&head) {
        Some((token, rest)) => (Some(token), rest),
        None => (None, Vec::new()),
    };

    for _ in 0..READS_PER_PHASE {
        let wanted = expect.wanted(&rest);
        if rest.len() >= wanted {
            break;
        }
        let chunk = port.read(wanted - rest.len()).await?;
        rest.extend_from_slice(&chunk);
    }

    if token.is_none() {
        match split_at_token(&rest) {
            Some((t, r)) => {
                token = Some(t);
                rest = r;
            }
            None => return Ok(no_response()),
        }
    }

    let complete = rest.len() >= expect.wanted(&rest);
    match token {
        Some(NAK) if complete => Err(ProtocolError::CommandRejected.into()),
        Some(ACK) if complete => match expect {
            Expect::Ack => match rest[0] {
                ACK => Ok(Attempt::Done(rest)),
                NAK => Err(ProtocolError::FailedToProcess.into()),
                _ => Ok(Attempt::Retry(ProtocolError::malformed(
                    "unexpected acknowledge",
                    &rest,
                ))),
            },
            Expect::Packet { .. } => match parse_reply(&rest, address) {
                Ok(_) => Ok(Attempt::Done(rest)),
                Err(_) if rest[0] == NAK => Err(ProtocolError::FailedToProcess.into()),
                Err(err) => Ok(Attempt::Retry(err)),
            },
        },
        _ => Ok(Attempt::Retry(ProtocolError::malformed("incomplete reply", &rest))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{MockEvent, MockTransport};
    use crate::error::CtlError;

    const MAC: u8 = 0x21;

    fn reply_frame(function: Function, data: &[u8]) -> Vec<u8> {
        let mut frame = Frame::write(MAC, function, data.to_vec()).encode().unwrap();
        // Replies carry the read command code
        frame[2] = Access::Read.code();
        let last = frame.len() - 1;
        frame[last] = checksum(&frame[1..last]);
        frame
    }

    #[test]
    fn test_encode_read_frame() {
        let frame = Frame::read(MAC, functions::FLOW).encode().unwrap();
        assert_eq!(
            frame,
            vec![0x21, STX, 0x80, 0x03, 0x6A, 0x01, 0xA9, PAD, 0x99]
        );
        assert_eq!(frame.len(), MIN_PACKET);
    }

    #[test]
    fn test_encode_rejects_data_beyond_length_byte() {
        assert!(Frame::write(MAC, functions::DETAILS, vec![0; MAX_DATA]).encode().is_ok());
        let err = Frame::write(MAC, functions::DETAILS, vec![0; MAX_DATA + 1])
            .encode()
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid frame data length '253', allowed: range(0.0, 252.0)"
        );
    }

    #[tokio::test]
    async fn test_oversized_frame_is_rejected_before_io() {
        let mock = device(vec![]);
        let mut port = mock.clone();
        let err = exchange(
            &mut port,
            &Frame::write(MAC, functions::DETAILS, vec![0; 300]),
            Expect::Ack,
            RetryPolicy::Monitored(5),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CtlError::Validation(_)));
        assert!(mock.events().is_empty());
    }

    #[test]
    fn test_encode_write_frame_length_byte() {
        let frame = Frame::write(MAC, functions::BAUD_RATE, 115200u32.to_le_bytes())
            .encode()
            .unwrap();
        assert_eq!(frame[3], 7);
        assert_eq!(frame.len(), MIN_PACKET + 4);
        assert_eq!(frame[frame.len() - 1], checksum(&frame[1..frame.len() - 1]));
    }

    #[test]
    fn test_parse_reply_extracts_data() {
        let bytes = reply_frame(functions::FLOW, &[0x00, 0x80]);
        let reply = parse_reply(&bytes, MAC).unwrap();
        assert_eq!(reply.function, functions::FLOW);
        assert_eq!(reply.data, vec![0x00, 0x80]);
    }

    #[test]
    fn test_parse_reply_ignores_trailing_bytes() {
        let mut bytes = reply_frame(functions::FLOW, &[0x00, 0x80]);
        bytes.extend_from_slice(&[0xFF, 0xEE]);
        assert!(parse_reply(&bytes, MAC).is_ok());
    }

    #[test]
    fn test_parse_reply_rejects_bad_checksum() {
        let mut bytes = reply_frame(functions::FLOW, &[0x00, 0x80]);
        bytes[7] ^= 0x01;
        assert!(matches!(
            parse_reply(&bytes, MAC),
            Err(ProtocolError::Checksum { .. })
        ));
    }

    #[test]
    fn test_parse_reply_rejects_other_address() {
        let bytes = reply_frame(functions::FLOW, &[0x00, 0x80]);
        assert!(parse_reply(&bytes, 0x20).is_err());
    }

    #[test]
    fn test_setpoint_code_endpoints() {
        assert_eq!(encode_setpoint(0.0, 10.0), 0x4000);
        assert_eq!(encode_setpoint(10.0, 10.0), 0xC000);
        assert_eq!(encode_setpoint(5.0, 10.0), 0x8000);
        assert!((decode_setpoint(0x8000, 50.0) - 25.0).abs() < 1e-9);
    }

    fn device(script: Vec<Vec<Vec<u8>>>) -> MockTransport {
        // One entry per frame write; the lone ACK opening each attempt gets no reply
        let mut replies = script.into_iter();
        MockTransport::new("rs485").with_responder(move |written: &[u8]| {
            if written == [ACK] {
                Vec::new()
            } else {
                replies.next().unwrap_or_default()
            }
        })
    }

    #[tokio::test]
    async fn test_read_exchange_with_fragmented_reply() {
        let reply = reply_frame(functions::FLOW, &[0x00, 0x80]);
        let (a, b) = reply.split_at(4);
        let mock = device(vec![vec![vec![ACK], a.to_vec(), b.to_vec()]]);
        let mut port = mock.clone();

        let result = exchange(
            &mut port,
            &Frame::read(MAC, functions::FLOW),
            Expect::Packet { data_len: 2 },
            RetryPolicy::UntilAnswered(10),
        )
        .await
        .unwrap();

        assert_eq!(result.attempts, 1);
        assert_eq!(parse_reply(&result.reply, MAC).unwrap().data, vec![0x00, 0x80]);
        // Final ACK closes the exchange
        assert_eq!(mock.writes().last().unwrap(), &vec![ACK]);
    }

    #[tokio::test]
    async fn test_garbage_before_token_is_skipped() {
        let mut chunk = vec![0xAA, 0x55, ACK];
        chunk.extend(reply_frame(functions::FLOW, &[0x34, 0x12]));
        let mut port = device(vec![vec![chunk]]);

        let result = exchange(
            &mut port,
            &Frame::read(MAC, functions::FLOW),
            Expect::Packet { data_len: 2 },
            RetryPolicy::UntilAnswered(10),
        )
        .await
        .unwrap();
        assert_eq!(result.attempts, 1);
    }

    #[tokio::test]
    async fn test_checksum_failure_is_retried() {
        let good = reply_frame(functions::FLOW, &[0x00, 0x80]);
        let mut bad = good.clone();
        bad[8] ^= 0xFF;
        let mut bad_chunk = vec![ACK];
        bad_chunk.extend(bad);
        let mut good_chunk = vec![ACK];
        good_chunk.extend(good);
        let mut port = device(vec![vec![bad_chunk], vec![good_chunk]]);

        let result = exchange(
            &mut port,
            &Frame::read(MAC, functions::FLOW),
            Expect::Packet { data_len: 2 },
            RetryPolicy::UntilAnswered(10),
        )
        .await
        .unwrap();
        assert_eq!(result.attempts, 2);
    }

    #[tokio::test]
    async fn test_persistent_checksum_failure_surfaces() {
        let mut bad = vec![ACK];
        bad.extend(reply_frame(functions::FLOW, &[0x00, 0x80]));
        let last = bad.len() - 1;
        bad[last] ^= 0x01;
        let mut port = device(vec![vec![bad.clone()], vec![bad.clone()], vec![bad]]);

        let err = exchange(
            &mut port,
            &Frame::read(MAC, functions::FLOW),
            Expect::Packet { data_len: 2 },
            RetryPolicy::Monitored(3),
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            CtlError::Protocol(ProtocolError::Checksum { .. })
        ));
    }

    #[tokio::test]
    async fn test_silence_exhausts_budget() {
        let mock = device(vec![]);
        let mut port = mock.clone();

        let err = exchange(
            &mut port,
            &Frame::write(MAC, functions::BAUD_RATE, 9600u32.to_le_bytes()),
            Expect::Ack,
            RetryPolicy::Monitored(4),
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            CtlError::Protocol(ProtocolError::NoResponse { attempts: 4 })
        ));
        // ACK + frame per attempt, no closing ACK
        assert_eq!(mock.writes().len(), 8);
    }

    #[tokio::test]
    async fn test_nak_with_reply_is_rejected_without_retry() {
        let mut chunk = vec![NAK];
        chunk.extend(reply_frame(functions::FLOW, &[0x00, 0x80]));
        let mock = device(vec![vec![chunk]]);
        let mut port = mock.clone();

        let err = exchange(
            &mut port,
            &Frame::read(MAC, functions::FLOW),
            Expect::Packet { data_len: 2 },
            RetryPolicy::UntilAnswered(10),
        )
        .await
        .unwrap_err();
        assert_eq!(err.to_string(), "Command incorrect.");
        let frames = mock
            .events()
            .into_iter()
            .filter(|e| matches!(e, MockEvent::Write(w) if w.len() > 1))
            .count();
        assert_eq!(frames, 1);
    }

    #[tokio::test]
    async fn test_ack_then_nak_is_failed_to_process() {
        let mut port = device(vec![vec![vec![ACK, NAK]]]);
        let err = exchange(
            &mut port,
            &Frame::write(MAC, functions::IO_MODE, vec![0x01]),
            Expect::Ack,
            RetryPolicy::Monitored(5),
        )
        .await
        .unwrap_err();
        assert_eq!(err.to_string(), "Failed to process command.");
    }

    #[tokio::test]
    async fn test_garbled_acknowledge_is_retried() {
        let mock = device(vec![vec![vec![ACK, 0x55]], vec![vec![ACK, ACK]]]);
        let mut port = mock.clone();
        let result = exchange(
            &mut port,
            &Frame::write(MAC, functions::IO_MODE, vec![0x01]),
            Expect::Ack,
            RetryPolicy::Monitored(5),
        )
        .await
        .unwrap();
        assert_eq!(result.attempts, 2);
        assert_eq!(result.reply, vec![ACK]);
    }

    #[tokio::test]
    async fn test_persistent_garbled_acknowledge_is_no_response() {
        let mut port = device(vec![vec![vec![ACK, 0x55]]; 3]);
        let err = exchange(
            &mut port,
            &Frame::write(MAC, functions::IO_MODE, vec![0x01]),
            Expect::Ack,
            RetryPolicy::Monitored(3),
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            CtlError::Protocol(ProtocolError::NoResponse { attempts: 3 })
        ));
    }

    #[tokio::test]
    async fn test_transport_fault_propagates() {
        let mock = device(vec![]);
        mock.fail_next(1);
        let mut port = mock.clone();
        let err = exchange(
            &mut port,
            &Frame::read(MAC, functions::FLOW),
            Expect::Packet { data_len: 2 },
            RetryPolicy::UntilAnswered(10),
        )
        .await
        .unwrap_err();
        assert!(err.is_transport_fault());
    }
}
