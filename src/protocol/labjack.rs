//! LabJack U3/U6 low-level extended commands.
//!
//! Only the commands the IO drivers need are modelled: Feedback (digital
//! lines, analog inputs, DACs), I2C (LJTick-DAC accessories) and ReadCal
//! (factory calibration memory).
//!
//! Extended command layout:
//!
//! ```text
//! b0  checksum8 of b1..b5
//! b1  0xF8
//! b2  number of data words after b5
//! b3  extended command number
//! b4  checksum16 of b6.. (LSB)
//! b5  checksum16 (MSB)
//! b6.. data, padded to an even length
//! ```

use crate::adapters::Transport;
use crate::error::{to_hex, CtlResult, ProtocolError, ValidationError};
use tracing::debug;

const EXTENDED: u8 = 0xF8;
const HEADER: usize = 6;

/// Feedback extended command number.
pub const CMD_FEEDBACK: u8 = 0x00;
/// I2C extended command number.
pub const CMD_I2C: u8 = 0x3B;
/// ReadCal extended command number.
pub const CMD_READ_CAL: u8 = 0x2D;

/// Bytes in one calibration memory block.
pub const CAL_BLOCK_LEN: usize = 32;

/// Empty reads tolerated while collecting a response.
const IDLE_READS: usize = 3;

/// 8-bit checksum with end-around carry.
pub fn checksum8(bytes: &[u8]) -> u8 {
    let mut a: u32 = bytes.iter().map(|b| u32::from(*b)).sum();
    let mut bb = a / 256;
    a = (a - 256 * bb) + bb;
    bb = a / 256;
    ((a - 256 * bb) + bb) as u8
}

/// 16-bit plain sum.
pub fn checksum16(bytes: &[u8]) -> u16 {
    bytes.iter().fold(0u16, |acc, b| acc.wrapping_add(u16::from(*b)))
}

/// Wrap `payload` in an extended command frame.
pub fn extended_command(command: u8, payload: &[u8]) -> Vec<u8> {
    let mut bytes = vec![0u8; HEADER];
    bytes.extend_from_slice(payload);
    if bytes.len() % 2 != 0 {
        bytes.push(0);
    }
    bytes[1] = EXTENDED;
    bytes[2] = ((bytes.len() - HEADER) / 2) as u8;
    bytes[3] = command;
    let sum16 = checksum16(&bytes[HEADER..]).to_le_bytes();
    bytes[4] = sum16[0];
    bytes[5] = sum16[1];
    bytes[0] = checksum8(&bytes[1..HEADER]);
    bytes
}

/// Verify framing, checksums and the error code of a response.
pub fn check_response(bytes: &[u8], command: u8) -> Result<(), ProtocolError> {
    if bytes.len() < HEADER + 2 {
        return Err(ProtocolError::malformed("short response", bytes));
    }
    let expected = checksum8(&bytes[1..HEADER]);
    if bytes[0] != expected {
        return Err(ProtocolError::Checksum {
            expected,
            actual: bytes[0],
        });
    }
    let sum16 = checksum16(&bytes[HEADER..]).to_le_bytes();
    if bytes[4..HEADER] != sum16 {
        return Err(ProtocolError::Checksum {
            expected: sum16[0],
            actual: bytes[4],
        });
    }
    if bytes[1] != EXTENDED || bytes[3] != command {
        return Err(ProtocolError::malformed("unexpected command in response", bytes));
    }
    if bytes[6] != 0 {
        return Err(ProtocolError::DeviceStatus {
            category: "LabJack error".to_string(),
            payload: format!("errorcode {} (frame {})", bytes[6], bytes[7]),
        });
    }
    Ok(())
}

/// One Feedback IOType.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedbackOp {
    /// Read one digital line
    BitStateRead {
        /// FIO/EIO/CIO line number
        line: u8,
    },
    /// Drive one digital line
    BitStateWrite {
        /// FIO/EIO/CIO line number
        line: u8,
        /// High when true
        state: bool,
    },
    /// U6 analog input, 24-bit raw reading
    Ain24 {
        /// Positive input channel
        channel: u8,
        /// ADC resolution, 1 is the fastest high-speed setting
        resolution_index: u8,
        /// 0 selects x1 gain (+/-10 V)
        gain_index: u8,
        /// 0 selects automatic settling
        settling_factor: u8,
        /// Measure against the next channel instead of ground
        differential: bool,
    },
    /// U6 built-in DAC, 16-bit value
    Dac16 {
        /// DAC0 or DAC1
        dac: u8,
        /// Raw code
        value: u16,
    },
}

impl FeedbackOp {
    /// Single-ended AIN24 read at the high-speed ADC, x1 gain, auto settling.
    pub fn ain(channel: u8) -> Self {
        FeedbackOp::Ain24 {
            channel,
            resolution_index: 1,
            gain_index: 0,
            settling_factor: 0,
            differential: false,
        }
    }

    fn encode(&self, out: &mut Vec<u8>) {
        match *self {
            FeedbackOp::BitStateRead { line } => out.extend_from_slice(&[10, line]),
            FeedbackOp::BitStateWrite { line, state } => {
                out.extend_from_slice(&[11, line | (u8::from(state) << 7)])
            }
            FeedbackOp::Ain24 {
                channel,
                resolution_index,
                gain_index,
                settling_factor,
                differential,
            } => out.extend_from_slice(&[
                2,
                channel,
                resolution_index | (gain_index << 4),
                settling_factor | (u8::from(differential) << 7),
            ]),
            FeedbackOp::Dac16 { dac, value } => {
                let [lo, hi] = value.to_le_bytes();
                out.extend_from_slice(&[38 + dac, lo, hi]);
            }
        }
    }

    fn response_len(&self) -> usize {
        match self {
            FeedbackOp::BitStateRead { .. } => 1,
            FeedbackOp::BitStateWrite { .. } | FeedbackOp::Dac16 { .. } => 0,
            FeedbackOp::Ain24 { .. } => 3,
        }
    }
}

/// Build a Feedback command.
pub fn feedback_command(ops: &[FeedbackOp]) -> Vec<u8> {
    // b6 is an echo byte returned unchanged
    let mut payload = vec![0u8];
    for op in ops {
        op.encode(&mut payload);
    }
    extended_command(CMD_FEEDBACK, &payload)
}

fn padded(len: usize) -> usize {
    len + len % 2
}

/// Size of the Feedback response to `ops`.
pub fn feedback_response_len(ops: &[FeedbackOp]) -> usize {
    padded(9 + ops.iter().map(FeedbackOp::response_len).sum::<usize>())
}

/// Run a Feedback command and return the concatenated IOType responses.
pub async fn feedback(port: &mut dyn Transport, ops: &[FeedbackOp]) -> CtlResult<Vec<u8>> {
    let command = feedback_command(ops);
    let len = feedback_response_len(ops);
    let response = transact(port, &command, len).await?;
    check_response(&response, CMD_FEEDBACK)?;
    let data_len: usize = ops.iter().map(FeedbackOp::response_len).sum();
    Ok(response[9..9 + data_len].to_vec())
}

/// I2C transfer through two digital lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct I2cRequest {
    /// 7-bit device address
    pub address: u8,
    /// Digital line carrying SDA
    pub sda_line: u8,
    /// Digital line carrying SCL
    pub scl_line: u8,
    /// Bytes written to the device
    pub send: Vec<u8>,
    /// Bytes read back after the write
    pub receive: usize,
}

impl I2cRequest {
    /// Build the extended command. Both byte counts travel in one byte each.
    pub fn encode(&self) -> Result<Vec<u8>, ValidationError> {
        let send = u8::try_from(self.send.len()).map_err(|_| {
            ValidationError::range("I2C send length", self.send.len(), 0.0, f64::from(u8::MAX))
        })?;
        let receive = u8::try_from(self.receive).map_err(|_| {
            ValidationError::range("I2C receive length", self.receive, 0.0, f64::from(u8::MAX))
        })?;
        let mut payload = vec![
            0, // options
            0, // speed adjust
            self.sda_line,
            self.scl_line,
            self.address << 1,
            0,
            send,
            receive,
        ];
        payload.extend_from_slice(&self.send);
        Ok(extended_command(CMD_I2C, &payload))
    }

    /// Size of the response frame.
    pub fn response_len(&self) -> usize {
        padded(12 + self.receive)
    }
}

/// Run an I2C transfer and return the received bytes.
pub async fn i2c(port: &mut dyn Transport, request: &I2cRequest) -> CtlResult<Vec<u8>> {
    let command = request.encode()?;
    let response = transact(port, &command, request.response_len()).await?;
    check_response(&response, CMD_I2C)?;
    Ok(response[12..12 + request.receive].to_vec())
}

/// Read one 32-byte block of the board's calibration memory.
pub async fn read_cal_block(port: &mut dyn Transport, block: u8) -> CtlResult<Vec<u8>> {
    let command = extended_command(CMD_READ_CAL, &[0, block]);
    let response = transact(port, &command, 8 + CAL_BLOCK_LEN).await?;
    check_response(&response, CMD_READ_CAL)?;
    Ok(response[8..8 + CAL_BLOCK_LEN].to_vec())
}

async fn transact(port: &mut dyn Transport, command: &[u8], len: usize) -> CtlResult<Vec<u8>> {
    port.write(command).await?;
    let mut response = Vec::with_capacity(len);
    let mut idle = 0;
    while response.len() < len && idle < IDLE_READS {
        let chunk = port.read(len - response.len()).await?;
        if chunk.is_empty() {
            idle += 1;
        }
        response.extend_from_slice(&chunk);
    }
    debug!(tx = %to_hex(command), rx = %to_hex(&response), "LabJack transfer");
    if response.len() < len {
        return Err(ProtocolError::malformed("short response", &response).into());
    }
    Ok(response)
}

/// Raw AIN24 reading as 16-bit counts.
pub fn ain24_counts(data: &[u8]) -> Result<f64, ProtocolError> {
    match data {
        [b0, b1, b2, ..] => {
            let raw = u32::from(*b0) | u32::from(*b1) << 8 | u32::from(*b2) << 16;
            Ok(f64::from(raw) / 256.0)
        }
        _ => Err(ProtocolError::malformed("short AIN24 response", data)),
    }
}

/// Linear conversion `bits = slope * volts + offset` (or the inverse for AIN).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearCal {
    /// Gain
    pub slope: f64,
    /// Value at zero input
    pub offset: f64,
}

impl LinearCal {
    /// Volts to a 16-bit DAC code, truncated and saturated.
    pub fn dac_code(&self, volts: f64) -> u16 {
        (self.slope * volts + self.offset).trunc().clamp(0.0, f64::from(u16::MAX)) as u16
    }

    /// Counts to volts.
    pub fn volts(&self, counts: f64) -> f64 {
        self.slope * counts + self.offset
    }
}

/// I2C address of the LJTick-DAC EEPROM.
pub const TICK_EEPROM_ADDRESS: u8 = 0x50;
/// I2C address of the LJTick-DAC converter.
pub const TICK_DAC_ADDRESS: u8 = 0x12;
/// EEPROM offset of the calibration block.
pub const TICK_CAL_OFFSET: u8 = 64;
/// Size of the LJTick-DAC calibration block.
pub const TICK_CAL_LEN: usize = 36;

/// 8-byte fixed point: little-endian u32 fraction then i32 integer part.
pub fn fixed_point(bytes: &[u8]) -> Result<f64, ProtocolError> {
    if bytes.len() < 8 {
        return Err(ProtocolError::malformed("short fixed point value", bytes));
    }
    let fraction = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    let whole = i32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    Ok(f64::from(whole) + f64::from(fraction) / 4_294_967_296.0)
}

/// Calibration constants of both LJTick-DAC outputs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TickDacCalibration {
    /// Output DACA
    pub a: LinearCal,
    /// Output DACB
    pub b: LinearCal,
}

impl TickDacCalibration {
    /// Decode the EEPROM calibration block. An erased byte (0xFF) anywhere in
    /// the block means the accessory is missing or was never calibrated.
    pub fn from_eeprom(block: &[u8]) -> Result<Self, ProtocolError> {
        if block.len() < 32 {
            return Err(ProtocolError::Calibration(format!(
                "expected {TICK_CAL_LEN} bytes, got {}",
                block.len()
            )));
        }
        if block.contains(&0xFF) {
            return Err(ProtocolError::Calibration(
                "LJTick-DAC calibration constants seem off, check that it is connected properly"
                    .to_string(),
            ));
        }
        Ok(Self {
            a: LinearCal {
                slope: fixed_point(&block[0..8])?,
                offset: fixed_point(&block[8..16])?,
            },
            b: LinearCal {
                slope: fixed_point(&block[16..24])?,
                offset: fixed_point(&block[24..32])?,
            },
        })
    }
}

/// Where a board model keeps its calibration constants.
///
/// The AIN block starts with the single-ended slope and offset of the widest
/// input range. The DAC block holds slope and offset of DAC0, then DAC1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalLayout {
    /// Block holding the AIN constants
    pub ain_block: u8,
    /// Block holding the DAC constants
    pub dac_block: u8,
}

/// U3 calibration memory.
pub const U3_CAL_LAYOUT: CalLayout = CalLayout {
    ain_block: 0,
    dac_block: 1,
};
/// U6 calibration memory.
pub const U6_CAL_LAYOUT: CalLayout = CalLayout {
    ain_block: 0,
    dac_block: 2,
};

/// Factory calibration of the built-in analog IO.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoardCalibration {
    /// Counts to volts for the analog inputs
    pub ain: LinearCal,
    /// Volts to DAC0 codes
    pub dac0: LinearCal,
    /// Volts to DAC1 codes
    pub dac1: LinearCal,
}

impl BoardCalibration {
    /// Decode the AIN and DAC calibration blocks.
    pub fn from_blocks(ain: &[u8], dac: &[u8]) -> Result<Self, ProtocolError> {
        for block in [ain, dac] {
            if block.len() < CAL_BLOCK_LEN {
                return Err(ProtocolError::Calibration(format!(
                    "expected {CAL_BLOCK_LEN} bytes, got {}",
                    block.len()
                )));
            }
            if block[..CAL_BLOCK_LEN].iter().all(|b| *b == 0xFF) {
                return Err(ProtocolError::Calibration(
                    "calibration memory is blank".to_string(),
                ));
            }
        }
        Ok(Self {
            ain: LinearCal {
                slope: fixed_point(&ain[0..8])?,
                offset: fixed_point(&ain[8..16])?,
            },
            dac0: LinearCal {
                slope: fixed_point(&dac[0..8])?,
                offset: fixed_point(&dac[8..16])?,
            },
            dac1: LinearCal {
                slope: fixed_point(&dac[16..24])?,
                offset: fixed_point(&dac[24..32])?,
            },
        })
    }

    /// Conversion for DAC `dac`; anything but 0 selects DAC1.
    pub fn dac(&self, dac: u8) -> LinearCal {
        if dac == 0 {
            self.dac0
        } else {
            self.dac1
        }
    }
}

/// Read the board's stored AIN and DAC calibration.
pub async fn read_board_calibration(
    port: &mut dyn Transport,
    layout: CalLayout,
) -> CtlResult<BoardCalibration> {
    let ain = read_cal_block(port, layout.ain_block).await?;
    let dac = read_cal_block(port, layout.dac_block).await?;
    Ok(BoardCalibration::from_blocks(&ain, &dac)?)
}
