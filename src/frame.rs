//! Modbus RTU framing for the two function codes the regulator bus uses.
//!
//! Frames are built and validated byte by byte so that the bus-sharing quirks
//! of the deployment stay visible: every request the bridge transmits carries
//! a trailing `0x00` after the CRC, and write acknowledgements are the first
//! six request bytes re-framed with their own CRC.

use std::collections::BTreeMap;

/// Modbus function code "Read Holding Registers".
pub const READ_HOLDING_REGISTERS: u8 = 0x03;
/// Modbus function code "Write Multiple Registers".
pub const WRITE_MULTIPLE_REGISTERS: u8 = 0x10;

/// Smallest foreign request the bus can carry (read request with CRC).
pub const REQUEST_MIN_LEN: usize = 8;
/// Smallest answer to a read request (one register would be 7 bytes).
pub const ANSWER_MIN_LEN: usize = 7;
/// "The maximum size of a MODBUS RTU frame is 256 bytes."
pub const MAX_FRAME_LEN: usize = 256;
/// Length of a write acknowledgement.
pub const WRITE_ACK_LEN: usize = 8;
/// Maximum number of registers in one Write Multiple Registers request.
pub const MAX_WRITE_REGISTERS: usize = 123;

/// Everything that can be wrong with a frame seen on the line.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("Frame length {0} is outside the protocol bounds")]
    Length(usize),
    #[error("Invalid CRC: expected = 0x{expected:04X}, actual = 0x{actual:04X}")]
    Crc { expected: u16, actual: u16 },
    #[error("Unexpected slave address 0x{actual:02X}, expected 0x{expected:02X}")]
    SlaveAddress { expected: u8, actual: u8 },
    #[error("Unexpected function code 0x{actual:02X}, expected 0x{expected:02X}")]
    FunctionCode { expected: u8, actual: u8 },
    #[error("Unexpected byte count {actual}, expected {expected}")]
    ByteCount { expected: usize, actual: usize },
    #[error("Frame too short: {actual} bytes, expected at least {expected}")]
    Truncated { expected: usize, actual: usize },
    #[error("Unsupported function code 0x{0:02X}")]
    UnsupportedFunction(u8),
    /// The declared byte count contradicts the declared register count.
    #[error("Byte count {byte_count} does not match register count {registers}")]
    RegisterCount { registers: usize, byte_count: usize },
    #[error("Cannot write {0} registers in one request")]
    TooManyRegisters(usize),
}

/// A request issued by the foreign master, decoded from the line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedRequest {
    Read {
        slave: u8,
        start: u16,
        count: u16,
    },
    Write {
        slave: u8,
        start: u16,
        values: BTreeMap<u16, u16>,
    },
}

impl ParsedRequest {
    pub fn slave(&self) -> u8 {
        match self {
            ParsedRequest::Read { slave, .. } | ParsedRequest::Write { slave, .. } => *slave,
        }
    }
}

impl std::fmt::Display for ParsedRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParsedRequest::Read {
                slave,
                start,
                count,
            } => write!(f, "read  slave=0x{slave:02X} start={start} count={count}"),
            ParsedRequest::Write {
                slave,
                start,
                values,
            } => {
                write!(f, "write slave=0x{slave:02X} start={start} values=[")?;
                for (i, (register, value)) in values.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{register}:0x{value:04X}")?;
                }
                write!(f, "]")
            }
        }
    }
}

/// Calculate the Modbus CRC-16 of `data`.
///
/// The low byte of the result is transmitted first.
#[must_use]
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for byte in data {
        crc ^= u16::from(*byte);
        for _ in 0..8 {
            #[allow(clippy::branches_sharing_code)]
            if (crc & 0x0001) != 0 {
                crc >>= 1;
                crc ^= 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

fn push_crc(frame: &mut Vec<u8>) {
    let crc = crc16(frame);
    frame.extend_from_slice(&crc.to_le_bytes());
}

/// Checks the two CRC bytes that follow `frame[..body_len]`.
fn check_crc(frame: &[u8], body_len: usize) -> Result<(), FrameError> {
    let expected = u16::from_le_bytes([frame[body_len], frame[body_len + 1]]);
    let actual = crc16(&frame[..body_len]);
    if expected != actual {
        return Err(FrameError::Crc { expected, actual });
    }
    Ok(())
}

fn read_u16(frame: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([frame[at], frame[at + 1]])
}

/// Builds a Read Holding Registers request.
///
/// Layout: `addr,0x03,startHi,startLo,countHi,countLo,crcLo,crcHi,0x00`.
pub fn build_read_request(slave: u8, start: u16, count: u16) -> Vec<u8> {
    let mut frame = Vec::with_capacity(9);
    frame.push(slave);
    frame.push(READ_HOLDING_REGISTERS);
    frame.extend_from_slice(&start.to_be_bytes());
    frame.extend_from_slice(&count.to_be_bytes());
    push_crc(&mut frame);
    frame.push(0x00);
    frame
}

/// Builds a Write Multiple Registers request.
///
/// Layout: `addr,0x10,startHi,startLo,0x00,countLo,byteCount,data...,crcLo,crcHi,0x00`.
pub fn build_write_request(slave: u8, start: u16, values: &[u16]) -> Result<Vec<u8>, FrameError> {
    if values.is_empty() || values.len() > MAX_WRITE_REGISTERS {
        return Err(FrameError::TooManyRegisters(values.len()));
    }
    let mut frame = Vec::with_capacity(10 + 2 * values.len());
    frame.push(slave);
    frame.push(WRITE_MULTIPLE_REGISTERS);
    frame.extend_from_slice(&start.to_be_bytes());
    frame.push(0x00);
    frame.push(values.len() as u8);
    frame.push((2 * values.len()) as u8);
    for value in values {
        frame.extend_from_slice(&value.to_be_bytes());
    }
    push_crc(&mut frame);
    frame.push(0x00);
    Ok(frame)
}

/// The acknowledgement the slave sends back for a write request.
///
/// Layout: `addr,0x10,startHi,startLo,0x00,countLo,crcLo,crcHi`.
pub fn build_write_ack(slave: u8, start: u16, count: u16) -> Vec<u8> {
    let mut frame = Vec::with_capacity(WRITE_ACK_LEN);
    frame.push(slave);
    frame.push(WRITE_MULTIPLE_REGISTERS);
    frame.extend_from_slice(&start.to_be_bytes());
    frame.push(0x00);
    frame.push(count as u8);
    push_crc(&mut frame);
    frame
}

/// Builds the answer a slave gives to a read request.
pub fn build_read_answer(slave: u8, values: &[u16]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(5 + 2 * values.len());
    frame.push(slave);
    frame.push(READ_HOLDING_REGISTERS);
    frame.push((2 * values.len()) as u8);
    for value in values {
        frame.extend_from_slice(&value.to_be_bytes());
    }
    push_crc(&mut frame);
    frame
}

/// Decodes a request sent by the foreign master.
pub fn parse_slave_request(frame: &[u8]) -> Result<ParsedRequest, FrameError> {
    if !(REQUEST_MIN_LEN..=MAX_FRAME_LEN).contains(&frame.len()) {
        return Err(FrameError::Length(frame.len()));
    }
    match frame[1] {
        READ_HOLDING_REGISTERS => {
            check_crc(frame, 6)?;
            Ok(ParsedRequest::Read {
                slave: frame[0],
                start: read_u16(frame, 2),
                count: read_u16(frame, 4),
            })
        }
        WRITE_MULTIPLE_REGISTERS => {
            let registers = usize::from(read_u16(frame, 4));
            let byte_count = usize::from(frame[6]);
            if 2 * registers != byte_count {
                return Err(FrameError::RegisterCount {
                    registers,
                    byte_count,
                });
            }
            let frame_len = 2 * registers + 9;
            if frame.len() < frame_len {
                return Err(FrameError::Truncated {
                    expected: frame_len,
                    actual: frame.len(),
                });
            }
            check_crc(frame, frame_len - 2)?;
            let start = read_u16(frame, 2);
            let values = (0..registers)
                .map(|i| {
                    (
                        start.wrapping_add(i as u16),
                        read_u16(frame, 7 + 2 * i),
                    )
                })
                .collect();
            Ok(ParsedRequest::Write {
                slave: frame[0],
                start,
                values,
            })
        }
        other => Err(FrameError::UnsupportedFunction(other)),
    }
}

/// Validates the answer to a read request and decodes it into a register map.
///
/// Registers are keyed from `start` onwards.
pub fn parse_answer(
    frame: &[u8],
    expected_slave: u8,
    expected_function: u8,
    start: u16,
    expected_count: u16,
) -> Result<BTreeMap<u16, u16>, FrameError> {
    if !(ANSWER_MIN_LEN..=MAX_FRAME_LEN).contains(&frame.len()) {
        return Err(FrameError::Length(frame.len()));
    }
    if frame[0] != expected_slave {
        return Err(FrameError::SlaveAddress {
            expected: expected_slave,
            actual: frame[0],
        });
    }
    if frame[1] != expected_function {
        return Err(FrameError::FunctionCode {
            expected: expected_function,
            actual: frame[1],
        });
    }
    let byte_count = usize::from(frame[2]);
    let expected_bytes = 2 * usize::from(expected_count);
    if byte_count != expected_bytes {
        return Err(FrameError::ByteCount {
            expected: expected_bytes,
            actual: byte_count,
        });
    }
    let answer_len = 5 + byte_count;
    if frame.len() < answer_len {
        return Err(FrameError::Truncated {
            expected: answer_len,
            actual: frame.len(),
        });
    }
    check_crc(frame, answer_len - 2)?;
    Ok((0..usize::from(expected_count))
        .map(|i| (start.wrapping_add(i as u16), read_u16(frame, 3 + 2 * i)))
        .collect())
}
