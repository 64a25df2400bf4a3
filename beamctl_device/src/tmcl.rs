//! TMCL frame codec for TMCM stepper-motor controllers.
//!
//! Both directions use fixed 9-byte frames with a big-endian 32-bit
//! value and a mod-256 checksum over the first eight bytes:
//!
//! request: `[address, command, type, motor/bank, value*4, checksum]`
//! reply:   `[reply-addr, target-addr, status, command, value*4, checksum]`
//!
//! A checksum mismatch or a reply answering a different command than
//! the one sent is a communication error and disconnects the device.

use bitflags::bitflags;

use beamctl_common::error::DeviceError;

/// Module address used on the wire; the controllers ship with 1.
pub const MODULE_ADDRESS: u8 = 1;

/// Length of every TMCL frame.
pub const FRAME_LEN: usize = 9;

/// TMCL instruction numbers.
pub mod instruction {
    pub const ROTATE_RIGHT: u8 = 1;
    pub const ROTATE_LEFT: u8 = 2;
    pub const STOP: u8 = 3;
    pub const MOVE_TO: u8 = 4;
    pub const SET_AXIS_PARAMETER: u8 = 5;
    pub const GET_AXIS_PARAMETER: u8 = 6;
    pub const STORE_AXIS_PARAMETER: u8 = 7;
    pub const GET_FIRMWARE_VERSION: u8 = 136;
}

/// Axis parameter numbers (the subset the instrument uses).
pub mod axis_param {
    pub const TARGET_POSITION: u8 = 0;
    pub const ACTUAL_POSITION: u8 = 1;
    pub const TARGET_SPEED: u8 = 2;
    pub const ACTUAL_SPEED: u8 = 3;
    pub const MAX_POSITIONING_SPEED: u8 = 4;
    pub const MAX_ACCELERATION: u8 = 5;
    pub const ABSOLUTE_MAX_CURRENT: u8 = 6;
    pub const STANDBY_CURRENT: u8 = 7;
    pub const TARGET_POSITION_REACHED: u8 = 8;
    pub const RIGHT_LIMIT_SWITCH_STATUS: u8 = 10;
    pub const LEFT_LIMIT_SWITCH_STATUS: u8 = 11;
    pub const RIGHT_LIMIT_SWITCH_DISABLE: u8 = 12;
    pub const LEFT_LIMIT_SWITCH_DISABLE: u8 = 13;
    pub const ACTUAL_ACCELERATION: u8 = 135;
    pub const RAMP_MODE: u8 = 138;
    pub const MICROSTEP_RESOLUTION: u8 = 140;
    pub const RAMP_DIVISOR: u8 = 153;
    pub const PULSE_DIVISOR: u8 = 154;
    pub const FREEWHEELING_DELAY: u8 = 204;
    pub const ACTUAL_LOAD_VALUE: u8 = 206;
    pub const DRIVER_ERROR_FLAGS: u8 = 208;
}

/// Reply status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TmclStatus {
    WrongChecksum,
    InvalidCommand,
    WrongType,
    InvalidValue,
    EepromLocked,
    CommandNotAvailable,
    Success,
    LoadedIntoEeprom,
    Unknown(u8),
}

impl TmclStatus {
    pub fn from_code(code: u8) -> Self {
        match code {
            1 => Self::WrongChecksum,
            2 => Self::InvalidCommand,
            3 => Self::WrongType,
            4 => Self::InvalidValue,
            5 => Self::EepromLocked,
            6 => Self::CommandNotAvailable,
            100 => Self::Success,
            101 => Self::LoadedIntoEeprom,
            other => Self::Unknown(other),
        }
    }

    /// Whether the controller accepted the instruction.
    pub fn is_ok(self) -> bool {
        matches!(self, Self::Success | Self::LoadedIntoEeprom)
    }

    pub fn message(self) -> String {
        match self {
            Self::WrongChecksum => "wrong checksum".to_string(),
            Self::InvalidCommand => "invalid command".to_string(),
            Self::WrongType => "wrong type".to_string(),
            Self::InvalidValue => "invalid value".to_string(),
            Self::EepromLocked => "configuration EEPROM locked".to_string(),
            Self::CommandNotAvailable => "command not available".to_string(),
            Self::Success => "success".to_string(),
            Self::LoadedIntoEeprom => "command loaded into TMCL EEPROM".to_string(),
            Self::Unknown(code) => format!("unknown status {code}"),
        }
    }
}

bitflags! {
    /// Driver error flags reported through axis parameter 208.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DriverError: u8 {
        const STALLGUARD          = 0x01;
        const OVERTEMPERATURE     = 0x02;
        const OVERTEMP_WARNING    = 0x04;
        const SHORT_TO_GROUND_A   = 0x08;
        const SHORT_TO_GROUND_B   = 0x10;
        const OPEN_LOAD_A         = 0x20;
        const OPEN_LOAD_B         = 0x40;
        const STANDSTILL          = 0x80;
    }
}

/// A decoded reply frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TmclReply {
    pub status: TmclStatus,
    pub command: u8,
    pub value: i32,
}

/// Build the 9-byte request frame.
pub fn pack(command: u8, type_: u8, motor_or_bank: u8, value: i32) -> [u8; FRAME_LEN] {
    let mut frame = [0u8; FRAME_LEN];
    frame[0] = MODULE_ADDRESS;
    frame[1] = command;
    frame[2] = type_;
    frame[3] = motor_or_bank;
    frame[4..8].copy_from_slice(&value.to_be_bytes());
    frame[8] = checksum(&frame[..8]);
    frame
}

/// Sum of all bytes modulo 256.
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

/// Decode a reply frame, verifying length, checksum and — when the
/// matching request is given — the answered command number.
pub fn unpack(frame: &[u8], sent: Option<&[u8]>) -> Result<TmclReply, DeviceError> {
    if frame.len() != FRAME_LEN {
        return Err(DeviceError::Communication(format!(
            "invalid TMCL message length: got {} bytes instead of {FRAME_LEN}",
            frame.len()
        )));
    }
    if checksum(&frame[..8]) != frame[8] {
        return Err(DeviceError::Communication(format!(
            "checksum error on TMCL message {frame:02x?}"
        )));
    }
    let command = frame[3];
    if let Some(sent) = sent {
        if sent.len() == FRAME_LEN && sent[1] != command {
            return Err(DeviceError::Communication(format!(
                "got reply for command {command}, expected {}",
                sent[1]
            )));
        }
    }
    Ok(TmclReply {
        status: TmclStatus::from_code(frame[2]),
        command,
        value: i32::from_be_bytes([frame[4], frame[5], frame[6], frame[7]]),
    })
}

/// Build a well-formed reply frame (used by the controller simulator).
pub fn pack_reply(status: u8, command: u8, value: i32) -> [u8; FRAME_LEN] {
    let mut frame = [0u8; FRAME_LEN];
    frame[0] = 2; // reply address
    frame[1] = MODULE_ADDRESS;
    frame[2] = status;
    frame[3] = command;
    frame[4..8].copy_from_slice(&value.to_be_bytes());
    frame[8] = checksum(&frame[..8]);
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_produces_the_documented_layout() {
        let frame = pack(instruction::MOVE_TO, 0, 2, 0x01020304);
        assert_eq!(frame[0], MODULE_ADDRESS);
        assert_eq!(frame[1], instruction::MOVE_TO);
        assert_eq!(frame[2], 0);
        assert_eq!(frame[3], 2);
        assert_eq!(&frame[4..8], &[1, 2, 3, 4]);
        assert_eq!(frame[8], checksum(&frame[..8]));
    }

    #[test]
    fn negative_values_are_big_endian_twos_complement() {
        let frame = pack(instruction::MOVE_TO, 0, 0, -1);
        assert_eq!(&frame[4..8], &[0xff, 0xff, 0xff, 0xff]);
        let reply = pack_reply(100, instruction::MOVE_TO, -12345);
        assert_eq!(unpack(&reply, None).unwrap().value, -12345);
    }

    #[test]
    fn checksum_mismatch_is_a_communication_error() {
        let mut reply = pack_reply(100, instruction::GET_AXIS_PARAMETER, 7);
        reply[8] ^= 0xff;
        assert!(matches!(
            unpack(&reply, None),
            Err(DeviceError::Communication(_))
        ));
    }

    #[test]
    fn reply_must_answer_the_sent_command() {
        let sent = pack(instruction::GET_AXIS_PARAMETER, 1, 0, 0);
        let reply = pack_reply(100, instruction::STOP, 0);
        assert!(matches!(
            unpack(&reply, Some(&sent)),
            Err(DeviceError::Communication(_))
        ));
        let good = pack_reply(100, instruction::GET_AXIS_PARAMETER, 55);
        assert_eq!(unpack(&good, Some(&sent)).unwrap().value, 55);
    }

    #[test]
    fn status_codes_decode() {
        assert!(TmclStatus::from_code(100).is_ok());
        assert!(TmclStatus::from_code(101).is_ok());
        assert!(!TmclStatus::from_code(1).is_ok());
        assert_eq!(TmclStatus::from_code(3), TmclStatus::WrongType);
    }
}
