use core::fmt;
use core::fmt::{Debug, Formatter};

use byteorder::{ByteOrder, LittleEndian};

/// Everything that can go wrong while driving an SDO transfer.
///
/// The variants fall into four kinds: a peer-initiated abort
/// (`TransferAborted`), protocol violations (`UnexpectedScsResponse`,
/// `UnexpectedToggleBit`, `UnexpectedResponseLength`, `MalformedFrame`),
/// timeouts, and link failures. None of them is retried within a transfer.
#[derive(Clone, Eq, PartialEq)]
pub enum ErrorCode {
    /// The peer terminated the transfer; carries the raw abort-code bytes
    /// from frame positions 4..8.
    TransferAborted { abort_code: Vec<u8> },
    UnexpectedScsResponse { expected: u8, actual: u8, abort_code: Vec<u8> },
    UnexpectedToggleBit { expected: bool, actual: bool, abort_code: Vec<u8> },
    UnexpectedResponseLength { expected: usize, actual: usize },
    InvalidBlockSize { blksize: u8 },
    MalformedFrame { expected: usize, actual: usize },
    Timeout { cob_id: u16 },
    LinkError { reason: String },
    FrameCreationFailed { data: Vec<u8> },
}

impl ErrorCode {
    /// Decodes the abort code carried by a `TransferAborted` error, if any.
    pub fn abort_code(&self) -> Option<u32> {
        match self {
            ErrorCode::TransferAborted { abort_code } if abort_code.len() >= 4 => {
                Some(LittleEndian::read_u32(abort_code))
            }
            _ => None,
        }
    }
}

impl Debug for ErrorCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::TransferAborted { abort_code } => {
                if abort_code.len() >= 4 {
                    let code = LittleEndian::read_u32(abort_code);
                    write!(f, "Transfer aborted by peer: {}", abort_code_text(code))
                } else {
                    write!(f, "Transfer aborted by peer")
                }
            }
            ErrorCode::UnexpectedScsResponse { expected, actual, .. } => write!(
                f,
                "Unexpected server command specifier {:#x} (expected {:#x})",
                actual, expected
            ),
            ErrorCode::UnexpectedToggleBit { expected, actual, .. } => write!(
                f,
                "Unexpected toggle bit {} (expected {})",
                actual, expected
            ),
            ErrorCode::UnexpectedResponseLength { expected, actual } => write!(
                f,
                "Unexpected response length {} (expected {})",
                actual, expected
            ),
            ErrorCode::InvalidBlockSize { blksize } => {
                write!(f, "Invalid block size {}", blksize)
            }
            ErrorCode::MalformedFrame { expected, actual } => write!(
                f,
                "Malformed frame: {} data bytes (need at least {})",
                actual, expected
            ),
            ErrorCode::Timeout { cob_id } => {
                write!(f, "Timed out waiting for COB-ID {:#x}", cob_id)
            }
            ErrorCode::LinkError { reason } => write!(f, "CAN link error: {}", reason),
            ErrorCode::FrameCreationFailed { data } => {
                write!(f, "Frame creation failed, data: {:x?}", data)
            }
        }
    }
}

/// The CiA 301 SDO abort codes.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum AbortCode {
    ToggleBitNotAlternated,
    SdoProtocolTimedOut,
    CommandSpecifierNotValidOrUnknown,
    InvalidBlockSize,
    InvalidSequenceNumber,
    CRCError,
    OutOfMemory,
    UnsupportedAccessToObject,
    AttemptToReadWriteOnlyObject,
    AttemptToWriteReadOnlyObject,
    ObjectDoesNotExistInObjectDictionary,
    ObjectCannotBeMappedToPDO,
    ExceedPDOSize,
    GeneralParameterIncompatibility,
    GeneralInternalIncompatibility,
    HardwareError,
    DataTypeMismatchLengthMismatch,
    DataTypeMismatchLengthTooHigh,
    DataTypeMismatchLengthTooLow,
    SubIndexDoesNotExist,
    ValueRangeExceeded,
    ValueWrittenTooHigh,
    ValueWrittenTooLow,
    MaxValueLessThanMinValue,
    ResourceNotAvailable,
    GeneralError,
    DataTransferOrStoreFailed,
    DataTransferOrStoreFailedDueToLocalControl,
    DataTransferOrStoreFailedDueToDeviceState,
    ObjectDictionaryGenerationFailedOrNotPresent,
    NoDataAvailable,
}

impl AbortCode {
    pub fn code(&self) -> u32 {
        match *self {
            AbortCode::ToggleBitNotAlternated => 0x0503_0000,
            AbortCode::SdoProtocolTimedOut => 0x0504_0000,
            AbortCode::CommandSpecifierNotValidOrUnknown => 0x0504_0001,
            AbortCode::InvalidBlockSize => 0x0504_0002,
            AbortCode::InvalidSequenceNumber => 0x0504_0003,
            AbortCode::CRCError => 0x0504_0004,
            AbortCode::OutOfMemory => 0x0504_0005,
            AbortCode::UnsupportedAccessToObject => 0x0601_0000,
            AbortCode::AttemptToReadWriteOnlyObject => 0x0601_0001,
            AbortCode::AttemptToWriteReadOnlyObject => 0x0601_0002,
            AbortCode::ObjectDoesNotExistInObjectDictionary => 0x0602_0000,
            AbortCode::ObjectCannotBeMappedToPDO => 0x0604_0041,
            AbortCode::ExceedPDOSize => 0x0604_0042,
            AbortCode::GeneralParameterIncompatibility => 0x0604_0043,
            AbortCode::GeneralInternalIncompatibility => 0x0604_0047,
            AbortCode::HardwareError => 0x0606_0000,
            AbortCode::DataTypeMismatchLengthMismatch => 0x0607_0010,
            AbortCode::DataTypeMismatchLengthTooHigh => 0x0607_0012,
            AbortCode::DataTypeMismatchLengthTooLow => 0x0607_0013,
            AbortCode::SubIndexDoesNotExist => 0x0609_0011,
            AbortCode::ValueRangeExceeded => 0x0609_0030,
            AbortCode::ValueWrittenTooHigh => 0x0609_0031,
            AbortCode::ValueWrittenTooLow => 0x0609_0032,
            AbortCode::MaxValueLessThanMinValue => 0x0609_0036,
            AbortCode::ResourceNotAvailable => 0x060A_0023,
            AbortCode::GeneralError => 0x0800_0000,
            AbortCode::DataTransferOrStoreFailed => 0x0800_0020,
            AbortCode::DataTransferOrStoreFailedDueToLocalControl => 0x0800_0021,
            AbortCode::DataTransferOrStoreFailedDueToDeviceState => 0x0800_0022,
            AbortCode::ObjectDictionaryGenerationFailedOrNotPresent => 0x0800_0023,
            AbortCode::NoDataAvailable => 0x0800_0024,
        }
    }

    pub fn description(&self) -> &'static str {
        match *self {
            AbortCode::ToggleBitNotAlternated => "Toggle bit not alternated",
            AbortCode::SdoProtocolTimedOut => "SDO protocol timed out",
            AbortCode::CommandSpecifierNotValidOrUnknown => "Client/server command specifier not valid or unknown",
            AbortCode::InvalidBlockSize => "Invalid block size (block mode only)",
            AbortCode::InvalidSequenceNumber => "Invalid sequence number (block mode only)",
            AbortCode::CRCError => "CRC error (block mode only)",
            AbortCode::OutOfMemory => "Out of memory",
            AbortCode::UnsupportedAccessToObject => "Unsupported access to an object",
            AbortCode::AttemptToReadWriteOnlyObject => "Attempt to read a write only object",
            AbortCode::AttemptToWriteReadOnlyObject => "Attempt to write a read only object",
            AbortCode::ObjectDoesNotExistInObjectDictionary => "Object does not exist in the object dictionary",
            AbortCode::ObjectCannotBeMappedToPDO => "Object cannot be mapped to the PDO",
            AbortCode::ExceedPDOSize => "The number and length of the objects to be mapped would exceed PDO length",
            AbortCode::GeneralParameterIncompatibility => "General parameter incompatibility reason",
            AbortCode::GeneralInternalIncompatibility => "General internal incompatibility in the device",
            AbortCode::HardwareError => "Access failed due to a hardware error",
            AbortCode::DataTypeMismatchLengthMismatch => "Data type does not match; length of service parameter does not match",
            AbortCode::DataTypeMismatchLengthTooHigh => "Data type does not match; length of service parameter too high",
            AbortCode::DataTypeMismatchLengthTooLow => "Data type does not match; length of service parameter too low",
            AbortCode::SubIndexDoesNotExist => "Sub-index does not exist",
            AbortCode::ValueRangeExceeded => "Value range of parameter exceeded (only for write access)",
            AbortCode::ValueWrittenTooHigh => "Value of parameter written too high",
            AbortCode::ValueWrittenTooLow => "Value of parameter written too low",
            AbortCode::MaxValueLessThanMinValue => "Maximum value is less than minimum value",
            AbortCode::ResourceNotAvailable => "Resource not available: SDO connection",
            AbortCode::GeneralError => "General error",
            AbortCode::DataTransferOrStoreFailed => "Data cannot be transferred or stored to the application",
            AbortCode::DataTransferOrStoreFailedDueToLocalControl => "Data cannot be transferred or stored to the application because of local control",
            AbortCode::DataTransferOrStoreFailedDueToDeviceState => "Data cannot be transferred or stored to the application because of the present device state",
            AbortCode::ObjectDictionaryGenerationFailedOrNotPresent => "Object dictionary dynamic generation fails or no object dictionary is present",
            AbortCode::NoDataAvailable => "No data available",
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0x0503_0000 => Some(AbortCode::ToggleBitNotAlternated),
            0x0504_0000 => Some(AbortCode::SdoProtocolTimedOut),
            0x0504_0001 => Some(AbortCode::CommandSpecifierNotValidOrUnknown),
            0x0504_0002 => Some(AbortCode::InvalidBlockSize),
            0x0504_0003 => Some(AbortCode::InvalidSequenceNumber),
            0x0504_0004 => Some(AbortCode::CRCError),
            0x0504_0005 => Some(AbortCode::OutOfMemory),
            0x0601_0000 => Some(AbortCode::UnsupportedAccessToObject),
            0x0601_0001 => Some(AbortCode::AttemptToReadWriteOnlyObject),
            0x0601_0002 => Some(AbortCode::AttemptToWriteReadOnlyObject),
            0x0602_0000 => Some(AbortCode::ObjectDoesNotExistInObjectDictionary),
            0x0604_0041 => Some(AbortCode::ObjectCannotBeMappedToPDO),
            0x0604_0042 => Some(AbortCode::ExceedPDOSize),
            0x0604_0043 => Some(AbortCode::GeneralParameterIncompatibility),
            0x0604_0047 => Some(AbortCode::GeneralInternalIncompatibility),
            0x0606_0000 => Some(AbortCode::HardwareError),
            0x0607_0010 => Some(AbortCode::DataTypeMismatchLengthMismatch),
            0x0607_0012 => Some(AbortCode::DataTypeMismatchLengthTooHigh),
            0x0607_0013 => Some(AbortCode::DataTypeMismatchLengthTooLow),
            0x0609_0011 => Some(AbortCode::SubIndexDoesNotExist),
            0x0609_0030 => Some(AbortCode::ValueRangeExceeded),
            0x0609_0031 => Some(AbortCode::ValueWrittenTooHigh),
            0x0609_0032 => Some(AbortCode::ValueWrittenTooLow),
            0x0609_0036 => Some(AbortCode::MaxValueLessThanMinValue),
            0x060A_0023 => Some(AbortCode::ResourceNotAvailable),
            0x0800_0000 => Some(AbortCode::GeneralError),
            0x0800_0020 => Some(AbortCode::DataTransferOrStoreFailed),
            0x0800_0021 => Some(AbortCode::DataTransferOrStoreFailedDueToLocalControl),
            0x0800_0022 => Some(AbortCode::DataTransferOrStoreFailedDueToDeviceState),
            0x0800_0023 => Some(AbortCode::ObjectDictionaryGenerationFailedOrNotPresent),
            0x0800_0024 => Some(AbortCode::NoDataAvailable),
            _ => None,
        }
    }
}

/// Human readable text for a 32-bit abort code, including codes this crate
/// never produces itself.
pub fn abort_code_text(code: u32) -> &'static str {
    match AbortCode::from_code(code) {
        Some(abort_code) => abort_code.description(),
        None => "Unknown abort code",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_debug() {
        assert_eq!(
            format!("{:?}", ErrorCode::TransferAborted { abort_code: vec![0, 0, 2, 6] }),
            "Transfer aborted by peer: Object does not exist in the object dictionary"
        );
        assert_eq!(
            format!("{:?}", ErrorCode::TransferAborted { abort_code: vec![] }),
            "Transfer aborted by peer"
        );
        assert_eq!(
            format!(
                "{:?}",
                ErrorCode::UnexpectedScsResponse { expected: 3, actual: 4, abort_code: vec![] }
            ),
            "Unexpected server command specifier 0x4 (expected 0x3)"
        );
        assert_eq!(
            format!("{:?}", ErrorCode::Timeout { cob_id: 0x582 }),
            "Timed out waiting for COB-ID 0x582"
        );
    }

    #[test]
    fn test_abort_code_round_trip() {
        let all = [
            AbortCode::ToggleBitNotAlternated,
            AbortCode::SdoProtocolTimedOut,
            AbortCode::CommandSpecifierNotValidOrUnknown,
            AbortCode::InvalidBlockSize,
            AbortCode::InvalidSequenceNumber,
            AbortCode::CRCError,
            AbortCode::OutOfMemory,
            AbortCode::UnsupportedAccessToObject,
            AbortCode::AttemptToReadWriteOnlyObject,
            AbortCode::AttemptToWriteReadOnlyObject,
            AbortCode::ObjectDoesNotExistInObjectDictionary,
            AbortCode::ObjectCannotBeMappedToPDO,
            AbortCode::ExceedPDOSize,
            AbortCode::GeneralParameterIncompatibility,
            AbortCode::GeneralInternalIncompatibility,
            AbortCode::HardwareError,
            AbortCode::DataTypeMismatchLengthMismatch,
            AbortCode::DataTypeMismatchLengthTooHigh,
            AbortCode::DataTypeMismatchLengthTooLow,
            AbortCode::SubIndexDoesNotExist,
            AbortCode::ValueRangeExceeded,
            AbortCode::ValueWrittenTooHigh,
            AbortCode::ValueWrittenTooLow,
            AbortCode::MaxValueLessThanMinValue,
            AbortCode::ResourceNotAvailable,
            AbortCode::GeneralError,
            AbortCode::DataTransferOrStoreFailed,
            AbortCode::DataTransferOrStoreFailedDueToLocalControl,
            AbortCode::DataTransferOrStoreFailedDueToDeviceState,
            AbortCode::ObjectDictionaryGenerationFailedOrNotPresent,
            AbortCode::NoDataAvailable,
        ];
        for abort_code in all {
            assert_eq!(AbortCode::from_code(abort_code.code()), Some(abort_code));
        }
        assert_eq!(AbortCode::from_code(0xFFFF_FFFF), None);
    }

    #[test]
    fn test_abort_code_text() {
        assert_eq!(abort_code_text(0x0503_0000), "Toggle bit not alternated");
        assert_eq!(abort_code_text(0x0602_0000), "Object does not exist in the object dictionary");
        assert_eq!(abort_code_text(0xDEAD_BEEF), "Unknown abort code");
    }

    #[test]
    fn test_transfer_aborted_decodes_code() {
        let err = ErrorCode::TransferAborted { abort_code: vec![0x02, 0x00, 0x01, 0x06] };
        assert_eq!(err.abort_code(), Some(0x0601_0002));
        assert_eq!(ErrorCode::Timeout { cob_id: 0x582 }.abort_code(), None);
    }
}
