// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Message frame headers.
//!
//! Every message in a ring buffer starts with a 12-byte [`CommonHeader`]:
//!
//! ```text
//! offset  size  field
//! 0       1     message_format
//! 1       1     message_format_check   (!message_format)
//! 2       4     message_size           (payload bytes, little-endian)
//! 6       4     message_size_check     (!message_size)
//! 10      2     message_seq_num        (little-endian)
//! ```
//!
//! Handle-exchange messages carry an 8-byte [`ExtendedHeader`] right after it.
//! The complement fields catch single-bit corruption; a bit flipped in both a
//! field and its check at the same position goes unnoticed.

use crate::error::CorruptionError;

/// Size of the common header in bytes.
pub const COMMON_HEADER_SIZE: usize = 12;

/// Size of the handle-exchange extension in bytes.
pub const EXTENDED_HEADER_SIZE: usize = 8;

/// Kind of message that follows a header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageFormat {
    /// Payload bytes only.
    Data = 0x01,
    /// Payload bytes plus one memory handle sent over the side-channel.
    HandleExchange = 0x02,
}

impl MessageFormat {
    pub const fn tag(self) -> u8 {
        self as u8
    }

    pub const fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0x01 => Some(Self::Data),
            0x02 => Some(Self::HandleExchange),
            _ => None,
        }
    }

    /// Bytes a message of this format occupies besides its payload.
    pub const fn overhead(self) -> usize {
        match self {
            Self::Data => COMMON_HEADER_SIZE,
            Self::HandleExchange => COMMON_HEADER_SIZE + EXTENDED_HEADER_SIZE,
        }
    }
}

/// Header prefixed to every message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommonHeader {
    pub message_format: u8,
    pub message_format_check: u8,
    pub message_size: u32,
    pub message_size_check: u32,
    pub message_seq_num: u16,
}

impl CommonHeader {
    /// Build a well-formed header.
    pub const fn new(format: MessageFormat, message_size: u32, seq: u16) -> Self {
        Self {
            message_format: format.tag(),
            message_format_check: !format.tag(),
            message_size,
            message_size_check: !message_size,
            message_seq_num: seq,
        }
    }

    pub fn serialize(&self) -> [u8; COMMON_HEADER_SIZE] {
        let mut bytes = [0u8; COMMON_HEADER_SIZE];
        bytes[0] = self.message_format;
        bytes[1] = self.message_format_check;
        bytes[2..6].copy_from_slice(&self.message_size.to_le_bytes());
        bytes[6..10].copy_from_slice(&self.message_size_check.to_le_bytes());
        bytes[10..12].copy_from_slice(&self.message_seq_num.to_le_bytes());
        bytes
    }

    pub fn deserialize(bytes: &[u8; COMMON_HEADER_SIZE]) -> Self {
        Self {
            message_format: bytes[0],
            message_format_check: bytes[1],
            message_size: u32::from_le_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]),
            message_size_check: u32::from_le_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]),
            message_seq_num: u16::from_le_bytes([bytes[10], bytes[11]]),
        }
    }

    /// Check the complement fields and the sequence number.
    ///
    /// This is the only place a frame is judged corrupt. A failure must close
    /// the connection; it is never retried.
    pub fn validate(&self, expected_seq: u16) -> Result<MessageFormat, CorruptionError> {
        if self.message_format_check != !self.message_format {
            return Err(CorruptionError::FormatCheckMismatch {
                tag: self.message_format,
                check: self.message_format_check,
            });
        }

        let format = MessageFormat::from_tag(self.message_format).ok_or(
            CorruptionError::UnknownFormat {
                tag: self.message_format,
            },
        )?;

        if self.message_size_check != !self.message_size {
            return Err(CorruptionError::SizeCheckMismatch {
                size: self.message_size,
                check: self.message_size_check,
            });
        }

        if self.message_seq_num != expected_seq {
            return Err(CorruptionError::UnexpectedSequence {
                expected: expected_seq,
                actual: self.message_seq_num,
            });
        }

        Ok(format)
    }

    /// Payload length announced by this header.
    pub fn payload_size(&self) -> usize {
        self.message_size as usize
    }
}

/// Handle descriptor following the common header of a handle-exchange message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtendedHeader {
    pub handle_seq: u32,
    pub handle_seq_check: u32,
}

impl ExtendedHeader {
    pub const fn new(handle_seq: u32) -> Self {
        Self {
            handle_seq,
            handle_seq_check: !handle_seq,
        }
    }

    pub fn serialize(&self) -> [u8; EXTENDED_HEADER_SIZE] {
        let mut bytes = [0u8; EXTENDED_HEADER_SIZE];
        bytes[0..4].copy_from_slice(&self.handle_seq.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.handle_seq_check.to_le_bytes());
        bytes
    }

    pub fn deserialize(bytes: &[u8; EXTENDED_HEADER_SIZE]) -> Self {
        Self {
            handle_seq: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            handle_seq_check: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        }
    }

    pub fn validate(&self) -> Result<u32, CorruptionError> {
        if self.handle_seq_check != !self.handle_seq {
            return Err(CorruptionError::HandleCheckMismatch {
                handle_seq: self.handle_seq,
                check: self.handle_seq_check,
            });
        }
        Ok(self.handle_seq)
    }
}

/// Per-direction message sequence counter.
///
/// Starts at 1 and wraps from 65535 to 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceCounter(u16);

impl SequenceCounter {
    pub const fn new() -> Self {
        Self(1)
    }

    /// Sequence number of the next message.
    pub const fn current(&self) -> u16 {
        self.0
    }

    pub fn advance(&mut self) {
        self.0 = self.0.wrapping_add(1);
    }
}

impl Default for SequenceCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_layout() {
        let header = CommonHeader::new(MessageFormat::Data, 0x0403_0201, 0x0605);
        let bytes = header.serialize();
        assert_eq!(bytes[0], 0x01);
        assert_eq!(bytes[1], 0xFE);
        assert_eq!(&bytes[2..6], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(&bytes[6..10], &[0xFE, 0xFD, 0xFC, 0xFB]);
        assert_eq!(&bytes[10..12], &[0x05, 0x06]);
    }

    #[test]
    fn test_overhead() {
        assert_eq!(MessageFormat::Data.overhead(), 12);
        assert_eq!(MessageFormat::HandleExchange.overhead(), 20);
    }

    #[test]
    fn test_validate_ok() {
        let header = CommonHeader::new(MessageFormat::HandleExchange, 512, 9);
        assert_eq!(header.validate(9), Ok(MessageFormat::HandleExchange));
    }

    #[test]
    fn test_validate_wrong_sequence() {
        let header = CommonHeader::new(MessageFormat::Data, 512, 9);
        assert_eq!(
            header.validate(10),
            Err(CorruptionError::UnexpectedSequence {
                expected: 10,
                actual: 9
            })
        );
    }

    #[test]
    fn test_unknown_format_with_valid_check() {
        let header = CommonHeader {
            message_format: 0x07,
            message_format_check: !0x07,
            message_size: 1,
            message_size_check: !1,
            message_seq_num: 1,
        };
        assert_eq!(
            header.validate(1),
            Err(CorruptionError::UnknownFormat { tag: 0x07 })
        );
    }

    #[test]
    fn test_single_bit_flips_are_detected() {
        let header = CommonHeader::new(MessageFormat::Data, 4096, 77);
        let bytes = header.serialize();

        // format, format_check, size and size_check occupy bytes 0..10
        for byte in 0..10 {
            for bit in 0..8 {
                let mut corrupted = bytes;
                corrupted[byte] ^= 1 << bit;
                let decoded = CommonHeader::deserialize(&corrupted);
                assert!(
                    decoded.validate(77).is_err(),
                    "flip of bit {} in byte {} went unnoticed",
                    bit,
                    byte
                );
            }
        }
    }

    #[test]
    fn test_mirrored_size_flip_escapes_detection() {
        // Known limitation: the same bit flipped in a field and its check
        // keeps the pair complementary.
        let header = CommonHeader::new(MessageFormat::Data, 4096, 1);
        let mut bytes = header.serialize();
        bytes[2] ^= 0x10;
        bytes[6] ^= 0x10;
        let decoded = CommonHeader::deserialize(&bytes);
        assert_eq!(decoded.validate(1), Ok(MessageFormat::Data));
        assert_ne!(decoded.message_size, 4096);
    }

    #[test]
    fn test_extended_header() {
        let ext = ExtendedHeader::new(41);
        let decoded = ExtendedHeader::deserialize(&ext.serialize());
        assert_eq!(decoded.validate(), Ok(41));

        let mut bytes = ext.serialize();
        bytes[5] ^= 0x01;
        assert!(ExtendedHeader::deserialize(&bytes).validate().is_err());
    }

    #[test]
    fn test_sequence_counter_wraps() {
        let mut seq = SequenceCounter::new();
        assert_eq!(seq.current(), 1);
        for _ in 0..65534 {
            seq.advance();
        }
        assert_eq!(seq.current(), 65535);
        seq.advance();
        assert_eq!(seq.current(), 0);
        seq.advance();
        assert_eq!(seq.current(), 1);
    }

    fn any_format() -> impl Strategy<Value = MessageFormat> {
        prop_oneof![Just(MessageFormat::Data), Just(MessageFormat::HandleExchange)]
    }

    proptest! {
        #[test]
        fn prop_header_round_trip(format in any_format(), size in any::<u32>(), seq in any::<u16>()) {
            let header = CommonHeader::new(format, size, seq);
            let decoded = CommonHeader::deserialize(&header.serialize());
            prop_assert_eq!(decoded, header);
            prop_assert_eq!(decoded.validate(seq), Ok(format));
        }

        #[test]
        fn prop_raw_header_round_trip(bytes in any::<[u8; COMMON_HEADER_SIZE]>()) {
            let header = CommonHeader::deserialize(&bytes);
            prop_assert_eq!(header.serialize(), bytes);
        }

        #[test]
        fn prop_any_single_bit_flip_fails(
            format in any_format(),
            size in any::<u32>(),
            seq in any::<u16>(),
            bit in 0usize..80,
        ) {
            let mut bytes = CommonHeader::new(format, size, seq).serialize();
            bytes[bit / 8] ^= 1 << (bit % 8);
            prop_assert!(CommonHeader::deserialize(&bytes).validate(seq).is_err());
        }
    }
}
