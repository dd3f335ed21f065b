//! Modbus RTU frame encoding and validation
//!
//! The fan boards speak Modbus RTU framing tunneled through a raw TCP
//! stream (no MBAP header). Every request and response is
//! `[slave_addr, func_code, payload..., crc_lo, crc_hi]` with the CRC
//! computed over everything before the two CRC bytes.
//!
//! All functions here are pure; socket handling lives in
//! [`crate::board`].

use crate::error::{CommandError, ExceptionCode};

/// Function code 0x06: write single register
pub const FUNC_WRITE_SINGLE: u8 = 0x06;
/// Function code 0x10: write multiple registers
pub const FUNC_WRITE_MULTIPLE: u8 = 0x10;
/// High bit of the function code marks an exception response
pub const EXCEPTION_FLAG: u8 = 0x80;

/// Fixed length of a successful write response. Both the single-register
/// (0x06) and multiple-register (0x10) success responses are 8 bytes on
/// the wire: `[addr, func, reg_hi, reg_lo, val/count_hi, val/count_lo,
/// crc_lo, crc_hi]`.
pub const WRITE_RESPONSE_LEN: usize = 8;

/// Shortest parseable frame: exception response
/// `[addr, func|0x80, code, crc_lo, crc_hi]`.
pub const MIN_RESPONSE_LEN: usize = 5;

/// Protocol limit on registers per write-multiple request (0x7B)
pub const MAX_WRITE_REGISTERS: usize = 123;

/// Modbus CRC-16 (polynomial 0xA001, init 0xFFFF).
///
/// The result is appended to frames low byte first; use [`crc16_bytes`]
/// when building wire data.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= u16::from(byte);
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

/// CRC-16 in wire order: `[low_byte, high_byte]`
pub fn crc16_bytes(data: &[u8]) -> [u8; 2] {
    let crc = crc16(data);
    [(crc & 0xFF) as u8, (crc >> 8) as u8]
}

/// Build a write-single-register request:
/// `[slave, 0x06, reg_hi, reg_lo, val_hi, val_lo, crc_lo, crc_hi]`.
///
/// Register address and value are `u16` by construction, so the 16-bit
/// range invariant holds without runtime checks; PWM values are clamped
/// by the caller before they reach this layer.
pub fn build_write_single(slave_addr: u8, register_addr: u16, value: u16) -> Vec<u8> {
    let mut frame = Vec::with_capacity(WRITE_RESPONSE_LEN);
    frame.push(slave_addr);
    frame.push(FUNC_WRITE_SINGLE);
    frame.extend_from_slice(&register_addr.to_be_bytes());
    frame.extend_from_slice(&value.to_be_bytes());
    frame.extend_from_slice(&crc16_bytes(&frame));
    frame
}

/// Build a write-multiple-registers request:
/// `[slave, 0x10, start_hi, start_lo, count_hi, count_lo, byte_count,
/// v0_hi, v0_lo, ..., crc_lo, crc_hi]` with `byte_count = 2 * count`.
///
/// `values` must hold at most [`MAX_WRITE_REGISTERS`] entries; board
/// configuration validation enforces this before any frame is built.
pub fn build_write_multiple(slave_addr: u8, start_addr: u16, values: &[u16]) -> Vec<u8> {
    debug_assert!(values.len() <= MAX_WRITE_REGISTERS);

    let count = values.len() as u16;
    let mut frame = Vec::with_capacity(9 + values.len() * 2);
    frame.push(slave_addr);
    frame.push(FUNC_WRITE_MULTIPLE);
    frame.extend_from_slice(&start_addr.to_be_bytes());
    frame.extend_from_slice(&count.to_be_bytes());
    frame.push((values.len() * 2) as u8);
    for value in values {
        frame.extend_from_slice(&value.to_be_bytes());
    }
    frame.extend_from_slice(&crc16_bytes(&frame));
    frame
}

/// Header of a validated, non-exception response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseFrame {
    pub slave_addr: u8,
    pub func_code: u8,
}

/// Validate and classify a raw response frame.
///
/// Checks length, recomputes the CRC over everything before the two
/// trailing CRC bytes, then detects exception responses via the 0x80
/// function-code bit.
pub fn parse_response(raw: &[u8]) -> Result<ResponseFrame, CommandError> {
    if raw.len() < MIN_RESPONSE_LEN {
        return Err(CommandError::FrameTooShort { len: raw.len() });
    }

    let (payload, crc) = raw.split_at(raw.len() - 2);
    let received = u16::from(crc[0]) | (u16::from(crc[1]) << 8);
    let expected = crc16(payload);
    if received != expected {
        return Err(CommandError::CrcMismatch { expected, received });
    }

    let slave_addr = raw[0];
    let func_code = raw[1];
    if func_code & EXCEPTION_FLAG != 0 {
        return Err(CommandError::Exception(ExceptionCode::from_byte(raw[2])));
    }

    Ok(ResponseFrame {
        slave_addr,
        func_code,
    })
}

/// Whether the accumulated receive buffer holds a complete response.
///
/// A success response is exactly [`WRITE_RESPONSE_LEN`] bytes. An
/// exception response is only 5 bytes, so the receive loop also stops
/// once a complete exception frame is buffered instead of waiting for
/// the timeout.
pub(crate) fn response_complete(buf: &[u8]) -> bool {
    if buf.len() >= WRITE_RESPONSE_LEN {
        return true;
    }
    buf.len() >= MIN_RESPONSE_LEN && buf[1] & EXCEPTION_FLAG != 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc16_known_vector() {
        // Historically verified CRC for `01 06 00 00 00 64` is `88 21`.
        let data = [0x01, 0x06, 0x00, 0x00, 0x00, 0x64];
        assert_eq!(crc16_bytes(&data), [0x88, 0x21]);
    }

    #[test]
    fn test_crc16_deterministic() {
        let data = [0x01, 0x10, 0x00, 0x00, 0x00, 0x10, 0x20, 0xAB, 0xCD];
        assert_eq!(crc16(&data), crc16(&data));
        assert_eq!(crc16_bytes(&data), crc16_bytes(&data));
    }

    #[test]
    fn test_build_write_single_layout() {
        let frame = build_write_single(0x01, 0x0000, 100);
        assert_eq!(frame, vec![0x01, 0x06, 0x00, 0x00, 0x00, 0x64, 0x88, 0x21]);
    }

    #[test]
    fn test_write_single_round_trip() {
        // A board echoes a successful single-register write verbatim, so
        // a built request must parse as a valid response.
        for (register, value) in [
            (0u16, 0u16),
            (0x0005, 1000),
            (0x00FF, 0x1234),
            (0xFFFF, 0xFFFF),
        ] {
            let frame = build_write_single(0x01, register, value);
            let parsed = parse_response(&frame).expect("echoed frame must be valid");
            assert_eq!(parsed.slave_addr, 0x01);
            assert_eq!(parsed.func_code, FUNC_WRITE_SINGLE);
        }
    }

    #[test]
    fn test_single_bit_tamper_detected_at_every_payload_position() {
        let frame = build_write_single(0x01, 0x0005, 0x03E8);
        let payload_len = frame.len() - 2;

        for byte_idx in 0..payload_len {
            for bit in 0..8 {
                let mut tampered = frame.clone();
                tampered[byte_idx] ^= 1 << bit;
                match parse_response(&tampered) {
                    Err(CommandError::CrcMismatch { .. }) => {}
                    other => panic!(
                        "bit {bit} of byte {byte_idx}: expected CRC mismatch, got {other:?}"
                    ),
                }
            }
        }
    }

    #[test]
    fn test_build_write_multiple_layout() {
        let values = [0u16, 500, 1000];
        let frame = build_write_multiple(0x02, 0x0010, &values);

        assert_eq!(frame.len(), 9 + values.len() * 2);
        assert_eq!(frame[0], 0x02);
        assert_eq!(frame[1], FUNC_WRITE_MULTIPLE);
        assert_eq!(&frame[2..4], &[0x00, 0x10]); // start address
        assert_eq!(&frame[4..6], &[0x00, 0x03]); // register count
        assert_eq!(frame[6], 6); // byte count = 2 * count
        assert_eq!(&frame[7..9], &[0x00, 0x00]);
        assert_eq!(&frame[9..11], &[0x01, 0xF4]);
        assert_eq!(&frame[11..13], &[0x03, 0xE8]);

        // Trailing CRC covers everything before it.
        let expected = crc16_bytes(&frame[..frame.len() - 2]);
        assert_eq!(&frame[frame.len() - 2..], &expected);
    }

    #[test]
    fn test_write_multiple_sixteen_fans_byte_count() {
        let values = vec![750u16; 16];
        let frame = build_write_multiple(0x01, 0, &values);
        assert_eq!(frame[6], 32);
        assert_eq!(frame.len(), 9 + 32);
    }

    #[test]
    fn test_parse_rejects_short_frames() {
        for len in 0..MIN_RESPONSE_LEN {
            let raw = vec![0x01; len];
            assert_eq!(
                parse_response(&raw),
                Err(CommandError::FrameTooShort { len })
            );
        }
    }

    #[test]
    fn test_parse_exception_responses() {
        let cases = [
            (0x01u8, ExceptionCode::IllegalFunction),
            (0x02, ExceptionCode::IllegalAddress),
            (0x03, ExceptionCode::IllegalValue),
            (0x04, ExceptionCode::SlaveFailure),
            (0x11, ExceptionCode::Unknown(0x11)),
        ];
        for (code, expected) in cases {
            let mut frame = vec![0x01, FUNC_WRITE_SINGLE | EXCEPTION_FLAG, code];
            frame.extend_from_slice(&crc16_bytes(&frame));
            assert_eq!(
                parse_response(&frame),
                Err(CommandError::Exception(expected))
            );
        }
    }

    #[test]
    fn test_exception_with_bad_crc_reports_crc_first() {
        // CRC validation runs before exception classification; a mangled
        // exception frame is a transport problem, not a device report.
        let mut frame = vec![0x01, FUNC_WRITE_SINGLE | EXCEPTION_FLAG, 0x02];
        frame.extend_from_slice(&crc16_bytes(&frame));
        frame[2] ^= 0xFF;
        assert!(matches!(
            parse_response(&frame),
            Err(CommandError::CrcMismatch { .. })
        ));
    }

    #[test]
    fn test_response_complete_heuristics() {
        let success = build_write_single(0x01, 0, 100);
        assert!(!response_complete(&success[..7]));
        assert!(response_complete(&success));

        let mut exception = vec![0x01, FUNC_WRITE_SINGLE | EXCEPTION_FLAG, 0x02];
        exception.extend_from_slice(&crc16_bytes(&exception));
        assert_eq!(exception.len(), MIN_RESPONSE_LEN);
        assert!(!response_complete(&exception[..4]));
        assert!(response_complete(&exception));
    }
}
