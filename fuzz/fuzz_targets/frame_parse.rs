//! Fuzz target for Modbus RTU response parsing
//!
//! Responses come off the wire from third-party controller boards, so
//! malformed frames must never panic the control stack: truncated
//! frames, mangled CRCs, bogus function and exception codes.

#![no_main]

use libfuzzer_sys::fuzz_target;

use fanwall::{crc16, parse_response, CommandError};

fuzz_target!(|data: &[u8]| {
    // Arbitrary bytes must always classify, never panic.
    match parse_response(data) {
        Ok(frame) => {
            // A frame that validated must carry a matching CRC and a
            // non-exception function code.
            let received =
                u16::from(data[data.len() - 2]) | (u16::from(data[data.len() - 1]) << 8);
            assert_eq!(crc16(&data[..data.len() - 2]), received);
            assert_eq!(frame.func_code & 0x80, 0);
        }
        Err(CommandError::FrameTooShort { len }) => assert!(len < 5),
        Err(CommandError::CrcMismatch { .. }) | Err(CommandError::Exception(_)) => {}
        Err(other) => panic!("unexpected error kind from parser: {other:?}"),
    }

    // CRC computation itself must accept any input.
    let _ = crc16(data);
});
