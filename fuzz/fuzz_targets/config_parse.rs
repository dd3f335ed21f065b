//! Fuzz target for wall configuration parsing
//!
//! Wall config files are operator-supplied; malformed YAML must fail
//! with an error, never a panic, and anything that parses must also
//! survive validation without panicking.

#![no_main]

use libfuzzer_sys::fuzz_target;

use fanwall::WallConfig;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        if let Ok(config) = serde_yaml::from_str::<WallConfig>(s) {
            // Validation classifies, it does not panic.
            let _ = config.validate();
            let _ = config.board_configs();
        }
    }
});
