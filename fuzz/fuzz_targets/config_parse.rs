//! Fuzz test for configuration file parsing
//!
//! Arbitrary TOML must parse or fail cleanly, and validation must never panic.

#![no_main]

use libfuzzer_sys::fuzz_target;
use rntbd_transport::ConnectionConfig;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        if let Ok(config) = ConnectionConfig::from_toml_str(s) {
            let _ = config.validate();
        }
    }
});
