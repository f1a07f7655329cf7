#![no_main]

use libfuzzer_sys::fuzz_target;
use shadowstack::config::ShadowConfig;

fuzz_target!(|data: &[u8]| {
    if let Ok(input) = std::str::from_utf8(data) {
        // Parsing and validation must reject bad input without panicking
        if let Ok(config) = ShadowConfig::from_toml_str(input) {
            let _ = config.validate();
            let _ = config.tag_table();
        }
    }
});
