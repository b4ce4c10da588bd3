//! Fuzz target: device name splitting.

#![no_main]

use cvd_core::{break_device_name, is_valid_group_name, is_valid_instance_name};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(name) = std::str::from_utf8(data) else {
        return;
    };
    if let Ok(device) = break_device_name(name) {
        assert!(is_valid_group_name(&device.group));
        assert!(is_valid_instance_name(&device.instance));
        assert_eq!(device.to_string(), name);
    }
});
