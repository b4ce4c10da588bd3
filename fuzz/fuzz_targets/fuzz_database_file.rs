//! Fuzz target: loading an instance database file.
//!
//! Arbitrary file contents must load or fail with an error; a corrupt
//! database never panics the reader.

#![no_main]

use std::time::Duration;

use cvd_instances::InstanceDatabase;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(dir) = tempfile::tempdir() else {
        return;
    };
    let path = dir.path().join("instance_database.json");
    if std::fs::write(&path, data).is_err() {
        return;
    }
    let db = InstanceDatabase::open(path, Duration::from_secs(1));
    let _ = db.instance_groups();
});
