#![no_main]

use std::fs;

use libfuzzer_sys::fuzz_target;
use specq::config::load_config_with_env;
use tempfile::tempdir;

fuzz_target!(|data: &[u8]| {
    let Ok(td) = tempdir() else { return };
    let dir = td.path().join(".specq");
    if fs::create_dir_all(&dir).is_err() {
        return;
    }
    if fs::write(dir.join("config.yaml"), data).is_err() {
        return;
    }
    let _ = load_config_with_env(td.path(), |_| None);
});
