#![no_main]

use std::fs;

use libfuzzer_sys::fuzz_target;
use specq::scanner::scan;
use tempfile::tempdir;

fuzz_target!(|data: &[u8]| {
    let Ok(td) = tempdir() else { return };
    let change_dir = td.path().join("arbitrary-change");
    if fs::create_dir_all(&change_dir).is_err() {
        return;
    }
    if fs::write(change_dir.join("proposal.md"), data).is_err() {
        return;
    }
    let _ = scan(td.path());
});
