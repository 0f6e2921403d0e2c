#![no_main]

use std::fs;

use binship_events::{EventLog, events_path};
use libfuzzer_sys::fuzz_target;
use tempfile::tempdir;

fuzz_target!(|data: &[u8]| {
    let Ok(td) = tempdir() else {
        return;
    };
    let path = events_path(td.path());
    if fs::write(&path, data).is_ok()
        && let Ok(log) = EventLog::read_from_file(&path)
    {
        let copy = td.path().join("copy.jsonl");
        if log.write_to_file(&copy).is_ok() {
            let reread = EventLog::read_from_file(&copy).expect("rewritten log parses");
            assert_eq!(reread.len(), log.len());
        }
    }
});
