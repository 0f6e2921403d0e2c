#![no_main]

use binship::template::TemplateVars;
use binship_types::{Platform, VersionInfo};
use chrono::{DateTime, Utc};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(input) = std::str::from_utf8(data) else {
        return;
    };
    let version = VersionInfo::unknown(DateTime::<Utc>::UNIX_EPOCH);
    let vars = TemplateVars::for_release("fuzz", &version, true)
        .with_platform(&Platform::new("linux", "amd64"));

    let rendered = vars.render(input);
    if !input.contains("${") {
        assert_eq!(rendered, input);
    }
    // Strict rendering only fails on names `render` would have left alone.
    if vars.render_strict(input).is_ok() {
        assert!(vars.unknown_vars(input).is_empty());
    }
});
