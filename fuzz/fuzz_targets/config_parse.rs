#![no_main]

use binship_config::Project;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(src) = std::str::from_utf8(data) else {
        return;
    };
    if let Ok(mut project) = Project::from_toml_str(src) {
        project.fill_defaults(std::path::Path::new("/fuzz/project"));
        let _ = project.validate();
        for build in &project.builds {
            let _ = build.platforms();
        }
    }
});
