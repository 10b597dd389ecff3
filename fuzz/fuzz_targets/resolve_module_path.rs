#![no_main]

use libfuzzer_sys::fuzz_target;
use tether_native::{resolve_relative, validate_module_file_name, virtual_dirname};

fuzz_target!(|data: &[u8]| {
    let raw = String::from_utf8_lossy(data);
    let (base, relative) = raw.split_once('\n').unwrap_or((".", &raw));

    let resolved = resolve_relative(base, relative);
    assert!(!resolved.is_empty());
    assert!(resolved.split('/').all(|part| part != ".."));
    assert!(!resolved.starts_with('/'));
    let _ = virtual_dirname(&resolved);

    if validate_module_file_name(relative).is_ok() {
        assert!(!relative.contains('/'));
        assert!(!relative.contains('\\'));
        assert!(!relative.contains(".."));
    }
});
