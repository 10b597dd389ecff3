#![no_main]

use libfuzzer_sys::fuzz_target;
use tether_intercept::{transform_bundle, ActionLocator, UNPATCHED_PREFIX};

fuzz_target!(|data: &[u8]| {
    let code = String::from_utf8_lossy(data);
    let report = ActionLocator::default().locate_all(&code);
    for located in report.found.values() {
        assert!(!located.name.is_empty());
        assert!(code
            .get(located.offset..)
            .is_some_and(|rest| rest.starts_with(located.name.as_str())));
    }
    assert_eq!(report.found.len() + report.missing.len(), 2);

    let transform = transform_bundle(&code);
    if !transform.is_modified() {
        assert_eq!(transform.code, code);
    }
    if let Some(name) = &transform.patched_action {
        let renamed = format!("function {UNPATCHED_PREFIX}{name}");
        assert!(transform.code.contains(&renamed));
    }
});
