#![no_main]

use ferrous_modular::controller::{compose_path, ControllerBuilder};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: (String, Vec<String>)| {
    let (root, paths) = data;
    let root = format!("/{}", root.trim_start_matches('/'));
    let mut controller = ControllerBuilder::<()>::new().root_path(root.clone());

    let mut declared = 0;
    for path in paths.iter().take(16) {
        match controller.get(path) {
            Ok(route) => {
                route.handler(|_| async { Ok(()) });
                declared += 1;
                assert!(compose_path(&root, path).starts_with('/'));
            }
            Err(_) => {}
        }
    }
    assert_eq!(controller.route_count(), declared);
});
