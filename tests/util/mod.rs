// Not every helper is used by every test binary.
#![allow(dead_code)]

use std::sync::Once;

/// Initializes the logger once per test binary, mirroring the upstream
/// pattern of giving `RUST_LOG=trace` a place to attach without every test
/// needing its own `env_logger::init()` call (and panicking on a second one).
pub fn init() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        env_logger::try_init().expect("unable to initialize logger");
    });
}
