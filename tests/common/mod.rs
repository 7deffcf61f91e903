//! Shared test setup. Every integration test calls `init_logger` first so
//! `RUST_LOG=debug cargo test -- --nocapture` actually shows `log::` output
//! from the engine instead of silence.

use std::sync::Once;

static INIT: Once = Once::new();

pub fn init_logger() {
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}
