// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

pub mod recording;
pub mod scripted_resolver;

/// Route `log` output of the crates under test through the test harness.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}
