//! End-to-end tests for the shared channel and the native worker host.

#[cfg(all(test, not(target_arch = "wasm32")))]
mod native_e2e;
