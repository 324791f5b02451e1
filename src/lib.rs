pub mod cli;
pub mod core;
pub mod interfaces;
pub mod logging;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
