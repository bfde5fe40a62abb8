pub mod logging;
pub mod lora;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;
