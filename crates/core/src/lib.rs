pub mod distributed;
pub mod generation;
pub mod training;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;
