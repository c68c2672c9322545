pub mod recommend;
pub mod store;
#[cfg(any(test, feature = "test-utils"))]
pub mod testutil;

pub use store::GraphStore;
