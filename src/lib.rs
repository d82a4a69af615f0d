// Export modules for use in tests
pub mod panic_handler;
pub mod pdf;
pub mod settings;
pub mod viewer;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

// Re-export the viewer entry points
pub use viewer::{LinkAction, TapOutcome, Viewer, ViewerConfig};
