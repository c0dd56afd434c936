//! Shared utilities for coherence-engine integration tests
#![allow(dead_code)]

pub mod fixtures;
pub mod log_capture;
pub mod mock_source;

pub use fixtures::{base_time, data_point, filtered_point, normal_scores, rich_item, test_config};
pub use log_capture::{init_test_logging, LogCapture};
pub use mock_source::spawn_source;
