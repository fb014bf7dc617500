//! Render coordination services.

pub mod correlation;
pub mod error;
pub mod mock_server;
pub mod module_mocks;
pub mod queue;
pub mod renderer;
pub mod rules;
pub mod sanitization;
