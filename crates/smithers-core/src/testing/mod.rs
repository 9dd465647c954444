//! Testing utilities for deterministic loop tests.

pub mod collecting;
pub mod mock_executor;

pub use collecting::{CollectingSink, ScriptedApprover};
pub use mock_executor::{CallEvent, MockCall, MockExecutor};
