//! Workflow engine: admission, execution with retry, failure notification.

pub mod builder;
pub mod retry;
pub mod workflow;

pub use builder::WorkflowBuilder;
pub use retry::RetryPolicy;
pub use workflow::{RunHandle, Workflow};
