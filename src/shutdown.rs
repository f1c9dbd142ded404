use std::time::Duration;

use crate::error::ShutdownError;

/// A component that can be shut down gracefully at process exit.
///
/// Process-wide shutdown registries hold their components as
/// `Box<dyn Shutdown>` and call each in turn.
pub trait Shutdown: Send + Sync {
    /// Stop the component and wait for its work to finish, giving up after
    /// `timeout` if one is given.
    fn shutdown(&self, timeout: Option<Duration>) -> Result<(), ShutdownError>;
}
