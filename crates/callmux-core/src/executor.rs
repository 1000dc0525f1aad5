//! The remote side of a binding.

use crate::error::Result;
use serde_json::Value;

/// Asynchronous backend that performs named operations.
///
/// Implementations must tolerate any number of concurrent `invoke` calls and
/// may complete them in any order. `receive_next` yields unsolicited messages
/// that are not correlated with any call; it is only awaited by one relay at a
/// time.
#[async_trait::async_trait]
pub trait Executor: Send + Sync + 'static {
    /// Run `operation` with `args` and return its result.
    async fn invoke(&self, operation: &str, args: Value) -> Result<Value>;

    /// Wait for the next unsolicited message.
    async fn receive_next(&self) -> Result<Value>;
}

