//! Success/failure envelope delivered by fallible bindings.

use serde::{Deserialize, Serialize};

/// Tagged outcome of one executor call.
///
/// Serializes as `{"status": "success", "value": ...}` or
/// `{"status": "failure", "error": ...}` so a consumer can branch on the tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Envelope<T, E> {
    Success { value: T },
    Failure { error: E },
}

impl<T, E> Envelope<T, E> {
    pub fn success(value: T) -> Self {
        Envelope::Success { value }
    }

    pub fn failure(error: E) -> Self {
        Envelope::Failure { error }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Envelope::Success { .. })
    }

    pub fn into_result(self) -> Result<T, E> {
        match self {
            Envelope::Success { value } => Ok(value),
            Envelope::Failure { error } => Err(error),
        }
    }
}

impl<T, E> From<Result<T, E>> for Envelope<T, E> {
    fn from(result: Result<T, E>) -> Self {
        match result {
            Ok(value) => Envelope::Success { value },
            Err(error) => Envelope::Failure { error },
        }
    }
}
