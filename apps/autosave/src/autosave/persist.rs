use std::future::Future;

use async_trait::async_trait;

use crate::errors::AutosaveError;

/// The commit callback invoked by the scheduler once a key's quiet period ends.
///
/// Implementations patch the remote document. They own user-visible error
/// reporting; the scheduler only counts the failure and moves on.
#[async_trait]
pub trait Persist<V>: Send + Sync {
    async fn persist(&self, key: &str, value: V) -> Result<(), AutosaveError>;
}

#[async_trait]
impl<V, F, Fut> Persist<V> for F
where
    V: Send + 'static,
    F: Fn(String, V) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), AutosaveError>> + Send + 'static,
{
    async fn persist(&self, key: &str, value: V) -> Result<(), AutosaveError> {
        (self)(key.to_string(), value).await
    }
}
