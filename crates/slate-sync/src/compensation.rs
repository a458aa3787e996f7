//! Compensating writes
//!
//! The backend has no multi-row transactions. A domain mutation that makes
//! several writes runs them through a [`WriteChain`], registering how to
//! take back each write once it lands. When a later write fails the
//! registered undos run newest first before the error is returned, so the
//! server ends where it started and a retry is safe.

use futures::future::{BoxFuture, FutureExt};
use slate_core::{SlateError, SlateResult};
use std::fmt;
use std::future::Future;
use tracing::{debug, error};

/// Ordered backend writes of one mutation
pub struct WriteChain<'a> {
    mutation: &'static str,
    landed: Vec<(&'static str, BoxFuture<'a, SlateResult<()>>)>,
}

impl<'a> WriteChain<'a> {
    /// Empty chain for `mutation`
    #[must_use]
    pub fn new(mutation: &'static str) -> Self {
        Self {
            mutation,
            landed: Vec::new(),
        }
    }

    /// Await `write`
    ///
    /// # Errors
    /// The write's own error, returned after every landed write has been
    /// taken back
    pub async fn write<T>(&mut self, write: impl Future<Output = SlateResult<T>>) -> SlateResult<T> {
        match write.await {
            Ok(value) => Ok(value),
            Err(cause) => {
                self.unwind(&cause).await;
                Err(cause)
            }
        }
    }

    /// Register `undo` as the way to take back the write that just landed
    pub fn landed<U>(&mut self, step: &'static str, undo: impl Future<Output = SlateResult<U>> + Send + 'a)
    where
        U: 'a,
    {
        self.landed.push((step, undo.map(|result| result.map(drop)).boxed()));
    }

    /// Writes that would be taken back by a failure now
    #[must_use]
    pub fn len(&self) -> usize {
        self.landed.len()
    }

    /// Whether nothing would be taken back
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.landed.is_empty()
    }

    async fn unwind(&mut self, cause: &SlateError) {
        while let Some((step, undo)) = self.landed.pop() {
            match undo.await {
                Ok(()) => debug!(mutation = self.mutation, step, "write taken back"),
                // Nothing left to try; the closing refetch shows the server's state
                Err(error) => error!(
                    mutation = self.mutation,
                    step,
                    %cause,
                    %error,
                    "could not take back write, server left partially updated"
                ),
            }
        }
    }
}

impl fmt::Debug for WriteChain<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let steps: Vec<&str> = self.landed.iter().map(|(step, _)| *step).collect();
        f.debug_struct("WriteChain")
            .field("mutation", &self.mutation)
            .field("landed", &steps)
            .finish()
    }
}
