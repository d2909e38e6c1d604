//! Per-operation context: cancellation, correlation and span attributes.
//!
//! An [`OpContext`] is threaded through every call that may suspend. It
//! replaces global tracer state: the correlation id and attributes travel
//! with the cancellation token and are turned into a `tracing` span on
//! demand.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info_span, Span};
use uuid::Uuid;

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct OpContext {
    token: CancellationToken,
    correlation_id: Uuid,
    attributes: Vec<(&'static str, String)>,
}

impl OpContext {
    /// Root context driven by `token`, with a fresh correlation id.
    pub fn new(token: CancellationToken) -> Self {
        Self {
            token,
            correlation_id: Uuid::new_v4(),
            attributes: Vec::new(),
        }
    }

    /// Root context that is only cancelled explicitly.
    pub fn background() -> Self {
        Self::new(CancellationToken::new())
    }

    /// Child context: cancelled with its parent, same correlation id.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            correlation_id: self.correlation_id,
            attributes: self.attributes.clone(),
        }
    }

    /// Child context for a new logical operation, with its own correlation id.
    pub fn operation(&self) -> Self {
        Self {
            correlation_id: Uuid::new_v4(),
            ..self.child()
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    pub fn with_attribute(mut self, key: &'static str, value: impl fmt::Display) -> Self {
        self.attributes.push((key, value.to_string()));
        self
    }

    pub fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }

    pub fn attributes(&self) -> &[(&'static str, String)] {
        &self.attributes
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Span carrying the correlation id and attributes of this context.
    pub fn span(&self, name: &'static str) -> Span {
        info_span!(
            "op",
            op = name,
            correlation_id = %self.correlation_id,
            attrs = %Attributes(&self.attributes),
        )
    }

    /// Drive `fut` until it completes, `timeout` elapses or the context is
    /// cancelled. A missed deadline is `Retryable`; cancellation is `Cancelled`.
    pub async fn run<F, T>(&self, timeout: Option<Duration>, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let deadline = async {
            match timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(Error::Cancelled),
            _ = deadline => Err(Error::Retryable(format!(
                "deadline of {:?} exceeded",
                timeout.unwrap_or_default()
            ))),
            result = fut => result,
        }
    }
}

struct Attributes<'a>(&'a [(&'static str, String)]);

impl fmt::Display for Attributes<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (key, value)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{key}={value}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_inherits_correlation_and_cancellation() {
        let root = OpContext::background().with_attribute("pod", "a/p1");
        let child = root.child();
        assert_eq!(child.correlation_id(), root.correlation_id());
        assert_eq!(child.attributes(), root.attributes());

        root.cancel();
        assert!(child.is_cancelled());
    }

    #[test]
    fn test_operation_gets_new_correlation_id() {
        let root = OpContext::background();
        let op = root.operation();
        assert_ne!(op.correlation_id(), root.correlation_id());

        op.cancel();
        assert!(!root.is_cancelled());
    }

    #[test]
    fn test_attributes_display() {
        let attrs = vec![("pod", "a/p1".to_string()), ("uid", "U1".to_string())];
        assert_eq!(Attributes(&attrs).to_string(), "pod=a/p1 uid=U1");
    }

    #[tokio::test]
    async fn test_run_completes() {
        let ctx = OpContext::background();
        let value = ctx.run(None, async { Ok(7) }).await.unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_run_cancelled() {
        let ctx = OpContext::background();
        ctx.cancel();
        let result: Result<()> = ctx.run(None, std::future::pending()).await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_deadline() {
        let ctx = OpContext::background();
        let result: Result<()> = ctx
            .run(Some(Duration::from_millis(50)), std::future::pending())
            .await;
        assert!(matches!(result, Err(Error::Retryable(_))));
    }
}
