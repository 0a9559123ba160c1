use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::job::Job;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MiddlewareError {
    /// Drop the job without reporting an error. During fetch the lease is
    /// released and the fetch loop continues.
    #[error("job discarded by middleware")]
    Discard,
    #[error("{0}")]
    Halt(String),
}

/// State handed down a middleware chain. Middleware may rewrite the job.
#[derive(Debug)]
pub struct MiddlewareContext {
    pub job: Job,
    pub wid: Option<String>,
    pub now: DateTime<Utc>,
    completed: bool,
}

impl MiddlewareContext {
    pub fn new(job: Job, wid: Option<String>, now: DateTime<Utc>) -> Self {
        Self {
            job,
            wid,
            now,
            completed: false,
        }
    }

    /// Whether every middleware passed control down to the end of the chain.
    pub fn completed(&self) -> bool {
        self.completed
    }
}

#[async_trait]
pub trait Middleware: Send + Sync {
    /// Handles the job and calls `next.run(ctx)` to continue, or returns
    /// without doing so to stop the chain.
    async fn call(&self, ctx: &mut MiddlewareContext, next: Next<'_>) -> Result<(), MiddlewareError>;
}

/// The remainder of a chain.
pub struct Next<'a> {
    chain: &'a [Arc<dyn Middleware>],
}

impl<'a> Next<'a> {
    pub fn new(chain: &'a [Arc<dyn Middleware>]) -> Self {
        Self { chain }
    }

    pub async fn run(self, ctx: &mut MiddlewareContext) -> Result<(), MiddlewareError> {
        match self.chain.split_first() {
            Some((head, rest)) => head.call(ctx, Next { chain: rest }).await,
            None => {
                ctx.completed = true;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// Records the jid it sees, then continues.
    pub(crate) struct Recorder(pub Arc<Mutex<Vec<String>>>);

    #[async_trait]
    impl Middleware for Recorder {
        async fn call(
            &self,
            ctx: &mut MiddlewareContext,
            next: Next<'_>,
        ) -> Result<(), MiddlewareError> {
            self.0.lock().push(ctx.job.jid.clone());
            next.run(ctx).await
        }
    }

    /// Fails with the configured error for one jobtype.
    pub(crate) struct Reject {
        pub jobtype: &'static str,
        pub error: MiddlewareError,
    }

    #[async_trait]
    impl Middleware for Reject {
        async fn call(
            &self,
            ctx: &mut MiddlewareContext,
            next: Next<'_>,
        ) -> Result<(), MiddlewareError> {
            if ctx.job.jobtype == self.jobtype {
                return Err(self.error.clone());
            }
            next.run(ctx).await
        }
    }

    struct Tag;

    #[async_trait]
    impl Middleware for Tag {
        async fn call(
            &self,
            ctx: &mut MiddlewareContext,
            next: Next<'_>,
        ) -> Result<(), MiddlewareError> {
            ctx.job.queue = "tagged".to_string();
            next.run(ctx).await
        }
    }

    struct Swallow;

    #[async_trait]
    impl Middleware for Swallow {
        async fn call(
            &self,
            _ctx: &mut MiddlewareContext,
            _next: Next<'_>,
        ) -> Result<(), MiddlewareError> {
            Ok(())
        }
    }

    fn ctx(jobtype: &str) -> MiddlewareContext {
        MiddlewareContext::new(Job::new("abcdefgh", jobtype, vec![]), None, Utc::now())
    }

    #[tokio::test]
    async fn runs_in_order_and_completes() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let chain: Vec<Arc<dyn Middleware>> =
            vec![Arc::new(Recorder(seen.clone())), Arc::new(Tag)];
        let mut ctx = ctx("Email");
        Next::new(&chain).run(&mut ctx).await.unwrap();
        assert!(ctx.completed());
        assert_eq!(ctx.job.queue, "tagged");
        assert_eq!(seen.lock().as_slice(), ["abcdefgh".to_string()]);
    }

    #[tokio::test]
    async fn short_circuits() {
        let chain: Vec<Arc<dyn Middleware>> = vec![
            Arc::new(Reject {
                jobtype: "Bad",
                error: MiddlewareError::Halt("nope".to_string()),
            }),
            Arc::new(Tag),
        ];
        let mut bad = ctx("Bad");
        let err = Next::new(&chain).run(&mut bad).await.unwrap_err();
        assert_eq!(err, MiddlewareError::Halt("nope".to_string()));
        assert_eq!(bad.job.queue, "default");

        let swallow: Vec<Arc<dyn Middleware>> = vec![Arc::new(Swallow), Arc::new(Tag)];
        let mut good = ctx("Good");
        Next::new(&swallow).run(&mut good).await.unwrap();
        assert!(!good.completed());
    }

    #[tokio::test]
    async fn empty_chain_completes() {
        let mut ctx = ctx("Email");
        Next::new(&[]).run(&mut ctx).await.unwrap();
        assert!(ctx.completed());
    }
}
