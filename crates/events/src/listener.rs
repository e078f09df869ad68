//! Commit-time ingress (mechanics only).
//!
//! A `CommitListener` is the single hand-off point between the write path and
//! anything that maintains derived state. The write path invokes it exactly
//! once per committed mutation, strictly after the commit, and never for a
//! rolled-back one.
//!
//! Implementations must return quickly. They may push back (e.g. a bounded
//! queue is full); the error hands the decision about retrying back to the
//! caller, which must not treat it as permission to forget the event.

use std::sync::Arc;

use async_trait::async_trait;

#[async_trait]
pub trait CommitListener<M>: Send + Sync
where
    M: Send + 'static,
{
    type Error: core::fmt::Debug + core::fmt::Display + Send + Sync + 'static;

    async fn on_commit(&self, message: M) -> Result<(), Self::Error>;
}

#[async_trait]
impl<M, L> CommitListener<M> for Arc<L>
where
    M: Send + 'static,
    L: CommitListener<M> + ?Sized,
{
    type Error = L::Error;

    async fn on_commit(&self, message: M) -> Result<(), Self::Error> {
        (**self).on_commit(message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<u32>>,
    }

    #[async_trait]
    impl CommitListener<u32> for Recorder {
        type Error = std::io::Error;

        async fn on_commit(&self, message: u32) -> Result<(), Self::Error> {
            self.seen.lock().unwrap().push(message);
            Ok(())
        }
    }

    #[tokio::test]
    async fn arc_forwards_to_inner_listener() {
        let inner = Arc::new(Recorder::default());
        let listener: Arc<Recorder> = inner.clone();

        listener.on_commit(1).await.unwrap();
        listener.on_commit(2).await.unwrap();

        assert_eq!(*inner.seen.lock().unwrap(), vec![1, 2]);
    }
}
