//! Spawning abstraction for the background re-evaluation worker.

use std::future::Future;

/// Something that can run a detached future to completion.
pub trait Executor {
    /// Run `future` in the background.
    fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static;
}

/// Tokio-backed executor.
#[cfg(any(feature = "tokio", test))]
pub mod tokio {
    use std::future::Future;

    use tokio::runtime::Handle;

    use super::Executor;

    /// Spawns onto a tokio runtime through its handle.
    #[derive(Debug, Clone)]
    pub struct TokioExecutor {
        handle: Handle,
    }

    impl TokioExecutor {
        /// Executor for the runtime behind `handle`.
        pub fn new(handle: Handle) -> Self {
            Self { handle }
        }

        /// Executor for the runtime the caller is running on.
        ///
        /// # Panics
        ///
        /// Panics when called outside a tokio runtime.
        pub fn current() -> Self {
            Self::new(Handle::current())
        }
    }

    impl Executor for TokioExecutor {
        fn spawn<F>(&self, future: F)
        where
            F: Future<Output = ()> + Send + 'static,
        {
            self.handle.spawn(future);
        }
    }

}
