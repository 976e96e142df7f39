use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, Instrument};

/// Spawn a task that dies with the given token. Errors are logged, not
/// propagated; anything that must outlive an error reports through alerts.
pub fn spawn_with_cancel(
    span: tracing::Span,
    token: CancellationToken,
    fut: impl std::future::Future<Output = crate::Result<()>> + Send + 'static,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(
        async move {
            tokio::select! {
                _ = token.cancelled() => {
                    trace!("task cancelled");
                }
                res = fut => match res {
                    Ok(()) => trace!("task finished"),
                    Err(e) => debug!("task finished with error: {e:#}"),
                },
            }
        }
        .instrument(span),
    )
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct BlockingSpawner {
    allow_tokio_block_in_place: bool,
}

impl BlockingSpawner {
    pub fn new(allow_tokio_block_in_place: bool) -> Self {
        Self {
            allow_tokio_block_in_place,
        }
    }

    pub fn spawn_block_in_place<F: FnOnce() -> R, R>(&self, f: F) -> R {
        if self.allow_tokio_block_in_place {
            return tokio::task::block_in_place(f);
        }
        f()
    }
}

impl Default for BlockingSpawner {
    fn default() -> Self {
        let allow_block_in_place = !matches!(
            tokio::runtime::Handle::current().runtime_flavor(),
            tokio::runtime::RuntimeFlavor::CurrentThread
        );
        Self::new(allow_block_in_place)
    }
}
