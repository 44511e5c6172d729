//! Write stream with deferred task emission.
//!
//! Bytes go straight to the local file. The replication task exists only
//! after the terminal transition of {Writing -> Completed | Failed}: a
//! clean shutdown builds and dispatches it, a write error or an abandoned
//! stream never does.

use crate::dispatch::Dispatcher;
use crate::error::Result;
use crate::task::{Directive, OperationKind, Task, TaskPayload};
use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::fs::File;
use tokio::io::AsyncWrite;

type FinishFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

enum StreamState {
    Writing,
    /// Local file is closed; propagation dispatch in flight.
    Completing(FinishFuture),
    Completed,
    Failed,
}

/// `AsyncWrite` adapter returned by `SyncFs::create_write_stream`.
pub struct SyncWriteStream {
    file: File,
    path: PathBuf,
    dispatcher: Arc<Dispatcher>,
    directive: Option<Directive>,
    state: StreamState,
}

impl SyncWriteStream {
    pub(crate) fn new(
        file: File,
        path: PathBuf,
        dispatcher: Arc<Dispatcher>,
        directive: Option<Directive>,
    ) -> Self {
        Self {
            file,
            path,
            dispatcher,
            directive,
            state: StreamState::Writing,
        }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    fn finish_future(&self) -> Option<FinishFuture> {
        if matches!(self.directive, Some(Directive::Skip)) {
            return None;
        }
        let mut task = Task::new(
            OperationKind::StreamWrite,
            vec![self.path.clone()],
            TaskPayload::File(self.path.clone()),
        );
        if let Some(Directive::Override { op, description }) = self.directive.clone() {
            task.apply_override(op, description);
        }
        let dispatcher = Arc::clone(&self.dispatcher);
        Some(Box::pin(async move { dispatcher.dispatch(task).await }))
    }
}

impl AsyncWrite for SyncWriteStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let result = futures::ready!(Pin::new(&mut this.file).poll_write(cx, buf));
        if result.is_err() {
            this.state = StreamState::Failed;
        }
        Poll::Ready(result)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let result = futures::ready!(Pin::new(&mut this.file).poll_flush(cx));
        if result.is_err() {
            this.state = StreamState::Failed;
        }
        Poll::Ready(result)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            match &mut this.state {
                StreamState::Writing => {
                    match futures::ready!(Pin::new(&mut this.file).poll_shutdown(cx)) {
                        Ok(()) => match this.finish_future() {
                            Some(fut) => this.state = StreamState::Completing(fut),
                            None => {
                                this.state = StreamState::Completed;
                                return Poll::Ready(Ok(()));
                            }
                        },
                        Err(err) => {
                            this.state = StreamState::Failed;
                            return Poll::Ready(Err(err));
                        }
                    }
                }
                StreamState::Completing(fut) => {
                    let result = futures::ready!(fut.as_mut().poll(cx));
                    this.state = StreamState::Completed;
                    return Poll::Ready(
                        result.map_err(|e| io::Error::new(io::ErrorKind::Other, e)),
                    );
                }
                StreamState::Completed => return Poll::Ready(Ok(())),
                // After a write error the stream only closes the file;
                // no task is ever generated.
                StreamState::Failed => {
                    return Pin::new(&mut this.file).poll_shutdown(cx);
                }
            }
        }
    }
}
