//! Runs a [`StreamingWriter`] on a blocking worker so async producers can
//! feed it without stalling the runtime.

use bytes::Bytes;
use tokio::{
    runtime::Handle,
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{
    backend::Backend,
    error::{Result, WriterError},
    writer::{SessionSummary, StreamingWriter},
};

enum FrameCmd {
    Data(Bytes),
    Finish(oneshot::Sender<Result<SessionSummary>>),
}

pub struct WriterTask {
    cancel: CancellationToken,
    sender: mpsc::Sender<FrameCmd>,
    handle: JoinHandle<Result<()>>,
    frame_len: Option<usize>,
}

impl WriterTask {
    /// Moves an opened writer onto a blocking worker. At most `queue_bound`
    /// frames wait in front of the encoder. Must be called from inside a
    /// tokio runtime.
    pub fn start<B>(writer: StreamingWriter<B>, queue_bound: usize) -> Self
    where
        B: Backend + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let (sender, receiver) = mpsc::channel(queue_bound.max(1));
        let frame_len = writer.frame_len();

        let runtime = Handle::current();
        let worker_cancel = cancel.clone();
        let handle = tokio::task::spawn_blocking(move || {
            Self::worker_loop(writer, runtime, worker_cancel, receiver)
        });

        Self {
            cancel,
            sender,
            handle,
            frame_len,
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Queues one raw frame, waiting while the queue is full.
    ///
    /// Fails with a protocol error once the worker has stopped; `finish`
    /// then reports why it stopped.
    pub async fn send(&self, frame: Bytes) -> Result<()> {
        if let Some(len) = self.frame_len {
            if frame.len() != len {
                return Err(WriterError::config(format!(
                    "frame has {} bytes, expected {}",
                    frame.len(),
                    len
                )));
            }
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(WriterError::Cancelled),
            res = self.sender.send(FrameCmd::Data(frame)) => {
                res.map_err(|_| WriterError::protocol("writer task is no longer running"))
            }
        }
    }

    /// Waits for every queued frame, then finishes the session.
    pub async fn finish(self) -> Result<SessionSummary> {
        let (reply, summary) = oneshot::channel();
        let queued = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            res = self.sender.send(FrameCmd::Finish(reply)) => res.is_ok(),
        };
        let summary = if queued { summary.await.ok() } else { None };

        let worker = self
            .handle
            .await
            .map_err(|e| WriterError::encode(format!("writer task failed: {}", e)))?;
        match summary {
            Some(result) => result,
            None => {
                worker?;
                Err(WriterError::protocol("writer task ended without finishing"))
            }
        }
    }

    fn worker_loop<B: Backend>(
        mut writer: StreamingWriter<B>,
        runtime: Handle,
        cancel: CancellationToken,
        mut receiver: mpsc::Receiver<FrameCmd>,
    ) -> Result<()> {
        loop {
            let cmd = runtime.block_on(async {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    cmd = receiver.recv() => cmd,
                }
            });
            match cmd {
                Some(FrameCmd::Data(frame)) => {
                    if let Err(e) = writer.process_frame(&frame) {
                        log::error!(
                            "writer task stopped at frame {}: {}",
                            writer.next_pts(),
                            e
                        );
                        return Err(e);
                    }
                }
                Some(FrameCmd::Finish(reply)) => {
                    let _ = reply.send(writer.finish());
                    return Ok(());
                }
                None => {
                    log::warn!("writer task cancelled after {} frames", writer.next_pts());
                    return Err(WriterError::Cancelled);
                }
            }
        }
    }
}
