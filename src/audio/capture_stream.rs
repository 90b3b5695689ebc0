use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::Stream;
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::watch;

use super::capture::CaptureInfo;
use crate::process::OutputReader;

/// Raw PCM from one recorder, for exactly one consumer.
///
/// Bytes are read from the recorder's stdout only when the stream is polled,
/// so a slow consumer backs up into the pipe and the recorder blocks. The
/// stream ends on cancel, when the recorder exits, or on a read error.
/// Dropping it cancels the capture session.
pub struct CaptureStream {
    info: CaptureInfo,
    reader: OutputReader,
    buf: Vec<u8>,
    cancel: Arc<watch::Sender<bool>>,
    cancelled: watch::Receiver<bool>,
    done: bool,
}

impl CaptureStream {
    pub(crate) fn new(
        info: CaptureInfo,
        reader: OutputReader,
        chunk_size: usize,
        cancel: Arc<watch::Sender<bool>>,
    ) -> Self {
        let cancelled = cancel.subscribe();
        Self {
            info,
            reader,
            buf: vec![0; chunk_size.max(1)],
            cancel,
            cancelled,
            done: false,
        }
    }

    pub fn info(&self) -> &CaptureInfo {
        &self.info
    }

    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }
}

impl Stream for CaptureStream {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done || *this.cancelled.borrow() {
            this.done = true;
            return Poll::Ready(None);
        }

        let mut read_buf = ReadBuf::new(&mut this.buf);
        match Pin::new(&mut this.reader).poll_read(cx, &mut read_buf) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(())) if read_buf.filled().is_empty() => {
                this.done = true;
                Poll::Ready(None)
            }
            Poll::Ready(Ok(())) => Poll::Ready(Some(Ok(Bytes::copy_from_slice(read_buf.filled())))),
            Poll::Ready(Err(e)) => {
                this.done = true;
                Poll::Ready(Some(Err(e)))
            }
        }
    }
}

impl Drop for CaptureStream {
    fn drop(&mut self) {
        if !self.done {
            log::debug!("capture stream for {} dropped", self.info.device_id);
        }
        self.cancel.send_replace(true);
    }
}
