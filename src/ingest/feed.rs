//! Background frame feed.
//!
//! Runs a [`FrameSource`] on its own thread and hands frames over a bounded
//! channel, so the tick loop can wait with a timeout and still react to a
//! stop request while the source is blocked on input.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::time::Duration;

use anyhow::Result;

use super::FrameSource;
use crate::frame::Frame;

#[derive(Debug)]
pub enum FeedPoll {
    Frame(Frame),
    /// Nothing arrived within the timeout.
    Idle,
    /// Source exhausted.
    Closed,
}

pub struct FrameFeed {
    rx: Receiver<Result<Frame>>,
}

impl FrameFeed {
    /// Opens the source on a reader thread. The thread is never joined: it
    /// may stay parked on a blocking read after the feed is dropped.
    pub fn spawn<S, F>(open: F, buffer: usize) -> Self
    where
        S: FrameSource,
        F: FnOnce() -> Result<S> + Send + 'static,
    {
        let (tx, rx) = mpsc::sync_channel(buffer.max(1));
        std::thread::spawn(move || {
            let result = open().and_then(|mut source| forward(&mut source, &tx));
            if let Err(err) = result {
                let _ = tx.send(Err(err));
            }
        });
        Self { rx }
    }

    /// Waits up to `timeout` for the next frame. Read errors are returned once;
    /// the feed is closed afterwards.
    pub fn poll(&self, timeout: Duration) -> Result<FeedPoll> {
        match self.rx.recv_timeout(timeout) {
            Ok(frame) => Ok(FeedPoll::Frame(frame?)),
            Err(RecvTimeoutError::Timeout) => Ok(FeedPoll::Idle),
            Err(RecvTimeoutError::Disconnected) => Ok(FeedPoll::Closed),
        }
    }
}

fn forward(source: &mut dyn FrameSource, tx: &SyncSender<Result<Frame>>) -> Result<()> {
    while let Some(frame) = source.next_frame()? {
        if tx.send(Ok(frame)).is_err() {
            break;
        }
    }
    Ok(())
}
