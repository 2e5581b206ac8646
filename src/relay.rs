//! Bidirectional copying between two connections with half-close.
//!
//! Each direction is a poll-based state machine, and both are driven from a
//! single future, so back-pressure on one direction never stalls the other.
//! When one side reaches end-of-stream the opposite write half is shut down
//! and the other direction keeps flowing until it ends as well.
use core::{
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};
use std::io;

use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    select,
    time::{sleep, Instant},
};
use tracing::debug;

use crate::BUFFER_POOL;

/// Bytes moved by [`relay_bidirectional`].
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct RelayStats {
    /// Bytes read from `a` and written to `b`.
    pub a_to_b: u64,
    /// Bytes read from `b` and written to `a`.
    pub b_to_a: u64,
}

enum CopyState {
    Reading,
    Writing { pos: usize, len: usize },
    Flushing(usize),
    ShuttingDown,
    Done,
}

enum CopyPoll {
    Flushed(usize),
    Finished,
}

/// Drives one direction: read, write, flush, and at EOF shut down the writer.
fn poll_copy<R, W>(
    cx: &mut Context<'_>,
    reader: &mut R,
    writer: &mut W,
    buf: &mut [u8],
    state: &mut CopyState,
) -> Poll<io::Result<CopyPoll>>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    loop {
        match state {
            CopyState::Reading => {
                let mut read_buf = ReadBuf::new(buf);
                match Pin::new(&mut *reader).poll_read(cx, &mut read_buf) {
                    Poll::Ready(Ok(())) => {
                        let len = read_buf.filled().len();
                        *state = if len == 0 {
                            CopyState::ShuttingDown
                        } else {
                            CopyState::Writing { pos: 0, len }
                        };
                    }
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                    Poll::Pending => return Poll::Pending,
                }
            }
            CopyState::Writing { pos, len } => {
                match Pin::new(&mut *writer).poll_write(cx, &buf[*pos..*len]) {
                    Poll::Ready(Ok(0)) => return Poll::Ready(Err(io::ErrorKind::WriteZero.into())),
                    Poll::Ready(Ok(n)) => {
                        *pos += n;
                        if *pos >= *len {
                            *state = CopyState::Flushing(*len);
                        }
                    }
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                    Poll::Pending => return Poll::Pending,
                }
            }
            CopyState::Flushing(n) => {
                let n = *n;
                match Pin::new(&mut *writer).poll_flush(cx) {
                    Poll::Ready(Ok(())) => {
                        *state = CopyState::Reading;
                        return Poll::Ready(Ok(CopyPoll::Flushed(n)));
                    }
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                    Poll::Pending => return Poll::Pending,
                }
            }
            // A failed shutdown still ends the direction.
            CopyState::ShuttingDown => match Pin::new(&mut *writer).poll_shutdown(cx) {
                Poll::Ready(_) => {
                    *state = CopyState::Done;
                    return Poll::Ready(Ok(CopyPoll::Finished));
                }
                Poll::Pending => return Poll::Pending,
            },
            CopyState::Done => return Poll::Ready(Ok(CopyPoll::Finished)),
        }
    }
}

/// Copies `a` to `b` and `b` to `a` until both directions reached
/// end-of-stream, or nothing moved for `idle_timeout`.
///
/// Copy buffers are borrowed from the process-wide pool for the duration of
/// the call.
pub async fn relay_bidirectional<A, B>(
    a: A,
    b: B,
    idle_timeout: Duration,
) -> io::Result<RelayStats>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut a_r, mut a_w) = tokio::io::split(a);
    let (mut b_r, mut b_w) = tokio::io::split(b);

    let mut buf_ab = BUFFER_POOL.get();
    let mut buf_ba = BUFFER_POOL.get();
    let mut state_ab = CopyState::Reading;
    let mut state_ba = CopyState::Reading;
    let mut ab_done = false;
    let mut ba_done = false;
    let mut stats = RelayStats::default();

    let idle = sleep(idle_timeout);
    tokio::pin!(idle);

    loop {
        if ab_done && ba_done {
            debug!(a_to_b = stats.a_to_b, b_to_a = stats.b_to_a, "relay finished");
            return Ok(stats);
        }

        let both = core::future::poll_fn(|cx| {
            let mut any_ready = false;
            let mut activity = false;

            if !ab_done {
                match poll_copy(cx, &mut a_r, &mut b_w, &mut buf_ab, &mut state_ab) {
                    Poll::Ready(Ok(CopyPoll::Flushed(n))) => {
                        stats.a_to_b += n as u64;
                        activity = true;
                        any_ready = true;
                    }
                    Poll::Ready(Ok(CopyPoll::Finished)) => {
                        debug!("relay a -> b reached eof");
                        ab_done = true;
                        any_ready = true;
                    }
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                    Poll::Pending => {}
                }
            }

            if !ba_done {
                match poll_copy(cx, &mut b_r, &mut a_w, &mut buf_ba, &mut state_ba) {
                    Poll::Ready(Ok(CopyPoll::Flushed(n))) => {
                        stats.b_to_a += n as u64;
                        activity = true;
                        any_ready = true;
                    }
                    Poll::Ready(Ok(CopyPoll::Finished)) => {
                        debug!("relay b -> a reached eof");
                        ba_done = true;
                        any_ready = true;
                    }
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                    Poll::Pending => {}
                }
            }

            if any_ready {
                Poll::Ready(Ok(activity))
            } else {
                Poll::Pending
            }
        });

        let activity = select! {
            result = both => Some(result?),
            _ = &mut idle => None,
        };
        match activity {
            Some(true) => idle.as_mut().reset(Instant::now() + idle_timeout),
            Some(false) => {}
            None => {
                debug!(a_to_b = stats.a_to_b, b_to_a = stats.b_to_a, "relay idle timeout");
                return Ok(stats);
            }
        }
    }
}
