//! Bidirectional framed channel between a spawner and its runner child.
//!
//! Two anonymous OS pipes presented as one duplex channel with fixed end
//! roles: the left end reads progress events and writes control messages,
//! the right end is the mirror image. Committing to a role consumes the
//! pipe, so using the opposite role's operations on the same handle is
//! unrepresentable rather than a runtime failure.
//!
//! The two ends are meant to live in different processes. The right end
//! crosses the process boundary as a pair of inherited file descriptors
//! ([`DuplexPipe::inheritable_right_fds`] on the parent side,
//! [`RightEndpoint::from_inherited_fds`] in the child).

use std::io;
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd, RawFd};

use futures::{FutureExt, SinkExt, StreamExt};
use nix::fcntl::{FcntlArg, FdFlag, OFlag, fcntl};
use nix::unistd::pipe2;
use serde::{Serialize, de::DeserializeOwned};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::unix::pipe;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::{MessageCodec, ProtocolError};
use crate::bridge::protocol::{ControlMessage, ProgressEvent};

#[derive(Debug, thiserror::Error)]
pub enum PipeError {
    /// The other end of the pipe has exited. Writes are never retried; the
    /// channel is treated as closed.
    #[error("peer end of the pipe is gone")]
    PeerGone,

    #[error(transparent)]
    Protocol(ProtocolError),
}

impl From<ProtocolError> for PipeError {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::Io(io) if io.kind() == io::ErrorKind::BrokenPipe => Self::PeerGone,
            other => Self::Protocol(other),
        }
    }
}

/// Result of a non-blocking receive attempt. "Nothing yet" and "peer closed"
/// are distinct signals.
#[derive(Debug, PartialEq)]
pub enum Polled<T> {
    Pending,
    Received(T),
    Closed,
}

/// One committed end of a duplex pipe: framed reads of `In`, framed writes
/// of `Out`. Generic over the underlying IO so tests can drive the same
/// code over in-memory streams.
pub struct PipeEndpoint<In, Out, R = pipe::Receiver, W = pipe::Sender> {
    reader: FramedRead<R, MessageCodec<In>>,
    writer: FramedWrite<W, MessageCodec<Out>>,
}

/// Spawner-held end: progress events in, control messages out.
pub type LeftEndpoint = PipeEndpoint<ProgressEvent, ControlMessage>;

/// Runner-held end: control messages in, progress events out.
pub type RightEndpoint = PipeEndpoint<ControlMessage, ProgressEvent>;

impl<In, Out, R, W> PipeEndpoint<In, Out, R, W>
where
    In: DeserializeOwned,
    Out: Serialize,
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn from_parts(reader: R, writer: W) -> Self {
        Self {
            reader: FramedRead::new(reader, MessageCodec::new()),
            writer: FramedWrite::new(writer, MessageCodec::new()),
        }
    }

    /// Frame-encodes and writes one message. No backpressure handling beyond
    /// the OS pipe buffer; a peer that exited surfaces as [`PipeError::PeerGone`].
    pub async fn send(&mut self, message: Out) -> Result<(), PipeError> {
        self.writer.send(message).await.map_err(PipeError::from)
    }

    /// Waits for the next inbound message. `None` means the peer closed its
    /// writer — terminal, never transient.
    pub async fn recv(&mut self) -> Result<Option<In>, PipeError> {
        match self.reader.next().await {
            None => Ok(None),
            Some(Ok(message)) => Ok(Some(message)),
            Some(Err(e)) => Err(e.into()),
        }
    }

    /// Non-blocking receive for polls between training steps.
    pub fn try_recv(&mut self) -> Result<Polled<In>, PipeError> {
        match self.reader.next().now_or_never() {
            None => Ok(Polled::Pending),
            Some(None) => Ok(Polled::Closed),
            Some(Some(Ok(message))) => Ok(Polled::Received(message)),
            Some(Some(Err(e))) => Err(e.into()),
        }
    }
}

impl RightEndpoint {
    /// Rebuilds the runner's end from descriptors inherited across exec.
    pub fn from_inherited_fds(read_fd: RawFd, write_fd: RawFd) -> io::Result<Self> {
        // Safety: the parent created these descriptors for this process and
        // nothing else in this process owns them.
        let read = unsafe { OwnedFd::from_raw_fd(read_fd) };
        let write = unsafe { OwnedFd::from_raw_fd(write_fd) };
        Self::from_owned_fds(read, write)
    }

    pub fn from_owned_fds(read: OwnedFd, write: OwnedFd) -> io::Result<Self> {
        Ok(Self::from_parts(
            pipe::Receiver::from_owned_fd(read)?,
            pipe::Sender::from_owned_fd(write)?,
        ))
    }
}

impl LeftEndpoint {
    pub fn from_owned_fds(read: OwnedFd, write: OwnedFd) -> io::Result<Self> {
        Ok(Self::from_parts(
            pipe::Receiver::from_owned_fd(read)?,
            pipe::Sender::from_owned_fd(write)?,
        ))
    }
}

/// An uncommitted duplex pipe: two unidirectional OS pipes, channel A
/// (left → right) and channel B (right → left). Both pipes are created
/// close-on-exec; only the right pair is made inheritable, and only on
/// request.
pub struct DuplexPipe {
    left_read: OwnedFd,
    left_write: OwnedFd,
    right_read: OwnedFd,
    right_write: OwnedFd,
}

impl DuplexPipe {
    pub fn new() -> io::Result<Self> {
        let (a_read, a_write) = pipe2(OFlag::O_CLOEXEC)?;
        let (b_read, b_write) = pipe2(OFlag::O_CLOEXEC)?;
        Ok(Self {
            left_read: b_read,
            left_write: a_write,
            right_read: a_read,
            right_write: b_write,
        })
    }

    /// Commits this handle to the left role. The right-side descriptors are
    /// dropped here, so after a child inherited them this process no longer
    /// holds the copies that would keep end-of-stream from propagating.
    pub fn use_left(self) -> io::Result<LeftEndpoint> {
        LeftEndpoint::from_owned_fds(self.left_read, self.left_write)
    }

    /// Commits this handle to the right role, the mirror of [`Self::use_left`].
    pub fn use_right(self) -> io::Result<RightEndpoint> {
        RightEndpoint::from_owned_fds(self.right_read, self.right_write)
    }

    /// Clears close-on-exec on the right pair and returns the raw numbers
    /// for handing to a child process (via its environment).
    pub fn inheritable_right_fds(&self) -> io::Result<(RawFd, RawFd)> {
        clear_cloexec(&self.right_read)?;
        clear_cloexec(&self.right_write)?;
        Ok((self.right_read.as_raw_fd(), self.right_write.as_raw_fd()))
    }

    /// Duplicates the right pair without giving up this handle. Lets a test
    /// hold both committed ends in one process.
    pub fn dup_right_fds(&self) -> io::Result<(OwnedFd, OwnedFd)> {
        Ok((self.right_read.try_clone()?, self.right_write.try_clone()?))
    }
}

fn clear_cloexec(fd: &impl AsFd) -> io::Result<()> {
    fcntl(fd.as_fd(), FcntlArg::F_SETFD(FdFlag::empty()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::RunStatus;

    fn committed_pair() -> (LeftEndpoint, RightEndpoint) {
        let pipe = DuplexPipe::new().unwrap();
        let (read, write) = pipe.dup_right_fds().unwrap();
        let right = RightEndpoint::from_owned_fds(read, write).unwrap();
        let left = pipe.use_left().unwrap();
        (left, right)
    }

    #[tokio::test]
    async fn committed_roles_pair_up() {
        let (mut left, mut right) = committed_pair();

        left.send(ControlMessage::Pause).await.unwrap();
        assert_eq!(right.recv().await.unwrap(), Some(ControlMessage::Pause));

        right.send(ProgressEvent::Loss(0.5)).await.unwrap();
        assert_eq!(left.recv().await.unwrap(), Some(ProgressEvent::Loss(0.5)));
    }

    #[tokio::test]
    async fn events_arrive_in_send_order() {
        let (mut left, mut right) = committed_pair();

        right.send(ProgressEvent::Loss(0.9)).await.unwrap();
        right.send(ProgressEvent::Epoch(1)).await.unwrap();
        right
            .send(ProgressEvent::Status(RunStatus::Done))
            .await
            .unwrap();

        assert_eq!(left.recv().await.unwrap(), Some(ProgressEvent::Loss(0.9)));
        assert_eq!(left.recv().await.unwrap(), Some(ProgressEvent::Epoch(1)));
        assert_eq!(
            left.recv().await.unwrap(),
            Some(ProgressEvent::Status(RunStatus::Done))
        );
    }

    /// Polls until the reactor has surfaced whatever the peer did. A fresh
    /// descriptor can report `Pending` for a poll or two before its first
    /// readiness edge is observed.
    async fn poll_until_settled(endpoint: &mut RightEndpoint) -> Polled<ControlMessage> {
        loop {
            match endpoint.try_recv().unwrap() {
                Polled::Pending => tokio::task::yield_now().await,
                other => return other,
            }
        }
    }

    #[tokio::test]
    async fn try_recv_distinguishes_pending_received_and_closed() {
        let (mut left, mut right) = committed_pair();

        assert_eq!(right.try_recv().unwrap(), Polled::Pending);

        left.send(ControlMessage::Terminate).await.unwrap();
        assert_eq!(
            poll_until_settled(&mut right).await,
            Polled::Received(ControlMessage::Terminate)
        );

        drop(left);
        assert_eq!(poll_until_settled(&mut right).await, Polled::Closed);
    }

    #[tokio::test]
    async fn recv_reports_end_of_stream_after_peer_drop() {
        let (left, mut right) = committed_pair();
        drop(left);

        assert_eq!(right.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn write_to_a_gone_peer_is_peer_gone() {
        let (left, mut right) = committed_pair();
        drop(left);

        let err = right
            .send(ProgressEvent::Status(RunStatus::Running))
            .await
            .unwrap_err();
        assert!(matches!(err, PipeError::PeerGone));
    }

    #[test]
    fn inheritable_fds_have_cloexec_cleared() {
        let pipe = DuplexPipe::new().unwrap();
        let (read_fd, write_fd) = pipe.inheritable_right_fds().unwrap();

        for fd in [read_fd, write_fd] {
            let borrowed = unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) };
            let flags = fcntl(borrowed, FcntlArg::F_GETFD).unwrap();
            assert_eq!(
                FdFlag::from_bits_truncate(flags) & FdFlag::FD_CLOEXEC,
                FdFlag::empty()
            );
        }
    }
}
