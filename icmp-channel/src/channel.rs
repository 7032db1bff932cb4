use std::io;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use echo_frame::{Role, SessionTag};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::socket::{OsSocket, PacketSocket};
use crate::{EndpointAddr, MAX_MESSAGE_SIZE};

/// A bidirectional packet channel carried in ICMPv6 echo messages.
///
/// Behaves like an unreliable datagram socket between one client and one
/// server sharing a session tag. All methods take `&self`; the outer
/// transport may receive from one task and send from another.
pub struct IcmpChannel {
    socket: Arc<dyn PacketSocket>,
    tag: SessionTag,
    role: Role,
    local: EndpointAddr,
    remote: EndpointAddr,

    read_deadline: Mutex<Option<Instant>>,
    write_deadline: Mutex<Option<Instant>>,

    shutdown: CancellationToken,
    rejected: AtomicU64,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The configured session tag could not be decoded.
    #[error("invalid session tag")]
    InvalidSessionTag(#[from] echo_frame::InvalidSessionTag),
    /// Opening or binding the ICMP socket failed (commonly missing privileges).
    #[error("failed to open ICMP socket")]
    Bind(#[source] io::Error),
    /// The socket rejected an outgoing message.
    #[error("failed to send ICMP message")]
    Transmit(#[source] io::Error),
    /// The socket failed while waiting for an incoming message.
    #[error("failed to receive ICMP message")]
    Receive(#[source] io::Error),
    /// The configured deadline elapsed before the operation completed.
    #[error("deadline elapsed")]
    Timeout,
    /// The channel was closed.
    #[error("channel is closed")]
    Closed,
}

impl Error {
    /// Whether this is the deadline expiring, i.e. "nothing arrived yet"
    /// rather than "the channel is broken".
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout)
    }
}

impl IcmpChannel {
    /// Opens a channel between `local` and `remote`.
    ///
    /// `tag` is the 6-character hex form of the session tag; both ends must
    /// be configured with the same value. No handshake is performed: the
    /// channel counts as connected once the socket is bound.
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect(
        local: EndpointAddr,
        remote: EndpointAddr,
        tag: &str,
        role: Role,
    ) -> Result<Self, Error> {
        let tag = SessionTag::from_hex(tag)?;
        let socket = OsSocket::bind(&local).map_err(Error::Bind)?;

        tracing::debug!(%local, %remote, ?role, "Opened ICMP channel");

        Ok(Self::from_socket(Arc::new(socket), local, remote, tag, role))
    }

    /// Assembles a channel on top of an already-open transport.
    ///
    /// This is the seam for custom transports and in-memory tests;
    /// [`connect`](Self::connect) is the production path.
    pub fn from_socket(
        socket: Arc<dyn PacketSocket>,
        local: EndpointAddr,
        remote: EndpointAddr,
        tag: SessionTag,
        role: Role,
    ) -> Self {
        Self {
            socket,
            tag,
            role,
            local,
            remote,
            read_deadline: Mutex::new(None),
            write_deadline: Mutex::new(None),
            shutdown: CancellationToken::new(),
            rejected: AtomicU64::new(0),
        }
    }

    /// Waits for the next payload addressed to us.
    ///
    /// Everything else arriving on the socket (ordinary pings, other
    /// sessions, our own frames echoed back) is discarded silently and the
    /// wait continues. The read deadline spans the whole wait; it is not
    /// re-armed per datagram.
    ///
    /// Returns the number of bytes copied into `buf` (payloads longer than
    /// `buf` are truncated) and the sender's address.
    pub async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, IpAddr), Error> {
        let deadline = *self.read_deadline.lock();

        self.guarded(deadline, self.recv_loop(buf)).await
    }

    async fn recv_loop(&self, buf: &mut [u8]) -> Result<(usize, IpAddr), Error> {
        let mut scratch = [0u8; MAX_MESSAGE_SIZE];

        loop {
            let (len, from) = self
                .socket
                .recv_from(&mut scratch)
                .await
                .map_err(Error::Receive)?;

            let Some(payload) = echo_frame::decode(&scratch[..len], self.tag, self.role) else {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(target: "wire::icmp::recv", src = %from, num_bytes = %len, "Discarding foreign datagram");

                continue;
            };

            tracing::trace!(target: "wire::icmp::recv", src = %from, num_bytes = %payload.len());

            let num_bytes = payload.len().min(buf.len());
            buf[..num_bytes].copy_from_slice(&payload[..num_bytes]);

            return Ok((num_bytes, from));
        }
    }

    /// Sends `payload` as one echo message.
    ///
    /// A server sends to `dst`, typically the address its last matching
    /// receive reported (one server socket may serve several clients). A
    /// client ignores `dst` and always sends to the remote it was connected
    /// with.
    ///
    /// Returns the payload length, not the wire length.
    pub async fn send_to(&self, payload: &[u8], dst: IpAddr) -> Result<usize, Error> {
        let deadline = *self.write_deadline.lock();

        let message = echo_frame::encode(self.tag, self.role, payload);
        let dst = match self.role {
            Role::Server => dst,
            Role::Client => self.remote.ip(),
        };

        self.guarded(deadline, async {
            self.socket
                .send_to(&message, dst)
                .await
                .map_err(Error::Transmit)
        })
        .await?;

        tracing::trace!(target: "wire::icmp::send", %dst, num_bytes = %payload.len());

        Ok(payload.len())
    }

    /// The configured local bind address.
    pub fn local_addr(&self) -> &EndpointAddr {
        &self.local
    }

    /// The peer configured at connect time.
    pub fn remote_addr(&self) -> &EndpointAddr {
        &self.remote
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Sets both deadlines at once.
    pub fn set_deadline(&self, deadline: Option<Instant>) {
        self.set_read_deadline(deadline);
        self.set_write_deadline(deadline);
    }

    /// Applies to subsequent [`recv_from`](Self::recv_from) calls; `None`
    /// clears. A deadline already in the past fails the next call
    /// immediately with [`Error::Timeout`].
    pub fn set_read_deadline(&self, deadline: Option<Instant>) {
        *self.read_deadline.lock() = deadline;
    }

    /// Applies to subsequent [`send_to`](Self::send_to) calls; `None` clears.
    pub fn set_write_deadline(&self, deadline: Option<Instant>) {
        *self.write_deadline.lock() = deadline;
    }

    /// Closes the channel.
    ///
    /// Idempotent and safe to call from any task: a receive blocked on
    /// another task fails promptly with [`Error::Closed`]. The socket itself
    /// is released once the channel is dropped.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// How many datagrams the session filter has discarded so far.
    pub fn rejected_datagrams(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Runs `op` under the channel's cancellation token and an optional
    /// absolute deadline. The deadline is armed once for the entire
    /// operation; retries inside `op` do not reset it.
    async fn guarded<T>(
        &self,
        deadline: Option<Instant>,
        op: impl Future<Output = Result<T, Error>>,
    ) -> Result<T, Error> {
        if self.shutdown.is_cancelled() {
            return Err(Error::Closed);
        }

        let guarded = async {
            tokio::select! {
                _ = self.shutdown.cancelled() => Err(Error::Closed),
                result = op => result,
            }
        };

        match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline.into(), guarded)
                .await
                .unwrap_or(Err(Error::Timeout)),
            None => guarded.await,
        }
    }
}
