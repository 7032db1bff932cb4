#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Framing of tunnel payloads as ICMPv6 echo messages.
//!
//! Every payload travels in the data field of an ICMPv6 Echo Request:
//! a 3-byte session tag, one role marker byte, then the opaque payload.
//! The tag separates our traffic from ordinary pings (and from other tunnels
//! sharing the host); the marker separates the two directions of a session so
//! neither side accepts its own frames echoed back by the network.
//!
//! Replies are accepted alongside requests on decode because some paths
//! rewrite a forwarded request into a reply.

use std::str::FromStr;

use etherparse::{IcmpEchoHeader, Icmpv6Header, Icmpv6Slice, Icmpv6Type};

/// Fixed identifier carried in every echo message we emit.
const ECHO_ID: u16 = 18;
/// Fixed sequence number; the channel does no sequence tracking.
const ECHO_SEQ: u16 = 1;

const CLIENT_MARKER: u8 = b'C';
const SERVER_MARKER: u8 = b'S';

/// Bytes of the echo data field occupied by the session tag and role marker.
pub const FRAME_OVERHEAD: usize = SessionTag::LEN + 1;

/// The 3-byte tag shared by both ends of one tunnel.
///
/// Configured as a 6-character hex string. Anything arriving on the socket
/// without this exact tag is foreign traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTag([u8; 3]);

impl SessionTag {
    pub const LEN: usize = 3;

    /// Decodes a tag from its configured hex form, e.g. `"a1b2c3"`.
    pub fn from_hex(hex: &str) -> Result<Self, InvalidSessionTag> {
        let bytes = hex::decode(hex)?;
        let tag = <[u8; Self::LEN]>::try_from(bytes.as_slice()).map_err(|_| {
            InvalidSessionTag::Length {
                num_bytes: bytes.len(),
            }
        })?;

        Ok(Self(tag))
    }

    pub const fn from_bytes(bytes: [u8; Self::LEN]) -> Self {
        Self(bytes)
    }
}

impl FromStr for SessionTag {
    type Err = InvalidSessionTag;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InvalidSessionTag {
    #[error("session tag is not a hex string: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("session tag must decode to exactly 3 bytes, got {num_bytes}")]
    Length { num_bytes: usize },
}

/// Which half of the tunnel we are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    /// The role at the other end of the tunnel.
    #[must_use]
    pub fn peer(self) -> Role {
        match self {
            Role::Client => Role::Server,
            Role::Server => Role::Client,
        }
    }

    fn marker(self) -> u8 {
        match self {
            Role::Client => CLIENT_MARKER,
            Role::Server => SERVER_MARKER,
        }
    }
}

/// Wraps `payload` into an ICMPv6 Echo Request tagged with `tag` and `role`.
///
/// The checksum stays zero: ICMPv6 checksums cover the IP pseudo-header and
/// the kernel fills them in on send.
pub fn encode(tag: SessionTag, role: Role, payload: &[u8]) -> Vec<u8> {
    let header = Icmpv6Header::new(Icmpv6Type::EchoRequest(IcmpEchoHeader {
        id: ECHO_ID,
        seq: ECHO_SEQ,
    }));

    let mut message = Vec::with_capacity(header.header_len() + FRAME_OVERHEAD + payload.len());
    header
        .write(&mut message)
        .expect("writing a fixed-size header to a Vec cannot fail");
    message.extend_from_slice(&tag.0);
    message.push(role.marker());
    message.extend_from_slice(payload);

    message
}

/// Attempts to extract a payload addressed to us from a received datagram.
///
/// `None` means "not ours": anything that is not a well-formed echo message
/// carrying our tag and the peer role's marker. Callers treat all rejections
/// identically and keep scanning; there is no way to tell truncated garbage
/// from foreign traffic.
pub fn decode(packet: &[u8], tag: SessionTag, local_role: Role) -> Option<&[u8]> {
    let message = Icmpv6Slice::from_slice(packet).ok()?;

    let (Icmpv6Type::EchoRequest(_) | Icmpv6Type::EchoReply(_)) = message.icmp_type() else {
        return None;
    };

    let (frame_header, payload) = message.payload().split_at_checked(FRAME_OVERHEAD)?;

    if frame_header[..SessionTag::LEN] != tag.0 {
        return None;
    }

    if frame_header[SessionTag::LEN] != local_role.peer().marker() {
        return None;
    }

    Some(payload)
}
