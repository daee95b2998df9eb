use std::fmt::{Debug, Display, Formatter};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

use bytes::{Buf, BufMut, BytesMut};
use rand::RngCore;
use thiserror::Error;

/// Version byte carried at offset 0 of every rendezvous frame. Frames with any other
///  value are not rendezvous frames.
pub const WIRE_VERSION: u8 = 0;

/// Size in bytes of a [Fingerprint].
pub const FINGERPRINT_SIZE: usize = 64;

/// Protocol tag for addresses on the wire. UDP is the only transport defined.
const PROTO_UDP: u8 = 0;

/// Smallest parseable frame: version, fingerprint and type byte, no body.
pub const MIN_MESSAGE_SIZE: usize = 1 + FINGERPRINT_SIZE + 1;

/// Largest frame [Message::ser] can produce: a [MessageKind::Meet] with an IPv6
///  address, i.e. the common prefix plus proto tag, port, 16 address bytes and the
///  echoed fingerprint of the peer being introduced.
pub const MAX_MESSAGE_SIZE: usize = MIN_MESSAGE_SIZE + 1 + 2 + 16 + FINGERPRINT_SIZE;

/// 64-byte per-peer token attached to every rendezvous frame. It is not an identity
///  and carries no cryptographic meaning by itself: the server may filter on it, and
///  a peer compares it against its own most recent value to tell rendezvous frames
///  apart from application datagrams arriving on the same socket.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Fingerprint(pub [u8; FINGERPRINT_SIZE]);

impl Fingerprint {
    pub fn random() -> Fingerprint {
        let mut bytes = [0u8; FINGERPRINT_SIZE];
        rand::rng().fill_bytes(&mut bytes);
        Fingerprint(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; FINGERPRINT_SIZE] {
        &self.0
    }
}

impl Debug for Fingerprint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Fingerprint({:02x}{:02x}{:02x}{:02x}..)",
            self.0[0], self.0[1], self.0[2], self.0[3]
        )
    }
}

impl From<[u8; FINGERPRINT_SIZE]> for Fingerprint {
    fn from(bytes: [u8; FINGERPRINT_SIZE]) -> Self {
        Fingerprint(bytes)
    }
}

/// Reasons a datagram is rejected as a rendezvous frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("malformed message: too short")]
    TooShort,
    #[error("malformed message: too big")]
    TooBig,
    #[error("malformed message: invalid version {0}")]
    InvalidVersion(u8),
    #[error("malformed message: invalid type {0}")]
    InvalidType(u8),
    #[error("malformed message: invalid proto {0}")]
    InvalidProto(u8),
    #[error("malformed message: invalid ip length {0}")]
    InvalidIpLength(usize),
}

/// One rendezvous frame: the envelope fingerprint plus the typed payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Message {
    pub fingerprint: Fingerprint,
    pub kind: MessageKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// A newcomer asking the server for introductions.
    HelloServer,
    /// One peer greeting another; the body is the receiver's externally observed
    ///  address.
    HelloPeer { addr: SocketAddr },
    /// The server asking a mingler to greet the newcomer at `addr`. `fingerprint` is
    ///  the newcomer's own, echoed so the resulting [MessageKind::HelloPeer] is
    ///  recognizable by the newcomer's mux.
    Meet { addr: SocketAddr, fingerprint: Fingerprint },
    /// A peer advertising that it is willing to be introduced to newcomers.
    ReadyToMingle,
}

impl MessageKind {
    fn type_byte(&self) -> u8 {
        match self {
            MessageKind::HelloServer => 0,
            MessageKind::HelloPeer { .. } => 1,
            MessageKind::Meet { .. } => 2,
            MessageKind::ReadyToMingle => 3,
        }
    }
}

impl Display for MessageKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MessageKind::HelloServer => "HelloServer",
            MessageKind::HelloPeer { .. } => "HelloPeer",
            MessageKind::Meet { .. } => "Meet",
            MessageKind::ReadyToMingle => "ReadyToMingle",
        };
        write!(f, "{}", name)
    }
}

impl Message {
    /// Appends the frame to `buf`: version, fingerprint, type byte, then the body of
    ///  the variant. Ports are big-endian; IPv4-mapped IPv6 addresses are carried in
    ///  their 4-byte form.
    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8(WIRE_VERSION);
        buf.put_slice(&self.fingerprint.0);
        buf.put_u8(self.kind.type_byte());

        match &self.kind {
            MessageKind::HelloServer | MessageKind::ReadyToMingle => {}
            MessageKind::HelloPeer { addr } => {
                ser_addr(buf, addr);
            }
            MessageKind::Meet { addr, fingerprint } => {
                ser_addr(buf, addr);
                buf.put_slice(&fingerprint.0);
            }
        }
    }

    /// Parses one datagram. The address length is inferred from what is left of the
    ///  datagram once the fixed-size fields are accounted for, so every read below is
    ///  in bounds by construction. Body-less frames tolerate trailing bytes.
    pub fn try_deser(mut buf: &[u8]) -> Result<Message, WireError> {
        if buf.len() > MAX_MESSAGE_SIZE {
            return Err(WireError::TooBig);
        }
        if buf.len() < MIN_MESSAGE_SIZE {
            return Err(WireError::TooShort);
        }

        let version = buf.get_u8();
        if version != WIRE_VERSION {
            return Err(WireError::InvalidVersion(version));
        }

        let mut fingerprint = [0u8; FINGERPRINT_SIZE];
        buf.copy_to_slice(&mut fingerprint);
        let fingerprint = Fingerprint(fingerprint);

        let type_byte = buf.get_u8();
        let kind = match type_byte {
            0 => MessageKind::HelloServer,
            1 => {
                let ip_len = buf.remaining().checked_sub(3).ok_or(WireError::TooShort)?;
                MessageKind::HelloPeer {
                    addr: deser_addr(&mut buf, ip_len)?,
                }
            }
            2 => {
                let ip_len = buf
                    .remaining()
                    .checked_sub(3 + FINGERPRINT_SIZE)
                    .ok_or(WireError::TooShort)?;
                let addr = deser_addr(&mut buf, ip_len)?;
                let mut echoed = [0u8; FINGERPRINT_SIZE];
                buf.copy_to_slice(&mut echoed);
                MessageKind::Meet {
                    addr,
                    fingerprint: Fingerprint(echoed),
                }
            }
            3 => MessageKind::ReadyToMingle,
            t => return Err(WireError::InvalidType(t)),
        };

        Ok(Message { fingerprint, kind })
    }
}

fn ser_addr(buf: &mut BytesMut, addr: &SocketAddr) {
    buf.put_u8(PROTO_UDP);
    buf.put_u16(addr.port());
    match addr.ip().to_canonical() {
        IpAddr::V4(ip) => buf.put_u32(ip.to_bits()),
        IpAddr::V6(ip) => buf.put_u128(ip.to_bits()),
    }
}

/// `ip_len` is what remains of the datagram for the address itself; the caller has
///  already subtracted the proto tag and port, so `buf` holds at least `3 + ip_len`.
fn deser_addr(buf: &mut impl Buf, ip_len: usize) -> Result<SocketAddr, WireError> {
    let proto = buf.get_u8();
    if proto != PROTO_UDP {
        return Err(WireError::InvalidProto(proto));
    }
    let port = buf.get_u16();

    match ip_len {
        4 => {
            let ip = Ipv4Addr::from_bits(buf.get_u32());
            Ok(SocketAddr::V4(SocketAddrV4::new(ip, port)))
        }
        16 => {
            let ip = Ipv6Addr::from_bits(buf.get_u128());
            Ok(match ip.to_ipv4_mapped() {
                Some(v4) => SocketAddr::V4(SocketAddrV4::new(v4, port)),
                None => SocketAddr::V6(SocketAddrV6::new(ip, port, 0, 0)),
            })
        }
        n => Err(WireError::InvalidIpLength(n)),
    }
}

#[cfg(test)]
mod test {
    use rstest::rstest;

    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    /// A frame with the given version, a fingerprint of 64 copies of `fp_byte`, and
    ///  the given tail (type byte plus body).
    fn frame(version: u8, fp_byte: u8, tail: &[u8]) -> Vec<u8> {
        let mut b = vec![version];
        b.extend_from_slice(&[fp_byte; FINGERPRINT_SIZE]);
        b.extend_from_slice(tail);
        b
    }

    #[rstest]
    #[case::hello_server(MessageKind::HelloServer, vec![0x00])]
    #[case::ready_to_mingle(MessageKind::ReadyToMingle, vec![0x03])]
    #[case::hello_peer_v4(
        MessageKind::HelloPeer { addr: addr("127.0.0.1:6666") },
        vec![0x01, 0x00, 0x1a, 0x0a, 0x7f, 0x00, 0x00, 0x01]
    )]
    #[case::hello_peer_v6(
        MessageKind::HelloPeer { addr: addr("[::1]:6666") },
        [
            &[0x01u8, 0x00, 0x1a, 0x0a][..],
            &[0x00; 15][..],
            &[0x01][..],
        ].concat()
    )]
    #[case::meet_v4(
        MessageKind::Meet { addr: addr("127.0.0.1:6666"), fingerprint: Fingerprint([7; FINGERPRINT_SIZE]) },
        [
            &[0x02u8, 0x00, 0x1a, 0x0a, 0x7f, 0x00, 0x00, 0x01][..],
            &[7; FINGERPRINT_SIZE][..],
        ].concat()
    )]
    #[case::meet_v6(
        MessageKind::Meet { addr: addr("[::1]:6666"), fingerprint: Fingerprint([7; FINGERPRINT_SIZE]) },
        [
            &[0x02u8, 0x00, 0x1a, 0x0a][..],
            &[0x00; 15][..],
            &[0x01][..],
            &[7; FINGERPRINT_SIZE][..],
        ].concat()
    )]
    fn test_ser_bytes_and_round_trip(#[case] kind: MessageKind, #[case] expected_tail: Vec<u8>) {
        let msg = Message {
            fingerprint: Fingerprint::random(),
            kind,
        };

        let mut buf = BytesMut::new();
        msg.ser(&mut buf);

        assert_eq!(buf[0], WIRE_VERSION);
        assert_eq!(&buf[1..1 + FINGERPRINT_SIZE], &msg.fingerprint.0[..]);
        assert_eq!(&buf[1 + FINGERPRINT_SIZE..], &expected_tail[..]);

        assert_eq!(Message::try_deser(&buf), Ok(msg));
    }

    #[rstest]
    #[case::empty(vec![], WireError::TooShort)]
    #[case::no_type_byte(frame(0, 0, &[]), WireError::TooShort)]
    #[case::too_big(vec![0; MAX_MESSAGE_SIZE + 1], WireError::TooBig)]
    #[case::bad_version(frame(1, 0, &[0x00]), WireError::InvalidVersion(1))]
    #[case::bad_type(frame(0, 0, &[0x04]), WireError::InvalidType(4))]
    #[case::hello_peer_no_body(frame(0, 0, &[0x01]), WireError::TooShort)]
    #[case::hello_peer_port_truncated(frame(0, 0, &[0x01, 0x00, 0x1a]), WireError::TooShort)]
    #[case::hello_peer_bad_proto(
        frame(0, 0, &[0x01, 0x01, 0x1a, 0x0a, 0x7f, 0x00, 0x00, 0x01]),
        WireError::InvalidProto(1)
    )]
    #[case::hello_peer_bad_ip_length(
        frame(0, 0, &[0x01, 0x00, 0x1a, 0x0a, 0x01, 0x02, 0x03, 0x04, 0x05]),
        WireError::InvalidIpLength(5)
    )]
    #[case::meet_missing_echoed_fingerprint(
        frame(0, 0, &[0x02, 0x00, 0x1a, 0x0a, 0x7f, 0x00, 0x00, 0x01]),
        WireError::TooShort
    )]
    #[case::meet_bad_ip_length(
        frame(0, 0, &[
            [0x02u8, 0x00, 0x1a, 0x0a].as_slice(),
            &[0x01, 0x02, 0x03][..],
            &[7; FINGERPRINT_SIZE][..],
        ].concat().as_slice()),
        WireError::InvalidIpLength(3)
    )]
    fn test_deser_rejects(#[case] input: Vec<u8>, #[case] expected: WireError) {
        assert_eq!(Message::try_deser(&input), Err(expected));
    }

    #[test]
    fn test_ipv4_mapped_address_is_coerced() {
        let msg = Message {
            fingerprint: Fingerprint::random(),
            kind: MessageKind::HelloPeer {
                addr: addr("[::ffff:127.0.0.1]:6666"),
            },
        };

        let mut buf = BytesMut::new();
        msg.ser(&mut buf);
        // 4-byte body: proto, port, IPv4
        assert_eq!(buf.len(), MIN_MESSAGE_SIZE + 1 + 2 + 4);

        let parsed = Message::try_deser(&buf).unwrap();
        assert_eq!(
            parsed.kind,
            MessageKind::HelloPeer {
                addr: addr("127.0.0.1:6666")
            }
        );
    }

    #[test]
    fn test_trailing_bytes_tolerated_on_bodyless_frames() {
        let input = frame(0, 0, &[0x03, 0xaa, 0xbb]);
        let parsed = Message::try_deser(&input).unwrap();
        assert_eq!(parsed.kind, MessageKind::ReadyToMingle);
    }
}
