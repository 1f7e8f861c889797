//! Wire protocol — colon-delimited text payloads and TCP framing.
//!
//! Every payload is UTF-8 text of the form `TAG:field:field...`. The last
//! field of a tag may contain unescaped colons, so each tag is split with
//! a fixed maximum field count. Over TCP, each payload is prefixed with a
//! 4-byte length in host byte order.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::NetworkError;
use crate::identity::{FIELD_DELIMITER, MessageId, validate_username};

/// Largest frame body a reader will accept.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Largest UDP datagram the listener expects.
pub const MAX_DATAGRAM_LEN: usize = 64 * 1024;

pub const TAG_HEARTBEAT: &str = "HEARTBEAT";
pub const TAG_BROADCAST: &str = "BROADCAST";
pub const TAG_TYPING_START: &str = "TYPING_START";
pub const TAG_TYPING_STOP: &str = "TYPING_STOP";
pub const TAG_NAME_UPDATE: &str = "NAME_UPDATE";
pub const TAG_CHAT: &str = "CHAT";
pub const TAG_HELLO: &str = "HELLO";

/// One decoded protocol payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// `HEARTBEAT:<sender>:<tcpPort>` (UDP).
    Heartbeat { sender: String, tcp_port: u16 },
    /// `BROADCAST:<sender>:<messageId>:<content>` (UDP).
    Broadcast {
        sender: String,
        message_id: MessageId,
        content: String,
    },
    /// `TYPING_START:<sender>` / `TYPING_STOP:<sender>` (UDP or TCP).
    Typing { sender: String, is_typing: bool },
    /// `NAME_UPDATE:<oldName>:<newName>` (UDP).
    NameUpdate { old_name: String, new_name: String },
    /// `CHAT:<sender>:<messageId>:<content>` (TCP).
    Chat {
        sender: String,
        message_id: MessageId,
        content: String,
    },
    /// `HELLO:<sender>` (TCP).
    Hello { sender: String },
}

impl Packet {
    /// The leading tag of this packet.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Heartbeat { .. } => TAG_HEARTBEAT,
            Self::Broadcast { .. } => TAG_BROADCAST,
            Self::Typing { is_typing: true, .. } => TAG_TYPING_START,
            Self::Typing { is_typing: false, .. } => TAG_TYPING_STOP,
            Self::NameUpdate { .. } => TAG_NAME_UPDATE,
            Self::Chat { .. } => TAG_CHAT,
            Self::Hello { .. } => TAG_HELLO,
        }
    }

    /// The username this packet claims to come from.
    pub fn sender(&self) -> &str {
        match self {
            Self::Heartbeat { sender, .. }
            | Self::Broadcast { sender, .. }
            | Self::Typing { sender, .. }
            | Self::Chat { sender, .. }
            | Self::Hello { sender } => sender,
            Self::NameUpdate { old_name, .. } => old_name,
        }
    }

    /// Encode to the wire text form.
    pub fn encode(&self) -> String {
        let tag = self.tag();
        match self {
            Self::Heartbeat { sender, tcp_port } => format!("{tag}:{sender}:{tcp_port}"),
            Self::Broadcast {
                sender,
                message_id,
                content,
            }
            | Self::Chat {
                sender,
                message_id,
                content,
            } => format!("{tag}:{sender}:{message_id}:{content}"),
            Self::Typing { sender, .. } | Self::Hello { sender } => format!("{tag}:{sender}"),
            Self::NameUpdate { old_name, new_name } => format!("{tag}:{old_name}:{new_name}"),
        }
    }

    /// Decode a raw payload, rejecting invalid UTF-8.
    pub fn decode_bytes(bytes: &[u8]) -> Result<Self, NetworkError> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| NetworkError::MalformedFrame(format!("invalid UTF-8: {e}")))?;
        Self::decode(text)
    }

    /// Decode a payload from its wire text form.
    pub fn decode(text: &str) -> Result<Self, NetworkError> {
        let tag = text.split(FIELD_DELIMITER).next().unwrap_or_default();
        let split_count = match tag {
            TAG_HEARTBEAT | TAG_NAME_UPDATE => 3,
            TAG_BROADCAST | TAG_CHAT => 4,
            TAG_TYPING_START | TAG_TYPING_STOP | TAG_HELLO => 2,
            _ => return Err(NetworkError::UnknownTag(truncate(tag, 32))),
        };

        let fields: Vec<&str> = text.splitn(split_count, FIELD_DELIMITER).collect();
        if fields.len() != split_count {
            return Err(malformed(text, "wrong field count"));
        }
        let sender = fields[1];
        validate_username(sender).map_err(|_| malformed(text, "invalid sender"))?;

        let packet = match tag {
            TAG_HEARTBEAT => Self::Heartbeat {
                sender: sender.to_string(),
                tcp_port: fields[2]
                    .parse()
                    .map_err(|_| malformed(text, "invalid tcp port"))?,
            },
            TAG_BROADCAST => Self::Broadcast {
                sender: sender.to_string(),
                message_id: MessageId::parse(fields[2])?,
                content: fields[3].to_string(),
            },
            TAG_CHAT => Self::Chat {
                sender: sender.to_string(),
                message_id: MessageId::parse(fields[2])?,
                content: fields[3].to_string(),
            },
            TAG_TYPING_START | TAG_TYPING_STOP => Self::Typing {
                sender: sender.to_string(),
                is_typing: tag == TAG_TYPING_START,
            },
            TAG_NAME_UPDATE => {
                let new_name = fields[2];
                validate_username(new_name).map_err(|_| malformed(text, "invalid new name"))?;
                Self::NameUpdate {
                    old_name: sender.to_string(),
                    new_name: new_name.to_string(),
                }
            }
            _ => Self::Hello {
                sender: sender.to_string(),
            },
        };
        Ok(packet)
    }
}

fn malformed(text: &str, reason: &str) -> NetworkError {
    NetworkError::MalformedFrame(format!("{reason}: {:?}", truncate(text, 64)))
}

fn truncate(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

// ---------------------------------------------------------------------------
// Framing
// ---------------------------------------------------------------------------

/// Encode `packet` as one length-prefixed frame.
///
/// Bodies over [`MAX_FRAME_LEN`] are refused here, since the reader on the
/// other end would drop the connection.
pub fn encode_frame(packet: &Packet) -> Result<Vec<u8>, NetworkError> {
    let body = packet.encode().into_bytes();
    if body.len() > MAX_FRAME_LEN {
        return Err(NetworkError::FrameTooLarge {
            len: body.len(),
            max: MAX_FRAME_LEN,
        });
    }

    let mut buf = Vec::with_capacity(4 + body.len());
    buf.extend_from_slice(&(body.len() as u32).to_ne_bytes());
    buf.extend_from_slice(&body);
    Ok(buf)
}

/// Write one length-prefixed frame carrying `packet`.
///
/// A `FrameTooLarge` error is returned before anything is written.
pub async fn write_frame<W>(writer: &mut W, packet: &Packet) -> Result<(), NetworkError>
where
    W: AsyncWrite + Unpin,
{
    let buf = encode_frame(packet)?;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame body.
///
/// Returns `Ok(None)` when the stream closes cleanly between frames.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Vec<u8>>, NetworkError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    let mut filled = 0;
    while filled < header.len() {
        let n = reader.read(&mut header[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(NetworkError::MalformedFrame(format!(
                "connection closed after {filled} of 4 header bytes"
            )));
        }
        filled += n;
    }

    let len = u32::from_ne_bytes(header) as usize;
    if len > MAX_FRAME_LEN {
        return Err(NetworkError::MalformedFrame(format!(
            "declared length {len} exceeds {MAX_FRAME_LEN}"
        )));
    }

    let mut body = vec![0u8; len];
    match reader.read_exact(&mut body).await {
        Ok(_) => Ok(Some(body)),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(
            NetworkError::MalformedFrame(format!("connection closed inside a {len}-byte frame")),
        ),
        Err(e) => Err(NetworkError::Io(e)),
    }
}

/// Decode a UDP datagram, ignoring trailing NUL padding.
pub fn decode_datagram(bytes: &[u8]) -> Result<Packet, NetworkError> {
    let end = bytes
        .iter()
        .rposition(|&b| b != 0)
        .map(|i| i + 1)
        .unwrap_or(0);
    Packet::decode_bytes(&bytes[..end])
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heartbeat_wire_form() {
        let packet = Packet::Heartbeat {
            sender: "alice".to_string(),
            tcp_port: 14000,
        };
        assert_eq!(packet.encode(), "HEARTBEAT:alice:14000");
        assert_eq!(Packet::decode("HEARTBEAT:alice:14000").unwrap(), packet);
    }

    #[test]
    fn test_content_keeps_colons() {
        let id = MessageId::generate();
        let text = format!("CHAT:bob:{id}:see you at 10:30: ok?");
        match Packet::decode(&text).unwrap() {
            Packet::Chat {
                sender,
                message_id,
                content,
            } => {
                assert_eq!(sender, "bob");
                assert_eq!(message_id, id);
                assert_eq!(content, "see you at 10:30: ok?");
            }
            other => panic!("Expected Chat, got {other:?}"),
        }
    }

    #[test]
    fn test_empty_content_allowed() {
        let id = MessageId::generate();
        let packet = Packet::decode(&format!("BROADCAST:carol:{id}:")).unwrap();
        assert!(matches!(packet, Packet::Broadcast { ref content, .. } if content.is_empty()));
    }

    #[test]
    fn test_typing_tags() {
        assert_eq!(
            Packet::decode("TYPING_START:dave").unwrap(),
            Packet::Typing {
                sender: "dave".to_string(),
                is_typing: true
            }
        );
        let stop = Packet::Typing {
            sender: "dave".to_string(),
            is_typing: false,
        };
        assert_eq!(stop.encode(), "TYPING_STOP:dave");
    }

    #[test]
    fn test_name_update() {
        let packet = Packet::decode("NAME_UPDATE:alice:bob").unwrap();
        assert_eq!(packet.sender(), "alice");
        assert!(Packet::decode("NAME_UPDATE:alice:b:c").is_err());
        assert!(Packet::decode("NAME_UPDATE:alice:").is_err());
    }

    #[test]
    fn test_hello() {
        let packet = Packet::decode("HELLO:erin").unwrap();
        assert_eq!(packet, Packet::Hello { sender: "erin".to_string() });
        assert_eq!(packet.encode(), "HELLO:erin");
    }

    #[test]
    fn test_unknown_tag() {
        match Packet::decode("USERNAME:frank") {
            Err(NetworkError::UnknownTag(tag)) => assert_eq!(tag, "USERNAME"),
            other => panic!("Expected UnknownTag, got {other:?}"),
        }
        // Tags are case-sensitive.
        assert!(matches!(
            Packet::decode("hello:frank"),
            Err(NetworkError::UnknownTag(_))
        ));
    }

    #[test]
    fn test_malformed_payloads() {
        for bad in [
            "HEARTBEAT:alice",
            "HEARTBEAT:alice:notaport",
            "HEARTBEAT:alice:70000",
            "CHAT:alice:not-a-uuid:hi",
            "CHAT:alice",
            "HELLO:",
            "HELLO:a:b",
            "HELLO: ",
            "TYPING_START",
            "TYPING_START:a:b",
            "TYPING_STOP:",
            "NAME_UPDATE:bob:rob:ert",
            "NAME_UPDATE:bob: ",
        ] {
            match Packet::decode(bad) {
                Err(NetworkError::MalformedFrame(_)) => {}
                other => panic!("Expected MalformedFrame for {bad:?}, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_invalid_utf8_rejected() {
        assert!(matches!(
            Packet::decode_bytes(&[0x48, 0x45, 0xff, 0xfe]),
            Err(NetworkError::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_datagram_trailing_nuls_trimmed() {
        let packet = decode_datagram(b"TYPING_STOP:gina\0\0\0").unwrap();
        assert_eq!(packet.sender(), "gina");
    }

    #[tokio::test]
    async fn test_frame_stream() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let hello = Packet::Hello {
            sender: "alice".to_string(),
        };
        let chat = Packet::Chat {
            sender: "alice".to_string(),
            message_id: MessageId::generate(),
            content: "héllo: wörld".to_string(),
        };

        write_frame(&mut client, &hello).await.unwrap();
        write_frame(&mut client, &chat).await.unwrap();
        drop(client);

        let first = read_frame(&mut server).await.unwrap().unwrap();
        assert_eq!(Packet::decode_bytes(&first).unwrap(), hello);
        let second = read_frame(&mut server).await.unwrap().unwrap();
        assert_eq!(Packet::decode_bytes(&second).unwrap(), chat);
        assert!(read_frame(&mut server).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_frame_length_is_native_endian() {
        let (mut client, mut server) = tokio::io::duplex(64);
        write_frame(&mut client, &Packet::Hello { sender: "a".into() })
            .await
            .unwrap();

        let mut header = [0u8; 4];
        server.read_exact(&mut header).await.unwrap();
        assert_eq!(u32::from_ne_bytes(header), "HELLO:a".len() as u32);
    }

    #[tokio::test]
    async fn test_truncated_frame_is_malformed() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&10u32.to_ne_bytes()).await.unwrap();
        client.write_all(b"HELLO").await.unwrap();
        drop(client);

        match read_frame(&mut server).await {
            Err(NetworkError::MalformedFrame(msg)) => assert!(msg.contains("10-byte")),
            other => panic!("Expected MalformedFrame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_truncated_header_is_malformed() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&[1, 0]).await.unwrap();
        drop(client);

        assert!(matches!(
            read_frame(&mut server).await,
            Err(NetworkError::MalformedFrame(_))
        ));
    }

    #[tokio::test]
    async fn test_oversized_packet_not_written() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let packet = Packet::Chat {
            sender: "alice".into(),
            message_id: MessageId::generate(),
            content: "x".repeat(MAX_FRAME_LEN + 1),
        };
        match write_frame(&mut client, &packet).await {
            Err(NetworkError::FrameTooLarge { len, max }) => {
                assert_eq!(max, MAX_FRAME_LEN);
                assert!(len > MAX_FRAME_LEN);
            }
            other => panic!("Expected FrameTooLarge, got {other:?}"),
        }

        // The stream is untouched: the next frame is the first one read.
        let small = Packet::Hello { sender: "alice".into() };
        write_frame(&mut client, &small).await.unwrap();
        let body = read_frame(&mut server).await.unwrap().unwrap();
        assert_eq!(Packet::decode_bytes(&body).unwrap(), small);
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let len = (MAX_FRAME_LEN as u32) + 1;
        client.write_all(&len.to_ne_bytes()).await.unwrap();

        assert!(matches!(
            read_frame(&mut server).await,
            Err(NetworkError::MalformedFrame(_))
        ));
    }
}
