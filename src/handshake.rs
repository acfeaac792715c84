//! Connection bootstrap run right after discovery hands over a socket.
//!
//! ```text
//! Initiator -> Responder:  [4 bytes BE: connection timestamp]
//! Both directions:         [2 bytes BE: username_len][username UTF-8]
//! ```

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::protocol::ProtocolError;

/// Which side of a discovered connection we are on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// We dialed; we pick the connection timestamp.
    Initiator,
    /// We accepted; the dialer tells us the timestamp.
    Responder,
    /// We accepted a second connection from a peer we already have.
    DuplicateResponder,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub username: String,
    /// Session start agreed by both sides, unix seconds.
    pub connected_at: u32,
}

pub async fn perform<S>(
    stream: &mut S,
    role: Role,
    local_username: &str,
    now: u32,
) -> Result<Handshake, ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let connected_at = match role {
        Role::Initiator => {
            stream.write_u32(now).await?;
            now
        }
        Role::Responder | Role::DuplicateResponder => stream.read_u32().await.map_err(eof)?,
    };

    let name = local_username.as_bytes();
    let name_len =
        u16::try_from(name.len()).map_err(|_| ProtocolError::NameTooLong(name.len()))?;
    stream.write_u16(name_len).await?;
    stream.write_all(name).await?;
    stream.flush().await?;

    let peer_len = stream.read_u16().await.map_err(eof)?;
    let mut peer_name = vec![0u8; peer_len as usize];
    stream.read_exact(&mut peer_name).await.map_err(eof)?;
    let username =
        String::from_utf8(peer_name).map_err(|_| ProtocolError::InvalidUtf8("username"))?;

    Ok(Handshake {
        username,
        connected_at,
    })
}

fn eof(e: std::io::Error) -> ProtocolError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        ProtocolError::ShortRead
    } else {
        ProtocolError::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn both_sides_learn_name_and_timestamp() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let (left, right) = tokio::join!(
            perform(&mut a, Role::Initiator, "alice", 1_700_000_123),
            perform(&mut b, Role::Responder, "bob", 5),
        );
        let left = left.unwrap();
        let right = right.unwrap();

        assert_eq!(left.username, "bob");
        assert_eq!(right.username, "alice");
        assert_eq!(left.connected_at, 1_700_000_123);
        assert_eq!(right.connected_at, 1_700_000_123);
    }

    #[tokio::test]
    async fn duplicate_responder_reads_timestamp() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let (_, dup) = tokio::join!(
            perform(&mut a, Role::Initiator, "alice", 42),
            perform(&mut b, Role::DuplicateResponder, "bob", 99),
        );
        assert_eq!(dup.unwrap().connected_at, 42);
    }

    #[tokio::test]
    async fn closed_stream_is_a_short_read() {
        let (mut a, b) = tokio::io::duplex(1024);
        drop(b);
        let result = perform(&mut a, Role::Responder, "bob", 0).await;
        assert!(result.is_err());
    }
}
