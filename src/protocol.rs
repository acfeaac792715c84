//! Binary wire protocol spoken between peers.
//!
//! # Frame format
//!
//! ```text
//! [4 bytes BE: length][1 byte: type][payload]
//!
//! length covers the type byte and the payload.
//!
//! PING      = 0   (empty payload)
//! PONG      = 1   (empty payload)
//! SYNC_REQ  = 2   [1 kind][2 count N][4 folder_id]
//!                 [N x 1 name_len][N x 8 size][N x 32 hex hash][N x 4 mod_time]
//!                 [names, concatenated in order]
//! FILE_REQ  = 3   [1 kind][4 folder_id][name to end of frame]
//! FILE_DATA = 4   [1 name_len][name][4 folder_id][chunk to end of frame]
//! ```
//!
//! All integers are big-endian.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const PING: u8 = 0;
pub const PONG: u8 = 1;
pub const SYNC_REQ: u8 = 2;
pub const FILE_REQ: u8 = 3;
pub const FILE_DATA: u8 = 4;

/// Length of a hex-encoded content hash on the wire.
pub const HASH_LEN: usize = 32;

/// Upper bound on a single frame (type byte + payload).
///
/// A full SYNC_REQ with 65535 entries and 255-byte names stays below this.
pub const MAX_FRAME_LEN: usize = 32 * 1024 * 1024;

/// Maximum number of files a single SYNC_REQ can advertise.
pub const MAX_FILES_PER_REQUEST: usize = u16::MAX as usize;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("connection closed")]
    Closed,
    #[error("connection closed mid-frame")]
    ShortRead,
    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),
    #[error("empty frame")]
    EmptyFrame,
    #[error("truncated {0} frame")]
    Truncated(&'static str),
    #[error("unknown message type {0}")]
    UnknownType(u8),
    #[error("unknown diff kind {0}")]
    UnknownDiffKind(u8),
    #[error("invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),
    #[error("name too long: {0} bytes (max 255)")]
    NameTooLong(usize),
    #[error("content hash must be 32 hex characters, got {0}")]
    BadHashLength(usize),
    #[error("too many files in one request: {0}")]
    TooManyFiles(usize),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Distinguishes a fresh full-folder offer from an incremental re-sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiffKind {
    Full,
    Incremental,
}

impl DiffKind {
    fn to_byte(self) -> u8 {
        match self {
            DiffKind::Full => 0,
            DiffKind::Incremental => 1,
        }
    }

    fn from_byte(b: u8) -> Result<Self, ProtocolError> {
        match b {
            0 => Ok(DiffKind::Full),
            1 => Ok(DiffKind::Incremental),
            other => Err(ProtocolError::UnknownDiffKind(other)),
        }
    }
}

/// One file as advertised inside a SYNC_REQ.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileAdvert {
    pub name: String,
    pub size: u64,
    /// Hex-encoded content hash, always [`HASH_LEN`] characters.
    pub hash: String,
    /// Modification time, unix seconds.
    pub mod_time: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Ping,
    Pong,
    SyncRequest {
        folder_id: u32,
        kind: DiffKind,
        files: Vec<FileAdvert>,
    },
    FileRequest {
        folder_id: u32,
        kind: DiffKind,
        name: String,
    },
    FileChunk {
        folder_id: u32,
        name: String,
        data: Vec<u8>,
    },
}

impl Message {
    pub fn type_tag(&self) -> u8 {
        match self {
            Message::Ping => PING,
            Message::Pong => PONG,
            Message::SyncRequest { .. } => SYNC_REQ,
            Message::FileRequest { .. } => FILE_REQ,
            Message::FileChunk { .. } => FILE_DATA,
        }
    }

    /// Encodes the message as a complete frame, length prefix included.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut body = vec![self.type_tag()];
        match self {
            Message::Ping | Message::Pong => {}
            Message::SyncRequest {
                folder_id,
                kind,
                files,
            } => encode_sync_request(&mut body, *folder_id, *kind, files)?,
            Message::FileRequest {
                folder_id,
                kind,
                name,
            } => {
                body.push(kind.to_byte());
                body.extend_from_slice(&folder_id.to_be_bytes());
                body.extend_from_slice(name.as_bytes());
            }
            Message::FileChunk {
                folder_id,
                name,
                data,
            } => {
                let name_len = short_name_len(name)?;
                body.push(name_len);
                body.extend_from_slice(name.as_bytes());
                body.extend_from_slice(&folder_id.to_be_bytes());
                body.extend_from_slice(data);
            }
        }

        if body.len() > MAX_FRAME_LEN {
            return Err(ProtocolError::FrameTooLarge(body.len()));
        }
        let mut frame = Vec::with_capacity(4 + body.len());
        frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
        frame.extend_from_slice(&body);
        Ok(frame)
    }

    /// Decodes a frame body (type byte + payload, without the length prefix).
    pub fn decode(body: &[u8]) -> Result<Self, ProtocolError> {
        let (&tag, payload) = body.split_first().ok_or(ProtocolError::EmptyFrame)?;
        match tag {
            PING => Ok(Message::Ping),
            PONG => Ok(Message::Pong),
            SYNC_REQ => decode_sync_request(payload),
            FILE_REQ => {
                let mut r = Reader::new(payload, "FILE_REQ");
                let kind = DiffKind::from_byte(r.u8()?)?;
                let folder_id = r.u32()?;
                let name = utf8(r.rest(), "FILE_REQ name")?;
                Ok(Message::FileRequest {
                    folder_id,
                    kind,
                    name,
                })
            }
            FILE_DATA => {
                let mut r = Reader::new(payload, "FILE_DATA");
                let name_len = r.u8()? as usize;
                let name = utf8(r.take(name_len)?, "FILE_DATA name")?;
                let folder_id = r.u32()?;
                Ok(Message::FileChunk {
                    folder_id,
                    name,
                    data: r.rest().to_vec(),
                })
            }
            other => Err(ProtocolError::UnknownType(other)),
        }
    }
}

fn encode_sync_request(
    body: &mut Vec<u8>,
    folder_id: u32,
    kind: DiffKind,
    files: &[FileAdvert],
) -> Result<(), ProtocolError> {
    if files.len() > MAX_FILES_PER_REQUEST {
        return Err(ProtocolError::TooManyFiles(files.len()));
    }
    body.push(kind.to_byte());
    body.extend_from_slice(&(files.len() as u16).to_be_bytes());
    body.extend_from_slice(&folder_id.to_be_bytes());
    for file in files {
        body.push(short_name_len(&file.name)?);
    }
    for file in files {
        body.extend_from_slice(&file.size.to_be_bytes());
    }
    for file in files {
        if file.hash.len() != HASH_LEN {
            return Err(ProtocolError::BadHashLength(file.hash.len()));
        }
        body.extend_from_slice(file.hash.as_bytes());
    }
    for file in files {
        body.extend_from_slice(&file.mod_time.to_be_bytes());
    }
    for file in files {
        body.extend_from_slice(file.name.as_bytes());
    }
    Ok(())
}

fn decode_sync_request(payload: &[u8]) -> Result<Message, ProtocolError> {
    let mut r = Reader::new(payload, "SYNC_REQ");
    let kind = DiffKind::from_byte(r.u8()?)?;
    let count = r.u16()? as usize;
    let folder_id = r.u32()?;

    let name_lens = r.take(count)?.to_vec();
    let mut sizes = Vec::with_capacity(count);
    for _ in 0..count {
        sizes.push(r.u64()?);
    }
    let mut hashes = Vec::with_capacity(count);
    for _ in 0..count {
        hashes.push(utf8(r.take(HASH_LEN)?, "SYNC_REQ hash")?);
    }
    let mut mod_times = Vec::with_capacity(count);
    for _ in 0..count {
        mod_times.push(r.u32()?);
    }

    let mut files = Vec::with_capacity(count);
    for (((len, size), hash), mod_time) in name_lens.into_iter().zip(sizes).zip(hashes).zip(mod_times)
    {
        let name = utf8(r.take(len as usize)?, "SYNC_REQ name")?;
        files.push(FileAdvert {
            name,
            size,
            hash,
            mod_time,
        });
    }

    Ok(Message::SyncRequest {
        folder_id,
        kind,
        files,
    })
}

fn short_name_len(name: &str) -> Result<u8, ProtocolError> {
    u8::try_from(name.len()).map_err(|_| ProtocolError::NameTooLong(name.len()))
}

fn utf8(bytes: &[u8], what: &'static str) -> Result<String, ProtocolError> {
    String::from_utf8(bytes.to_vec()).map_err(|_| ProtocolError::InvalidUtf8(what))
}

/// Bounds-checked cursor over a frame payload.
struct Reader<'a> {
    buf: &'a [u8],
    frame: &'static str,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8], frame: &'static str) -> Self {
        Self { buf, frame }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        if self.buf.len() < n {
            return Err(ProtocolError::Truncated(self.frame));
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], ProtocolError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, ProtocolError> {
        Ok(u16::from_be_bytes(self.array()?))
    }

    fn u32(&mut self) -> Result<u32, ProtocolError> {
        Ok(u32::from_be_bytes(self.array()?))
    }

    fn u64(&mut self) -> Result<u64, ProtocolError> {
        Ok(u64::from_be_bytes(self.array()?))
    }

    fn rest(&mut self) -> &'a [u8] {
        std::mem::take(&mut self.buf)
    }
}

/// Reads one frame body (type byte + payload) from the stream.
///
/// Returns [`ProtocolError::Closed`] on a clean EOF at a frame boundary and
/// [`ProtocolError::ShortRead`] when the stream ends inside a frame.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>, ProtocolError> {
    let mut len_buf = [0u8; 4];
    let mut filled = 0;
    while filled < len_buf.len() {
        let n = reader.read(&mut len_buf[filled..]).await?;
        if n == 0 {
            return Err(if filled == 0 {
                ProtocolError::Closed
            } else {
                ProtocolError::ShortRead
            });
        }
        filled += n;
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge(len));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            ProtocolError::ShortRead
        } else {
            ProtocolError::Io(e)
        }
    })?;
    Ok(body)
}

pub async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    msg: &Message,
) -> Result<(), ProtocolError> {
    let frame = msg.encode()?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Message, ProtocolError> {
    let body = read_frame(reader).await?;
    Message::decode(&body)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn advert(name: &str, size: u64, mod_time: u32) -> FileAdvert {
        FileAdvert {
            name: name.into(),
            size,
            hash: format!("{:032x}", size),
            mod_time,
        }
    }

    fn roundtrip(msg: Message) {
        let frame = msg.encode().unwrap();
        let len = u32::from_be_bytes(frame[..4].try_into().unwrap()) as usize;
        assert_eq!(len, frame.len() - 4);
        assert_eq!(Message::decode(&frame[4..]).unwrap(), msg);
    }

    #[test]
    fn ping_pong_are_five_bytes() {
        assert_eq!(Message::Ping.encode().unwrap(), vec![0, 0, 0, 1, PING]);
        assert_eq!(Message::Pong.encode().unwrap(), vec![0, 0, 0, 1, PONG]);
        roundtrip(Message::Ping);
        roundtrip(Message::Pong);
    }

    #[test]
    fn sync_request_roundtrip() {
        roundtrip(Message::SyncRequest {
            folder_id: 7,
            kind: DiffKind::Full,
            files: vec![advert("a.txt", 10, 1_700_000_000), advert("b.txt", 20, u32::MAX)],
        });
    }

    #[test]
    fn sync_request_without_files() {
        roundtrip(Message::SyncRequest {
            folder_id: u32::MAX,
            kind: DiffKind::Incremental,
            files: Vec::new(),
        });
    }

    #[test]
    fn sync_request_at_max_file_count() {
        let files = (0..MAX_FILES_PER_REQUEST)
            .map(|i| advert(&format!("f{i}"), i as u64, i as u32))
            .collect();
        roundtrip(Message::SyncRequest {
            folder_id: 1,
            kind: DiffKind::Incremental,
            files,
        });
    }

    #[test]
    fn sync_request_layout_matches_field_order() {
        let msg = Message::SyncRequest {
            folder_id: 0x01020304,
            kind: DiffKind::Incremental,
            files: vec![advert("ab", 5, 9)],
        };
        let frame = msg.encode().unwrap();
        let body = &frame[4..];
        assert_eq!(body[0], SYNC_REQ);
        assert_eq!(body[1], 1);
        assert_eq!(&body[2..4], &[0, 1]);
        assert_eq!(&body[4..8], &[1, 2, 3, 4]);
        assert_eq!(body[8], 2);
        assert_eq!(&body[9..17], &5u64.to_be_bytes());
        assert_eq!(&body[17..49], format!("{:032x}", 5).as_bytes());
        assert_eq!(&body[49..53], &9u32.to_be_bytes());
        assert_eq!(&body[53..], b"ab");
    }

    #[test]
    fn file_request_roundtrip() {
        roundtrip(Message::FileRequest {
            folder_id: 42,
            kind: DiffKind::Incremental,
            name: "notes.md".into(),
        });
        roundtrip(Message::FileRequest {
            folder_id: 0,
            kind: DiffKind::Full,
            name: String::new(),
        });
    }

    #[test]
    fn file_chunk_roundtrip() {
        roundtrip(Message::FileChunk {
            folder_id: 9,
            name: "photo.jpg".into(),
            data: (0..=255u8).collect(),
        });
        roundtrip(Message::FileChunk {
            folder_id: 9,
            name: String::new(),
            data: Vec::new(),
        });
    }

    #[test]
    fn rejects_frames_shorter_than_fixed_prefix() {
        assert!(matches!(
            Message::decode(&[FILE_REQ, 1, 0, 0]),
            Err(ProtocolError::Truncated("FILE_REQ"))
        ));
        assert!(matches!(
            Message::decode(&[FILE_DATA, 5, b'a']),
            Err(ProtocolError::Truncated("FILE_DATA"))
        ));
        assert!(matches!(
            Message::decode(&[SYNC_REQ, 0, 0, 1, 0, 0, 0, 7]),
            Err(ProtocolError::Truncated("SYNC_REQ"))
        ));
        assert!(matches!(Message::decode(&[]), Err(ProtocolError::EmptyFrame)));
    }

    #[test]
    fn rejects_unknown_tags() {
        assert!(matches!(
            Message::decode(&[9]),
            Err(ProtocolError::UnknownType(9))
        ));
        assert!(matches!(
            Message::decode(&[FILE_REQ, 7, 0, 0, 0, 1]),
            Err(ProtocolError::UnknownDiffKind(7))
        ));
    }

    #[test]
    fn encode_enforces_field_limits() {
        let long = "x".repeat(256);
        let chunk = Message::FileChunk {
            folder_id: 1,
            name: long.clone(),
            data: vec![],
        };
        assert!(matches!(chunk.encode(), Err(ProtocolError::NameTooLong(256))));

        let bad_hash = Message::SyncRequest {
            folder_id: 1,
            kind: DiffKind::Full,
            files: vec![FileAdvert {
                name: "a".into(),
                size: 1,
                hash: "abc".into(),
                mod_time: 0,
            }],
        };
        assert!(matches!(bad_hash.encode(), Err(ProtocolError::BadHashLength(3))));
    }

    #[tokio::test]
    async fn frames_stream_in_order() {
        let mut buf = Vec::new();
        write_message(&mut buf, &Message::Ping).await.unwrap();
        let req = Message::FileRequest {
            folder_id: 3,
            kind: DiffKind::Full,
            name: "a".into(),
        };
        write_message(&mut buf, &req).await.unwrap();

        let mut cursor = &buf[..];
        assert_eq!(read_message(&mut cursor).await.unwrap(), Message::Ping);
        assert_eq!(read_message(&mut cursor).await.unwrap(), req);
        assert!(matches!(
            read_message(&mut cursor).await,
            Err(ProtocolError::Closed)
        ));
    }

    #[tokio::test]
    async fn short_read_mid_frame() {
        let frame = Message::FileChunk {
            folder_id: 1,
            name: "a".into(),
            data: vec![1, 2, 3],
        }
        .encode()
        .unwrap();

        let mut cut = &frame[..frame.len() - 1];
        assert!(matches!(
            read_frame(&mut cut).await,
            Err(ProtocolError::ShortRead)
        ));

        let mut cut_len = &frame[..2];
        assert!(matches!(
            read_frame(&mut cut_len).await,
            Err(ProtocolError::ShortRead)
        ));
    }

    #[tokio::test]
    async fn oversized_length_is_rejected_before_allocation() {
        let bytes = ((MAX_FRAME_LEN + 1) as u32).to_be_bytes();
        let mut cursor = &bytes[..];
        assert!(matches!(
            read_frame(&mut cursor).await,
            Err(ProtocolError::FrameTooLarge(_))
        ));
    }
}
