//! Every message that crosses the socket boundary, plus the framing that
//! carries it.
//!
//! Frames are a `u32` big-endian length followed by a MessagePack body.
//! Clients send [`ClientFrame`]s, the server answers with [`ServerFrame`]s.

use futures::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_derive::{Deserialize, Serialize};
use std::io;

/// Refuse frames bigger than this; nothing in the protocol comes close.
const MAX_FRAME_LEN: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    Overheard,
    Emote,
    Whisper,
    Print,
}

/// A single observable happening, streamed to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorldEvent {
    pub kind: EventKind,
    /// Display name of the speaker or actor, when there is one.
    pub source: Option<String>,
    pub text: Option<String>,
}

impl WorldEvent {
    pub fn overheard(source: Option<String>, text: impl Into<String>) -> Self {
        WorldEvent {
            kind: EventKind::Overheard,
            source,
            text: Some(text.into()),
        }
    }

    pub fn emote(source: impl Into<String>, text: impl Into<String>) -> Self {
        WorldEvent {
            kind: EventKind::Emote,
            source: Some(source.into()),
            text: Some(text.into()),
        }
    }

    pub fn whisper(text: impl Into<String>) -> Self {
        WorldEvent {
            kind: EventKind::Whisper,
            source: None,
            text: Some(text.into()),
        }
    }

    pub fn print(text: impl Into<String>) -> Self {
        WorldEvent {
            kind: EventKind::Print,
            source: None,
            text: Some(text.into()),
        }
    }
}

/// A verb typed by a user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub verb: String,
    pub rest: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ping {
    pub when: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pong {
    pub when: String,
    pub delta: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientFrame {
    Command(Command),
    Ping(Ping),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerFrame {
    Event(WorldEvent),
    Pong(Pong),
}

pub async fn write_frame<W, T>(writer: &mut W, payload: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = rmp_serde::to_vec_named(payload)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    if body.len() > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "frame too large",
        ));
    }
    let len = (body.len() as u32).to_be_bytes();
    writer.write_all(&len).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one frame. `Ok(None)` means the peer closed the stream.
pub async fn read_frame<R, T>(reader: &mut R) -> io::Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "frame too large",
        ));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    let payload = rmp_serde::from_read_ref(&body)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    Ok(Some(payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[async_std::test]
    async fn frames_survive_the_wire() {
        let mut wire: Vec<u8> = Vec::new();
        let frame = ClientFrame::Command(Command {
            verb: "say".to_owned(),
            rest: "hello".to_owned(),
        });
        write_frame(&mut wire, &frame).await.unwrap();

        let mut reader = &wire[..];
        let decoded: ClientFrame = read_frame(&mut reader).await.unwrap().unwrap();
        assert_eq!(decoded, frame);

        // a second read on the drained buffer is a clean EOF
        let eof: Option<ClientFrame> = read_frame(&mut reader).await.unwrap();
        assert!(eof.is_none());
    }

    #[async_std::test]
    async fn oversized_frames_are_refused() {
        let mut wire: Vec<u8> = Vec::new();
        wire.extend_from_slice(&(u32::MAX).to_be_bytes());
        let mut reader = &wire[..];
        let res: io::Result<Option<ClientFrame>> = read_frame(&mut reader).await;
        assert!(res.is_err());
    }
}
