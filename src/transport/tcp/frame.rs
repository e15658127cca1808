use std::io::ErrorKind;

use anyhow::anyhow;
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::CourierError;
use crate::messaging::dto::Payload;

/// Writes a single payload as `[u32 LE length][payload]`
pub async fn write_frame<W: AsyncWrite + Unpin + ?Sized>(writer: &mut W, payload: &Payload, max_frame_length: usize) -> anyhow::Result<()> {
    let mut buf = BytesMut::new();
    payload.ser(&mut buf);
    if buf.len() > max_frame_length {
        return Err(CourierError::FrameTooLarge { len: buf.len(), max: max_frame_length }.into());
    }

    writer.write_all(&(buf.len() as u32).to_le_bytes()).await?;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

#[derive(Debug)]
pub enum Frame {
    Payload(Payload),
    /// The frame was read completely, but its content could not be decoded. The stream is still
    ///  positioned at the start of the next frame.
    Malformed(anyhow::Error),
}

impl Frame {
    pub fn into_payload(self) -> anyhow::Result<Payload> {
        match self {
            Frame::Payload(p) => Ok(p),
            Frame::Malformed(e) => Err(e),
        }
    }
}

/// Reads a single frame. Returns `None` if the stream ends cleanly before a new frame starts.
///  Errors leave the stream in an undefined position.
pub async fn read_frame<R: AsyncRead + Unpin + ?Sized>(reader: &mut R, max_frame_length: usize) -> anyhow::Result<Option<Frame>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let frame_len = u32::from_le_bytes(len_buf) as usize;
    if frame_len > max_frame_length {
        return Err(CourierError::FrameTooLarge { len: frame_len, max: max_frame_length }.into());
    }

    let mut frame = vec![0u8; frame_len];
    reader.read_exact(&mut frame).await?;

    Ok(Some(decode_frame(&frame)))
}

fn decode_frame(mut buf: &[u8]) -> Frame {
    match Payload::try_deser(&mut buf) {
        Ok(_) if !buf.is_empty() => Frame::Malformed(anyhow!("{} trailing bytes in frame", buf.len())),
        Ok(payload) => Frame::Payload(payload),
        Err(e) => Frame::Malformed(e),
    }
}
