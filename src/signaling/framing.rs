//! Framing für den Control-Channel
//!
//! Geschrieben wird immer `u32` Big-Endian Länge + JSON über
//! `LengthDelimitedCodec`. Beim Lesen wird ein Frame, der mit `{` beginnt,
//! als Legacy-Nachricht ohne Längen-Header behandelt: gelesen wird, bis der
//! getrimmte Puffer auf `}` endet oder der Peer die Verbindung schließt.
//!
//! Pro Verbindung und Richtung wird genau ein Envelope übertragen.

use super::client::SignalingError;
use super::messages::{Envelope, ProtocolError};
use futures::{SinkExt, StreamExt};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec, LengthDelimitedCodecError};

/// Maximale Größe eines Envelopes
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// Lese-Chunk für Legacy-Frames
const LEGACY_CHUNK: usize = 1024;

fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .big_endian()
        .max_frame_length(MAX_FRAME_LEN)
        .new_codec()
}

/// Schreibt einen Envelope mit Längen-Header
pub async fn write_envelope<W>(writer: &mut W, envelope: &Envelope) -> Result<(), SignalingError>
where
    W: AsyncWrite + Unpin,
{
    let body = envelope.encode();
    if body.len() > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge.into());
    }

    let mut frames = FramedWrite::new(writer, codec());
    frames.send(Bytes::from(body)).await?;
    Ok(())
}

/// Liest genau einen Envelope
pub async fn read_envelope<R>(reader: &mut R) -> Result<Envelope, SignalingError>
where
    R: AsyncRead + Unpin,
{
    let first = reader.read_u8().await.map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed before any data")
        } else {
            e
        }
    })?;

    let envelope = if first == b'{' {
        Envelope::decode(&read_legacy_body(reader).await?)?
    } else {
        Envelope::decode(&read_prefixed_body(reader, first).await?)?
    };
    Ok(envelope)
}

async fn read_prefixed_body<R>(reader: &mut R, first: u8) -> Result<BytesMut, SignalingError>
where
    R: AsyncRead + Unpin,
{
    // Erstes Header-Byte ist schon gelesen
    let header = [first];
    let mut frames = FramedRead::new((&header[..]).chain(reader), codec());

    match frames.next().await {
        Some(Ok(body)) => Ok(body),
        Some(Err(e)) => Err(frame_error(e)),
        None => Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()),
    }
}

/// Längenfehler des Codecs als `FrameTooLarge`, alles andere als Transportfehler
fn frame_error(error: io::Error) -> SignalingError {
    let too_large = error
        .get_ref()
        .map(|inner| inner.is::<LengthDelimitedCodecError>())
        .unwrap_or(false);

    if too_large {
        ProtocolError::FrameTooLarge.into()
    } else {
        error.into()
    }
}

async fn read_legacy_body<R>(reader: &mut R) -> Result<Vec<u8>, SignalingError>
where
    R: AsyncRead + Unpin,
{
    let mut body = vec![b'{'];
    let mut chunk = [0u8; LEGACY_CHUNK];

    while !ends_with_closing_brace(&body) {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..n]);

        if body.len() > MAX_FRAME_LEN {
            return Err(ProtocolError::FrameTooLarge.into());
        }
    }

    Ok(body)
}

fn ends_with_closing_brace(buf: &[u8]) -> bool {
    buf.iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map(|i| buf[i] == b'}')
        .unwrap_or(false)
}
