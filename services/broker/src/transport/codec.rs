// TCP frame/envelope encoding and decoding helpers with size limits.
use anyhow::{Context, Result, anyhow};
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use trellis_wire::{Decoded, Envelope, Frame, FrameHeader};

// Read one envelope; `None` on a clean close between frames.
pub async fn read_envelope<R>(
    recv: &mut R,
    max_frame_bytes: usize,
    frame_scratch: &mut BytesMut,
) -> Result<Option<Decoded>>
where
    R: AsyncRead + Unpin,
{
    let frame = match read_frame_limited_into(recv, max_frame_bytes, frame_scratch).await? {
        Some(frame) => frame,
        None => return Ok(None),
    };
    Envelope::decode(frame).map(Some).context("decode envelope")
}

pub async fn write_envelope<W>(send: &mut W, envelope: &Envelope) -> Result<usize>
where
    W: AsyncWrite + Unpin,
{
    let frame = envelope.encode().context("encode envelope")?;
    write_frame(send, &frame).await?;
    Ok(FrameHeader::LEN + frame.payload.len())
}

// Low-level frame reader with a max payload cap.
pub async fn read_frame_limited_into<R>(
    recv: &mut R,
    max_payload_bytes: usize,
    scratch: &mut BytesMut,
) -> Result<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    let mut header_bytes = [0u8; FrameHeader::LEN];
    match recv.read_exact(&mut header_bytes).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err).context("read frame header"),
    }

    let header = FrameHeader::decode(Bytes::copy_from_slice(&header_bytes))
        .context("decode frame header")?;
    let length = usize::try_from(header.length).context("frame length")?;
    if length > max_payload_bytes {
        return Err(anyhow!(
            "frame length {length} exceeds max_payload_bytes {max_payload_bytes}"
        ));
    }
    scratch.clear();
    scratch.resize(length, 0u8);
    recv.read_exact(&mut scratch[..])
        .await
        .context("read frame payload")?;
    metrics::counter!("trellis_frames_in_total").increment(1);
    metrics::counter!("trellis_bytes_in_total").increment((FrameHeader::LEN + length) as u64);
    Ok(Some(Frame {
        header,
        payload: scratch.split().freeze(),
    }))
}

pub async fn write_frame<W>(send: &mut W, frame: &Frame) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    send.write_all(&frame.encode())
        .await
        .context("write frame")?;
    metrics::counter!("trellis_frames_out_total").increment(1);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_wire::{Request, Response, StreamStatus};

    #[tokio::test]
    async fn envelope_survives_a_duplex_pipe() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let envelope = Envelope {
            msg: Some(3),
            ..Envelope::with_requests(vec![Request::List {
                rid: 1,
                path: "/downstream/plc".to_string(),
            }])
        };
        write_envelope(&mut client, &envelope).await.expect("write");
        drop(client);

        let mut scratch = BytesMut::new();
        let decoded = read_envelope(&mut server, 1024, &mut scratch)
            .await
            .expect("read")
            .expect("envelope");
        assert_eq!(decoded.envelope, envelope);
        assert!(
            read_envelope(&mut server, 1024, &mut scratch)
                .await
                .expect("eof")
                .is_none()
        );
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let big = Envelope::with_responses(vec![Response::new(
            1,
            Some(StreamStatus::Open),
            vec![serde_json::json!(["name", "x".repeat(512)])],
        )]);
        write_envelope(&mut client, &big).await.expect("write");

        let mut scratch = BytesMut::new();
        let err = read_envelope(&mut server, 64, &mut scratch)
            .await
            .expect_err("too large");
        assert!(err.to_string().contains("exceeds max_payload_bytes"));
    }

    #[tokio::test]
    async fn truncated_payload_is_an_error() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let frame = Envelope::ack_only(1).encode().expect("encode");
        let bytes = frame.encode();
        client
            .write_all(&bytes[..bytes.len() - 2])
            .await
            .expect("write");
        drop(client);

        let mut scratch = BytesMut::new();
        let err = read_envelope(&mut server, 1024, &mut scratch)
            .await
            .expect_err("truncated");
        assert!(format!("{err:#}").contains("read frame payload"));
    }
}
