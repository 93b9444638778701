use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ProtoError;

pub const MAGIC: [u8; 4] = *b"SRVL";

/// Writes one length-framed MessagePack body: magic, u32 length, payload.
pub async fn write_frame_async<W: AsyncWrite + Unpin>(
    writer: &mut W,
    body: &[u8],
) -> Result<(), ProtoError> {
    let body_len = u32::try_from(body.len())
        .map_err(|_| ProtoError::Oversized(body.len()))?;

    writer.write_all(&MAGIC).await?;
    writer.write_all(&body_len.to_be_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one framed body, enforcing the magic and the frame size limit.
pub async fn read_frame_async<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_frame_bytes: usize,
) -> Result<Vec<u8>, ProtoError> {
    let mut magic = [0_u8; 4];
    reader.read_exact(&mut magic).await?;
    if magic != MAGIC {
        return Err(ProtoError::InvalidMagic);
    }

    let mut len_buf = [0_u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let body_len = u32::from_be_bytes(len_buf) as usize;
    if body_len > max_frame_bytes {
        return Err(ProtoError::Oversized(body_len));
    }

    let mut body = vec![0_u8; body_len];
    reader.read_exact(&mut body).await?;
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::{read_frame_async, write_frame_async};
    use crate::error::ProtoError;

    #[tokio::test]
    async fn frames_round_trip_over_a_duplex_pipe() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        write_frame_async(&mut client, b"payload").await.expect("write");
        let body =
            read_frame_async(&mut server, 1024).await.expect("read frame");
        assert_eq!(body, b"payload");
    }

    #[tokio::test]
    async fn bad_magic_is_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        tokio::io::AsyncWriteExt::write_all(&mut client, b"NOPE\x00\x00\x00\x00")
            .await
            .expect("write");
        let err =
            read_frame_async(&mut server, 64).await.expect_err("magic check");
        assert!(matches!(err, ProtoError::InvalidMagic));
    }

    #[tokio::test]
    async fn oversized_frames_are_rejected_before_allocation() {
        let (mut client, mut server) = tokio::io::duplex(64);
        tokio::io::AsyncWriteExt::write_all(
            &mut client,
            &[b'S', b'R', b'V', b'L', 0xff, 0xff, 0xff, 0xff],
        )
        .await
        .expect("write");
        let err = read_frame_async(&mut server, 1024)
            .await
            .expect_err("size check");
        assert!(matches!(err, ProtoError::Oversized(_)));
    }
}
