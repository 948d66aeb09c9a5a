//! Exact-length reads used by every wire parser in the crate.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt};

/// Reads exactly `n` bytes into the front of `buf` and returns them.
///
/// Short reads are accumulated until `n` bytes are present. A stream that ends first
/// yields [`io::ErrorKind::UnexpectedEof`]; any other error from the stream is returned
/// as is.
pub async fn read_full<'a, R>(reader: &mut R, buf: &'a mut [u8], n: usize) -> io::Result<&'a [u8]>
where
    R: AsyncRead + Unpin + ?Sized,
{
    if buf.len() < n {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("frame of {} bytes does not fit a {} byte buffer", n, buf.len()),
        ));
    }

    let mut filled = 0;
    while filled < n {
        let read = reader.read(&mut buf[filled..n]).await?;
        if read == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("stream closed after {} of {} bytes", filled, n),
            ));
        }
        filled += read;
    }

    Ok(&buf[..n])
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::AsyncWriteExt;

    use super::*;

    #[tokio::test]
    async fn fragmented_delivery_matches_atomic_delivery() {
        let (mut reader, mut writer) = tokio::io::duplex(64);
        let feeder = tokio::spawn(async move {
            writer.write_all(b"abc").await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.write_all(b"12").await.unwrap();
            writer
        });

        let mut buf = [0u8; 100];
        let frame = read_full(&mut reader, &mut buf, 5).await.unwrap();
        assert_eq!(frame, b"abc12");

        let mut atomic: &[u8] = b"abc12";
        let mut other = [0u8; 5];
        assert_eq!(read_full(&mut atomic, &mut other, 5).await.unwrap(), frame);

        drop(feeder.await.unwrap());
        let err = read_full(&mut reader, &mut buf, 5).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn early_end_of_stream_fails() {
        let mut wire: &[u8] = &[0x05, 0x01];
        let mut buf = [0u8; 4];
        let err = read_full(&mut wire, &mut buf, 3).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn zero_length_frame_reads_nothing() {
        let mut wire: &[u8] = &[];
        let mut buf = [0u8; 1];
        assert!(read_full(&mut wire, &mut buf, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn frame_larger_than_buffer_is_rejected() {
        let mut wire: &[u8] = &[0; 8];
        let mut buf = [0u8; 4];
        let err = read_full(&mut wire, &mut buf, 8).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
