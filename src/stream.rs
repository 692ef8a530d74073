//! Resumable reads over a stream of byte chunks.
//!
//! The network task pushes whatever each socket read returned through a
//! [StreamFeeder]. The decoding side asks a [StreamReader] for exactly N bytes;
//! if fewer are buffered the request is suspended (not blocked) and picks up
//! where it stopped once more chunks arrive. Bytes already received but not
//! yet consumed stay in the reader, so a request may span any number of chunks
//! and a chunk may satisfy any number of requests.

use bytes::{Buf, Bytes, BytesMut};
use futures::StreamExt;
use std::io;
use tokio::sync::mpsc::{self, Permit};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::VncError;

type Chunk = io::Result<Bytes>;

/// Create a connected feeder/reader pair
///
/// `capacity` bounds the number of chunks in flight, `cancel` is the
/// connection's terminating flag.
pub fn channel(capacity: usize, cancel: CancellationToken) -> (StreamFeeder, StreamReader) {
    let (tx, rx) = mpsc::channel(capacity);
    (
        StreamFeeder { tx },
        StreamReader {
            chunks: ReceiverStream::new(rx),
            pending: BytesMut::new(),
            consumed: 0,
            cancel,
        },
    )
}

/// The writing half, owned by the I/O side
///
/// Dropping every feeder ends the stream, which the reader reports as an
/// unexpected EOF.
#[derive(Debug, Clone)]
pub struct StreamFeeder {
    tx: mpsc::Sender<Chunk>,
}

impl StreamFeeder {
    pub async fn feed(&self, bytes: impl Into<Bytes>) -> Result<(), VncError> {
        self.tx.send(Ok(bytes.into())).await?;
        Ok(())
    }

    /// Forward a transport failure, the reader will fail with it
    pub async fn fail(&self, err: io::Error) -> Result<(), VncError> {
        self.tx.send(Err(err)).await?;
        Ok(())
    }

    pub(crate) async fn reserve(&self) -> Result<Permit<'_, Chunk>, VncError> {
        self.tx
            .reserve()
            .await
            .map_err(|_| VncError::ClientNotRunning)
    }
}

pub struct StreamReader {
    chunks: ReceiverStream<Chunk>,
    pending: BytesMut,
    consumed: u64,
    cancel: CancellationToken,
}

impl StreamReader {
    /// Wait until at least `n` bytes are buffered
    async fn fill(&mut self, n: usize) -> Result<(), VncError> {
        if self.cancel.is_cancelled() {
            return Err(VncError::ClientNotRunning);
        }
        while self.pending.len() < n {
            let chunk = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(VncError::ClientNotRunning),
                chunk = self.chunks.next() => chunk,
            };
            match chunk {
                Some(Ok(bytes)) => self.pending.extend_from_slice(&bytes),
                Some(Err(e)) => return Err(e.into()),
                None => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("expected {} bytes, got {}", n, self.pending.len()),
                    )
                    .into())
                }
            }
        }
        Ok(())
    }

    pub async fn read_u8(&mut self) -> Result<u8, VncError> {
        self.fill(1).await?;
        self.consumed += 1;
        Ok(self.pending.get_u8())
    }

    pub async fn read_u16(&mut self) -> Result<u16, VncError> {
        self.fill(2).await?;
        self.consumed += 2;
        Ok(self.pending.get_u16())
    }

    pub async fn read_u32(&mut self) -> Result<u32, VncError> {
        self.fill(4).await?;
        self.consumed += 4;
        Ok(self.pending.get_u32())
    }

    pub async fn read_i32(&mut self) -> Result<i32, VncError> {
        self.fill(4).await?;
        self.consumed += 4;
        Ok(self.pending.get_i32())
    }

    pub async fn read_array<const N: usize>(&mut self) -> Result<[u8; N], VncError> {
        self.fill(N).await?;
        let mut out = [0; N];
        self.pending.copy_to_slice(&mut out);
        self.consumed += N as u64;
        Ok(out)
    }

    pub async fn read_bytes(&mut self, n: usize) -> Result<Bytes, VncError> {
        self.fill(n).await?;
        self.consumed += n as u64;
        Ok(self.pending.split_to(n).freeze())
    }

    /// Fill `buf` completely
    ///
    /// Copies chunk by chunk, so large payloads are never buffered twice.
    pub async fn read_into(&mut self, buf: &mut [u8]) -> Result<(), VncError> {
        let mut filled = 0;
        while filled < buf.len() {
            if self.pending.is_empty() {
                self.fill(1).await?;
            }
            let n = self.pending.len().min(buf.len() - filled);
            self.pending.copy_to_slice(&mut buf[filled..filled + n]);
            filled += n;
            self.consumed += n as u64;
        }
        Ok(())
    }

    pub async fn skip(&mut self, mut n: usize) -> Result<(), VncError> {
        while n > 0 {
            if self.pending.is_empty() {
                self.fill(1).await?;
            }
            let step = self.pending.len().min(n);
            self.pending.advance(step);
            self.consumed += step as u64;
            n -= step;
        }
        Ok(())
    }

    /// Total bytes handed out so far
    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    /// Bytes received but not consumed yet
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use proptest::prelude::*;

    /// A reader already fed with `data` and closed afterwards
    pub(crate) fn reader_with(data: Vec<u8>) -> StreamReader {
        let (feeder, reader) = channel(4, CancellationToken::new());
        tokio::spawn(async move {
            let _ = feeder.feed(data).await;
        });
        reader
    }

    async fn collect(chunks: Vec<Vec<u8>>, total: usize) -> Vec<u8> {
        let (feeder, mut reader) = channel(2, CancellationToken::new());
        tokio::spawn(async move {
            for chunk in chunks {
                feeder.feed(chunk).await.unwrap();
            }
        });
        let head = reader.read_u8().await.unwrap();
        let mut rest = vec![0; total - 1];
        reader.read_into(&mut rest).await.unwrap();
        let mut out = vec![head];
        out.extend(rest);
        out
    }

    #[tokio::test]
    async fn single_byte_chunks() {
        let data: Vec<u8> = (0..=255).collect();
        let chunks = data.iter().map(|b| vec![*b]).collect();
        assert_eq!(collect(chunks, data.len()).await, data);
    }

    #[tokio::test]
    async fn typed_reads_span_chunks() {
        let (feeder, mut reader) = channel(8, CancellationToken::new());
        tokio::spawn(async move {
            for chunk in [&[0x12_u8][..], &[0x34, 0xff], &[0xff, 0xff], &[0xfe, 9]] {
                feeder.feed(chunk.to_vec()).await.unwrap();
            }
        });
        assert_eq!(reader.read_u16().await.unwrap(), 0x1234);
        assert_eq!(reader.read_i32().await.unwrap(), -2);
        assert_eq!(reader.read_u8().await.unwrap(), 9);
        assert_eq!(reader.consumed(), 7);
    }

    #[tokio::test]
    async fn end_of_stream_is_an_io_error() {
        let mut reader = reader_with(vec![1, 2]);
        let err = reader.read_u32().await.unwrap_err();
        match err {
            VncError::IoError(e) => assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn transport_errors_are_forwarded() {
        let (feeder, mut reader) = channel(2, CancellationToken::new());
        feeder
            .fail(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
            .await
            .unwrap();
        let err = reader.read_u8().await.unwrap_err();
        assert!(err.is_terminal());
    }

    #[tokio::test]
    async fn cancellation_wakes_a_suspended_read() {
        let cancel = CancellationToken::new();
        let (_feeder, mut reader) = channel(2, cancel.clone());
        let pending = tokio::spawn(async move { reader.read_u8().await });
        tokio::task::yield_now().await;
        cancel.cancel();
        assert!(matches!(
            pending.await.unwrap(),
            Err(VncError::ClientNotRunning)
        ));
    }

    proptest! {
        #[test]
        fn fragmentation_does_not_change_the_bytes(
            data in proptest::collection::vec(any::<u8>(), 1..512),
            cuts in proptest::collection::vec(1usize..32, 1..64),
        ) {
            let mut chunks = Vec::new();
            let mut rest = &data[..];
            let mut cut = cuts.iter().cycle();
            while !rest.is_empty() {
                let n = (*cut.next().unwrap()).min(rest.len());
                chunks.push(rest[..n].to_vec());
                rest = &rest[n..];
            }
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let whole = rt.block_on(collect(vec![data.clone()], data.len()));
            let pieces = rt.block_on(collect(chunks, data.len()));
            prop_assert_eq!(&whole, &data);
            prop_assert_eq!(&pieces, &data);
        }
    }
}
