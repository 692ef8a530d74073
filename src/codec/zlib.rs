use flate2::{Decompress, FlushDecompress, Status};
use std::sync::Arc;
use tracing::trace;

use crate::{
    config::{INFLATE_CHUNK_SIZE, INFLATE_INITIAL_SIZE, MAX_COMPRESSED_LEN},
    pool::{BufferOptions, BufferPool, PooledBuffer},
    Rect, VncError,
};

use super::{DecodeContext, RectUpdate};

/// A zlib stream that spans every rectangle of one encoding on a connection
///
/// The server never resets its deflater, each rectangle continues the stream
/// (and its dictionary) where the previous one stopped.
pub(crate) struct InflateStream {
    inner: Decompress,
}

impl InflateStream {
    pub fn new() -> Self {
        Self {
            inner: Decompress::new(true),
        }
    }

    /// Inflate all of `input`, growing the output until the inflater is drained
    pub fn inflate(
        &mut self,
        input: &[u8],
        pool: &Arc<BufferPool>,
    ) -> Result<PooledBuffer, VncError> {
        let mut out = pool.acquire(
            INFLATE_INITIAL_SIZE,
            BufferOptions::ALLOCATE | BufferOptions::GROW,
        )?;
        let mut consumed = 0;
        let mut produced = 0;
        loop {
            if produced == out.len() {
                out.resize(produced + INFLATE_CHUNK_SIZE);
            }
            let in_before = self.inner.total_in();
            let out_before = self.inner.total_out();
            let status = self
                .inner
                .decompress(
                    &input[consumed..],
                    &mut out[produced..],
                    FlushDecompress::Sync,
                )
                .map_err(|e| VncError::Inflate(e.to_string()))?;
            let used = (self.inner.total_in() - in_before) as usize;
            let made = (self.inner.total_out() - out_before) as usize;
            consumed += used;
            produced += made;

            if status == Status::StreamEnd {
                return Err(VncError::Inflate("zlib stream ended".to_string()));
            }
            // all input taken and room left over: nothing is pending inside
            if consumed == input.len() && produced < out.len() {
                break;
            }
            if used == 0 && made == 0 {
                return Err(VncError::Inflate(format!(
                    "no progress with {} bytes left",
                    input.len() - consumed
                )));
            }
        }
        trace!("Inflated {} bytes into {}", input.len(), produced);
        out.truncate(produced);
        Ok(out)
    }
}

/// Read the length-prefixed compressed payload of a rectangle
pub(super) async fn read_compressed(ctx: &mut DecodeContext<'_>) -> Result<PooledBuffer, VncError> {
    // +--------------+--------------+-------------+
    // | No. of bytes | Type [Value] | Description |
    // +--------------+--------------+-------------+
    // | 4            | U32          | length      |
    // | length       | U8 array     | zlibData    |
    // +--------------+--------------+-------------+
    let len = ctx.reader.read_u32().await? as usize;
    if len > MAX_COMPRESSED_LEN {
        return Err(VncError::malformed(format!("compressed payload of {} bytes", len)));
    }
    let mut data = ctx.acquire(len)?;
    ctx.reader.read_into(&mut data).await?;
    Ok(data)
}

pub struct Decoder {
    stream: InflateStream,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            stream: InflateStream::new(),
        }
    }

    pub(crate) async fn decode(
        &mut self,
        ctx: &mut DecodeContext<'_>,
        rect: &Rect,
    ) -> Result<RectUpdate, VncError> {
        let compressed = read_compressed(ctx).await?;
        let pixels = self.stream.inflate(&compressed, ctx.pool)?;
        drop(compressed);

        let expected = rect.area() as usize * ctx.bytes_per_pixel();
        if pixels.len() != expected {
            return Err(VncError::malformed(format!(
                "zlib rectangle {}x{} inflated to {} bytes, expected {}",
                rect.width,
                rect.height,
                pixels.len(),
                expected
            )));
        }
        Ok(RectUpdate::Pixels(pixels))
    }
}
