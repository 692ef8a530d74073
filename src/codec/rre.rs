use crate::{Rect, VncError};
use tracing::trace;

use super::{fill_rect, DecodeContext, RectUpdate};

/// RRE, or CoRRE when `compact` is set
pub struct Decoder {
    compact: bool,
}

impl Decoder {
    pub fn new(compact: bool) -> Self {
        Self { compact }
    }

    async fn read_coord(&self, ctx: &mut DecodeContext<'_>) -> Result<usize, VncError> {
        Ok(if self.compact {
            ctx.reader.read_u8().await? as usize
        } else {
            ctx.reader.read_u16().await? as usize
        })
    }

    pub(crate) async fn decode(
        &mut self,
        ctx: &mut DecodeContext<'_>,
        rect: &Rect,
    ) -> Result<RectUpdate, VncError> {
        // +---------------+--------------+-------------------------+
        // | No. of bytes  | Type [Value] | Description             |
        // +---------------+--------------+-------------------------+
        // | 4             | U32          | number-of-subrectangles |
        // | bytesPerPixel | PIXEL        | background-pixel-value  |
        // +---------------+--------------+-------------------------+
        //
        // followed by number-of-subrectangles of
        //
        // +---------------+--------------+---------------------+
        // | bytesPerPixel | PIXEL        | subrect-pixel-value |
        // | 2 (1 CoRRE)   | U16 (U8)     | x-position          |
        // | 2 (1 CoRRE)   | U16 (U8)     | y-position          |
        // | 2 (1 CoRRE)   | U16 (U8)     | width               |
        // | 2 (1 CoRRE)   | U16 (U8)     | height              |
        // +---------------+--------------+---------------------+
        let count = ctx.reader.read_u32().await?;
        if count as u64 > rect.area() {
            return Err(VncError::malformed(format!(
                "{} sub-rectangles in a {}x{} rectangle",
                count, rect.width, rect.height
            )));
        }
        let bpp = ctx.bytes_per_pixel();
        let stride = rect.width as usize;
        let background = ctx.read_pixel().await?;

        let mut pixels = ctx.acquire_pixels(rect)?;
        for dst in pixels.chunks_exact_mut(bpp) {
            dst.copy_from_slice(&background[..bpp]);
        }

        trace!("RRE {} sub-rectangles", count);
        for _ in 0..count {
            let pixel = ctx.read_pixel().await?;
            let x = self.read_coord(ctx).await?;
            let y = self.read_coord(ctx).await?;
            let w = self.read_coord(ctx).await?;
            let h = self.read_coord(ctx).await?;
            if x + w > rect.width as usize || y + h > rect.height as usize {
                return Err(VncError::malformed(format!(
                    "sub-rectangle {}x{}+{}+{} outside {}x{}",
                    w, h, x, y, rect.width, rect.height
                )));
            }
            fill_rect(&mut pixels, stride, bpp, x, y, w, h, &pixel);
        }
        Ok(RectUpdate::Pixels(pixels))
    }
}
