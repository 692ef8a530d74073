use crate::{Rect, VncError};

use super::{DecodeContext, RectUpdate};

pub struct Decoder {}

impl Decoder {
    pub fn new() -> Self {
        Self {}
    }

    pub(crate) async fn decode(
        &mut self,
        ctx: &mut DecodeContext<'_>,
        rect: &Rect,
    ) -> Result<RectUpdate, VncError> {
        // +----------------------------+--------------+-------------+
        // | No. of bytes               | Type [Value] | Description |
        // +----------------------------+--------------+-------------+
        // | width*height*bytesPerPixel | PIXEL array  | pixels      |
        // +----------------------------+--------------+-------------+
        let mut pixels = ctx.acquire_pixels(rect)?;
        ctx.reader.read_into(&mut pixels).await?;
        Ok(RectUpdate::Pixels(pixels))
    }
}
