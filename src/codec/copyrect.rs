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
        _rect: &Rect,
    ) -> Result<RectUpdate, VncError> {
        // +--------------+--------------+----------------+
        // | No. of bytes | Type [Value] | Description    |
        // +--------------+--------------+----------------+
        // | 2            | U16          | src-x-position |
        // | 2            | U16          | src-y-position |
        // +--------------+--------------+----------------+
        let src_x = ctx.reader.read_u16().await?;
        let src_y = ctx.reader.read_u16().await?;
        Ok(RectUpdate::Copy { src_x, src_y })
    }
}
