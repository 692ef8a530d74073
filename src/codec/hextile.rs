use crate::{Rect, VncError};

use super::{fill_rect, DecodeContext, RectUpdate};

const RAW: u8 = 1;
const BACKGROUND_SPECIFIED: u8 = 2;
const FOREGROUND_SPECIFIED: u8 = 4;
const ANY_SUBRECTS: u8 = 8;
const SUBRECTS_COLOURED: u8 = 16;

const TILE_SIZE: usize = 16;

pub struct Decoder {
    background: Option<[u8; 4]>,
    foreground: Option<[u8; 4]>,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            background: None,
            foreground: None,
        }
    }

    pub(crate) async fn decode(
        &mut self,
        ctx: &mut DecodeContext<'_>,
        rect: &Rect,
    ) -> Result<RectUpdate, VncError> {
        let bpp = ctx.bytes_per_pixel();
        let (width, height) = (rect.width as usize, rect.height as usize);
        let stride = width;
        let mut pixels = ctx.acquire_pixels(rect)?;

        let mut y = 0;
        while y < height {
            let th = TILE_SIZE.min(height - y);
            let mut x = 0;
            while x < width {
                let tw = TILE_SIZE.min(width - x);

                // +--------------+--------------+---------------------+
                // | No. of bytes | Type [Value] | Description         |
                // +--------------+--------------+---------------------+
                // | 1            | U8           | subencoding-mask    |
                // +--------------+--------------+---------------------+
                let mask = ctx.reader.read_u8().await?;
                if mask & RAW != 0 {
                    for row in y..y + th {
                        let start = (row * stride + x) * bpp;
                        ctx.reader
                            .read_into(&mut pixels[start..start + tw * bpp])
                            .await?;
                    }
                    x += TILE_SIZE;
                    continue;
                }

                if mask & BACKGROUND_SPECIFIED != 0 {
                    self.background = Some(ctx.read_pixel().await?);
                }
                if mask & FOREGROUND_SPECIFIED != 0 {
                    self.foreground = Some(ctx.read_pixel().await?);
                }
                let background = self.background.ok_or_else(|| {
                    VncError::malformed(format!("hextile tile at {},{} without background", x, y))
                })?;
                fill_rect(&mut pixels, stride, bpp, x, y, tw, th, &background);

                if mask & ANY_SUBRECTS != 0 {
                    let count = ctx.reader.read_u8().await?;
                    for _ in 0..count {
                        let colour = if mask & SUBRECTS_COLOURED != 0 {
                            ctx.read_pixel().await?
                        } else {
                            self.foreground.ok_or_else(|| {
                                VncError::malformed("hextile sub-rectangle without foreground")
                            })?
                        };
                        // x, y in the high and low nibble, then width-1, height-1
                        let xy = ctx.reader.read_u8().await? as usize;
                        let wh = ctx.reader.read_u8().await? as usize;
                        let (sx, sy) = (xy >> 4, xy & 0xf);
                        let (sw, sh) = ((wh >> 4) + 1, (wh & 0xf) + 1);
                        if sx + sw > tw || sy + sh > th {
                            return Err(VncError::malformed(format!(
                                "hextile sub-rectangle {}x{}+{}+{} outside {}x{} tile",
                                sw, sh, sx, sy, tw, th
                            )));
                        }
                        fill_rect(&mut pixels, stride, bpp, x + sx, y + sy, sw, sh, &colour);
                    }
                }
                x += TILE_SIZE;
            }
            y += TILE_SIZE;
        }
        Ok(RectUpdate::Pixels(pixels))
    }
}
