use tracing::{error, trace};

use crate::{PixelFormat, Rect, VncError};

use super::{
    fill_rect,
    zlib::{read_compressed, InflateStream},
    DecodeContext, RectUpdate,
};

const TILE_SIZE: usize = 64;

/// A view over the inflated payload
struct ByteCursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteCursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], VncError> {
        let end = self.pos + n;
        if end > self.data.len() {
            return Err(VncError::malformed(format!(
                "zrle data truncated at {} of {}",
                self.pos,
                self.data.len()
            )));
        }
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8, VncError> {
        Ok(self.take(1)?[0])
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// 1 + the sum of bytes up to and including the first one below 255
    fn read_run_length(&mut self) -> Result<usize, VncError> {
        let mut run = 1;
        loop {
            let part = self.read_u8()?;
            run += part as usize;
            if part != 255 {
                return Ok(run);
            }
        }
    }
}

/// How a compressed pixel maps onto a full pixel
#[derive(Debug, Clone, Copy)]
struct CPixel {
    bpp: usize,
    len: usize,
    /// the dropped byte comes first in memory
    pad_first: bool,
}

impl CPixel {
    fn new(format: &PixelFormat) -> Self {
        let bpp = format.bytes_per_pixel();
        // 32 bit true colour with all channels in either the low or the high
        // three bytes travels as three bytes
        if bpp == 4 && format.is_true_color() && format.depth <= 24 {
            let mask = format.color_mask();
            if mask & 0xff00_0000 == 0 {
                return Self {
                    bpp,
                    len: 3,
                    pad_first: format.is_big_endian(),
                };
            }
            if mask & 0x0000_00ff == 0 {
                return Self {
                    bpp,
                    len: 3,
                    pad_first: !format.is_big_endian(),
                };
            }
        }
        Self {
            bpp,
            len: bpp,
            pad_first: false,
        }
    }

    fn read(&self, cursor: &mut ByteCursor) -> Result<[u8; 4], VncError> {
        let mut pixel = [0xff; 4];
        let offset = if self.pad_first && self.len < self.bpp { 1 } else { 0 };
        pixel[offset..offset + self.len].copy_from_slice(cursor.take(self.len)?);
        Ok(pixel)
    }
}

/// Writes the pixels of one tile in raster order
struct TileWriter<'a> {
    out: &'a mut [u8],
    stride: usize,
    bpp: usize,
    x: usize,
    y: usize,
    width: usize,
    count: usize,
    written: usize,
}

impl TileWriter<'_> {
    fn push(&mut self, pixel: &[u8], run: usize) -> Result<(), VncError> {
        if self.written + run > self.count {
            return Err(VncError::malformed(format!(
                "zrle run of {} overflows a {} pixel tile",
                run, self.count
            )));
        }
        for _ in 0..run {
            let px = self.x + self.written % self.width;
            let py = self.y + self.written / self.width;
            let start = (py * self.stride + px) * self.bpp;
            self.out[start..start + self.bpp].copy_from_slice(&pixel[..self.bpp]);
            self.written += 1;
        }
        Ok(())
    }

    fn is_full(&self) -> bool {
        self.written == self.count
    }
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
        let data = self.stream.inflate(&compressed, ctx.pool)?;
        drop(compressed);

        let mut pixels = ctx.acquire_pixels(rect)?;
        let mut cursor = ByteCursor::new(&data);
        decode_tiles(&mut cursor, &mut pixels, rect, ctx.format)?;
        if cursor.remaining() != 0 {
            return Err(VncError::malformed(format!(
                "{} bytes left after the last zrle tile",
                cursor.remaining()
            )));
        }
        Ok(RectUpdate::Pixels(pixels))
    }
}

fn decode_tiles(
    cursor: &mut ByteCursor,
    out: &mut [u8],
    rect: &Rect,
    format: &PixelFormat,
) -> Result<(), VncError> {
    let cpixel = CPixel::new(format);
    let bpp = format.bytes_per_pixel();
    let (width, height) = (rect.width as usize, rect.height as usize);
    let stride = width;
    let mut palette: Vec<[u8; 4]> = Vec::with_capacity(127);

    let mut y = 0;
    while y < height {
        let th = TILE_SIZE.min(height - y);
        let mut x = 0;
        while x < width {
            let tw = TILE_SIZE.min(width - x);
            let mut tile = TileWriter {
                out: &mut *out,
                stride,
                bpp,
                x,
                y,
                width: tw,
                count: tw * th,
                written: 0,
            };

            let subencoding = cursor.read_u8()?;
            trace!("ZRLE tile {},{} subencoding {}", x, y, subencoding);
            palette.clear();
            match subencoding {
                0 => {
                    while !tile.is_full() {
                        tile.push(&cpixel.read(cursor)?, 1)?;
                    }
                }
                1 => {
                    let pixel = cpixel.read(cursor)?;
                    fill_rect(tile.out, stride, bpp, x, y, tw, th, &pixel);
                }
                2..=16 => {
                    for _ in 0..subencoding {
                        palette.push(cpixel.read(cursor)?);
                    }
                    let bits = match subencoding {
                        2 => 1,
                        3..=4 => 2,
                        _ => 4,
                    };
                    let mask = (1u8 << bits) - 1;
                    // every row starts on a byte boundary
                    let row_len = (tw * bits + 7) / 8;
                    for _ in 0..th {
                        let row = cursor.take(row_len)?;
                        for col in 0..tw {
                            let bit = col * bits;
                            let index = (row[bit / 8] >> (8 - bits - bit % 8)) & mask;
                            let pixel = palette.get(index as usize).ok_or_else(|| {
                                VncError::malformed(format!(
                                    "palette index {} of {}",
                                    index, subencoding
                                ))
                            })?;
                            tile.push(pixel, 1)?;
                        }
                    }
                }
                128 => {
                    while !tile.is_full() {
                        let pixel = cpixel.read(cursor)?;
                        let run = cursor.read_run_length()?;
                        tile.push(&pixel, run)?;
                    }
                }
                130..=255 => {
                    let size = subencoding as usize - 128;
                    for _ in 0..size {
                        palette.push(cpixel.read(cursor)?);
                    }
                    while !tile.is_full() {
                        let control = cursor.read_u8()?;
                        let index = (control & 0x7f) as usize;
                        let run = if control & 0x80 != 0 {
                            cursor.read_run_length()?
                        } else {
                            1
                        };
                        let pixel = palette.get(index).ok_or_else(|| {
                            VncError::malformed(format!("palette index {} of {}", index, size))
                        })?;
                        tile.push(pixel, run)?;
                    }
                }
                other => {
                    error!("ZRLE subencoding error {}", other);
                    return Err(VncError::malformed(format!(
                        "invalid zrle subencoding {}",
                        other
                    )));
                }
            }
            x += TILE_SIZE;
        }
        y += TILE_SIZE;
    }
    Ok(())
}
