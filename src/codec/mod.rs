//! Rectangle decoders, one per encoding tag.
//!
//! Every decoder reads the body of a single rectangle through the
//! [StreamReader] and hands back a [RectUpdate]. Pixel results are always
//! `width * height` pixels in the negotiated [PixelFormat], row major.

mod copyrect;
mod cursor;
mod hextile;
mod raw;
mod rre;
mod zlib;
mod zrle;

use std::sync::Arc;

use crate::{
    pool::{BufferOptions, BufferPool, PooledBuffer},
    stream::StreamReader,
    CursorImage, PixelFormat, Rect, VncEncoding, VncError,
};

/// Everything a decoder needs besides its own state
pub(crate) struct DecodeContext<'a> {
    pub reader: &'a mut StreamReader,
    pub format: &'a PixelFormat,
    pub pool: &'a Arc<BufferPool>,
    pub options: BufferOptions,
}

impl DecodeContext<'_> {
    pub fn bytes_per_pixel(&self) -> usize {
        self.format.bytes_per_pixel()
    }

    pub fn acquire(&self, length: usize) -> Result<PooledBuffer, VncError> {
        self.pool.acquire(length, self.options)
    }

    /// A buffer sized for the pixels of `rect`
    pub fn acquire_pixels(&self, rect: &Rect) -> Result<PooledBuffer, VncError> {
        self.acquire(rect.area() as usize * self.bytes_per_pixel())
    }

    /// Read one pixel, only the first `bytes_per_pixel` bytes are meaningful
    pub async fn read_pixel(&mut self) -> Result<[u8; 4], VncError> {
        let mut pixel = [0; 4];
        let bpp = self.bytes_per_pixel();
        self.reader.read_into(&mut pixel[..bpp]).await?;
        Ok(pixel)
    }
}

/// The result of decoding one rectangle body
#[derive(Debug)]
pub(crate) enum RectUpdate {
    Pixels(PooledBuffer),
    Copy { src_x: u16, src_y: u16 },
    Cursor(CursorImage),
    DesktopSize,
    LastRect,
}

/// Resolves encoding tags to decoders
///
/// The compressed encodings keep their inflate context here for the lifetime
/// of the connection, the other decoders are stateless and built per rectangle.
pub(crate) struct EncodingRegistry {
    zlib: zlib::Decoder,
    zrle: zrle::Decoder,
}

impl EncodingRegistry {
    pub fn new() -> Self {
        Self {
            zlib: zlib::Decoder::new(),
            zrle: zrle::Decoder::new(),
        }
    }

    pub async fn decode(
        &mut self,
        encoding: VncEncoding,
        rect: &Rect,
        ctx: &mut DecodeContext<'_>,
    ) -> Result<RectUpdate, VncError> {
        match encoding {
            VncEncoding::Raw => raw::Decoder::new().decode(ctx, rect).await,
            VncEncoding::CopyRect => copyrect::Decoder::new().decode(ctx, rect).await,
            VncEncoding::Rre => rre::Decoder::new(false).decode(ctx, rect).await,
            VncEncoding::CoRre => rre::Decoder::new(true).decode(ctx, rect).await,
            VncEncoding::Hextile => hextile::Decoder::new().decode(ctx, rect).await,
            VncEncoding::Zlib => self.zlib.decode(ctx, rect).await,
            VncEncoding::Zrle => self.zrle.decode(ctx, rect).await,
            VncEncoding::CursorPseudo => cursor::Decoder::new().decode(ctx, rect).await,
            VncEncoding::DesktopSizePseudo => Ok(RectUpdate::DesktopSize),
            VncEncoding::LastRectPseudo => Ok(RectUpdate::LastRect),
        }
    }
}

/// Paint the `w * h` area at (`x`, `y`) of a `stride` pixels wide buffer
#[allow(clippy::too_many_arguments)]
fn fill_rect(
    buf: &mut [u8],
    stride: usize,
    bpp: usize,
    x: usize,
    y: usize,
    w: usize,
    h: usize,
    pixel: &[u8],
) {
    for row in y..y + h {
        let start = (row * stride + x) * bpp;
        for dst in buf[start..start + w * bpp].chunks_exact_mut(bpp) {
            dst.copy_from_slice(&pixel[..bpp]);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::stream::tests::reader_with;

    /// Decode a single rectangle body of `encoding` from `wire`
    pub(crate) async fn decode_one(
        registry: &mut EncodingRegistry,
        encoding: VncEncoding,
        rect: Rect,
        format: PixelFormat,
        wire: Vec<u8>,
    ) -> Result<RectUpdate, VncError> {
        let mut reader = reader_with(wire);
        let pool = BufferPool::new();
        let mut ctx = DecodeContext {
            reader: &mut reader,
            format: &format,
            pool: &pool,
            options: BufferOptions::default(),
        };
        registry.decode(encoding, &rect, &mut ctx).await
    }

    pub(crate) fn pixels(update: RectUpdate) -> Vec<u8> {
        match update {
            RectUpdate::Pixels(buf) => buf.to_vec(),
            other => panic!("expected pixels, got {other:?}"),
        }
    }

    #[test]
    fn fill_rect_paints_inside_only() {
        let mut buf = vec![0; 4 * 3];
        fill_rect(&mut buf, 4, 1, 1, 1, 2, 2, &[9]);
        assert_eq!(buf, vec![0, 0, 0, 0, 0, 9, 9, 0, 0, 9, 9, 0]);
    }

    #[tokio::test]
    async fn pseudo_encodings_carry_no_body() {
        let mut registry = EncodingRegistry::new();
        let update = decode_one(
            &mut registry,
            VncEncoding::DesktopSizePseudo,
            Rect::new(0, 0, 800, 600),
            PixelFormat::bgra(),
            vec![],
        )
        .await
        .unwrap();
        assert!(matches!(update, RectUpdate::DesktopSize));
    }

    #[tokio::test]
    async fn copy_rect_reads_the_source() {
        let mut registry = EncodingRegistry::new();
        let update = decode_one(
            &mut registry,
            VncEncoding::CopyRect,
            Rect::new(10, 10, 5, 5),
            PixelFormat::bgra(),
            vec![0, 1, 0, 2],
        )
        .await
        .unwrap();
        assert!(matches!(update, RectUpdate::Copy { src_x: 1, src_y: 2 }));
    }
}
