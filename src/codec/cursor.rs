use crate::{CursorImage, Rect, VncError};

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
        // the rectangle position is the hotspot
        //
        // +----------------------------+--------------+---------------+
        // | No. of bytes               | Type [Value] | Description   |
        // +----------------------------+--------------+---------------+
        // | width*height*bytesPerPixel | PIXEL array  | cursor-pixels |
        // | div(width+7,8)*height      | U8 array     | bitmask       |
        // +----------------------------+--------------+---------------+
        let bpp = ctx.bytes_per_pixel();
        let w = rect.width as usize;
        let h = rect.height as usize;
        let mask_stride = (w + 7) / 8;

        let mut pixels = ctx.acquire_pixels(rect)?;
        ctx.reader.read_into(&mut pixels).await?;
        let mut mask = ctx.acquire(mask_stride * h)?;
        ctx.reader.read_into(&mut mask).await?;

        let mut rgba = Vec::with_capacity(w * h * 4);
        for y in 0..h {
            for x in 0..w {
                let offset = (y * w + x) * bpp;
                let value = ctx.format.pixel_value(&pixels[offset..offset + bpp]);
                let [r, g, b] = ctx.format.to_rgb8(value);
                let opaque = mask[y * mask_stride + x / 8] & (0x80 >> (x % 8)) != 0;
                rgba.extend_from_slice(&[r, g, b, if opaque { 255 } else { 0 }]);
            }
        }

        Ok(RectUpdate::Cursor(CursorImage {
            hotspot_x: rect.x,
            hotspot_y: rect.y,
            width: rect.width,
            height: rect.height,
            rgba,
        }))
    }
}

#[cfg(test)]
mod tests {
    use crate::codec::{tests::decode_one, EncodingRegistry, RectUpdate};
    use crate::{PixelFormat, Rect, VncEncoding};

    #[tokio::test]
    async fn mask_becomes_alpha() {
        // 2x1 bgra cursor, first pixel red and opaque, second blue and transparent
        let wire = vec![0, 0, 0xff, 0, 0xff, 0, 0, 0, 0b1000_0000];
        let update = decode_one(
            &mut EncodingRegistry::new(),
            VncEncoding::CursorPseudo,
            Rect::new(1, 0, 2, 1),
            PixelFormat::bgra(),
            wire,
        )
        .await
        .unwrap();
        let RectUpdate::Cursor(cursor) = update else {
            panic!("expected a cursor");
        };
        assert_eq!((cursor.hotspot_x, cursor.hotspot_y), (1, 0));
        assert_eq!(cursor.rgba, vec![0xff, 0, 0, 255, 0, 0, 0xff, 0]);
    }
}
