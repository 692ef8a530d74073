use crate::PixelFormat;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    pub x: u16,
    pub y: u16,
    pub width: u16,
    pub height: u16,
}

impl Rect {
    pub fn new(x: u16, y: u16, width: u16, height: u16) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Number of pixels covered
    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

impl From<[u8; 8]> for Rect {
    fn from(buf: [u8; 8]) -> Self {
        Self {
            x: u16::from_be_bytes([buf[0], buf[1]]),
            y: u16::from_be_bytes([buf[2], buf[3]]),
            width: u16::from_be_bytes([buf[4], buf[5]]),
            height: u16::from_be_bytes([buf[6], buf[7]]),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Screen {
    pub width: u16,
    pub height: u16,
}

impl From<(u16, u16)> for Screen {
    fn from(tuple: (u16, u16)) -> Self {
        Self {
            width: tuple.0,
            height: tuple.1,
        }
    }
}

impl Screen {
    /// The whole display as a rectangle at the origin
    pub fn rect(&self) -> Rect {
        Rect::new(0, 0, self.width, self.height)
    }
}

/// A decoded remote cursor
///
/// `rgba` holds `width * height` pixels of `[r, g, b, a]`,
/// alpha is 255 where the cursor mask bit is set and 0 elsewhere.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorImage {
    pub hotspot_x: u16,
    pub hotspot_y: u16,
    pub width: u16,
    pub height: u16,
    pub rgba: Vec<u8>,
}

/// The drawing surface the engine writes decoded rectangles into
///
/// All calls come from a single dedicated thread, in protocol order.
pub trait FrameBuffer: Send + 'static {
    /// Called once after the server init, and again whenever the display size or
    /// the pixel format in use changes, always before any `blit` that depends on it
    fn set_display(&mut self, screen: Screen, format: &PixelFormat);

    /// Write `pixels` (`rect.width * rect.height` pixels in `format`, row major) at `rect`
    fn blit(&mut self, rect: &Rect, pixels: &[u8], format: &PixelFormat);

    /// Copy the area of `dst`'s size found at (`src_x`, `src_y`) to `dst`
    fn copy_rect(&mut self, dst: &Rect, src_x: u16, src_y: u16);

    /// A whole framebuffer update message has been applied
    fn flush(&mut self) {}
}

#[non_exhaustive]
#[derive(Debug, Clone)]
pub enum VncEvent {
    SetResolution(Screen),
    SetPixelFormat(PixelFormat),
    SetCursor(CursorImage),
    SetColorMap {
        first_color: u16,
        /// 16 bit red, green, blue
        colors: Vec<[u16; 3]>,
    },
    Bell,
    Text(String),
    /// The connection terminated, with the reason
    Error(String),
}
