use crate::{stream::StreamReader, VncError};
use std::time::Duration;

/// Capacity of the channels between the network, decoding and drawing contexts
pub(crate) const CHANNEL_SIZE: usize = 4096;
/// Bytes requested from the socket per read
pub(crate) const READ_BUFFER_SIZE: usize = 64 * 1024;
/// Initial size of the inflate output buffer
pub(crate) const INFLATE_INITIAL_SIZE: usize = 256 * 1024;
/// Step by which the inflate output buffer grows when it runs full
pub(crate) const INFLATE_CHUNK_SIZE: usize = 64 * 1024;
/// Upper bound for a single compressed rectangle payload
pub(crate) const MAX_COMPRESSED_LEN: usize = 32 * 1024 * 1024;
/// Upper bound for server cut text
pub(crate) const MAX_CUT_TEXT_LEN: usize = 16 * 1024 * 1024;
/// Upper bound for the desktop name and failure reasons
pub(crate) const MAX_STRING_LEN: usize = 1024 * 1024;
/// Default period of the metrics sampler
pub(crate) const METRICS_INTERVAL: Duration = Duration::from_secs(1);

/// All supported vnc encodings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum VncEncoding {
    Raw = 0,
    CopyRect = 1,
    Rre = 2,
    CoRre = 4,
    Hextile = 5,
    Zlib = 6,
    Zrle = 16,
    CursorPseudo = -239,
    DesktopSizePseudo = -223,
    LastRectPseudo = -224,
}

impl TryFrom<i32> for VncEncoding {
    type Error = VncError;

    fn try_from(num: i32) -> Result<Self, Self::Error> {
        Ok(match num {
            0 => VncEncoding::Raw,
            1 => VncEncoding::CopyRect,
            2 => VncEncoding::Rre,
            4 => VncEncoding::CoRre,
            5 => VncEncoding::Hextile,
            6 => VncEncoding::Zlib,
            16 => VncEncoding::Zrle,
            -239 => VncEncoding::CursorPseudo,
            -223 => VncEncoding::DesktopSizePseudo,
            -224 => VncEncoding::LastRectPseudo,
            _ => return Err(VncError::UnknownEncoding(num)),
        })
    }
}

impl From<VncEncoding> for i32 {
    fn from(e: VncEncoding) -> Self {
        e as i32
    }
}

impl VncEncoding {
    /// Pseudo encodings carry no pixels for the frame buffer
    pub fn is_pseudo(self) -> bool {
        (self as i32) < 0
    }
}

/// All supported vnc versions
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Eq)]
#[repr(u8)]
pub enum VncVersion {
    RFB33,
    RFB37,
    RFB38,
}

impl From<VncVersion> for &[u8; 12] {
    fn from(version: VncVersion) -> Self {
        match version {
            VncVersion::RFB33 => b"RFB 003.003\n",
            VncVersion::RFB37 => b"RFB 003.007\n",
            VncVersion::RFB38 => b"RFB 003.008\n",
        }
    }
}

/// The version line announced by the server
///
/// ```text
/// +--------------+--------------+------------------+
/// | No. of bytes | Type [Value] | Description      |
/// +--------------+--------------+------------------+
/// | 12           | U8 array     | "RFB xxx.yyy\n"  |
/// +--------------+--------------+------------------+
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerVersion {
    pub major: u32,
    pub minor: u32,
    text: String,
}

impl ServerVersion {
    pub fn parse(raw: &[u8; 12]) -> Result<Self, VncError> {
        let wrong = || VncError::WrongVersion(String::from_utf8_lossy(raw).into_owned());
        if &raw[..4] != b"RFB " || raw[7] != b'.' || raw[11] != b'\n' {
            return Err(wrong());
        }
        let number = |digits: &[u8]| -> Option<u32> {
            if !digits.iter().all(u8::is_ascii_digit) {
                return None;
            }
            std::str::from_utf8(digits).ok()?.parse().ok()
        };
        let major = number(&raw[4..7]).ok_or_else(wrong)?;
        let minor = number(&raw[8..11]).ok_or_else(wrong)?;
        Ok(Self {
            major,
            minor,
            text: String::from_utf8_lossy(&raw[..11]).into_owned(),
        })
    }

    /// The version line without its trailing newline
    pub fn text(&self) -> &str {
        &self.text
    }

    /// The protocol revision we can speak with this server
    ///
    // https://www.rfc-editor.org/rfc/rfc6143#section-7.1.1
    //  Other version numbers are reported by some servers and clients,
    //  but should be interpreted as 3.3 since they do not implement the
    //  different handshake in 3.7 or 3.8.
    //  Servers reporting a higher 3.x minor (e.g. 3.889) do speak 3.8.
    pub fn protocol(&self) -> VncVersion {
        match (self.major, self.minor) {
            (3, 7) => VncVersion::RFB37,
            (3, minor) if minor >= 8 => VncVersion::RFB38,
            (major, _) if major > 3 => VncVersion::RFB38,
            _ => VncVersion::RFB33,
        }
    }
}

///  Pixel Format Data Structure according to [RFC6143](https://www.rfc-editor.org/rfc/rfc6143.html#section-7.4)
///
/// ```text
/// +--------------+--------------+-----------------+
/// | No. of bytes | Type [Value] | Description     |
/// +--------------+--------------+-----------------+
/// | 1            | U8           | bits-per-pixel  |
/// | 1            | U8           | depth           |
/// | 1            | U8           | big-endian-flag |
/// | 1            | U8           | true-color-flag |
/// | 2            | U16          | red-max         |
/// | 2            | U16          | green-max       |
/// | 2            | U16          | blue-max        |
/// | 1            | U8           | red-shift       |
/// | 1            | U8           | green-shift     |
/// | 1            | U8           | blue-shift      |
/// | 3            |              | padding         |
/// +--------------+--------------+-----------------+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelFormat {
    /// the number of bits used for each pixel value on the wire
    ///
    /// 8, 16, 32(usually) only
    ///
    pub bits_per_pixel: u8,
    /// Although the depth should
    ///
    /// be consistent with the bits-per-pixel and the various -max values,
    ///
    /// clients do not use it when interpreting pixel data.
    ///
    pub depth: u8,
    /// true if multi-byte pixels are interpreted as big endian
    ///
    pub big_endian_flag: u8,
    /// true then the last six items specify how to extract the red, green and blue intensities from the pixel value
    ///
    pub true_color_flag: u8,
    /// the next three always in big-endian order
    /// no matter how the `big_endian_flag` is set
    ///
    pub red_max: u16,
    pub green_max: u16,
    pub blue_max: u16,
    /// the number of shifts needed to get the red value in a pixel to the least significant bit
    ///
    pub red_shift: u8,
    pub green_shift: u8,
    pub blue_shift: u8,
}

impl From<PixelFormat> for Vec<u8> {
    fn from(pf: PixelFormat) -> Vec<u8> {
        let mut bytes = vec![
            pf.bits_per_pixel,
            pf.depth,
            pf.big_endian_flag,
            pf.true_color_flag,
        ];
        bytes.extend_from_slice(&pf.red_max.to_be_bytes());
        bytes.extend_from_slice(&pf.green_max.to_be_bytes());
        bytes.extend_from_slice(&pf.blue_max.to_be_bytes());
        bytes.extend_from_slice(&[pf.red_shift, pf.green_shift, pf.blue_shift, 0, 0, 0]);
        bytes
    }
}

impl TryFrom<[u8; 16]> for PixelFormat {
    type Error = VncError;

    fn try_from(pf: [u8; 16]) -> Result<Self, Self::Error> {
        let bits_per_pixel = pf[0];
        if bits_per_pixel != 8 && bits_per_pixel != 16 && bits_per_pixel != 32 {
            return Err(VncError::WrongPixelFormat);
        }
        Ok(PixelFormat {
            bits_per_pixel,
            depth: pf[1],
            big_endian_flag: pf[2],
            true_color_flag: pf[3],
            red_max: u16::from_be_bytes([pf[4], pf[5]]),
            green_max: u16::from_be_bytes([pf[6], pf[7]]),
            blue_max: u16::from_be_bytes([pf[8], pf[9]]),
            red_shift: pf[10],
            green_shift: pf[11],
            blue_shift: pf[12],
        })
    }
}

impl Default for PixelFormat {
    // by default the pixel transformed is (a << 24 | r << 16 || g << 8 | b) in le
    // which is [b, g, r, a] in network
    fn default() -> Self {
        Self {
            bits_per_pixel: 32,
            depth: 24,
            big_endian_flag: 0,
            true_color_flag: 1,
            red_max: 255,
            green_max: 255,
            blue_max: 255,
            red_shift: 16,
            green_shift: 8,
            blue_shift: 0,
        }
    }
}

impl PixelFormat {
    // (a << 24 | r << 16 || g << 8 | b) in le
    // [b, g, r, a] in network
    pub fn bgra() -> PixelFormat {
        PixelFormat::default()
    }

    // (a << 24 | b << 16 | g << 8 | r) in le
    // which is [r, g, b, a] in network
    pub fn rgba() -> PixelFormat {
        Self {
            red_shift: 0,
            blue_shift: 16,
            ..Default::default()
        }
    }

    // one byte per pixel, bbgggrrr
    pub fn bgr233() -> PixelFormat {
        Self {
            bits_per_pixel: 8,
            depth: 8,
            big_endian_flag: 0,
            true_color_flag: 1,
            red_max: 7,
            green_max: 7,
            blue_max: 3,
            red_shift: 0,
            green_shift: 3,
            blue_shift: 6,
        }
    }

    pub fn bytes_per_pixel(&self) -> usize {
        self.bits_per_pixel as usize / 8
    }

    pub fn is_big_endian(&self) -> bool {
        self.big_endian_flag != 0
    }

    pub fn is_true_color(&self) -> bool {
        self.true_color_flag != 0
    }

    /// Interpret the leading `bytes_per_pixel` bytes of `bytes` as a pixel value
    pub fn pixel_value(&self, bytes: &[u8]) -> u32 {
        match (self.bytes_per_pixel(), self.is_big_endian()) {
            (1, _) => bytes[0] as u32,
            (2, true) => u16::from_be_bytes([bytes[0], bytes[1]]) as u32,
            (2, false) => u16::from_le_bytes([bytes[0], bytes[1]]) as u32,
            (_, true) => u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            (_, false) => u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
        }
    }

    /// Scale the channels of a pixel value to 8 bit red, green and blue
    ///
    /// Colour-mapped formats have no channels, the index is used as a grey level
    pub fn to_rgb8(&self, value: u32) -> [u8; 3] {
        if !self.is_true_color() {
            let grey = value as u8;
            return [grey, grey, grey];
        }
        let channel = |shift: u8, max: u16| -> u8 {
            if max == 0 {
                return 0;
            }
            let v = value.checked_shr(shift as u32).unwrap_or(0) & max as u32;
            (v * 255 / max as u32) as u8
        };
        [
            channel(self.red_shift, self.red_max),
            channel(self.green_shift, self.green_max),
            channel(self.blue_shift, self.blue_max),
        ]
    }

    /// Bits of a pixel value actually used by the colour channels
    pub(crate) fn color_mask(&self) -> u32 {
        let mask = |shift: u8, max: u16| (max as u32).checked_shl(shift as u32).unwrap_or(0);
        mask(self.red_shift, self.red_max)
            | mask(self.green_shift, self.green_max)
            | mask(self.blue_shift, self.blue_max)
    }

    pub(crate) async fn read(reader: &mut StreamReader) -> Result<Self, VncError> {
        let pixel_buffer: [u8; 16] = reader.read_array().await?;
        pixel_buffer.try_into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_standard_version_lines() {
        let v = ServerVersion::parse(b"RFB 003.008\n").unwrap();
        assert_eq!((v.major, v.minor), (3, 8));
        assert_eq!(v.text(), "RFB 003.008");
        assert_eq!(v.protocol(), VncVersion::RFB38);

        let v = ServerVersion::parse(b"RFB 003.889\n").unwrap();
        assert_eq!(v.protocol(), VncVersion::RFB38);
        let v = ServerVersion::parse(b"RFB 003.005\n").unwrap();
        assert_eq!(v.protocol(), VncVersion::RFB33);
    }

    #[test]
    fn rejects_garbage_version_lines() {
        assert!(matches!(
            ServerVersion::parse(b"HTTP/1.1 200"),
            Err(VncError::WrongVersion(_))
        ));
        assert!(ServerVersion::parse(b"RFB 0x3.008\n").is_err());
    }

    #[test]
    fn unknown_encoding_tags_are_errors() {
        assert_eq!(VncEncoding::try_from(-239).unwrap(), VncEncoding::CursorPseudo);
        assert!(matches!(
            VncEncoding::try_from(99),
            Err(VncError::UnknownEncoding(99))
        ));
    }

    #[test]
    fn pixel_format_wire_layout() {
        let bytes: Vec<u8> = PixelFormat::bgra().into();
        assert_eq!(bytes.len(), 16);
        let arr: [u8; 16] = bytes.try_into().unwrap();
        assert_eq!(PixelFormat::try_from(arr).unwrap(), PixelFormat::bgra());

        let mut bad = arr;
        bad[0] = 24;
        assert!(matches!(
            PixelFormat::try_from(bad),
            Err(VncError::WrongPixelFormat)
        ));
    }

    #[test]
    fn channel_scaling() {
        let pf = PixelFormat::bgra();
        assert_eq!(pf.pixel_value(&[0x10, 0x20, 0x30, 0x00]), 0x0030_2010);
        assert_eq!(pf.to_rgb8(0x0030_2010), [0x30, 0x20, 0x10]);

        let pf = PixelFormat::bgr233();
        // red 7, green 0, blue 3
        assert_eq!(pf.to_rgb8(0b11_000_111), [255, 0, 255]);
    }
}
