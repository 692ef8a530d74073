use bytes::{BufMut, Bytes, BytesMut};

use crate::{stream::StreamReader, PixelFormat, Rect, VncEncoding, VncError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ClientMsg {
    SetPixelFormat(PixelFormat),
    SetEncodings(Vec<VncEncoding>),
    FramebufferUpdateRequest { rect: Rect, incremental: bool },
    KeyEvent { keysym: u32, down: bool },
    PointerEvent { x: u16, y: u16, buttons: u8 },
    ClientCutText(String),
}

impl ClientMsg {
    pub(crate) fn encode(&self) -> Bytes {
        let mut payload = BytesMut::new();
        match self {
            ClientMsg::SetPixelFormat(pf) => {
                // +--------------+--------------+--------------+
                // | No. of bytes | Type [Value] | Description  |
                // +--------------+--------------+--------------+
                // | 1            | U8 [0]       | message-type |
                // | 3            |              | padding      |
                // | 16           | PIXEL_FORMAT | pixel-format |
                // +--------------+--------------+--------------+
                payload.put_slice(&[0, 0, 0, 0]);
                payload.put_slice(&<PixelFormat as Into<Vec<u8>>>::into(*pf));
            }
            ClientMsg::SetEncodings(encodings) => {
                // +--------------+--------------+---------------------+
                // | No. of bytes | Type [Value] | Description         |
                // +--------------+--------------+---------------------+
                // | 1            | U8 [2]       | message-type        |
                // | 1            |              | padding             |
                // | 2            | U16          | number-of-encodings |
                // +--------------+--------------+---------------------+

                // This is followed by number-of-encodings repetitions of the following:
                // +--------------+--------------+---------------+
                // | No. of bytes | Type [Value] | Description   |
                // +--------------+--------------+---------------+
                // | 4            | S32          | encoding-type |
                // +--------------+--------------+---------------+
                payload.put_slice(&[2, 0]);
                payload.put_u16(encodings.len() as u16);
                for e in encodings {
                    payload.put_i32((*e).into());
                }
            }
            ClientMsg::FramebufferUpdateRequest { rect, incremental } => {
                // +--------------+--------------+--------------+
                // | No. of bytes | Type [Value] | Description  |
                // +--------------+--------------+--------------+
                // | 1            | U8 [3]       | message-type |
                // | 1            | U8           | incremental  |
                // | 2            | U16          | x-position   |
                // | 2            | U16          | y-position   |
                // | 2            | U16          | width        |
                // | 2            | U16          | height       |
                // +--------------+--------------+--------------+
                payload.put_slice(&[3, *incremental as u8]);
                payload.put_u16(rect.x);
                payload.put_u16(rect.y);
                payload.put_u16(rect.width);
                payload.put_u16(rect.height);
            }
            ClientMsg::KeyEvent { keysym, down } => {
                // +--------------+--------------+--------------+
                // | No. of bytes | Type [Value] | Description  |
                // +--------------+--------------+--------------+
                // | 1            | U8 [4]       | message-type |
                // | 1            | U8           | down-flag    |
                // | 2            |              | padding      |
                // | 4            | U32          | key          |
                // +--------------+--------------+--------------+
                payload.put_slice(&[4, *down as u8, 0, 0]);
                payload.put_u32(*keysym);
            }
            ClientMsg::PointerEvent { x, y, buttons } => {
                // +--------------+--------------+--------------+
                // | No. of bytes | Type [Value] | Description  |
                // +--------------+--------------+--------------+
                // | 1            | U8 [5]       | message-type |
                // | 1            | U8           | button-mask  |
                // | 2            | U16          | x-position   |
                // | 2            | U16          | y-position   |
                // +--------------+--------------+--------------+
                payload.put_slice(&[5, *buttons]);
                payload.put_u16(*x);
                payload.put_u16(*y);
            }
            ClientMsg::ClientCutText(s) => {
                //   +--------------+--------------+--------------+
                //   | No. of bytes | Type [Value] | Description  |
                //   +--------------+--------------+--------------+
                //   | 1            | U8 [6]       | message-type |
                //   | 3            |              | padding      |
                //   | 4            | U32          | length       |
                //   | length       | U8 array     | text         |
                //   +--------------+--------------+--------------+
                // the text is ISO 8859-1
                let text: Vec<u8> = s
                    .chars()
                    .map(|c| if (c as u32) < 0x100 { c as u8 } else { b'?' })
                    .collect();
                payload.put_slice(&[6, 0, 0, 0]);
                payload.put_u32(text.len() as u32);
                payload.put_slice(&text);
            }
        }
        payload.freeze()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ServerMsgType {
    FramebufferUpdate,
    SetColorMapEntries,
    Bell,
    ServerCutText,
}

/// Indexed by the message-type byte
const SERVER_MSG_TYPES: [ServerMsgType; 4] = [
    ServerMsgType::FramebufferUpdate,
    ServerMsgType::SetColorMapEntries,
    ServerMsgType::Bell,
    ServerMsgType::ServerCutText,
];

impl TryFrom<u8> for ServerMsgType {
    type Error = VncError;

    fn try_from(num: u8) -> Result<Self, Self::Error> {
        SERVER_MSG_TYPES
            .get(num as usize)
            .copied()
            .ok_or(VncError::WrongServerMessage(num))
    }
}

/// A rectangle header inside a framebuffer update
///
/// ```text
/// +--------------+--------------+---------------+
/// | No. of bytes | Type [Value] | Description   |
/// +--------------+--------------+---------------+
/// | 2            | U16          | x-position    |
/// | 2            | U16          | y-position    |
/// | 2            | U16          | width         |
/// | 2            | U16          | height        |
/// | 4            | S32          | encoding-type |
/// +--------------+--------------+---------------+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RectHeader {
    pub rect: Rect,
    pub encoding: i32,
}

impl RectHeader {
    pub(crate) async fn read(reader: &mut StreamReader) -> Result<Self, VncError> {
        let rect: [u8; 8] = reader.read_array().await?;
        let encoding = reader.read_i32().await?;
        Ok(Self {
            rect: rect.into(),
            encoding,
        })
    }
}

/// Read a u32 length prefixed string, refusing lengths above `max`
pub(crate) async fn read_string(
    reader: &mut StreamReader,
    max: usize,
) -> Result<Vec<u8>, VncError> {
    let len = reader.read_u32().await? as usize;
    if len > max {
        return Err(VncError::malformed(format!(
            "string of {} bytes, at most {} allowed",
            len, max
        )));
    }
    Ok(reader.read_bytes(len).await?.to_vec())
}

/// Bytes of ISO 8859-1 text as a string
pub(crate) fn latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|b| *b as char).collect()
}
