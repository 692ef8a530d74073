use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc::Sender;
use tracing::{info, trace, warn};

use super::{
    auth::{self, Authenticator},
    connection::{ApplyOp, ServerInfo},
    messages::{latin1, read_string, ClientMsg, ServerMsgType},
    quirks::{ServerFlavor, ServerQuirks},
    session::Session,
    update::FrameUpdateDecoder,
};
use crate::{
    config::{MAX_CUT_TEXT_LEN, MAX_STRING_LEN},
    stream::StreamReader,
    PixelFormat, Screen, ServerVersion, VncError, VncEvent, VncVersion,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DispatchState {
    AwaitingVersionString,
    Handshaking,
    Normal,
}

/// What the client brings into the handshake
pub(crate) struct HandshakeConfig {
    pub version: VncVersion,
    pub shared: bool,
    pub pixel_format: Option<PixelFormat>,
    pub quirks: ServerQuirks,
    pub authenticator: Option<Box<dyn Authenticator>>,
}

/// Reads server messages and routes them to their decoders
pub(crate) struct ProtocolDispatcher {
    reader: StreamReader,
    session: Arc<Session>,
    updates: FrameUpdateDecoder,
    events: Sender<VncEvent>,
    apply: Sender<ApplyOp>,
    state: DispatchState,
    negotiated: VncVersion,
}

impl ProtocolDispatcher {
    pub fn new(
        reader: StreamReader,
        session: Arc<Session>,
        updates: FrameUpdateDecoder,
        events: Sender<VncEvent>,
        apply: Sender<ApplyOp>,
    ) -> Self {
        Self {
            reader,
            session,
            updates,
            events,
            apply,
            state: DispatchState::AwaitingVersionString,
            negotiated: VncVersion::RFB33,
        }
    }

    pub fn state(&self) -> DispatchState {
        self.state
    }

    pub async fn read_version(
        &mut self,
        max: VncVersion,
        quirks: &ServerQuirks,
    ) -> Result<ServerVersion, VncError> {
        let raw: [u8; 12] = self.reader.read_array().await?;
        let version = ServerVersion::parse(&raw)?;
        info!("Server version: {}", version.text());

        let (flavor, keymap) = quirks.classify(&version);
        if flavor != ServerFlavor::Generic {
            warn!("Server looks like {:?}, adjusting the key map", flavor);
        }
        self.session.set_flavor(flavor, keymap);

        let offered = version.protocol();
        self.negotiated = if max < offered { max } else { offered };
        trace!("Negotiated rfb version: {:?}", self.negotiated);
        self.state = DispatchState::Handshaking;
        Ok(version)
    }

    /// Everything from the version line up to the first update request
    pub async fn handshake(&mut self, mut config: HandshakeConfig) -> Result<ServerInfo, VncError> {
        let version = self.read_version(config.version, &config.quirks).await?;
        let reply: &'static [u8; 12] = self.negotiated.into();
        self.session.write_raw(Bytes::from_static(reply))?;

        auth::negotiate(
            &mut self.reader,
            &self.session,
            self.negotiated,
            config.authenticator.as_deref_mut(),
        )
        .await?;

        trace!("Send shared flag: {}", config.shared);
        self.session.write_raw(Bytes::copy_from_slice(&[config.shared as u8]))?;

        // +--------------+--------------+------------------------------+
        // | No. of bytes | Type [Value] | Description                  |
        // +--------------+--------------+------------------------------+
        // | 2            | U16          | framebuffer-width in pixels  |
        // | 2            | U16          | framebuffer-height in pixels |
        // | 16           | PIXEL_FORMAT | server-pixel-format          |
        // | 4            | U32          | name-length                  |
        // | name-length  | U8 array     | name-string                  |
        // +--------------+--------------+------------------------------+
        let width = self.reader.read_u16().await?;
        let height = self.reader.read_u16().await?;
        let screen = Screen::from((width, height));
        let server_format = PixelFormat::read(&mut self.reader).await?;
        let name = read_string(&mut self.reader, MAX_STRING_LEN).await?;
        let name = String::from_utf8_lossy(&name).into_owned();

        self.events.send(VncEvent::SetResolution(screen)).await?;
        let format = match config.pixel_format {
            Some(format) => format,
            None => {
                self.events
                    .send(VncEvent::SetPixelFormat(server_format))
                    .await?;
                server_format
            }
        };
        self.session.set_display(screen, format);
        self.apply.send(ApplyOp::SetDisplay { screen, format }).await?;

        if config.pixel_format.is_some() {
            trace!("Send customized pixel format {:#?}", format);
            self.session.send(ClientMsg::SetPixelFormat(format))?;
        }
        let encodings = self.session.encodings();
        trace!("Client encodings: {:?}", encodings);
        self.session.send(ClientMsg::SetEncodings(encodings))?;

        trace!("Require the first frame");
        self.session.request_update(false)?;
        self.state = DispatchState::Normal;

        Ok(ServerInfo {
            name,
            screen,
            pixel_format: format,
            version,
            flavor: self.session.flavor(),
        })
    }

    /// Route server messages until the stream ends or fails
    pub async fn run(&mut self) -> Result<(), VncError> {
        loop {
            let msg_type = ServerMsgType::try_from(self.reader.read_u8().await?)?;
            trace!("Server message got: {:?}", msg_type);
            match msg_type {
                ServerMsgType::FramebufferUpdate => {
                    if let Some(format) = self.session.take_format_change() {
                        let screen = self.session.screen();
                        self.apply.send(ApplyOp::SetDisplay { screen, format }).await?;
                        self.events.send(VncEvent::SetPixelFormat(format)).await?;
                    }
                    let format = self.session.pixel_format();
                    let screen = self.session.screen();
                    let summary = self
                        .updates
                        .read_update(&mut self.reader, &format, screen)
                        .await?;
                    if let Some(screen) = summary.resized {
                        self.session.set_screen(screen);
                    }
                    self.session.update_complete()?;
                }
                ServerMsgType::SetColorMapEntries => {
                    // +--------------+--------------+------------------+
                    // | No. of bytes | Type [Value] | Description      |
                    // +--------------+--------------+------------------+
                    // | 1            | U8 [1]       | message-type     |
                    // | 1            |              | padding          |
                    // | 2            | U16          | first-color      |
                    // | 2            | U16          | number-of-colors |
                    // +--------------+--------------+------------------+
                    self.reader.skip(1).await?;
                    let first_color = self.reader.read_u16().await?;
                    let count = self.reader.read_u16().await?;
                    let mut colors = Vec::with_capacity(count as usize);
                    for _ in 0..count {
                        let r = self.reader.read_u16().await?;
                        let g = self.reader.read_u16().await?;
                        let b = self.reader.read_u16().await?;
                        colors.push([r, g, b]);
                    }
                    self.events
                        .send(VncEvent::SetColorMap {
                            first_color,
                            colors,
                        })
                        .await?;
                }
                ServerMsgType::Bell => {
                    self.events.send(VncEvent::Bell).await?;
                }
                ServerMsgType::ServerCutText => {
                    // +--------------+--------------+--------------+
                    // | No. of bytes | Type [Value] | Description  |
                    // +--------------+--------------+--------------+
                    // | 1            | U8 [3]       | message-type |
                    // | 3            |              | padding      |
                    // | 4            | U32          | length       |
                    // | length       | U8 array     | text         |
                    // +--------------+--------------+--------------+
                    self.reader.skip(3).await?;
                    let text = read_string(&mut self.reader, MAX_CUT_TEXT_LEN).await?;
                    self.events.send(VncEvent::Text(latin1(&text))).await?;
                }
            }
        }
    }

    /// Tell the user why the connection is going down
    ///
    /// Never waits, a full event queue loses the notification.
    pub fn report(&self, err: &VncError) {
        if self.events.try_send(VncEvent::Error(err.to_string())).is_err() {
            warn!("Event queue unavailable, error not delivered");
        }
    }
}
