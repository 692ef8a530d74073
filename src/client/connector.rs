use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::{
        mpsc::{channel, unbounded_channel},
        oneshot,
    },
};
use tokio_util::sync::CancellationToken;
use tracing::{info, trace};

use super::{
    auth::Authenticator,
    connection::{self, DataSignal, VncClient, VncInner},
    dispatcher::{HandshakeConfig, ProtocolDispatcher},
    quirks::ServerQuirks,
    session::Session,
    update::FrameUpdateDecoder,
};
use crate::{
    config::{CHANNEL_SIZE, METRICS_INTERVAL},
    metrics::{ConnectionMetrics, MetricsDelegate},
    pool::{BufferOptions, BufferPool},
    stream, FrameBuffer, PixelFormat, VncEncoding, VncError, VncVersion,
};

/// Connection Builder to setup a vnc client
pub struct VncConnector<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    stream: S,
    frame_buffer: Box<dyn FrameBuffer>,
    authenticator: Option<Box<dyn Authenticator>>,
    rfb_version: VncVersion,
    allow_shared: bool,
    pixel_format: Option<PixelFormat>,
    encodings: Vec<VncEncoding>,
    continuous: bool,
    update_interval: Option<Duration>,
    metrics_delegate: Option<Arc<dyn MetricsDelegate>>,
    metrics_interval: Duration,
    quirks: ServerQuirks,
    pool: Option<Arc<BufferPool>>,
    buffer_options: BufferOptions,
    connect_timeout: Option<Duration>,
    clipboard: bool,
}

impl<S> VncConnector<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// To new a vnc client configuration with stream `S`
    ///
    /// `S` should implement async I/O methods, decoded rectangles end up in
    /// `frame_buffer`
    ///
    /// ```no_run
    /// use vnc_engine::{FrameBuffer, PixelFormat, Rect, Screen, VncConnector, VncEncoding};
    /// use tokio::{self, net::TcpStream};
    /// use anyhow::Result;
    ///
    /// struct Discard;
    ///
    /// impl FrameBuffer for Discard {
    ///     fn set_display(&mut self, _: Screen, _: &PixelFormat) {}
    ///     fn blit(&mut self, _: &Rect, _: &[u8], _: &PixelFormat) {}
    ///     fn copy_rect(&mut self, _: &Rect, _: u16, _: u16) {}
    /// }
    ///
    /// #[tokio::main]
    /// async fn main() -> Result<()> {
    ///     let tcp = TcpStream::connect("127.0.0.1:5900").await?;
    ///     let vnc = VncConnector::new(tcp, Discard)
    ///         .add_encoding(VncEncoding::Zrle)
    ///         .add_encoding(VncEncoding::CopyRect)
    ///         .add_encoding(VncEncoding::Raw)
    ///         .allow_shared(true)
    ///         .set_pixel_format(PixelFormat::bgra())
    ///         .connect()
    ///         .await?;
    ///     vnc.close().await?;
    ///     Ok(())
    /// }
    /// ```
    ///
    pub fn new(stream: S, frame_buffer: impl FrameBuffer) -> Self {
        Self {
            stream,
            frame_buffer: Box::new(frame_buffer),
            authenticator: None,
            rfb_version: VncVersion::RFB38,
            allow_shared: true,
            pixel_format: None,
            encodings: Vec::new(),
            continuous: false,
            update_interval: None,
            metrics_delegate: None,
            metrics_interval: METRICS_INTERVAL,
            quirks: ServerQuirks::default(),
            pool: None,
            buffer_options: BufferOptions::default(),
            connect_timeout: None,
            clipboard: false,
        }
    }

    /// Answers the security challenge if the server asks for more than `None`
    ///
    /// Never consulted if the server doesn't apply any protection to the session
    ///
    pub fn set_authenticator(mut self, authenticator: impl Authenticator) -> Self {
        self.authenticator = Some(Box::new(authenticator));
        self
    }

    /// The max vnc version that we supported
    ///
    /// Version should be one of the [VncVersion]
    ///
    pub fn set_version(mut self, version: VncVersion) -> Self {
        self.rfb_version = version;
        self
    }

    /// Set the rgb order which you will use to resolve the image data
    ///
    /// In most of the case, use `PixelFormat::bgra()` on little endian PCs
    ///
    /// Will use the default format informed by the vnc server if not set
    ///
    /// In this condition, the client will get a [crate::VncEvent::SetPixelFormat] event notified
    ///
    pub fn set_pixel_format(mut self, pf: PixelFormat) -> Self {
        self.pixel_format = Some(pf);
        self
    }

    /// Shared-flag is non-zero (true) if the server should try to share the
    /// desktop by leaving other clients connected, and zero (false) if it
    /// should give exclusive access to this client by disconnecting all
    /// other clients.
    ///
    pub fn allow_shared(mut self, allow_shared: bool) -> Self {
        self.allow_shared = allow_shared;
        self
    }

    /// Client encodings that we want to use
    ///
    /// One of [VncEncoding]
    ///
    /// [VncEncoding::Raw] must be sent as the RFC required
    ///
    /// The order to add encodings is the order to inform the server
    ///
    pub fn add_encoding(mut self, encoding: VncEncoding) -> Self {
        self.encodings.push(encoding);
        self
    }

    /// Request the next update as soon as the previous one is decoded
    pub fn continuous_updates(mut self, on: bool) -> Self {
        self.continuous = on;
        self
    }

    /// Request an incremental update every `interval` while not continuous
    pub fn set_update_interval(mut self, interval: Duration) -> Self {
        self.update_interval = Some(interval);
        self
    }

    pub fn set_metrics_delegate(mut self, delegate: Arc<dyn MetricsDelegate>) -> Self {
        self.metrics_delegate = Some(delegate);
        self
    }

    pub fn set_metrics_interval(mut self, interval: Duration) -> Self {
        self.metrics_interval = interval;
        self
    }

    pub fn set_quirks(mut self, quirks: ServerQuirks) -> Self {
        self.quirks = quirks;
        self
    }

    /// Decode into buffers of `pool`, which may be shared between connections
    pub fn set_buffer_pool(mut self, pool: Arc<BufferPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn set_buffer_options(mut self, options: BufferOptions) -> Self {
        self.buffer_options = options;
        self
    }

    /// Give up if the server sends nothing within `timeout` of the connect
    pub fn set_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Let [VncClient::send_client_cut_text] reach the server
    pub fn enable_clipboard(mut self, on: bool) -> Self {
        self.clipboard = on;
        self
    }

    /// Run the handshake and start the engine
    ///
    pub async fn connect(self) -> Result<VncClient, VncError> {
        if self.encodings.is_empty() {
            return Err(VncError::NoEncoding);
        }

        let cancel = CancellationToken::new();
        let (feeder, reader) = stream::channel(CHANNEL_SIZE, cancel.clone());
        let (outbound_tx, outbound_rx) = unbounded_channel();
        let (apply_tx, apply_rx) = channel(CHANNEL_SIZE);
        let (event_tx, event_rx) = channel(CHANNEL_SIZE);
        let (exited_tx, exited_rx) = oneshot::channel();
        let decoder_exited = Arc::new(AtomicBool::new(false));
        let signal = Arc::new(DataSignal::default());
        let silent = Arc::new(AtomicBool::new(false));

        let metrics = ConnectionMetrics::new(self.metrics_delegate);
        let session = Arc::new(Session::new(
            outbound_tx,
            metrics.clone(),
            self.encodings,
            self.continuous,
            self.clipboard,
        ));
        let pool = self.pool.unwrap_or_else(BufferPool::new);

        let frame_buffer = self.frame_buffer;
        tokio::task::spawn_blocking(move || connection::apply_loop(frame_buffer, apply_rx));

        let net_task = tokio::spawn(connection::net_loop(
            self.stream,
            feeder,
            outbound_rx,
            cancel.clone(),
            exited_rx,
            signal.clone(),
            metrics.clone(),
        ));

        if let Some(timeout) = self.connect_timeout {
            connection::spawn_watchdog(signal.clone(), timeout, cancel.clone(), silent.clone());
        }

        let updates = FrameUpdateDecoder::new(
            pool,
            self.buffer_options,
            apply_tx.clone(),
            event_tx.clone(),
            metrics.clone(),
        );
        let mut dispatcher =
            ProtocolDispatcher::new(reader, session.clone(), updates, event_tx, apply_tx);

        let config = HandshakeConfig {
            version: self.rfb_version,
            shared: self.allow_shared,
            pixel_format: self.pixel_format,
            quirks: self.quirks,
            authenticator: self.authenticator,
        };
        let info = match dispatcher.handshake(config).await {
            Ok(info) => info,
            Err(e) => {
                cancel.cancel();
                decoder_exited.store(true, Ordering::Release);
                drop(dispatcher);
                let _ = exited_tx.send(());
                let _ = net_task.await;
                if silent.load(Ordering::Acquire) {
                    if let Some(timeout) = self.connect_timeout {
                        return Err(VncError::ServerSilent(timeout));
                    }
                }
                return Err(e);
            }
        };
        info!("VNC Client {} starts", info.name);

        tokio::spawn(connection::decode_loop(
            dispatcher,
            cancel.clone(),
            decoder_exited.clone(),
            exited_tx,
        ));
        metrics.spawn_sampler(self.metrics_interval, cancel.clone());
        if let Some(interval) = self.update_interval {
            trace!("Requesting updates every {:?}", interval);
            connection::spawn_update_interval(session.clone(), interval, cancel.clone());
        }

        Ok(VncClient::new(VncInner {
            session,
            info,
            events: tokio::sync::Mutex::new(event_rx),
            cancel,
            decoder_exited,
            net_task: parking_lot::Mutex::new(Some(net_task)),
        }))
    }
}
