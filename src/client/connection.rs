//! The running half of a client.
//!
//! A connected client is made of three activities:
//!
//! * the net task owns the socket, pushes whatever it reads to the decoder and
//!   writes the queued outbound messages in order
//! * the decode task runs the [ProtocolDispatcher], the only owner of the
//!   decoding state
//! * the apply thread owns the [FrameBuffer] and applies decoded rectangles,
//!   so a slow presentation never stalls the decoding
//!
//! Tearing down cancels a shared token. The decode task leaves at its next
//! suspension point and confirms it; only then does the net task shut the
//! socket down and finalize the metrics.

use bytes::{Bytes, BytesMut};
use parking_lot::{Condvar, Mutex};
use std::{
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::{
        mpsc::{error::TryRecvError, Receiver, UnboundedReceiver},
        oneshot,
    },
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::*;

use super::{
    dispatcher::ProtocolDispatcher,
    keys::{Modifier, SpecialKey},
    quirks::ServerFlavor,
    session::Session,
};
use crate::{
    config::READ_BUFFER_SIZE, metrics::ConnectionMetrics, pool::PooledBuffer, stream::StreamFeeder,
    FrameBuffer, PixelFormat, Rect, Screen, ServerVersion, VncEncoding, VncError, VncEvent,
};

/// A unit of work for the apply thread
pub(crate) enum ApplyOp {
    SetDisplay {
        screen: Screen,
        format: PixelFormat,
    },
    Blit {
        rect: Rect,
        pixels: PooledBuffer,
        format: PixelFormat,
    },
    Copy {
        dst: Rect,
        src_x: u16,
        src_y: u16,
    },
    UpdateComplete,
}

/// What the server told us during the handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    pub name: String,
    pub screen: Screen,
    /// The format the rectangles are decoded in, the client's if it set one
    pub pixel_format: PixelFormat,
    pub version: ServerVersion,
    pub flavor: ServerFlavor,
}

pub(super) fn apply_loop(mut frame_buffer: Box<dyn FrameBuffer>, mut ops: Receiver<ApplyOp>) {
    trace!("Apply thread starts");
    while let Some(op) = ops.blocking_recv() {
        match op {
            ApplyOp::SetDisplay { screen, format } => frame_buffer.set_display(screen, &format),
            // the pixels go back to their pool once blitted
            ApplyOp::Blit {
                rect,
                pixels,
                format,
            } => frame_buffer.blit(&rect, &pixels, &format),
            ApplyOp::Copy { dst, src_x, src_y } => frame_buffer.copy_rect(&dst, src_x, src_y),
            ApplyOp::UpdateComplete => frame_buffer.flush(),
        }
    }
    trace!("Apply thread stops");
}

#[derive(Default)]
struct SignalState {
    data: bool,
    closed: bool,
}

/// Fires once, when the first byte arrives from the server
#[derive(Default)]
pub(crate) struct DataSignal {
    state: Mutex<SignalState>,
    cond: Condvar,
}

impl DataSignal {
    pub fn notify(&self) {
        let mut state = self.state.lock();
        if !state.data {
            state.data = true;
            self.cond.notify_all();
        }
    }

    /// Release the waiters of a connection that is going down
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.cond.notify_all();
    }

    pub fn has_data(&self) -> bool {
        self.state.lock().data
    }

    /// Block until data arrived, the connection closed or `timeout` passed
    ///
    /// Returns whether data arrived.
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while !state.data && !state.closed {
            if self.cond.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        state.data
    }
}

pub(super) async fn net_loop<S>(
    stream: S,
    feeder: StreamFeeder,
    mut outbound: UnboundedReceiver<Bytes>,
    cancel: CancellationToken,
    decoder_exited: oneshot::Receiver<()>,
    signal: Arc<DataSignal>,
    metrics: Arc<ConnectionMetrics>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    trace!("Net Connection thread starts");
    let (mut rd, mut wr) = tokio::io::split(stream);
    let mut buffer = BytesMut::with_capacity(READ_BUFFER_SIZE);
    // a chunk read but not yet accepted by the decoder
    let mut pending: Option<Bytes> = None;
    let mut read_open = true;

    // main traffic loop
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            permit = feeder.reserve(), if pending.is_some() => {
                match (permit, pending.take()) {
                    (Ok(permit), Some(chunk)) => permit.send(Ok(chunk)),
                    _ => break,
                }
            }
            result = rd.read_buf(&mut buffer), if pending.is_none() && read_open => {
                match result {
                    Ok(0) => {
                        trace!("Net Connection EOF detected");
                        read_open = false;
                        let _ = feeder
                            .fail(io::Error::from(io::ErrorKind::UnexpectedEof))
                            .await;
                    }
                    Ok(nread) => {
                        metrics.add_bytes_received(nread);
                        signal.notify();
                        pending = Some(buffer.split().freeze());
                        buffer.reserve(READ_BUFFER_SIZE);
                    }
                    Err(e) => {
                        error!("{}", e.to_string());
                        read_open = false;
                        let _ = feeder.fail(e).await;
                    }
                }
            }
            msg = outbound.recv() => {
                match msg {
                    Some(bytes) => {
                        if let Err(e) = wr.write_all(&bytes).await {
                            error!("{}", e.to_string());
                            let _ = feeder.fail(e).await;
                            break;
                        }
                        metrics.add_bytes_sent(bytes.len());
                    }
                    None => break,
                }
            }
        }
    }

    cancel.cancel();
    drop(feeder);
    // the decoder may still be inside a read, wait until it let go
    let _ = decoder_exited.await;
    if let Err(e) = wr.shutdown().await {
        debug!("Socket shutdown: {}", e);
    }
    metrics.connection_did_close();
    signal.close();
    trace!("Net Connection thread stops");
}

pub(super) async fn decode_loop(
    mut dispatcher: ProtocolDispatcher,
    cancel: CancellationToken,
    exited: Arc<AtomicBool>,
    done: oneshot::Sender<()>,
) {
    trace!("Decoding thread starts");
    let result = tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(VncError::ClientNotRunning),
        result = dispatcher.run() => result,
    };
    match result {
        Ok(()) | Err(VncError::ClientNotRunning) => (),
        Err(e) => {
            error!("Error occurs during the decoding {:?}", e);
            dispatcher.report(&e);
        }
    }
    exited.store(true, Ordering::Release);
    cancel.cancel();
    // closes the apply and event channels
    drop(dispatcher);
    let _ = done.send(());
    trace!("Decoding thread stops");
}

/// Fail the connection if the server stays silent for `timeout`
pub(super) fn spawn_watchdog(
    signal: Arc<DataSignal>,
    timeout: Duration,
    cancel: CancellationToken,
    silent: Arc<AtomicBool>,
) -> JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        if !signal.wait(timeout) && !cancel.is_cancelled() {
            warn!("No data from the server within {:?}", timeout);
            silent.store(true, Ordering::Release);
            cancel.cancel();
        }
    })
}

/// Ask for an incremental update every `interval` unless updates are continuous
pub(super) fn spawn_update_interval(
    session: Arc<Session>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if session.is_continuous() {
                        continue;
                    }
                    if session.request_update(true).is_err() {
                        break;
                    }
                }
            }
        }
    })
}

pub(super) struct VncInner {
    pub session: Arc<Session>,
    pub info: ServerInfo,
    pub events: tokio::sync::Mutex<Receiver<VncEvent>>,
    pub cancel: CancellationToken,
    pub decoder_exited: Arc<AtomicBool>,
    pub net_task: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for VncInner {
    fn drop(&mut self) {
        info!("VNC Client {} stops", self.info.name);
        self.cancel.cancel();
    }
}

/// The instance of a connected vnc client
///
/// Cheap to clone, every clone drives the same connection. The outbound
/// methods never wait for the network and may be called from any thread.
#[derive(Clone)]
pub struct VncClient {
    inner: Arc<VncInner>,
}

impl VncClient {
    pub(super) fn new(inner: VncInner) -> Self {
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn server_info(&self) -> &ServerInfo {
        &self.inner.info
    }

    pub fn metrics(&self) -> &Arc<ConnectionMetrics> {
        self.inner.session.metrics()
    }

    pub fn is_running(&self) -> bool {
        !self.inner.cancel.is_cancelled() && !self.inner.decoder_exited.load(Ordering::Acquire)
    }

    fn session(&self) -> Result<&Session, VncError> {
        if self.is_running() {
            Ok(&self.inner.session)
        } else {
            Err(VncError::ClientNotRunning)
        }
    }

    /// Request an update of the whole screen
    pub fn request_update(&self, incremental: bool) -> Result<(), VncError> {
        self.session()?.request_update(incremental)
    }

    pub fn request_update_rect(&self, rect: Rect, incremental: bool) -> Result<(), VncError> {
        self.session()?.request_update_rect(rect, incremental)
    }

    /// Switch the pixel format, applied from the next framebuffer update on
    pub fn set_pixel_format(&self, format: PixelFormat) -> Result<(), VncError> {
        self.session()?.set_pixel_format(format)
    }

    pub fn change_encodings(&self, encodings: Vec<VncEncoding>) -> Result<(), VncError> {
        self.session()?.change_encodings(encodings)
    }

    pub fn send_mouse(&self, x: u16, y: u16, buttons: u8) -> Result<(), VncError> {
        self.session()?.send_mouse(x, y, buttons)
    }

    /// Press and release the key producing `c`
    pub fn send_key(&self, c: char) -> Result<(), VncError> {
        self.session()?.send_key(c)
    }

    pub fn send_raw_key(&self, keysym: u32, down: bool) -> Result<(), VncError> {
        self.session()?.send_raw_key(keysym, down)
    }

    pub fn send_modifier(&self, modifier: Modifier, down: bool) -> Result<(), VncError> {
        self.session()?.send_modifier(modifier, down)
    }

    /// Send a key combination, nothing else gets between its key events
    pub fn send_special_key(&self, key: SpecialKey) -> Result<(), VncError> {
        self.session()?.send_special_key(key)
    }

    pub fn release_all_modifiers(&self) -> Result<(), VncError> {
        self.session()?.release_all_modifiers()
    }

    /// Dropped silently unless the clipboard was enabled on the connector
    pub fn send_client_cut_text(&self, text: String) -> Result<(), VncError> {
        self.session()?.send_client_cut_text(text)
    }

    /// Hold back update requests until [VncClient::continue_updates]
    pub fn stop_updates(&self) -> Result<(), VncError> {
        self.session()?.stop_updates();
        Ok(())
    }

    pub fn continue_updates(&self) -> Result<(), VncError> {
        self.session()?.continue_updates()
    }

    /// Request the next update as soon as one has been decoded
    pub fn set_continuous_updates(&self, on: bool) -> Result<(), VncError> {
        self.session()?.set_continuous_updates(on);
        Ok(())
    }

    /// Receive a `VncEvent` from the engine
    /// This function will block until a `VncEvent` is received
    ///
    pub async fn recv_event(&self) -> Result<VncEvent, VncError> {
        match self.inner.events.lock().await.recv().await {
            Some(e) => Ok(e),
            None => Err(VncError::ClientNotRunning),
        }
    }

    /// polling `VncEvent` from the engine and give it to the client
    ///
    pub async fn poll_event(&self) -> Result<Option<VncEvent>, VncError> {
        match self.inner.events.lock().await.try_recv() {
            Err(TryRecvError::Disconnected) => Err(VncError::ClientNotRunning),
            Err(TryRecvError::Empty) => Ok(None),
            Ok(e) => Ok(Some(e)),
        }
    }

    /// Stop the VNC engine and release resources
    ///
    /// Returns once the socket is shut down and the metrics are final.
    pub async fn close(&self) -> Result<(), VncError> {
        self.inner.cancel.cancel();
        let net_task = self.inner.net_task.lock().take();
        if let Some(net_task) = net_task {
            if let Err(e) = net_task.await {
                error!("Net Connection task failed: {}", e);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{pool::BufferPool, stream, BufferOptions};
    use tokio::{io::duplex, sync::mpsc::unbounded_channel};

    #[test]
    fn data_signal_fires_once_and_close_releases_waiters() {
        let signal = Arc::new(DataSignal::default());
        assert!(!signal.wait(Duration::from_millis(10)));

        let waiter = {
            let signal = signal.clone();
            std::thread::spawn(move || signal.wait(Duration::from_secs(30)))
        };
        signal.close();
        assert!(!waiter.join().unwrap());

        signal.notify();
        assert!(signal.has_data());
        assert!(signal.wait(Duration::from_secs(30)));
    }

    #[derive(Default)]
    struct Log(Arc<parking_lot::Mutex<Vec<String>>>);

    impl FrameBuffer for Log {
        fn set_display(&mut self, screen: Screen, _: &PixelFormat) {
            self.0
                .lock()
                .push(format!("display {}x{}", screen.width, screen.height));
        }

        fn blit(&mut self, rect: &Rect, pixels: &[u8], _: &PixelFormat) {
            self.0
                .lock()
                .push(format!("blit {}x{} {}", rect.width, rect.height, pixels.len()));
        }

        fn copy_rect(&mut self, _: &Rect, src_x: u16, src_y: u16) {
            self.0.lock().push(format!("copy {} {}", src_x, src_y));
        }

        fn flush(&mut self) {
            self.0.lock().push("flush".to_string());
        }
    }

    #[tokio::test]
    async fn apply_thread_keeps_the_order_and_recycles_pixels() {
        let log = Log::default();
        let seen = log.0.clone();
        let pool = BufferPool::new();
        let (tx, rx) = tokio::sync::mpsc::channel(8);
        let apply = tokio::task::spawn_blocking(move || apply_loop(Box::new(log), rx));

        let format = PixelFormat::bgra();
        tx.send(ApplyOp::SetDisplay {
            screen: Screen::from((4, 4)),
            format,
        })
        .await
        .unwrap();
        tx.send(ApplyOp::Blit {
            rect: Rect::new(0, 0, 2, 2),
            pixels: pool.acquire(16, BufferOptions::default()).unwrap(),
            format,
        })
        .await
        .unwrap();
        tx.send(ApplyOp::Copy {
            dst: Rect::new(2, 2, 2, 2),
            src_x: 0,
            src_y: 0,
        })
        .await
        .unwrap();
        tx.send(ApplyOp::UpdateComplete).await.unwrap();
        drop(tx);
        apply.await.unwrap();

        assert_eq!(
            *seen.lock(),
            vec!["display 4x4", "blit 2x2 16", "copy 0 0", "flush"]
        );
        let stats = pool.stats();
        assert_eq!(stats.active, 0);
        assert_eq!(stats.free, 1);
    }

    #[tokio::test]
    async fn net_loop_shuts_the_socket_only_after_the_decoder_left() {
        let (client, mut server) = duplex(1024);
        let cancel = CancellationToken::new();
        let (feeder, mut reader) = stream::channel(4, cancel.clone());
        let (out_tx, out_rx) = unbounded_channel();
        let (exited_tx, exited_rx) = oneshot::channel();
        let signal = Arc::new(DataSignal::default());
        let metrics = ConnectionMetrics::new(None);
        let task = tokio::spawn(net_loop(
            client,
            feeder,
            out_rx,
            cancel.clone(),
            exited_rx,
            signal.clone(),
            metrics.clone(),
        ));

        server.write_all(b"hello").await.unwrap();
        assert_eq!(&reader.read_bytes(5).await.unwrap()[..], b"hello");
        assert!(signal.has_data());

        out_tx.send(Bytes::from_static(b"hi")).unwrap();
        let mut buf = [0; 2];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");

        cancel.cancel();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!metrics.is_closed());

        drop(reader);
        exited_tx.send(()).unwrap();
        task.await.unwrap();
        assert!(metrics.is_closed());
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.bytes_received, 5);
        assert_eq!(snapshot.bytes_sent, 2);

        let mut rest = Vec::new();
        assert_eq!(server.read_to_end(&mut rest).await.unwrap(), 0);
    }
}
