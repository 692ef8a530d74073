use std::time::Duration;

use flate2::{Compress, Compression, FlushCompress};
use tokio::{
    io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream},
    sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
    time::timeout,
};
use vnc_engine::{
    Authenticator, FrameBuffer, PixelFormat, Rect, Screen, VncClient, VncConnector, VncEncoding,
    VncError, VncEvent, VncVersion,
};

#[derive(Debug)]
enum Call {
    Display(Screen),
    Blit(Rect, Vec<u8>),
    Copy(Rect, u16, u16),
    Flush,
}

struct Recorder(UnboundedSender<Call>);

impl FrameBuffer for Recorder {
    fn set_display(&mut self, screen: Screen, _: &PixelFormat) {
        let _ = self.0.send(Call::Display(screen));
    }

    fn blit(&mut self, rect: &Rect, pixels: &[u8], _: &PixelFormat) {
        let _ = self.0.send(Call::Blit(*rect, pixels.to_vec()));
    }

    fn copy_rect(&mut self, dst: &Rect, src_x: u16, src_y: u16) {
        let _ = self.0.send(Call::Copy(*dst, src_x, src_y));
    }

    fn flush(&mut self) {
        let _ = self.0.send(Call::Flush);
    }
}

const WAIT: Duration = Duration::from_secs(5);

fn init_logs() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_test_writer()
        .try_init();
}

fn rect_header(rect: Rect, encoding: i32) -> Vec<u8> {
    let mut out = Vec::new();
    for v in [rect.x, rect.y, rect.width, rect.height] {
        out.extend_from_slice(&v.to_be_bytes());
    }
    out.extend_from_slice(&encoding.to_be_bytes());
    out
}

/// Play the server side up to and including the first update request
///
/// `format` is the pixel format the client is expected to ask for.
async fn serve_handshake(
    server: &mut DuplexStream,
    encodings: usize,
    format: Option<PixelFormat>,
) {
    for b in b"RFB 003.008\n" {
        server.write_all(&[*b]).await.unwrap();
        tokio::task::yield_now().await;
    }
    let mut version = [0; 12];
    server.read_exact(&mut version).await.unwrap();
    assert_eq!(&version, b"RFB 003.008\n");

    server.write_all(&[1, 1]).await.unwrap();
    assert_eq!(server.read_u8().await.unwrap(), 1);
    server.write_all(&[0, 0, 0, 0]).await.unwrap();
    assert_eq!(server.read_u8().await.unwrap(), 1, "shared flag");

    let mut init = Vec::new();
    init.extend_from_slice(&32u16.to_be_bytes());
    init.extend_from_slice(&16u16.to_be_bytes());
    init.extend(Vec::<u8>::from(PixelFormat::bgra()));
    init.extend_from_slice(&4u32.to_be_bytes());
    init.extend_from_slice(b"test");
    server.write_all(&init).await.unwrap();

    if let Some(format) = format {
        let mut set_format = [0; 20];
        server.read_exact(&mut set_format).await.unwrap();
        assert_eq!(set_format[0], 0);
        assert_eq!(set_format[4..].to_vec(), Vec::<u8>::from(format));
    }

    let mut set_encodings = vec![0; 4 + 4 * encodings];
    server.read_exact(&mut set_encodings).await.unwrap();
    assert_eq!(set_encodings[0], 2);
    assert_eq!(u16::from_be_bytes([set_encodings[2], set_encodings[3]]) as usize, encodings);

    let mut request = [0; 10];
    server.read_exact(&mut request).await.unwrap();
    assert_eq!(request, [3, 0, 0, 0, 0, 0, 0, 32, 0, 16]);
}

async fn connect(
    encodings: &[VncEncoding],
) -> (VncClient, DuplexStream, UnboundedReceiver<Call>) {
    init_logs();
    let (client, mut server) = duplex(64 * 1024);
    let (tx, calls) = unbounded_channel();
    let mut connector = VncConnector::new(client, Recorder(tx));
    for encoding in encodings {
        connector = connector.add_encoding(*encoding);
    }
    let count = encodings.len();
    let (vnc, ()) = tokio::join!(
        async { connector.connect().await.unwrap() },
        serve_handshake(&mut server, count, None)
    );
    (vnc, server, calls)
}

async fn until_flush(calls: &mut UnboundedReceiver<Call>) -> Vec<Call> {
    let mut seen = Vec::new();
    loop {
        let call = timeout(WAIT, calls.recv()).await.unwrap().unwrap();
        if let Call::Flush = call {
            return seen;
        }
        seen.push(call);
    }
}

#[tokio::test]
async fn two_raw_rectangles_reach_the_frame_buffer() {
    let (vnc, mut server, mut calls) = connect(&[VncEncoding::Raw]).await;
    assert_eq!(vnc.server_info().name, "test");
    assert_eq!(vnc.server_info().screen, Screen::from((32, 16)));
    assert_eq!(vnc.server_info().version.minor, 8);

    let mut update = vec![0, 0, 0, 2];
    update.extend(rect_header(Rect::new(0, 0, 16, 16), 0));
    update.extend([0x11; 16 * 16 * 4]);
    update.extend(rect_header(Rect::new(16, 0, 16, 16), 0));
    update.extend([0x22; 16 * 16 * 4]);
    server.write_all(&update).await.unwrap();

    let seen = until_flush(&mut calls).await;
    assert!(matches!(seen[0], Call::Display(screen) if screen == Screen::from((32, 16))));
    let blits: Vec<_> = seen
        .iter()
        .filter_map(|call| match call {
            Call::Blit(rect, pixels) => Some((*rect, pixels)),
            _ => None,
        })
        .collect();
    assert_eq!(blits.len(), 2);
    assert_eq!(blits[0].0, Rect::new(0, 0, 16, 16));
    assert!(blits[0].1.iter().all(|b| *b == 0x11));
    assert_eq!(blits[1].0, Rect::new(16, 0, 16, 16));
    assert!(blits[1].1.iter().all(|b| *b == 0x22));

    let pixels: u64 = blits.iter().map(|(rect, _)| rect.area()).sum();
    assert_eq!(pixels, 512);
    assert_eq!(vnc.metrics().total_pixels(), 512);
    let snapshot = vnc.metrics().snapshot();
    assert_eq!(snapshot.total_rects, 2);
    assert_eq!(snapshot.total_requests, 1);
    assert!(snapshot.bytes_received >= 2 * 16 * 16 * 4);

    assert!(matches!(
        vnc.recv_event().await.unwrap(),
        VncEvent::SetResolution(_)
    ));
    assert!(matches!(
        vnc.recv_event().await.unwrap(),
        VncEvent::SetPixelFormat(format) if format == PixelFormat::bgra()
    ));
    assert!(vnc.poll_event().await.unwrap().is_none());

    vnc.send_mouse(3, 4, 1).unwrap();
    let mut pointer = [0; 6];
    server.read_exact(&mut pointer).await.unwrap();
    assert_eq!(pointer, [5, 1, 0, 3, 0, 4]);

    vnc.close().await.unwrap();
    assert!(!vnc.is_running());
    assert!(vnc.metrics().is_closed());
    let mut rest = Vec::new();
    assert_eq!(server.read_to_end(&mut rest).await.unwrap(), 0);
    assert!(matches!(
        vnc.send_mouse(0, 0, 0),
        Err(VncError::ClientNotRunning)
    ));
}

/// Keeps a one byte per pixel screen and hands out a copy on every flush
struct Canvas {
    width: usize,
    video: Vec<u8>,
    frames: UnboundedSender<Vec<u8>>,
}

impl FrameBuffer for Canvas {
    fn set_display(&mut self, screen: Screen, format: &PixelFormat) {
        assert_eq!(format.bytes_per_pixel(), 1);
        self.width = screen.width as usize;
        self.video = vec![0; screen.rect().area() as usize];
    }

    fn blit(&mut self, rect: &Rect, pixels: &[u8], _: &PixelFormat) {
        let width = rect.width as usize;
        for (y, row) in pixels.chunks(width).enumerate() {
            let start = (rect.y as usize + y) * self.width + rect.x as usize;
            self.video[start..start + width].copy_from_slice(row);
        }
    }

    fn copy_rect(&mut self, _: &Rect, _: u16, _: u16) {}

    fn flush(&mut self) {
        let _ = self.frames.send(self.video.clone());
    }
}

#[tokio::test]
async fn two_raw_rectangles_cover_a_bgr233_screen() {
    init_logs();
    let (client, mut server) = duplex(64 * 1024);
    let (tx, mut frames) = unbounded_channel();
    let canvas = Canvas {
        width: 0,
        video: Vec::new(),
        frames: tx,
    };
    let connector = VncConnector::new(client, canvas)
        .add_encoding(VncEncoding::Raw)
        .set_pixel_format(PixelFormat::bgr233());
    let (vnc, ()) = tokio::join!(
        async { connector.connect().await.unwrap() },
        serve_handshake(&mut server, 1, Some(PixelFormat::bgr233()))
    );
    assert_eq!(vnc.server_info().pixel_format, PixelFormat::bgr233());

    let mut update = vec![0, 0, 0, 2];
    update.extend(rect_header(Rect::new(0, 0, 16, 16), 0));
    update.extend([0xff; 16 * 16]);
    update.extend(rect_header(Rect::new(16, 0, 16, 16), 0));
    update.extend([0xff; 16 * 16]);
    server.write_all(&update).await.unwrap();

    let frame = timeout(WAIT, frames.recv()).await.unwrap().unwrap();
    assert_eq!(frame, vec![0xff; 32 * 16]);
    let snapshot = vnc.metrics().snapshot();
    assert_eq!(snapshot.total_pixels, 512);
    assert_eq!(snapshot.total_rects, 2);
    assert_eq!(snapshot.bytes_represented, 512);
    vnc.close().await.unwrap();
}

#[tokio::test]
async fn zlib_rectangles_share_one_stream() {
    let (vnc, mut server, mut calls) = connect(&[VncEncoding::Zlib, VncEncoding::Raw]).await;

    let mut compress = Compress::new(Compression::default(), true);
    let mut update = vec![0, 0, 0, 2];
    for (i, fill) in [0x33u8, 0x44].into_iter().enumerate() {
        let mut out = Vec::with_capacity(1024);
        compress
            .compress_vec(&[fill; 4 * 4 * 4], &mut out, FlushCompress::Sync)
            .unwrap();
        update.extend(rect_header(Rect::new(4 * i as u16, 0, 4, 4), 6));
        update.extend_from_slice(&(out.len() as u32).to_be_bytes());
        update.extend(out);
    }
    server.write_all(&update).await.unwrap();

    let seen = until_flush(&mut calls).await;
    let blits: Vec<_> = seen
        .iter()
        .filter_map(|call| match call {
            Call::Blit(_, pixels) => Some(pixels.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(blits, vec![vec![0x33; 64], vec![0x44; 64]]);
    assert!(vnc.metrics().compression_ratio() > 0.0);
    vnc.close().await.unwrap();
}

#[tokio::test]
async fn copy_rect_is_applied_in_order() {
    let (vnc, mut server, mut calls) = connect(&[VncEncoding::CopyRect, VncEncoding::Raw]).await;

    let mut update = vec![0, 0, 0, 1];
    update.extend(rect_header(Rect::new(8, 8, 4, 4), 1));
    update.extend([0, 1, 0, 2]);
    server.write_all(&update).await.unwrap();

    let seen = until_flush(&mut calls).await;
    assert!(matches!(
        seen.last(),
        Some(Call::Copy(rect, 1, 2)) if *rect == Rect::new(8, 8, 4, 4)
    ));
    vnc.close().await.unwrap();
}

#[tokio::test]
async fn unknown_encoding_terminates_with_an_error_event() {
    let (vnc, mut server, mut calls) = connect(&[VncEncoding::Raw]).await;

    let mut update = vec![0, 0, 0, 1];
    update.extend(rect_header(Rect::new(0, 0, 8, 8), 7));
    update.extend([0; 256]);
    server.write_all(&update).await.unwrap();

    let mut reason = None;
    while let Ok(event) = timeout(WAIT, vnc.recv_event()).await.unwrap() {
        if let VncEvent::Error(e) = event {
            reason = Some(e);
        }
    }
    assert!(reason.unwrap().contains('7'));
    assert!(!vnc.is_running());
    assert!(matches!(
        vnc.request_update(true),
        Err(VncError::ClientNotRunning)
    ));

    let mut blits = 0;
    while let Some(call) = timeout(WAIT, calls.recv()).await.unwrap() {
        if let Call::Blit(..) = call {
            blits += 1;
        }
    }
    assert_eq!(blits, 0);
    assert_eq!(vnc.metrics().total_pixels(), 0);

    vnc.close().await.unwrap();
    assert!(vnc.metrics().is_closed());
}

#[tokio::test]
async fn silent_server_fails_the_connect() {
    let (client, _server) = duplex(1024);
    let (tx, _calls) = unbounded_channel();
    let err = VncConnector::new(client, Recorder(tx))
        .add_encoding(VncEncoding::Raw)
        .set_connect_timeout(Duration::from_millis(50))
        .connect()
        .await
        .err()
        .unwrap();
    assert!(matches!(err, VncError::ServerSilent(_)));
}

#[tokio::test]
async fn protected_server_needs_an_authenticator() {
    let (client, mut server) = duplex(1024);
    let (tx, _calls) = unbounded_channel();
    server.write_all(b"RFB 003.008\n").await.unwrap();
    server.write_all(&[1, 2]).await.unwrap();
    let err = VncConnector::new(client, Recorder(tx))
        .add_encoding(VncEncoding::Raw)
        .connect()
        .await
        .err()
        .unwrap();
    assert!(matches!(err, VncError::NoAuthenticator));
}

struct Reverse;

impl Authenticator for Reverse {
    fn security_types(&self) -> &[u8] {
        &[2]
    }

    fn respond(&mut self, _: u8, challenge: &[u8]) -> Result<Vec<u8>, VncError> {
        Ok(challenge.iter().rev().copied().collect())
    }
}

#[tokio::test]
async fn failed_authentication_carries_the_reason() {
    let (client, mut server) = duplex(1024);
    let (tx, _calls) = unbounded_channel();
    let server_side = async move {
        server.write_all(b"RFB 003.008\n").await.unwrap();
        let mut version = [0; 12];
        server.read_exact(&mut version).await.unwrap();
        server.write_all(&[1, 2]).await.unwrap();
        assert_eq!(server.read_u8().await.unwrap(), 2);
        let challenge: Vec<u8> = (0..16).collect();
        server.write_all(&challenge).await.unwrap();
        let mut response = [0; 16];
        server.read_exact(&mut response).await.unwrap();
        assert_eq!(response[0], 15);
        server.write_all(&[0, 0, 0, 1, 0, 0, 0, 3]).await.unwrap();
        server.write_all(b"bad").await.unwrap();
        server
    };
    let connect = VncConnector::new(client, Recorder(tx))
        .add_encoding(VncEncoding::Raw)
        .set_version(VncVersion::RFB38)
        .set_authenticator(Reverse)
        .connect();
    let (result, _server) = tokio::join!(connect, server_side);
    assert!(matches!(result.err(), Some(VncError::AuthFailed(reason)) if reason == "bad"));
}

#[tokio::test]
async fn connect_without_encodings_is_refused() {
    let (client, _server) = duplex(1024);
    let (tx, _calls) = unbounded_channel();
    let err = VncConnector::new(client, Recorder(tx))
        .connect()
        .await
        .err()
        .unwrap();
    assert!(matches!(err, VncError::NoEncoding));
}
