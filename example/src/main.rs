use anyhow::{Context, Result};
use std::{sync::Arc, time::Duration};
use tokio::{self, net::TcpStream};
use tracing::Level;
use vnc_engine::{
    FrameBuffer, MetricsDelegate, MetricsSnapshot, PixelFormat, Rect, Screen, VncConnector,
    VncEncoding, VncEvent,
};

/// Keeps the remote screen in memory as `0x00rrggbb` words
struct Canvas {
    video: Vec<u32>,
    width: usize,
    height: usize,
    frames: u64,
}

impl Canvas {
    fn new() -> Self {
        Self {
            video: vec![],
            width: 0,
            height: 0,
            frames: 0,
        }
    }
}

impl FrameBuffer for Canvas {
    fn set_display(&mut self, screen: Screen, format: &PixelFormat) {
        tracing::info!("Resize {:?} {:?}", screen, format);
        self.width = screen.width as usize;
        self.height = screen.height as usize;
        self.video.clear();
        self.video.resize(self.width * self.height, 0);
    }

    fn blit(&mut self, rect: &Rect, pixels: &[u8], format: &PixelFormat) {
        let bpp = format.bytes_per_pixel();
        let mut s_idx = 0;
        for y in rect.y as usize..rect.y as usize + rect.height as usize {
            let mut d_idx = y * self.width + rect.x as usize;
            for _ in 0..rect.width {
                let [r, g, b] = format.to_rgb8(format.pixel_value(&pixels[s_idx..s_idx + bpp]));
                if let Some(dst) = self.video.get_mut(d_idx) {
                    *dst = u32::from_be_bytes([0, r, g, b]);
                }
                s_idx += bpp;
                d_idx += 1;
            }
        }
    }

    fn copy_rect(&mut self, dst: &Rect, src_x: u16, src_y: u16) {
        let width = dst.width as usize;
        let mut tmp = Vec::with_capacity(width * dst.height as usize);
        for y in 0..dst.height as usize {
            let s_idx = (src_y as usize + y) * self.width + src_x as usize;
            tmp.extend_from_slice(&self.video[s_idx..s_idx + width]);
        }
        for (y, row) in tmp.chunks(width).enumerate() {
            let d_idx = (dst.y as usize + y) * self.width + dst.x as usize;
            self.video[d_idx..d_idx + width].copy_from_slice(row);
        }
    }

    fn flush(&mut self) {
        self.frames += 1;
        tracing::trace!("Frame {} complete", self.frames);
    }
}

struct LogRates;

impl MetricsDelegate for LogRates {
    fn metrics_did_update(&self, snapshot: &MetricsSnapshot) {
        tracing::info!(
            "in {:.0} B/s, out {:.0} B/s, {:.0} px/s, ratio {:.2}",
            snapshot.in_rate,
            snapshot.out_rate,
            snapshot.pixel_rate,
            snapshot.compression_ratio
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Create tracing subscriber
    #[cfg(debug_assertions)]
    let subscriber = tracing_subscriber::fmt()
        .pretty()
        .with_max_level(Level::TRACE)
        .finish();
    #[cfg(not(debug_assertions))]
    let subscriber = tracing_subscriber::fmt()
        .pretty()
        .with_max_level(Level::INFO)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:5900".to_string());
    let tcp = TcpStream::connect(&addr)
        .await
        .with_context(|| format!("Unable to connect to {}", addr))?;
    let vnc = VncConnector::new(tcp, Canvas::new())
        .add_encoding(VncEncoding::Zrle)
        .add_encoding(VncEncoding::Hextile)
        .add_encoding(VncEncoding::Zlib)
        .add_encoding(VncEncoding::CopyRect)
        .add_encoding(VncEncoding::Raw)
        .add_encoding(VncEncoding::CursorPseudo)
        .add_encoding(VncEncoding::DesktopSizePseudo)
        .allow_shared(true)
        .set_pixel_format(PixelFormat::bgra())
        .set_update_interval(Duration::from_millis(16))
        .set_metrics_delegate(Arc::new(LogRates))
        .set_connect_timeout(Duration::from_secs(10))
        .connect()
        .await?;
    tracing::info!("Connected to {:?}", vnc.server_info());

    loop {
        match vnc.recv_event().await {
            Ok(VncEvent::Error(reason)) => {
                tracing::error!("{}", reason);
                break;
            }
            Ok(VncEvent::Bell) => {
                tracing::warn!("Bell event got, but ignore it");
            }
            Ok(VncEvent::Text(string)) => {
                tracing::info!("Got clipboard message {}", string);
            }
            Ok(event) => tracing::debug!("{:?}", event),
            Err(e) => {
                tracing::error!("{}", e.to_string());
                break;
            }
        }
    }
    let _ = vnc.close().await;
    Ok(())
}
