//! # VNC engine
//!
//! An async decode engine for the client side of the RFB (VNC) protocol.
//!
//! The engine takes any full duplex `AsyncRead + AsyncWrite` stream and a
//! [FrameBuffer] to draw into. [VncConnector] runs the handshake, after which
//! the returned [VncClient] decodes server messages in the background and
//! offers the outbound side of the protocol (update requests, pointer, keys
//! and clipboard).
//!
//! Supported encodings are Raw, CopyRect, RRE, CoRRE, Hextile, Zlib and ZRLE,
//! plus the Cursor, DesktopSize and LastRect pseudo encodings.
//!
//! ```no_run
//! use vnc_engine::{FrameBuffer, PixelFormat, Rect, Screen, VncConnector, VncEncoding, VncEvent};
//! use tokio::net::TcpStream;
//!
//! struct Discard;
//!
//! impl FrameBuffer for Discard {
//!     fn set_display(&mut self, _: Screen, _: &PixelFormat) {}
//!     fn blit(&mut self, _: &Rect, _: &[u8], _: &PixelFormat) {}
//!     fn copy_rect(&mut self, _: &Rect, _: u16, _: u16) {}
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let tcp = TcpStream::connect("127.0.0.1:5900").await?;
//!     let vnc = VncConnector::new(tcp, Discard)
//!         .add_encoding(VncEncoding::Zrle)
//!         .add_encoding(VncEncoding::Raw)
//!         .continuous_updates(true)
//!         .connect()
//!         .await?;
//!     while let Ok(event) = vnc.recv_event().await {
//!         if let VncEvent::Error(reason) = event {
//!             eprintln!("{}", reason);
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod client;
mod codec;
pub mod config;
pub mod error;
pub mod event;
pub mod metrics;
pub mod pool;
pub mod stream;

pub use client::*;
pub use config::{PixelFormat, ServerVersion, VncEncoding, VncVersion};
pub use error::{ErrorKind, VncError};
pub use event::*;
pub use metrics::{ConnectionMetrics, MetricsDelegate, MetricsSnapshot};
pub use pool::{BufferOptions, BufferPool, PoolStats, PooledBuffer};
