use std::sync::Arc;
use tokio::sync::mpsc::Sender;
use tracing::trace;

use super::{connection::ApplyOp, messages::RectHeader};
use crate::{
    codec::{DecodeContext, EncodingRegistry, RectUpdate},
    metrics::ConnectionMetrics,
    pool::{BufferOptions, BufferPool},
    stream::StreamReader,
    PixelFormat, Rect, Screen, VncEncoding, VncError, VncEvent,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UpdateState {
    AwaitingRectCount,
    AwaitingRectHeader {
        remaining: u16,
    },
    DecodingRectBody {
        rect: Rect,
        encoding: VncEncoding,
        remaining: u16,
    },
    MessageComplete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct UpdateSummary {
    pub rects: u16,
    pub pixels: u64,
    pub resized: Option<Screen>,
}

/// Drives the rectangles of one FramebufferUpdate message
pub(crate) struct FrameUpdateDecoder {
    registry: EncodingRegistry,
    pool: Arc<BufferPool>,
    options: BufferOptions,
    apply: Sender<ApplyOp>,
    events: Sender<VncEvent>,
    metrics: Arc<ConnectionMetrics>,
    state: UpdateState,
}

impl FrameUpdateDecoder {
    pub fn new(
        pool: Arc<BufferPool>,
        options: BufferOptions,
        apply: Sender<ApplyOp>,
        events: Sender<VncEvent>,
        metrics: Arc<ConnectionMetrics>,
    ) -> Self {
        Self {
            registry: EncodingRegistry::new(),
            pool,
            options,
            apply,
            events,
            metrics,
            state: UpdateState::MessageComplete,
        }
    }

    pub fn state(&self) -> UpdateState {
        self.state
    }

    /// Decode the rest of a FramebufferUpdate, the type byte is already consumed
    ///
    /// Every rectangle which carries pixels must lie within `screen`.
    pub async fn read_update(
        &mut self,
        reader: &mut StreamReader,
        format: &PixelFormat,
        mut screen: Screen,
    ) -> Result<UpdateSummary, VncError> {
        let mut summary = UpdateSummary::default();
        self.state = UpdateState::AwaitingRectCount;
        loop {
            match self.state {
                UpdateState::AwaitingRectCount => {
                    //   +--------------+--------------+----------------------+
                    //   | No. of bytes | Type [Value] | Description          |
                    //   +--------------+--------------+----------------------+
                    //   | 1            | U8 [0]       | message-type         |
                    //   | 1            |              | padding              |
                    //   | 2            | U16          | number-of-rectangles |
                    //   +--------------+--------------+----------------------+
                    reader.skip(1).await?;
                    let count = reader.read_u16().await?;
                    trace!("Framebuffer update with {} rectangles", count);
                    self.state = match count {
                        0 => UpdateState::MessageComplete,
                        remaining => UpdateState::AwaitingRectHeader { remaining },
                    };
                }
                UpdateState::AwaitingRectHeader { remaining } => {
                    let header = RectHeader::read(reader).await?;
                    let encoding = VncEncoding::try_from(header.encoding)?;
                    match encoding {
                        VncEncoding::DesktopSizePseudo | VncEncoding::LastRectPseudo => {}
                        // the cursor has no position on screen but may not outgrow it
                        VncEncoding::CursorPseudo => check_within(
                            "cursor",
                            &Rect::new(0, 0, header.rect.width, header.rect.height),
                            screen,
                        )?,
                        _ => check_within("rectangle", &header.rect, screen)?,
                    }
                    self.state = UpdateState::DecodingRectBody {
                        rect: header.rect,
                        encoding,
                        remaining,
                    };
                }
                UpdateState::DecodingRectBody {
                    rect,
                    encoding,
                    remaining,
                } => {
                    let start = reader.consumed();
                    let update = {
                        let mut ctx = DecodeContext {
                            reader: &mut *reader,
                            format,
                            pool: &self.pool,
                            options: self.options,
                        };
                        self.registry.decode(encoding, &rect, &mut ctx).await?
                    };
                    let wire = reader.consumed() - start;
                    trace!("{:?} {:?} took {} bytes", encoding, rect, wire);
                    summary.rects += 1;

                    let mut last = remaining == 1;
                    match update {
                        RectUpdate::Pixels(pixels) => {
                            self.metrics.add_rect(&rect, wire);
                            summary.pixels += rect.area();
                            self.apply
                                .send(ApplyOp::Blit {
                                    rect,
                                    pixels,
                                    format: *format,
                                })
                                .await?;
                        }
                        RectUpdate::Copy { src_x, src_y } => {
                            let src = Rect::new(src_x, src_y, rect.width, rect.height);
                            check_within("copy source", &src, screen)?;
                            self.metrics.add_rect(&rect, wire);
                            summary.pixels += rect.area();
                            self.apply
                                .send(ApplyOp::Copy {
                                    dst: rect,
                                    src_x,
                                    src_y,
                                })
                                .await?;
                        }
                        RectUpdate::Cursor(image) => {
                            self.events.send(VncEvent::SetCursor(image)).await?;
                        }
                        RectUpdate::DesktopSize => {
                            screen = Screen::from((rect.width, rect.height));
                            self.apply
                                .send(ApplyOp::SetDisplay {
                                    screen,
                                    format: *format,
                                })
                                .await?;
                            self.events.send(VncEvent::SetResolution(screen)).await?;
                            summary.resized = Some(screen);
                        }
                        RectUpdate::LastRect => last = true,
                    }
                    self.state = if last {
                        UpdateState::MessageComplete
                    } else {
                        UpdateState::AwaitingRectHeader {
                            remaining: remaining - 1,
                        }
                    };
                }
                UpdateState::MessageComplete => {
                    self.apply.send(ApplyOp::UpdateComplete).await?;
                    return Ok(summary);
                }
            }
        }
    }
}

/// Fail with `Malformed` unless `rect` fits into `screen`
fn check_within(what: &str, rect: &Rect, screen: Screen) -> Result<(), VncError> {
    let right = rect.x as u32 + rect.width as u32;
    let bottom = rect.y as u32 + rect.height as u32;
    if right > screen.width as u32 || bottom > screen.height as u32 {
        return Err(VncError::malformed(format!(
            "{} {}x{}+{}+{} outside the {}x{} screen",
            what, rect.width, rect.height, rect.x, rect.y, screen.width, screen.height
        )));
    }
    Ok(())
}
