//! The outbound half of a connection.
//!
//! Every client to server message is composed here and queued for the
//! network task. Callers may come from any thread. The writer lock is
//! reentrant so a helper that sends a multi message sequence can call the
//! single message helpers while keeping the sequence contiguous.

use bytes::Bytes;
use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, trace};

use super::{
    keys::{char_to_keysym, KeyStroke, Modifier, ModifierKeyMap, SpecialKey},
    messages::ClientMsg,
    quirks::ServerFlavor,
};
use crate::{metrics::ConnectionMetrics, PixelFormat, Rect, Screen, VncEncoding, VncError};

struct SessionState {
    pixel_format: PixelFormat,
    /// set by `set_pixel_format`, cleared once the decoder picked it up
    format_changed: bool,
    screen: Screen,
    encodings: Vec<VncEncoding>,
    keymap: ModifierKeyMap,
    flavor: ServerFlavor,
    /// a request made while updates were stopped, `true` if incremental
    deferred: Option<bool>,
    pointer: (u16, u16, u8),
}

pub(crate) struct Session {
    writer: ReentrantMutex<UnboundedSender<Bytes>>,
    metrics: Arc<ConnectionMetrics>,
    state: Mutex<SessionState>,
    continuous: AtomicBool,
    stopped: AtomicBool,
    clipboard: AtomicBool,
}

impl Session {
    pub fn new(
        writer: UnboundedSender<Bytes>,
        metrics: Arc<ConnectionMetrics>,
        encodings: Vec<VncEncoding>,
        continuous: bool,
        clipboard: bool,
    ) -> Self {
        Self {
            writer: ReentrantMutex::new(writer),
            metrics,
            state: Mutex::new(SessionState {
                pixel_format: PixelFormat::default(),
                format_changed: false,
                screen: Screen::default(),
                encodings,
                keymap: ModifierKeyMap::STANDARD,
                flavor: ServerFlavor::Generic,
                deferred: None,
                pointer: (0, 0, 0),
            }),
            continuous: AtomicBool::new(continuous),
            stopped: AtomicBool::new(false),
            clipboard: AtomicBool::new(clipboard),
        }
    }

    pub fn lock_writer(&self) -> ReentrantMutexGuard<'_, UnboundedSender<Bytes>> {
        self.writer.lock()
    }

    /// Queue bytes which are not a client message, e.g. handshake replies
    pub fn write_raw(&self, bytes: Bytes) -> Result<(), VncError> {
        self.lock_writer()
            .send(bytes)
            .map_err(|_| VncError::ClientNotRunning)
    }

    pub fn send(&self, msg: ClientMsg) -> Result<(), VncError> {
        trace!("Client message: {:?}", msg);
        if let ClientMsg::FramebufferUpdateRequest { .. } = msg {
            self.metrics.add_update_request();
        }
        self.write_raw(msg.encode())
    }

    pub fn metrics(&self) -> &Arc<ConnectionMetrics> {
        &self.metrics
    }

    // handshake results

    pub fn set_display(&self, screen: Screen, format: PixelFormat) {
        let mut state = self.state.lock();
        state.screen = screen;
        state.pixel_format = format;
        state.format_changed = false;
        self.metrics.set_bytes_per_pixel(format.bytes_per_pixel());
    }

    pub fn set_screen(&self, screen: Screen) {
        self.state.lock().screen = screen;
    }

    pub fn set_flavor(&self, flavor: ServerFlavor, keymap: ModifierKeyMap) {
        let mut state = self.state.lock();
        state.flavor = flavor;
        state.keymap = keymap;
    }

    pub fn screen(&self) -> Screen {
        self.state.lock().screen
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.state.lock().pixel_format
    }

    pub fn flavor(&self) -> ServerFlavor {
        self.state.lock().flavor
    }

    pub fn encodings(&self) -> Vec<VncEncoding> {
        self.state.lock().encodings.clone()
    }

    /// The pixel format set by the client since the last call, if any
    pub fn take_format_change(&self) -> Option<PixelFormat> {
        let mut state = self.state.lock();
        if !state.format_changed {
            return None;
        }
        state.format_changed = false;
        self.metrics.set_bytes_per_pixel(state.pixel_format.bytes_per_pixel());
        Some(state.pixel_format)
    }

    // update scheduling

    pub fn request_update(&self, incremental: bool) -> Result<(), VncError> {
        let rect = self.screen().rect();
        self.request_update_rect(rect, incremental)
    }

    pub fn request_update_rect(&self, rect: Rect, incremental: bool) -> Result<(), VncError> {
        if self.stopped.load(Ordering::Acquire) {
            let mut state = self.state.lock();
            state.deferred = Some(state.deferred.unwrap_or(true) && incremental);
            trace!("Updates stopped, request deferred");
            return Ok(());
        }
        self.send(ClientMsg::FramebufferUpdateRequest { rect, incremental })
    }

    /// A framebuffer update has been decoded completely
    pub fn update_complete(&self) -> Result<(), VncError> {
        if self.continuous.load(Ordering::Acquire) && !self.stopped.load(Ordering::Acquire) {
            self.request_update(true)?;
        }
        Ok(())
    }

    pub fn stop_updates(&self) {
        debug!("Updates stopped");
        self.stopped.store(true, Ordering::Release);
    }

    /// Resume updates, sending the request deferred while stopped
    pub fn continue_updates(&self) -> Result<(), VncError> {
        debug!("Updates continued");
        self.stopped.store(false, Ordering::Release);
        let deferred = self.state.lock().deferred.take();
        match deferred {
            Some(incremental) => self.request_update(incremental),
            None => Ok(()),
        }
    }

    pub fn set_continuous_updates(&self, on: bool) {
        self.continuous.store(on, Ordering::Release);
    }

    pub fn is_continuous(&self) -> bool {
        self.continuous.load(Ordering::Acquire)
    }

    // session parameters

    pub fn set_pixel_format(&self, format: PixelFormat) -> Result<(), VncError> {
        let _writer = self.lock_writer();
        {
            let mut state = self.state.lock();
            state.pixel_format = format;
            state.format_changed = true;
        }
        self.send(ClientMsg::SetPixelFormat(format))
    }

    pub fn change_encodings(&self, encodings: Vec<VncEncoding>) -> Result<(), VncError> {
        if encodings.is_empty() {
            return Err(VncError::NoEncoding);
        }
        self.state.lock().encodings = encodings.clone();
        self.send(ClientMsg::SetEncodings(encodings))
    }

    // input

    pub fn send_mouse(&self, x: u16, y: u16, buttons: u8) -> Result<(), VncError> {
        self.state.lock().pointer = (x, y, buttons);
        self.send(ClientMsg::PointerEvent { x, y, buttons })
    }

    pub fn pointer(&self) -> (u16, u16, u8) {
        self.state.lock().pointer
    }

    pub fn send_raw_key(&self, keysym: u32, down: bool) -> Result<(), VncError> {
        self.send(ClientMsg::KeyEvent { keysym, down })
    }

    /// Press and release the key for `c`
    pub fn send_key(&self, c: char) -> Result<(), VncError> {
        let keysym = char_to_keysym(c);
        let _writer = self.lock_writer();
        self.send_raw_key(keysym, true)?;
        self.send_raw_key(keysym, false)
    }

    pub fn send_modifier(&self, modifier: Modifier, down: bool) -> Result<(), VncError> {
        let keysym = self.state.lock().keymap.keysym(modifier);
        self.send_raw_key(keysym, down)
    }

    pub fn send_special_key(&self, key: SpecialKey) -> Result<(), VncError> {
        let _writer = self.lock_writer();
        for stroke in key.strokes() {
            match stroke {
                KeyStroke::Modifier(modifier, down) => self.send_modifier(modifier, down)?,
                KeyStroke::Key(keysym, down) => self.send_raw_key(keysym, down)?,
            }
        }
        Ok(())
    }

    pub fn release_all_modifiers(&self) -> Result<(), VncError> {
        let _writer = self.lock_writer();
        for modifier in Modifier::ALL {
            self.send_modifier(modifier, false)?;
        }
        Ok(())
    }

    pub fn set_clipboard(&self, on: bool) {
        self.clipboard.store(on, Ordering::Release);
    }

    pub fn send_client_cut_text(&self, text: String) -> Result<(), VncError> {
        if !self.clipboard.load(Ordering::Acquire) {
            debug!("Clipboard disabled, cut text dropped");
            return Ok(());
        }
        self.send(ClientMsg::ClientCutText(text))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::client::keys::{XK_ALT_L, XK_DELETE, XK_META_L};
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

    pub(crate) fn test_session() -> (Session, UnboundedReceiver<Bytes>) {
        let (tx, rx) = unbounded_channel();
        let session = Session::new(
            tx,
            ConnectionMetrics::new(None),
            vec![VncEncoding::Raw],
            false,
            true,
        );
        (session, rx)
    }

    fn drain(rx: &mut UnboundedReceiver<Bytes>) -> Vec<Bytes> {
        let mut out = Vec::new();
        while let Ok(b) = rx.try_recv() {
            out.push(b);
        }
        out
    }

    fn keysym(msg: &Bytes) -> (u32, bool) {
        assert_eq!(msg[0], 4);
        (
            u32::from_be_bytes([msg[4], msg[5], msg[6], msg[7]]),
            msg[1] == 1,
        )
    }

    #[test]
    fn requests_made_while_stopped_are_deferred() {
        let (session, mut rx) = test_session();
        session.set_screen(Screen::from((64, 32)));

        session.stop_updates();
        session.request_update(true).unwrap();
        session.request_update(false).unwrap();
        assert!(drain(&mut rx).is_empty());

        session.continue_updates().unwrap();
        let sent = drain(&mut rx);
        assert_eq!(sent.len(), 1);
        assert_eq!(&sent[0][..], &[3, 0, 0, 0, 0, 0, 0, 64, 0, 32]);
        assert_eq!(session.metrics().snapshot().total_requests, 1);
    }

    #[test]
    fn continuous_mode_requests_after_each_update() {
        let (session, mut rx) = test_session();
        session.update_complete().unwrap();
        assert!(drain(&mut rx).is_empty());

        session.set_continuous_updates(true);
        session.update_complete().unwrap();
        assert_eq!(drain(&mut rx).len(), 1);

        session.stop_updates();
        session.update_complete().unwrap();
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn special_keys_follow_the_keymap() {
        let (session, mut rx) = test_session();
        session.set_flavor(ServerFlavor::AppleRemoteDesktop, ModifierKeyMap::APPLE);
        session.send_special_key(SpecialKey::ControlAltDelete).unwrap();
        let keys: Vec<_> = drain(&mut rx).iter().map(keysym).collect();
        assert_eq!(keys.len(), 6);
        assert_eq!(keys[1], (XK_META_L, true));
        assert_eq!(keys[2], (XK_DELETE, true));
        assert_eq!(keys[4], (XK_META_L, false));

        session.set_flavor(ServerFlavor::Generic, ModifierKeyMap::STANDARD);
        session.release_all_modifiers().unwrap();
        let keys: Vec<_> = drain(&mut rx).iter().map(keysym).collect();
        assert!(keys.contains(&(XK_ALT_L, false)));
        assert!(keys.iter().all(|(_, down)| !down));
    }

    #[test]
    fn clipboard_gate() {
        let (session, mut rx) = test_session();
        session.set_clipboard(false);
        session.send_client_cut_text("secret".to_string()).unwrap();
        assert!(drain(&mut rx).is_empty());
        session.set_clipboard(true);
        session.send_client_cut_text("hi".to_string()).unwrap();
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[test]
    fn pixel_format_change_is_picked_up_once() {
        let (session, _rx) = test_session();
        session.set_pixel_format(PixelFormat::bgr233()).unwrap();
        assert_eq!(session.take_format_change(), Some(PixelFormat::bgr233()));
        assert_eq!(session.take_format_change(), None);
    }

    #[test]
    fn closed_writer_reports_not_running() {
        let (session, rx) = test_session();
        drop(rx);
        assert!(matches!(
            session.send_raw_key(0x61, true),
            Err(VncError::ClientNotRunning)
        ));
    }
}
