//! ReplayInput: replays client key, button and motion events on the display.
//!
//! Every press and release is forwarded to an [`InputInjector`] and mirrored
//! in a [`PressedSet`], so that a disconnect or a quit message can release
//! everything still held down.

use tracing::{debug, trace, warn};
use xfb_core::domain::pressed::PressedInput;
use xfb_core::protocol::{Key, KeyEvent, MouseClick, MouseMove};
use xfb_core::{InputKind, PressedSet};

use crate::application::serve_framebuffer::DisplayError;

/// Synthetic input on the display server.
///
/// The X11 implementation lives in the infrastructure layer and uses XTEST.
pub trait InputInjector {
    /// Presses or releases the key with X keycode `keycode`.
    fn fake_key(&mut self, keycode: u8, down: bool) -> Result<(), DisplayError>;

    /// Presses or releases X button `button`.
    fn fake_button(&mut self, button: u8, down: bool) -> Result<(), DisplayError>;

    /// Moves the pointer to an absolute position on the root window.
    fn fake_motion(&mut self, x: u16, y: u16) -> Result<(), DisplayError>;

    /// Translates a keysym to the keycode currently producing it, for the
    /// legacy key message layout.
    fn keysym_to_keycode(&mut self, keysym: u32) -> Result<Option<u8>, DisplayError>;
}

/// The Replay Input use case.
#[derive(Debug, Default)]
pub struct ReplayInput {
    pressed: PressedSet,
}

impl ReplayInput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pressed(&self) -> &PressedSet {
        &self.pressed
    }

    /// Replays a key message. Unknown keysyms are logged and dropped.
    pub fn handle_key(&mut self, injector: &mut dyn InputInjector, event: KeyEvent) -> Result<(), DisplayError> {
        let keycode = match event.key {
            Key::Keycode(keycode) => keycode,
            Key::Keysym(keysym) => match injector.keysym_to_keycode(keysym)? {
                Some(keycode) => keycode,
                None => {
                    warn!("no keycode for keysym {keysym:#06x}, dropping key event");
                    return Ok(());
                }
            },
        };
        trace!("key: kc={keycode:#04x} down={}", event.down);
        injector.fake_key(keycode, event.down)?;
        self.track(InputKind::Keyboard, keycode, event.down);
        Ok(())
    }

    pub fn handle_click(&mut self, injector: &mut dyn InputInjector, click: MouseClick) -> Result<(), DisplayError> {
        injector.fake_button(click.button, click.down)?;
        self.track(InputKind::Mouse, click.button, click.down);
        Ok(())
    }

    pub fn handle_move(&mut self, injector: &mut dyn InputInjector, motion: MouseMove) -> Result<(), DisplayError> {
        injector.fake_motion(motion.x, motion.y)
    }

    /// Releases everything still held and empties the set.
    ///
    /// Every release is attempted even if an earlier one fails; the first
    /// error is returned.
    pub fn release_all(&mut self, injector: &mut dyn InputInjector) -> Result<(), DisplayError> {
        let held = self.pressed.take_all();
        if !held.is_empty() {
            debug!("releasing {} held input(s)", held.len());
        }
        let mut first_error = None;
        for PressedInput { kind, code } in held {
            let result = match kind {
                InputKind::Keyboard => injector.fake_key(code, false),
                InputKind::Mouse => injector.fake_button(code, false),
            };
            if let Err(e) = result {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn track(&mut self, kind: InputKind, code: u8, down: bool) {
        if down {
            if !self.pressed.insert(kind, code) && self.pressed.is_full() {
                warn!("pressed-input set full, {kind:?} {code} will not be auto-released");
            }
        } else {
            self.pressed.remove(kind, code);
        }
    }
}
