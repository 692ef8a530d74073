//! Keysyms and the key sequences built from them.

pub const XK_BACKSPACE: u32 = 0xff08;
pub const XK_TAB: u32 = 0xff09;
pub const XK_RETURN: u32 = 0xff0d;
pub const XK_PAUSE: u32 = 0xff13;
pub const XK_ESCAPE: u32 = 0xff1b;
pub const XK_PRINT: u32 = 0xff61;
pub const XK_EXECUTE: u32 = 0xff62;
pub const XK_INSERT: u32 = 0xff63;
pub const XK_BREAK: u32 = 0xff6b;
pub const XK_SHIFT_L: u32 = 0xffe1;
pub const XK_CONTROL_L: u32 = 0xffe3;
pub const XK_META_L: u32 = 0xffe7;
pub const XK_ALT_L: u32 = 0xffe9;
pub const XK_DELETE: u32 = 0xffff;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Modifier {
    Shift,
    Control,
    /// Option on Apple keyboards
    Alt,
    Command,
}

impl Modifier {
    pub const ALL: [Modifier; 4] = [
        Modifier::Shift,
        Modifier::Control,
        Modifier::Alt,
        Modifier::Command,
    ];
}

/// Which keysym each modifier is sent as
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModifierKeyMap {
    pub shift: u32,
    pub control: u32,
    pub alt: u32,
    pub command: u32,
}

impl ModifierKeyMap {
    pub const STANDARD: ModifierKeyMap = ModifierKeyMap {
        shift: XK_SHIFT_L,
        control: XK_CONTROL_L,
        alt: XK_ALT_L,
        command: XK_META_L,
    };

    /// Apple Remote Desktop reads Alt as Command and Meta as Option
    pub const APPLE: ModifierKeyMap = ModifierKeyMap {
        shift: XK_SHIFT_L,
        control: XK_CONTROL_L,
        alt: XK_META_L,
        command: XK_ALT_L,
    };

    pub fn keysym(&self, modifier: Modifier) -> u32 {
        match modifier {
            Modifier::Shift => self.shift,
            Modifier::Control => self.control,
            Modifier::Alt => self.alt,
            Modifier::Command => self.command,
        }
    }
}

impl Default for ModifierKeyMap {
    fn default() -> Self {
        Self::STANDARD
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecialKey {
    CommandOptionEscape,
    ControlAltDelete,
    Pause,
    Break,
    Print,
    Execute,
    Insert,
    Delete,
}

/// One step of a special key sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum KeyStroke {
    Modifier(Modifier, bool),
    Key(u32, bool),
}

impl SpecialKey {
    pub(crate) fn strokes(self) -> Vec<KeyStroke> {
        let tap = |keysym| vec![KeyStroke::Key(keysym, true), KeyStroke::Key(keysym, false)];
        let chord = |first, second, keysym| {
            let mut strokes = vec![
                KeyStroke::Modifier(first, true),
                KeyStroke::Modifier(second, true),
            ];
            strokes.extend(tap(keysym));
            strokes.push(KeyStroke::Modifier(second, false));
            strokes.push(KeyStroke::Modifier(first, false));
            strokes
        };
        match self {
            SpecialKey::CommandOptionEscape => chord(Modifier::Command, Modifier::Alt, XK_ESCAPE),
            SpecialKey::ControlAltDelete => chord(Modifier::Control, Modifier::Alt, XK_DELETE),
            SpecialKey::Pause => tap(XK_PAUSE),
            SpecialKey::Break => tap(XK_BREAK),
            SpecialKey::Print => tap(XK_PRINT),
            SpecialKey::Execute => tap(XK_EXECUTE),
            SpecialKey::Insert => tap(XK_INSERT),
            SpecialKey::Delete => tap(XK_DELETE),
        }
    }
}

/// The keysym typing `c` produces
pub fn char_to_keysym(c: char) -> u32 {
    match c {
        '\n' | '\r' => XK_RETURN,
        '\t' => XK_TAB,
        '\u{8}' => XK_BACKSPACE,
        '\u{1b}' => XK_ESCAPE,
        '\u{7f}' => XK_DELETE,
        // Latin-1 keysyms are the code points
        ' '..='~' | '\u{a0}'..='\u{ff}' => c as u32,
        _ => 0x0100_0000 | c as u32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn characters_to_keysyms() {
        assert_eq!(char_to_keysym('a'), 0x61);
        assert_eq!(char_to_keysym('é'), 0xe9);
        assert_eq!(char_to_keysym('\n'), XK_RETURN);
        assert_eq!(char_to_keysym('€'), 0x0100_20ac);
    }

    #[test]
    fn chords_release_in_reverse() {
        let strokes = SpecialKey::ControlAltDelete.strokes();
        assert_eq!(
            strokes,
            vec![
                KeyStroke::Modifier(Modifier::Control, true),
                KeyStroke::Modifier(Modifier::Alt, true),
                KeyStroke::Key(XK_DELETE, true),
                KeyStroke::Key(XK_DELETE, false),
                KeyStroke::Modifier(Modifier::Alt, false),
                KeyStroke::Modifier(Modifier::Control, false),
            ]
        );
    }

    #[test]
    fn apple_swaps_option_and_command() {
        assert_eq!(ModifierKeyMap::APPLE.keysym(Modifier::Command), XK_ALT_L);
        assert_eq!(ModifierKeyMap::STANDARD.keysym(Modifier::Command), XK_META_L);
    }
}
