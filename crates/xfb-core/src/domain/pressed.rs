//! Set of keys and mouse buttons currently held down by the remote client.
//!
//! When the client disconnects or sends "quit" while something is still
//! pressed, the server must release it, or the local session keeps a stuck
//! key. Entries are unique per `(kind, code)` and the set is bounded.

/// Maximum number of simultaneously tracked inputs.
pub const MAX_PRESSED: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum InputKind {
    Mouse = 1,
    Keyboard = 2,
}

/// One held input: an X button number or an X keycode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PressedInput {
    pub kind: InputKind,
    pub code: u8,
}

#[derive(Debug, Default)]
pub struct PressedSet {
    entries: Vec<PressedInput>,
}

impl PressedSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `code` as held. Returns `false` if it already was, or if the
    /// set is full.
    pub fn insert(&mut self, kind: InputKind, code: u8) -> bool {
        let input = PressedInput { kind, code };
        if self.entries.contains(&input) || self.entries.len() >= MAX_PRESSED {
            return false;
        }
        self.entries.push(input);
        true
    }

    /// Forgets `code`. Returns `false` if it was not held.
    pub fn remove(&mut self, kind: InputKind, code: u8) -> bool {
        let input = PressedInput { kind, code };
        match self.entries.iter().position(|e| *e == input) {
            Some(i) => {
                // Order does not matter, so fill the hole with the last entry.
                self.entries.swap_remove(i);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, kind: InputKind, code: u8) -> bool {
        self.entries.contains(&PressedInput { kind, code })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= MAX_PRESSED
    }

    /// Empties the set and returns what was held, for releasing.
    pub fn take_all(&mut self) -> Vec<PressedInput> {
        std::mem::take(&mut self.entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_ignores_duplicates() {
        let mut set = PressedSet::new();
        assert!(set.insert(InputKind::Keyboard, 38));
        assert!(!set.insert(InputKind::Keyboard, 38));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_same_code_different_kind_are_distinct() {
        let mut set = PressedSet::new();
        assert!(set.insert(InputKind::Keyboard, 1));
        assert!(set.insert(InputKind::Mouse, 1));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_remove_swaps_last_into_hole() {
        // Arrange
        let mut set = PressedSet::new();
        set.insert(InputKind::Keyboard, 10);
        set.insert(InputKind::Keyboard, 11);
        set.insert(InputKind::Mouse, 1);

        // Act
        let removed = set.remove(InputKind::Keyboard, 10);

        // Assert
        assert!(removed);
        assert!(!set.contains(InputKind::Keyboard, 10));
        assert!(set.contains(InputKind::Keyboard, 11));
        assert!(set.contains(InputKind::Mouse, 1));
        assert!(!set.remove(InputKind::Keyboard, 10));
    }

    #[test]
    fn test_take_all_empties_set() {
        let mut set = PressedSet::new();
        set.insert(InputKind::Mouse, 3);
        set.insert(InputKind::Keyboard, 50);

        let held = set.take_all();

        assert_eq!(held.len(), 2);
        assert!(set.is_empty());
        assert!(set.take_all().is_empty());
    }

    #[test]
    fn test_insert_rejected_when_full() {
        let mut set = PressedSet::new();
        for code in 0..=255u8 {
            set.insert(InputKind::Keyboard, code);
        }
        assert!(set.is_full());
        assert!(!set.insert(InputKind::Mouse, 1));
    }
}
