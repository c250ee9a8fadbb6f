use std::sync::atomic::{AtomicU8, Ordering};

/// Down / disposed state of a pool or listener as an atomic bitfield
#[derive(Debug)]
pub struct PoolFlags(AtomicU8);

impl PoolFlags {
    const S_DOWN: u8 = 1 << 0; // Subjectively down
    const O_DOWN: u8 = 1 << 1; // Objectively down
    const DISCONNECTED: u8 = 1 << 2; // Own connection attempts failing
    const DISPOSED: u8 = 1 << 3;

    pub fn new() -> Self {
        Self(AtomicU8::new(0))
    }

    #[inline]
    fn get(&self, flag: u8) -> bool {
        self.0.load(Ordering::Acquire) & flag != 0
    }

    #[inline]
    fn set(&self, flag: u8, value: bool) {
        if value {
            self.0.fetch_or(flag, Ordering::AcqRel);
        } else {
            self.0.fetch_and(!flag, Ordering::AcqRel);
        }
    }

    pub fn is_sdown(&self) -> bool {
        self.get(Self::S_DOWN)
    }
    pub fn set_sdown(&self, v: bool) {
        self.set(Self::S_DOWN, v);
    }

    pub fn is_odown(&self) -> bool {
        self.get(Self::O_DOWN)
    }
    pub fn set_odown(&self, v: bool) {
        self.set(Self::O_DOWN, v);
    }

    pub fn is_disconnected(&self) -> bool {
        self.get(Self::DISCONNECTED)
    }
    pub fn set_disconnected(&self, v: bool) {
        self.set(Self::DISCONNECTED, v);
    }

    /// Unusable: objectively down, disconnected or disposed
    pub fn is_down(&self) -> bool {
        self.get(Self::O_DOWN | Self::DISCONNECTED | Self::DISPOSED)
    }

    pub fn is_disposed(&self) -> bool {
        self.get(Self::DISPOSED)
    }

    /// Marks disposed; returns true only for the call that flipped the flag
    pub fn mark_disposed(&self) -> bool {
        self.0.fetch_or(Self::DISPOSED, Ordering::AcqRel) & Self::DISPOSED == 0
    }

    /// Format flags for display (matching Redis sentinel flag names)
    pub fn format(&self) -> String {
        let mut flags = Vec::with_capacity(4);
        if self.is_sdown() {
            flags.push("s_down");
        }
        if self.is_odown() {
            flags.push("o_down");
        }
        if self.is_disconnected() {
            flags.push("disconnected");
        }
        if self.is_disposed() {
            flags.push("disposed");
        }

        if flags.is_empty() {
            "none".to_string()
        } else {
            flags.join(",")
        }
    }
}

impl Default for PoolFlags {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_down_flags() {
        let flags = PoolFlags::new();
        assert!(!flags.is_down());
        assert_eq!(flags.format(), "none");

        flags.set_sdown(true);
        assert!(flags.is_sdown());
        assert!(!flags.is_down());

        flags.set_odown(true);
        assert!(flags.is_down());
        assert_eq!(flags.format(), "s_down,o_down");

        flags.set_odown(false);
        flags.set_sdown(false);
        assert!(!flags.is_down());

        flags.set_disconnected(true);
        assert!(flags.is_down());
    }

    #[test]
    fn test_mark_disposed_once() {
        let flags = PoolFlags::new();
        assert!(flags.mark_disposed());
        assert!(!flags.mark_disposed());
        assert!(flags.is_disposed());
        assert!(flags.is_down());
    }
}
