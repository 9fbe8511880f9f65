use std::fmt::{Display, Formatter};

/// The lifecycle of a fiber.
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum FiberState {
    /// Created or reset, never resumed.
    Init,
    /// Yielded and wants to run again as soon as possible.
    Ready,
    /// Running on some thread.
    Exec,
    /// Yielded and waits for someone to post it again.
    Hold,
    /// The body returned.
    Term,
    /// The body panicked.
    Except,
}

impl FiberState {
    /// Returns `true` if the body will never run again without a reset.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, FiberState::Term | FiberState::Except)
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => FiberState::Init,
            1 => FiberState::Ready,
            2 => FiberState::Exec,
            3 => FiberState::Hold,
            4 => FiberState::Term,
            _ => FiberState::Except,
        }
    }
}

impl Display for FiberState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(
            match self {
                FiberState::Init => "Init",
                FiberState::Ready => "Ready",
                FiberState::Exec => "Exec",
                FiberState::Hold => "Hold",
                FiberState::Term => "Term",
                FiberState::Except => "Except",
            },
            f,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_u8() {
        for state in [
            FiberState::Init,
            FiberState::Ready,
            FiberState::Exec,
            FiberState::Hold,
            FiberState::Term,
            FiberState::Except,
        ] {
            assert_eq!(state, FiberState::from_u8(state as u8));
        }
        assert!(FiberState::Except.is_terminal());
        assert!(!FiberState::Hold.is_terminal());
        assert_eq!("Hold", FiberState::Hold.to_string());
    }
}
