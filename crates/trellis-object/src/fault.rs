use thiserror::Error;

/// Error kind propagated across the bus as an int32 `error` header.
///
/// The discriminants are wire-stable: peers exchange them as integers, so
/// renumbering is a protocol break.
#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(i32)]
pub enum Fault {
    #[error("Generic failure")]
    Failure = 1,
    #[error("Malformed input")]
    Invalid = 2,
    #[error("Codec error")]
    Parse = 3,
    #[error("Bounded value out of range")]
    Range = 4,
    #[error("Capacity exceeded")]
    NoMem = 5,
    #[error("Requested entry does not exist")]
    NoEntry = 6,
    #[error("Configuration has unexpected shape")]
    Config = 7,
    #[error("Handle closed underneath")]
    NotConnected = 8,
    #[error("Unrecoverable failure")]
    Fatal = 9,
}

impl Fault {
    pub const fn to_wire(self) -> i32 {
        self as i32
    }

    /// Unknown codes map to `Failure` so a newer peer can't wedge an
    /// older one.
    pub const fn from_wire(code: i32) -> Self {
        match code {
            2 => Self::Invalid,
            3 => Self::Parse,
            4 => Self::Range,
            5 => Self::NoMem,
            6 => Self::NoEntry,
            7 => Self::Config,
            8 => Self::NotConnected,
            9 => Self::Fatal,
            _ => Self::Failure,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_roundtrip() {
        for kind in [
            Fault::Failure,
            Fault::Invalid,
            Fault::Parse,
            Fault::Range,
            Fault::NoMem,
            Fault::NoEntry,
            Fault::Config,
            Fault::NotConnected,
            Fault::Fatal,
        ] {
            assert_eq!(Fault::from_wire(kind.to_wire()), kind);
        }
    }

    #[test]
    fn unknown_code_is_failure() {
        assert_eq!(Fault::from_wire(0), Fault::Failure);
        assert_eq!(Fault::from_wire(-3), Fault::Failure);
        assert_eq!(Fault::from_wire(1000), Fault::Failure);
    }
}
