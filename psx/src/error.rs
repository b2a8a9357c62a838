use thiserror::Error;

/// Something wrong with how the machine was put together. Fatal at startup, never retried.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("component {0} registered twice")]
    DuplicateComponent(&'static str),

    #[error("required component {0} was never registered")]
    MissingComponent(&'static str),

    #[error("interrupt line {line} is already owned by {owner}")]
    DuplicateInterruptOwner { line: &'static str, owner: String },

    #[error("DMA channel {channel} is already owned by {owner}")]
    DuplicateDmaOwner { channel: &'static str, owner: String },

    #[error("BIOS image is {0} bytes, expected 512KiB")]
    BiosSize(usize),

    #[error("malformed executable: {0}")]
    MalformedExe(&'static str),

    #[error("{address:08x} already has a {kind} callback")]
    DuplicateCallback { address: u32, kind: &'static str },

    #[error("{address:08x} overlaps a {width}-bit {kind} callback at {existing:08x}")]
    WidthConflict { address: u32, kind: &'static str, existing: u32, width: u32 },

    #[error("{0:08x} is not in the hardware register window")]
    NotHardware(u32),

    #[error(transparent)]
    Address(#[from] AddressError),

    #[error(transparent)]
    Timing(#[from] timing::TimingError),
}

/// An address space access the caller asked for can't be honoured as asked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("{address:08x}+{size} straddles two regions")]
    Straddle { address: u32, size: u32 },

    #[error("nothing is mapped at {0:08x}")]
    Unbacked(u32),

    #[error("{0:08x} has no backing storage")]
    NoStorage(u32),

    #[error("{0:08x} is read-only")]
    ReadOnly(u32),
}
