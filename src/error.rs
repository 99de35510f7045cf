/// Errors produced while decoding frames or validating configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The frame holds fewer bytes than the decoder reads.
    #[error("Frame too short - required={required} received={received}")]
    FrameTooShort { required: usize, received: usize },
    /// The frame type byte does not name a known frame.
    #[error("Unknown frame type 0x{0:02X}")]
    UnknownFrameType(u8),
    /// A configured device address could not be parsed.
    #[error("Invalid device address '{0}'")]
    InvalidAddress(String),
    /// A configuration value is out of its allowed range.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}
