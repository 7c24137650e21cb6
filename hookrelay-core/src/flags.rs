use bitflags::bitflags;

bitflags! {
    /// Per-frame flags carried in the header.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FrameFlags: u16 {
        /// The event payload replaced one or more earlier payloads
        /// from the same source while it waited for budget.
        const COALESCED = 0b0000_0001;
        /// The event waited at least one window before it was admitted.
        const DEFERRED  = 0b0000_0010;
        /// The frame answers a previous `Call`.
        const REPLY     = 0b0000_0100;
    }
}

impl FrameFlags {
    /// Decode from the wire, rejecting bits this build does not know.
    pub fn from_wire(bits: u16) -> Result<Self, crate::RelayError> {
        Self::from_bits(bits).ok_or(crate::RelayError::InvalidHeader("unknown flag bits"))
    }
}
