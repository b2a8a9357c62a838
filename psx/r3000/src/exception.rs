use thiserror::Error;

/// Guest-visible exceptions. These are never host errors: the SCP vectors into the guest's
/// handler and execution carries on.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exception {
    #[error("interrupt")]
    Interrupt,
    #[error("TLB modification at {0:#010x}")]
    TlbModified(u32),
    #[error("TLB miss loading {0:#010x}")]
    TlbLoad(u32),
    #[error("TLB miss storing {0:#010x}")]
    TlbStore(u32),
    #[error("address error loading {0:#010x}")]
    AddressLoad(u32),
    #[error("address error storing {0:#010x}")]
    AddressStore(u32),
    #[error("bus error fetching {0:#010x}")]
    BusInstruction(u32),
    #[error("bus error accessing {0:#010x}")]
    BusData(u32),
    #[error("syscall")]
    Syscall,
    #[error("breakpoint")]
    Breakpoint,
    #[error("reserved instruction")]
    ReservedInstruction,
    #[error("coprocessor {0} unusable")]
    CoprocessorUnusable(u8),
    #[error("arithmetic overflow")]
    Overflow,
}

impl Exception {
    /// Value of Cause.ExcCode
    pub fn code(self) -> u32 {
        match self {
            Exception::Interrupt => 0,
            Exception::TlbModified(_) => 1,
            Exception::TlbLoad(_) => 2,
            Exception::TlbStore(_) => 3,
            Exception::AddressLoad(_) => 4,
            Exception::AddressStore(_) => 5,
            Exception::BusInstruction(_) => 6,
            Exception::BusData(_) => 7,
            Exception::Syscall => 8,
            Exception::Breakpoint => 9,
            Exception::ReservedInstruction => 10,
            Exception::CoprocessorUnusable(_) => 11,
            Exception::Overflow => 12,
        }
    }

    /// The address latched into BadVAddr, for the exceptions that set it
    pub fn bad_vaddr(self) -> Option<u32> {
        match self {
            Exception::TlbModified(addr)
            | Exception::TlbLoad(addr)
            | Exception::TlbStore(addr)
            | Exception::AddressLoad(addr)
            | Exception::AddressStore(addr) => Some(addr),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_and_bad_vaddr() {
        assert_eq!(Exception::AddressStore(0x11).code(), 5);
        assert_eq!(Exception::AddressStore(0x11).bad_vaddr(), Some(0x11));
        assert_eq!(Exception::BusData(0x1f00_0000).bad_vaddr(), None);
        assert_eq!(Exception::Overflow.code(), 12);
    }

    #[test]
    fn display() {
        assert_eq!(Exception::AddressLoad(0x8000_0001).to_string(), "address error loading 0x80000001");
        assert_eq!(Exception::CoprocessorUnusable(2).to_string(), "coprocessor 2 unusable");
    }
}
