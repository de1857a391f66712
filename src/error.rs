//! Unified error type for the simulator's execute core.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegisterError {
    #[error("register index {0} is out of range (0..32)")]
    IndexOutOfRange(u8),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MemoryError {
    #[error("address {addr:#x} denied: missing {rights:?} rights")]
    PermissionDenied { addr: u32, rights: Rights },

    #[error("address {addr:#x} misaligned for a {width}-byte access")]
    Misaligned { addr: u32, width: u32 },

    #[error("address {addr:#x} lies outside any mapped segment")]
    OutOfBounds { addr: u32 },

    #[error("requested stack size {requested:#x} meets or exceeds the {max:#x} ceiling")]
    StackTooLarge { requested: u32, max: u32 },

    #[error("binary state signature {found:?} does not match expected {expected:?}")]
    SignatureMismatch {
        expected: &'static [u8],
        found: Vec<u8>,
    },

    #[error("segment at {vaddr:#x} with size {memsz:#x} overflows the 32-bit address space")]
    SegmentAddressOverflow { vaddr: u32, memsz: u32 },

    #[error("no segments were given to build memory from")]
    EmptySegmentList,
}

#[derive(Debug, Error)]
pub enum ElfError {
    #[error("failed to parse ELF file: {0}")]
    Parse(String),

    #[error("unsupported ELF class or endianness: this simulator requires 32-bit little-endian")]
    UnsupportedClassOrEndian,

    #[error("ELF file carries no loadable program headers")]
    NoLoadableSegments,

    #[error(transparent)]
    Memory(#[from] MemoryError),
}

#[derive(Debug, Error)]
pub enum SimError {
    #[error(transparent)]
    Register(#[from] RegisterError),

    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error(transparent)]
    Elf(#[from] ElfError),

    #[error("program counter {0:#x} is not 4-byte aligned")]
    PcMisaligned(u32),

    #[error("word {0:#010x} does not decode to any defined RV32I operation")]
    UndefinedInstruction(u32),

    #[error("ecall requested unsupported syscall number {0}")]
    UnsupportedSyscall(u32),

    #[error("I/O failure: {0}")]
    Io(#[from] std::io::Error),
}

/// Memory segment access rights, bit-compatible with the reference
/// implementation's `RIGHTS_R`/`RIGHTS_W`/`RIGHTS_X` constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rights(pub u8);

impl Rights {
    pub const R: Rights = Rights(0b001);
    pub const W: Rights = Rights(0b010);
    pub const X: Rights = Rights(0b100);
    pub const NONE: Rights = Rights(0);

    pub fn contains(self, other: Rights) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn union(self, other: Rights) -> Rights {
        Rights(self.0 | other.0)
    }
}

impl std::ops::BitOr for Rights {
    type Output = Rights;
    fn bitor(self, rhs: Rights) -> Rights {
        self.union(rhs)
    }
}
