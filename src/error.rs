use thiserror::Error;

/// Architectural exceptions, dispatched internally by the engine via `processException`-style
/// logic in `cpu.rs`. Never escapes a public API as a plain `Err` — the engine always catches
/// these and routes them to the kernel vector (or to a pause/exit, for BKPT/SYSCALL-exit).
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trap {
    #[error("interrupt on level {0}")]
    Interrupt(u32),
    #[error("TLB page fault")]
    TlbPageFault,
    #[error("TLB miss on load")]
    TlbMissLoad,
    #[error("TLB miss on store")]
    TlbMissStore,
    #[error("address error on load at {0:#010x}")]
    AddrErrorLoad(u32),
    #[error("address error on store at {0:#010x}")]
    AddrErrorStore(u32),
    #[error("bus error on instruction fetch")]
    InstructionBusError,
    #[error("bus error on data access")]
    DataBusError,
    #[error("syscall")]
    Syscall,
    #[error("breakpoint")]
    Breakpoint,
    #[error("reserved instruction")]
    ReservedInstruction,
    #[error("coprocessor {0} unusable")]
    CoprocessorUnusable(u32),
    #[error("arithmetic overflow")]
    Overflow,
}

impl Trap {
    /// The `Cause.ExcCode` value (bits 2..6) for this trap, matching the thirteen-entry
    /// exception taxonomy of the reference architecture.
    pub fn exc_code(self) -> u32 {
        match self {
            Trap::Interrupt(_) => 0,
            Trap::TlbPageFault => 1,
            Trap::TlbMissLoad => 2,
            Trap::TlbMissStore => 3,
            Trap::AddrErrorLoad(_) => 4,
            Trap::AddrErrorStore(_) => 5,
            Trap::InstructionBusError => 6,
            Trap::DataBusError => 7,
            Trap::Syscall => 8,
            Trap::Breakpoint => 9,
            Trap::ReservedInstruction => 10,
            Trap::CoprocessorUnusable(_) => 11,
            Trap::Overflow => 12,
        }
    }

    pub fn bad_vaddr(self) -> Option<u32> {
        match self {
            Trap::AddrErrorLoad(a) | Trap::AddrErrorStore(a) => Some(a),
            _ => None,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AssemblyError {
    #[error("line {line}: unknown instruction '{mnemonic}'")]
    UnknownInstruction { line: usize, mnemonic: String },
    #[error("line {line}: wrong argument count (expected {expected}, got {got})")]
    WrongArgumentCount { line: usize, expected: usize, got: usize },
    #[error("line {line}: invalid register '{name}'")]
    InvalidRegister { line: usize, name: String },
    #[error("line {line}: the $at register is reserved for the assembler (use .set noat to override)")]
    RegisterAtProtected { line: usize },
    #[error("line {line}: invalid immediate value '{text}'")]
    InvalidImmediate { line: usize, text: String },
    #[error("line {line}: malformed label '{text}'")]
    MalformedLabel { line: usize, text: String },
    #[error("line {line}: label redefinition '{name}'")]
    LabelRedefinition { line: usize, name: String },
    #[error("unresolved label '{name}'")]
    UnresolvedLabel { name: String },
    #[error("line {line}: unknown directive '{name}'")]
    UnknownDirective { line: usize, name: String },
    #[error("line {line}: wrong parameter count for directive '{name}'")]
    WrongDirectiveArgs { line: usize, name: String },
    #[error("line {line}: malformed string constant")]
    MalformedString { line: usize },
    #[error("line {line}: value does not fit in a {bits}-bit field")]
    FieldOverflow { line: usize, bits: u32 },
    #[error("line {line}: global label redefinition '{name}'")]
    GlobalRedefinition { line: usize, name: String },
    #[error("line {line}: address {addr:#010x} does not belong to segment '{segment}'")]
    WrongSegment { line: usize, addr: u32, segment: &'static str },
    #[error("store of instruction into non-text segment at {0:#010x}")]
    InstructionStoreOutsideText(u32),
    #[error("line {line}: misaligned data at {addr:#010x}")]
    Misaligned { line: usize, addr: u32 },
    #[error("line {line}: instruction's binary encoding does not decode back to itself")]
    EncodingRoundTripFailed { line: usize },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("no '__start' label defined")]
    MissingStart,
    #[error("invalid device configuration: {0}")]
    BadDeviceParameters(String),
    #[error("the VM is already running")]
    AlreadyRunning,
    #[error("the VM is paused at a breakpoint")]
    Breakpointed,
}

#[derive(Error, Debug)]
pub enum IoError {
    #[error("source file not found: {0}")]
    MissingSource(String),
    #[error("exception handler file not found: {0}")]
    MissingExceptionHandler(String),
}

#[derive(Error, Debug)]
pub enum SimError {
    #[error(transparent)]
    Assembly(#[from] AssemblyError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Io(#[from] IoError),
}
