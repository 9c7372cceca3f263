//! Ambient configuration surface (C15). Mirrors the CLI flags of SPEC_FULL.md §6 field-for-field
//! so an external front-end can populate one of these without this crate parsing argv itself.

use std::collections::BTreeSet;

#[derive(Debug, Clone)]
pub struct CacheLevelConfig {
    pub block_size: usize,
    pub ways: usize,
    pub lines: usize,
    pub write_hit: WriteHitPolicy,
    pub write_miss: WriteMissPolicy,
    pub replacement: ReplacementPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteHitPolicy {
    WriteBack,
    WriteThrough,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMissPolicy {
    WriteAllocate,
    WriteNoAllocate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplacementPolicy {
    Lru,
    Fifo,
    Random,
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub l1_code: Option<CacheLevelConfig>,
    pub l1_data: Option<CacheLevelConfig>,
    pub l2_code: Option<CacheLevelConfig>,
    pub l2_data: Option<CacheLevelConfig>,
}

#[derive(Debug, Clone)]
pub struct VmConfig {
    pub breakpoints: BTreeSet<u32>,
    pub enable_pseudo_instructions: bool,
    pub verbose: bool,
    pub load_exception_handler: bool,
    pub enable_mmio: bool,
    pub enable_delay_slots: bool,
    pub memory_block_size: usize,
    pub cache: Option<CacheConfig>,
    pub virtual_syscalls: bool,
    pub screen_address: u32,
    pub keyboard_address: u32,
    pub clock_address: u32,
    /// Addresses of the (already-assembled, user-supplied) handler routine for each of the eight
    /// interrupt levels, slotted into `__interrupt_handlers_array` by `kernel::kernel_text`. `0`
    /// means "no handler installed for this level" — the interrupt switcher falls through to
    /// `ret_frominterrupt` without dispatching. Mirrors the original's `getKernelText(...,
    /// interrupt_handlers=[...])` parameter, grounded on `original_source/spym/vm/exceptions.py`'s
    /// `parseInterruptHandlers`.
    pub interrupt_handlers: [u32; 8],
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            breakpoints: BTreeSet::new(),
            enable_pseudo_instructions: true,
            verbose: false,
            load_exception_handler: true,
            enable_mmio: true,
            enable_delay_slots: true,
            memory_block_size: 32,
            cache: Some(CacheConfig {
                l1_code: Some(CacheLevelConfig {
                    block_size: 32,
                    ways: 1,
                    lines: 2048,
                    write_hit: WriteHitPolicy::WriteThrough,
                    write_miss: WriteMissPolicy::WriteNoAllocate,
                    replacement: ReplacementPolicy::Fifo,
                }),
                l1_data: Some(CacheLevelConfig {
                    block_size: 32,
                    ways: 1,
                    lines: 8,
                    write_hit: WriteHitPolicy::WriteBack,
                    write_miss: WriteMissPolicy::WriteAllocate,
                    replacement: ReplacementPolicy::Lru,
                }),
                l2_code: None,
                l2_data: None,
            }),
            virtual_syscalls: false,
            screen_address: 0xFFFF_0008,
            keyboard_address: 0xFFFF_0000,
            clock_address: 0xFFFF_0010,
            interrupt_handlers: [0; 8],
        }
    }
}
