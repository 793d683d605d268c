//! Register layout of the flash controller and its cache-invalidate companion.

use bitflags::bitflags;

/// First word of every key sequence.
pub const KEY1: u32 = 0x4567_0123;
/// Second word of every key sequence.
pub const KEY2: u32 = 0xCDEF_89AB;
/// Read-protection option byte value meaning "not protected".
pub const RDP_KEY: u16 = 0x00A5;
/// Option-byte command enabling the watchdog reload initial value.
pub const IWDG_RLIV_CMD: u32 = 0xA5A5_5B1E;
/// Option-byte command keeping the watchdog from waking stop and standby.
pub const LSI_LP_CMD: u32 = 0x369C_F0F0;
/// Option-byte command gating the debug clock off.
pub const DEBUG_CLOCK_CMD: u32 = 0x1234_BCDE;
/// Cache controller CTL bit requesting an instruction/data cache invalidate.
pub const CACHE_INVALIDATE: u32 = 0x0800;

/// Highest wait-state count `ACR` + `LATENCY_EX` can encode.
pub const MAX_LATENCY: u32 = 31;

/// Flash controller register offsets.
pub mod offset {
    pub const ACR: u64 = 0x00;
    pub const KEYR: u64 = 0x04;
    pub const OPTKEYR: u64 = 0x08;
    pub const SR: u64 = 0x0C;
    pub const CR: u64 = 0x10;
    pub const AR: u64 = 0x14;
    pub const OBR: u64 = 0x1C;
    pub const WRPR: u64 = 0x20;
    pub const ECR: u64 = 0x24;
    pub const PW0: u64 = 0x28;
    pub const PW1: u64 = 0x2C;
    pub const PW2: u64 = 0x30;
    pub const PW3: u64 = 0x34;
    pub const LATENCY_EX: u64 = 0x38;

    /// Payload word slots in write order.
    pub const PAYLOAD: [u64; 4] = [PW0, PW1, PW2, PW3];
}

/// Cache controller register offsets.
pub mod cache_offset {
    pub const CTL: u64 = 0x00;
}

/// Option byte layout, relative to the option byte base.
pub mod option_byte {
    pub const RDP: u32 = 0x00;
    pub const USER: u32 = 0x02;
    pub const WRP: [u32; 4] = [0x08, 0x0A, 0x0C, 0x0E];
    pub const IWDG_RL_IV: u32 = 0x30;
    pub const IWDG_INI_KEY: u32 = 0x34;
    pub const LSI_LP_CTL: u32 = 0x38;
}

bitflags! {
    /// CR
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Control: u32 {
        const PG = 0x0001;
        const PER = 0x0002;
        const MER = 0x0004;
        const OPTPG = 0x0010;
        const OPTER = 0x0020;
        const STRT = 0x0040;
        const LOCK = 0x0080;
        const OPTWRE = 0x0200;
        const ERRIE = 0x0400;
        const EOPIE = 0x1000;
    }

    /// ECR: half-page erase and multi-word program enables.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ExtControl: u32 {
        const HPER = 0x0001;
        const WPG = 0x0002;
        const WPG2 = 0x0004;
        const WPG4 = 0x0008;
        const INF_HPER = 0x0010;
        const INF_HWPG = 0x0020;
        const INF_WPG = 0x0040;
        const INF_WPG2 = 0x0080;
        const INF_WPG4 = 0x0100;
    }

    /// SR
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Status: u32 {
        const BSY = 0x0001;
        const PGERR = 0x0004;
        const WRPRTERR = 0x0010;
        const EOP = 0x0020;
    }

    /// ACR
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AccessControl: u32 {
        const LATENCY = 0x0007;
        const HLFCYA = 0x0008;
        const PRFTBE = 0x0010;
        const PRFTBS = 0x0020;
    }

    /// OBR, low bits. The user option byte lives in bits 2..10.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OptionStatus: u32 {
        const OPTERR = 0x0001;
        const RDPRT = 0x0002;
    }

    /// Interrupt sources that can be enabled in CR.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Interrupts: u32 {
        const ERROR = Control::ERRIE.bits();
        const END_OF_OPERATION = Control::EOPIE.bits();
    }
}

impl Control {
    /// Enables living in the main key domain.
    pub const MAIN_ENABLES: Control = Control::PG
        .union(Control::PER)
        .union(Control::MER)
        .union(Control::ERRIE)
        .union(Control::EOPIE);
    /// Enables living in the option key domain.
    pub const OPTION_ENABLES: Control = Control::OPTPG.union(Control::OPTER);
    /// Operation enables in CR. At most one operation may be armed.
    pub const OPERATIONS: Control = Control::PG
        .union(Control::PER)
        .union(Control::MER)
        .union(Control::OPTPG)
        .union(Control::OPTER);
}

impl ExtControl {
    pub const MAIN_ENABLES: ExtControl = ExtControl::HPER
        .union(ExtControl::WPG)
        .union(ExtControl::WPG2)
        .union(ExtControl::WPG4);
    pub const INFO_ENABLES: ExtControl = ExtControl::INF_HPER
        .union(ExtControl::INF_HWPG)
        .union(ExtControl::INF_WPG)
        .union(ExtControl::INF_WPG2)
        .union(ExtControl::INF_WPG4);
}

/// A single operation enable ("arm") bit and the register holding it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnableBit {
    Control(Control),
    Extended(ExtControl),
}

impl EnableBit {
    pub fn offset(self) -> u64 {
        match self {
            EnableBit::Control(_) => offset::CR,
            EnableBit::Extended(_) => offset::ECR,
        }
    }

    pub fn mask(self) -> u32 {
        match self {
            EnableBit::Control(bit) => bit.bits(),
            EnableBit::Extended(bit) => bit.bits(),
        }
    }
}

/// Absolute base addresses of the register blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterMap {
    pub flash: u64,
    pub cache: u64,
}

impl RegisterMap {
    pub fn flash(&self, offset: u64) -> u64 {
        self.flash + offset
    }

    pub fn cache_ctl(&self) -> u64 {
        self.cache + cache_offset::CTL
    }
}

impl Default for RegisterMap {
    fn default() -> Self {
        Self {
            flash: flashseq_config::DEFAULT_FLASH_REG_BASE,
            cache: flashseq_config::DEFAULT_CACHE_REG_BASE,
        }
    }
}
