use crate::sequencer::FlashError;
use crate::Scope;
use flashseq_config::DeviceDescriptor;
use std::ops::Range;

/// Pages covered by one WRPR bit. The last bit covers every remaining page.
pub const PAGES_PER_WRP_BIT: u32 = 2;

/// Address ranges of the three flash areas. Ranges are disjoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashGeometry {
    pub main: Range<u32>,
    pub info: Range<u32>,
    pub option_bytes: Range<u32>,
    pub page_size: u32,
}

impl FlashGeometry {
    pub fn hk32f39a() -> Self {
        Self {
            main: 0x0800_0000..0x0808_0000,
            info: 0x1FFF_F000..0x1FFF_F800,
            option_bytes: 0x1FFF_F800..0x1FFF_F840,
            page_size: 0x800,
        }
    }

    pub fn from_descriptor(device: &DeviceDescriptor) -> anyhow::Result<Self> {
        device.validate()?;
        let span = |range: &flashseq_config::MemoryRange| -> anyhow::Result<Range<u32>> {
            let start = u32::try_from(range.base)?;
            let end = u32::try_from(range.base + range.size_bytes()?)?;
            Ok(start..end)
        };
        Ok(Self {
            main: span(&device.main)?,
            info: span(&device.info)?,
            option_bytes: span(&device.option_bytes)?,
            page_size: u32::try_from(device.page_size_bytes()?)?,
        })
    }

    pub fn range(&self, scope: Scope) -> &Range<u32> {
        match scope {
            Scope::Main => &self.main,
            Scope::Info => &self.info,
            Scope::OptionBytes => &self.option_bytes,
        }
    }

    pub fn half_page_size(&self) -> u32 {
        self.page_size / 2
    }

    pub fn page_count(&self) -> u32 {
        (self.main.end - self.main.start) / self.page_size
    }

    /// Which area, if any, holds `addr`.
    pub fn scope_of(&self, addr: u32) -> Option<Scope> {
        [Scope::Main, Scope::Info, Scope::OptionBytes]
            .into_iter()
            .find(|scope| self.range(*scope).contains(&addr))
    }

    /// Index of the write-protection bit guarding the main-array page at `addr`.
    pub fn wrp_bit(&self, addr: u32) -> Option<u32> {
        if !self.main.contains(&addr) {
            return None;
        }
        let page = (addr - self.main.start) / self.page_size;
        Some((page / PAGES_PER_WRP_BIT).min(31))
    }

    /// Checks that `len` bytes at `addr` fit in `scope` and that `addr` is
    /// aligned to `align` bytes.
    pub fn check(&self, scope: Scope, addr: u32, len: u32, align: u32) -> Result<(), FlashError> {
        let range = self.range(scope);
        let fits = addr >= range.start
            && addr
                .checked_add(len)
                .map_or(false, |end| end <= range.end);
        if !fits || addr % align != 0 {
            return Err(FlashError::InvalidAddress {
                scope,
                address: addr,
            });
        }
        Ok(())
    }
}

impl Default for FlashGeometry {
    fn default() -> Self {
        Self::hk32f39a()
    }
}
