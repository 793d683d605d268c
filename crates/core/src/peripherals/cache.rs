use crate::regs::{cache_offset, CACHE_INVALIDATE};
use crate::SimResult;
use serde::Serialize;

/// Instruction/data cache controller. Only the invalidate request is modeled;
/// the bit self-clears once the invalidate has been taken.
#[derive(Debug, Default, Serialize)]
pub struct CacheController {
    ctl: u32,
    invalidations: u64,
}

impl CacheController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn invalidations(&self) -> u64 {
        self.invalidations
    }
}

impl crate::Peripheral for CacheController {
    fn read(&mut self, offset: u64) -> SimResult<u32> {
        match offset {
            cache_offset::CTL => Ok(self.ctl),
            _ => Ok(0),
        }
    }

    fn write(&mut self, offset: u64, value: u32) -> SimResult<()> {
        if offset == cache_offset::CTL {
            if value & CACHE_INVALIDATE != 0 {
                self.invalidations += 1;
                tracing::trace!("CACHE: invalidate #{}", self.invalidations);
            }
            self.ctl = value & !CACHE_INVALIDATE;
        }
        Ok(())
    }
}
