use crate::{Bus, SimResult};

/// One access seen on the bus, in issue order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusEvent {
    Read { addr: u64, value: u32 },
    Write { addr: u64, value: u32, width: u8 },
}

/// Records every access before forwarding it to the wrapped bus.
#[derive(Debug)]
pub struct TraceBus<B> {
    inner: B,
    events: Vec<BusEvent>,
}

impl<B: Bus> TraceBus<B> {
    pub fn new(inner: B) -> Self {
        Self {
            inner,
            events: Vec::new(),
        }
    }

    pub fn events(&self) -> &[BusEvent] {
        &self.events
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    /// Addresses and values of all writes, dropping reads.
    pub fn writes(&self) -> Vec<(u64, u32)> {
        self.events
            .iter()
            .filter_map(|e| match e {
                BusEvent::Write { addr, value, .. } => Some((*addr, *value)),
                BusEvent::Read { .. } => None,
            })
            .collect()
    }

    pub fn inner(&self) -> &B {
        &self.inner
    }

    pub fn inner_mut(&mut self) -> &mut B {
        &mut self.inner
    }
}

impl<B: Bus> Bus for TraceBus<B> {
    fn read_u32(&mut self, addr: u64) -> SimResult<u32> {
        let value = self.inner.read_u32(addr)?;
        self.events.push(BusEvent::Read { addr, value });
        Ok(value)
    }

    fn write_u32(&mut self, addr: u64, value: u32) -> SimResult<()> {
        self.events.push(BusEvent::Write {
            addr,
            value,
            width: 4,
        });
        self.inner.write_u32(addr, value)
    }

    fn write_u16(&mut self, addr: u64, value: u16) -> SimResult<()> {
        self.events.push(BusEvent::Write {
            addr,
            value: value as u32,
            width: 2,
        });
        self.inner.write_u16(addr, value)
    }

    fn read_u16(&mut self, addr: u64) -> SimResult<u16> {
        let value = self.inner.read_u16(addr)?;
        self.events.push(BusEvent::Read {
            addr,
            value: value as u32,
        });
        Ok(value)
    }
}
