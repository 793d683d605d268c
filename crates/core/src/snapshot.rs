use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

#[derive(Serialize, Deserialize, Debug)]
pub struct DeviceSnapshot {
    pub controller: ControllerSnapshot,
    pub peripherals: HashMap<String, serde_json::Value>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ControllerSnapshot {
    pub registers: BTreeMap<String, u32>,
    /// Option-byte area as half words, lowest address first.
    pub option_bytes: Vec<u16>,
    pub status_reads: u64,
    pub protocol_violations: u64,
}

impl DeviceSnapshot {
    pub fn capture(bus: &crate::bus::SystemBus) -> Self {
        let mut peripherals = HashMap::new();
        if let Ok(cache) = serde_json::to_value(&bus.cache) {
            peripherals.insert("cache".to_string(), cache);
        }
        Self {
            controller: bus.flash.snapshot(),
            peripherals,
        }
    }
}
