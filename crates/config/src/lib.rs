use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Fixed register block base of the flash controller.
pub const DEFAULT_FLASH_REG_BASE: u64 = 0x4002_2000;
/// Cache controller base; its control register is used to signal invalidation.
pub const DEFAULT_CACHE_REG_BASE: u64 = 0x4002_4000;

pub const DEFAULT_ERASE_TICKS: u32 = 0x000B_0000;
pub const DEFAULT_PROGRAM_TICKS: u32 = 0x0000_F000;
pub const DEFAULT_BUSY_LATENCY: u32 = 3;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("memory ranges '{0}' and '{1}' overlap")]
    Overlap(&'static str, &'static str),
    #[error("page size {0:#x} must be a non-zero power of two")]
    PageSize(u64),
    #[error("main array size {size:#x} is not a multiple of the page size {page:#x}")]
    PartialPage { size: u64, page: u64 },
    #[error("range '{0}' does not fit in the 32-bit address space")]
    OutOfAddressSpace(&'static str),
    #[error("information block size {size:#x} is not a non-zero multiple of the half page {half:#x}")]
    PartialHalfPage { size: u64, half: u64 },
}

/// Lockable key domains of the controller.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Region {
    /// Main array, keyed through KEYR.
    Main,
    /// Information block and option bytes, keyed through OPTKEYR.
    Info,
}

/// Address space an operation targets.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Main,
    Info,
    OptionBytes,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EraseMode {
    Page,
    HalfPage,
    Mass,
}

/// When the sequencer clears an operation's enable bit after polling.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DisarmPolicy {
    /// Array operations always disarm, option-byte operations keep the
    /// enable bit set when they time out.
    #[default]
    AsBuilt,
    Always,
    SkipOnTimeout,
}

/// Terminal outcome of an operation, as recorded in scripts and results.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Complete,
    ProgramError,
    WriteProtectError,
    Timeout,
    InvalidAddress,
    InvalidPayload,
    UnsupportedOperation,
    /// Another operation's enable bit was still set.
    StillArmed,
    BusFault,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MemoryRange {
    pub base: u64,
    pub size: String, // e.g. "512KB"
}

impl MemoryRange {
    pub fn size_bytes(&self) -> Result<u64> {
        parse_size(&self.size)
    }

    fn span(&self, name: &'static str) -> Result<(u64, u64)> {
        let size = self.size_bytes()?;
        let end = self
            .base
            .checked_add(size)
            .ok_or(ConfigError::OutOfAddressSpace(name))?;
        Ok((self.base, end))
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RegisterBases {
    #[serde(default = "default_flash_base")]
    pub flash: u64,
    #[serde(default = "default_cache_base")]
    pub cache: u64,
}

impl Default for RegisterBases {
    fn default() -> Self {
        Self {
            flash: DEFAULT_FLASH_REG_BASE,
            cache: DEFAULT_CACHE_REG_BASE,
        }
    }
}

fn default_flash_base() -> u64 {
    DEFAULT_FLASH_REG_BASE
}

fn default_cache_base() -> u64 {
    DEFAULT_CACHE_REG_BASE
}

/// Tick budgets handed to the completion wait. The unit is one status poll.
#[derive(Debug, Serialize, Deserialize, Clone, Copy)]
pub struct Timeouts {
    #[serde(default = "default_erase_ticks")]
    pub erase_ticks: u32,
    #[serde(default = "default_program_ticks")]
    pub program_ticks: u32,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            erase_ticks: DEFAULT_ERASE_TICKS,
            program_ticks: DEFAULT_PROGRAM_TICKS,
        }
    }
}

fn default_erase_ticks() -> u32 {
    DEFAULT_ERASE_TICKS
}

fn default_program_ticks() -> u32 {
    DEFAULT_PROGRAM_TICKS
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SimulationConfig {
    /// Status reads during which BSY stays set after a trigger.
    #[serde(default = "default_busy_latency")]
    pub busy_latency: u32,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            busy_latency: DEFAULT_BUSY_LATENCY,
        }
    }
}

fn default_busy_latency() -> u32 {
    DEFAULT_BUSY_LATENCY
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct DeviceDescriptor {
    pub name: String,
    pub main: MemoryRange,
    pub page_size: String,
    pub info: MemoryRange,
    pub option_bytes: MemoryRange,
    #[serde(default)]
    pub registers: RegisterBases,
    #[serde(default)]
    pub timeouts: Timeouts,
    #[serde(default)]
    pub disarm_policy: DisarmPolicy,
    #[serde(default)]
    pub simulation: SimulationConfig,
}

impl DeviceDescriptor {
    /// The HK32F39A layout: 512 KiB main array in 2 KiB pages, a 2 KiB
    /// information block and the option bytes right after it.
    pub fn hk32f39a() -> Self {
        Self {
            name: "hk32f39a".to_string(),
            main: MemoryRange {
                base: 0x0800_0000,
                size: "512KiB".to_string(),
            },
            page_size: "2KiB".to_string(),
            info: MemoryRange {
                base: 0x1FFF_F000,
                size: "2KiB".to_string(),
            },
            option_bytes: MemoryRange {
                base: 0x1FFF_F800,
                size: "64B".to_string(),
            },
            registers: RegisterBases::default(),
            timeouts: Timeouts::default(),
            disarm_policy: DisarmPolicy::default(),
            simulation: SimulationConfig::default(),
        }
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let f = std::fs::File::open(&path)
            .with_context(|| format!("Failed to open device descriptor at {:?}", path.as_ref()))?;
        let device: Self =
            serde_yaml::from_reader(f).context("Failed to parse Device Descriptor")?;
        device.validate()?;
        Ok(device)
    }

    pub fn page_size_bytes(&self) -> Result<u64> {
        parse_size(&self.page_size)
    }

    pub fn validate(&self) -> Result<()> {
        let page = self.page_size_bytes()?;
        if page == 0 || !page.is_power_of_two() {
            return Err(ConfigError::PageSize(page).into());
        }

        let main_size = self.main.size_bytes()?;
        if main_size % page != 0 {
            return Err(ConfigError::PartialPage {
                size: main_size,
                page,
            }
            .into());
        }

        // Information-block erases work on half pages.
        let info_size = self.info.size_bytes()?;
        let half = (page / 2).max(1);
        if info_size == 0 || info_size % half != 0 {
            return Err(ConfigError::PartialHalfPage {
                size: info_size,
                half,
            }
            .into());
        }

        let ranges = [
            ("main", self.main.span("main")?),
            ("info", self.info.span("info")?),
            ("option_bytes", self.option_bytes.span("option_bytes")?),
        ];
        for (name, (_, end)) in ranges {
            if end > u64::from(u32::MAX) + 1 {
                return Err(ConfigError::OutOfAddressSpace(name).into());
            }
        }
        for (i, (a_name, (a_start, a_end))) in ranges.iter().enumerate() {
            for (b_name, (b_start, b_end)) in &ranges[i + 1..] {
                if a_start < b_end && b_start < a_end {
                    return Err(ConfigError::Overlap(*a_name, *b_name).into());
                }
            }
        }

        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct ScriptInputs {
    /// Device descriptor path, relative to the script. Defaults to the
    /// built-in HK32F39A layout.
    #[serde(default)]
    pub device: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct ScriptLimits {
    /// Keep executing after a step fails.
    #[serde(default)]
    pub continue_on_error: bool,
    /// Overrides the simulated busy latency of the device.
    #[serde(default)]
    pub busy_latency: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct EraseArgs {
    pub mode: EraseMode,
    #[serde(default = "default_main_scope")]
    pub scope: Scope,
    #[serde(default)]
    pub address: u32,
}

fn default_main_scope() -> Scope {
    Scope::Main
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct ProgramArgs {
    #[serde(default = "default_main_scope")]
    pub scope: Scope,
    pub address: u32,
    pub words: Vec<u32>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct HalfWordArgs {
    #[serde(default = "default_main_scope")]
    pub scope: Scope,
    pub address: u32,
    pub value: u16,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct UserOptionArgs {
    pub iwdg_software: bool,
    pub stop_no_reset: bool,
    pub standby_no_reset: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct UnlockStep {
    pub unlock: Region,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct LockStep {
    pub lock: Region,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct EraseStep {
    pub erase: EraseArgs,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct ProgramStep {
    pub program: ProgramArgs,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct HalfWordStep {
    pub program_half_word: HalfWordArgs,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct ClearFlagsStep {
    pub clear_flags: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct LatencyStep {
    pub set_latency: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct PrefetchStep {
    pub prefetch: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct WriteProtectStep {
    /// One bit per protection group, set bits get protected.
    pub write_protect: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct ReadoutProtectStep {
    pub readout_protect: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct UserOptionStep {
    pub user_option_bytes: UserOptionArgs,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct ResetStep {
    pub reset: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(untagged)]
pub enum ScriptStep {
    Unlock(UnlockStep),
    Lock(LockStep),
    Erase(EraseStep),
    Program(ProgramStep),
    ProgramHalfWord(HalfWordStep),
    ClearFlags(ClearFlagsStep),
    SetLatency(LatencyStep),
    Prefetch(PrefetchStep),
    WriteProtect(WriteProtectStep),
    ReadoutProtect(ReadoutProtectStep),
    UserOptionBytes(UserOptionStep),
    Reset(ResetStep),
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct StatusAssertion {
    pub expected_status: Outcome,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct MemoryWord {
    pub address: u32,
    pub value: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct MemoryWordAssertion {
    pub memory_word: MemoryWord,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct ReadoutAssertion {
    pub readout_protected: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(untagged)]
pub enum ScriptAssertion {
    ExpectedStatus(StatusAssertion),
    MemoryWord(MemoryWordAssertion),
    ReadoutProtected(ReadoutAssertion),
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct OperationScript {
    pub schema_version: String,
    #[serde(default = "default_inputs")]
    pub inputs: ScriptInputs,
    #[serde(default)]
    pub limits: ScriptLimits,
    pub steps: Vec<ScriptStep>,
    #[serde(default)]
    pub assertions: Vec<ScriptAssertion>,
}

fn default_inputs() -> ScriptInputs {
    ScriptInputs { device: None }
}

impl OperationScript {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let f = std::fs::File::open(&path)
            .with_context(|| format!("Failed to open operation script at {:?}", path.as_ref()))?;
        let script: Self =
            serde_yaml::from_reader(f).context("Failed to parse Operation Script YAML")?;
        script.validate()?;
        Ok(script)
    }

    pub fn validate(&self) -> Result<()> {
        if self.schema_version != "1.0" {
            anyhow::bail!(
                "Unsupported schema_version '{}'. Supported versions: '1.0'",
                self.schema_version
            );
        }

        if self.steps.is_empty() {
            anyhow::bail!("Script must contain at least one step");
        }

        if let Some(device) = &self.inputs.device {
            if device.trim().is_empty() {
                anyhow::bail!("Input 'device' path cannot be empty");
            }
        }

        for (idx, step) in self.steps.iter().enumerate() {
            if let ScriptStep::SetLatency(LatencyStep { set_latency }) = step {
                if *set_latency > 31 {
                    anyhow::bail!("Step {}: latency {} exceeds 31 wait states", idx, set_latency);
                }
            }
        }

        Ok(())
    }
}

pub fn parse_size(size_str: &str) -> Result<u64> {
    use human_size::{Byte, Size, SpecificSize};
    let s: Size = size_str
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid size format: {}", e))?;
    let bytes: SpecificSize<Byte> = s.into();
    Ok(bytes.value() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_device_is_valid() {
        let device = DeviceDescriptor::hk32f39a();
        assert!(device.validate().is_ok());
        assert_eq!(device.main.size_bytes().unwrap(), 512 * 1024);
        assert_eq!(device.page_size_bytes().unwrap(), 2048);
        assert_eq!(device.timeouts.erase_ticks, 0x000B_0000);
        assert_eq!(device.timeouts.program_ticks, 0x0000_F000);
    }

    #[test]
    fn test_device_yaml_defaults() {
        let yaml = r#"
name: "tiny"
main:
  base: 0x08000000
  size: "16KiB"
page_size: "1KiB"
info:
  base: 0x1FFFF000
  size: "2KiB"
option_bytes:
  base: 0x1FFFF800
  size: "64B"
"#;
        let device: DeviceDescriptor = serde_yaml::from_str(yaml).unwrap();
        assert!(device.validate().is_ok());
        assert_eq!(device.registers.flash, DEFAULT_FLASH_REG_BASE);
        assert_eq!(device.disarm_policy, DisarmPolicy::AsBuilt);
        assert_eq!(device.simulation.busy_latency, DEFAULT_BUSY_LATENCY);
    }

    #[test]
    fn test_device_overlapping_ranges() {
        let mut device = DeviceDescriptor::hk32f39a();
        device.info.base = 0x0800_0800;
        let err = device.validate().unwrap_err();
        assert!(err.to_string().contains("overlap"));
    }

    #[test]
    fn test_device_partial_page() {
        let mut device = DeviceDescriptor::hk32f39a();
        device.main.size = "3000B".to_string();
        let err = device.validate().unwrap_err();
        assert!(err.to_string().contains("multiple of the page size"));
    }

    #[test]
    fn test_device_info_smaller_than_half_page() {
        let mut device = DeviceDescriptor::hk32f39a();
        device.info.size = "512B".to_string();
        let err = device.validate().unwrap_err();
        assert!(err.to_string().contains("half page"));

        device.info.size = "1536B".to_string();
        assert!(device.validate().is_ok());
    }

    #[test]
    fn test_device_range_overflow_is_rejected() {
        let mut device = DeviceDescriptor::hk32f39a();
        device.main.base = 0xFFFF_FFFF_FFFF_FFF0;
        let err = device.validate().unwrap_err();
        assert!(err.to_string().contains("32-bit address space"));
    }

    #[test]
    fn test_valid_script() {
        let yaml = r#"
schema_version: "1.0"
inputs:
  device: "device.yaml"
steps:
  - unlock: main
  - erase:
      mode: page
      address: 0x08004000
  - program:
      address: 0x08004000
      words: [0xDEADBEEF, 0x12345678]
  - program_half_word:
      scope: option_bytes
      address: 0x1FFFF804
      value: 0x0012
  - clear_flags: true
  - lock: main
assertions:
  - expected_status: complete
  - memory_word:
      address: 0x08004000
      value: 0xDEADBEEF
  - readout_protected: false
"#;
        let script: OperationScript = serde_yaml::from_str(yaml).unwrap();
        assert!(script.validate().is_ok());
        assert_eq!(script.steps.len(), 6);
        assert_eq!(script.assertions.len(), 3);
        match &script.steps[2] {
            ScriptStep::Program(ProgramStep { program }) => {
                assert_eq!(program.scope, Scope::Main);
                assert_eq!(program.words, vec![0xDEADBEEF, 0x12345678]);
            }
            other => panic!("unexpected step {:?}", other),
        }
        match &script.steps[3] {
            ScriptStep::ProgramHalfWord(HalfWordStep { program_half_word }) => {
                assert_eq!(program_half_word.scope, Scope::OptionBytes);
            }
            other => panic!("unexpected step {:?}", other),
        }
    }

    #[test]
    fn test_invalid_version() {
        let yaml = r#"
schema_version: "2.0"
steps:
  - unlock: main
"#;
        let script: OperationScript = serde_yaml::from_str(yaml).unwrap();
        let err = script.validate().unwrap_err();
        assert!(err.to_string().contains("Unsupported schema_version"));
    }

    #[test]
    fn test_empty_steps() {
        let yaml = r#"
schema_version: "1.0"
steps: []
"#;
        let script: OperationScript = serde_yaml::from_str(yaml).unwrap();
        let err = script.validate().unwrap_err();
        assert!(err.to_string().contains("at least one step"));
    }

    #[test]
    fn test_latency_out_of_range() {
        let yaml = r#"
schema_version: "1.0"
steps:
  - set_latency: 40
"#;
        let script: OperationScript = serde_yaml::from_str(yaml).unwrap();
        let err = script.validate().unwrap_err();
        assert!(err.to_string().contains("latency"));
    }
}
