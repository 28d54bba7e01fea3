//! Session configuration.
//!
//! A [`SessionConfig`] is what a front end hands to [`crate::Session::open`]. It can be built in
//! code or deserialized from YAML; every field has a default, so a config only needs to name
//! the settings it changes:
//!
//! ```
//! use thead_debug::config::{DebugArch, SessionConfig};
//!
//! let config = SessionConfig::from_yaml_str("target:\n  debug_arch: dm\n").unwrap();
//! assert_eq!(config.target.debug_arch, DebugArch::Dm);
//! assert_eq!(config.link.clock_khz, 12_000);
//! ```

use serde::{Deserialize, Serialize};

use crate::core::had::HacrWidth;
use crate::identity::CpuArch;
use crate::link::{AccessWidth, WireProtocol, Xlen};
use crate::memory::Endian;
use crate::target::RunState;

/// Errors while loading a [`SessionConfig`].
#[derive(thiserror::Error, Debug, docsplay::Display)]
pub enum ConfigError {
    /// The configuration is not valid YAML.
    Yaml(#[from] serde_yaml::Error),
    /// A HACR width of {0} bits is not supported, use 8 or 16.
    HacrWidth(u8),
}

/// Which debug module generation to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DebugArch {
    /// Probe for a RISC-V debug module first and fall back to HAD.
    #[default]
    Auto,
    /// The HAD module of C-SKY cores.
    Had,
    /// The RISC-V debug module.
    Dm,
}

/// How the RISC-V debug module reaches memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemAccessMode {
    /// Load and store instructions in the program buffer.
    #[default]
    Progbuf,
    /// Abstract memory access commands.
    Abstract,
    /// The system bus master of the debug module.
    Sysbus,
}

impl MemAccessMode {
    /// The value sent with [`crate::link::LinkConfigKey::SetMemAccessMode`].
    pub fn link_value(self) -> u32 {
        match self {
            MemAccessMode::Progbuf => 0,
            MemAccessMode::Abstract => 1,
            MemAccessMode::Sysbus => 2,
        }
    }
}

/// The widest memory transfer the target tolerates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MemMaxMode {
    #[serde(rename = "dword")]
    DoubleWord,
    #[default]
    #[serde(rename = "word")]
    Word,
    #[serde(rename = "hword")]
    HalfWord,
    #[serde(rename = "byte")]
    Byte,
}

impl From<MemMaxMode> for AccessWidth {
    fn from(mode: MemMaxMode) -> Self {
        match mode {
            MemMaxMode::DoubleWord => AccessWidth::DoubleWord,
            MemMaxMode::Word => AccessWidth::Word,
            MemMaxMode::HalfWord => AccessWidth::HalfWord,
            MemMaxMode::Byte => AccessWidth::Byte,
        }
    }
}

/// Settings applied to the link when the session is opened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkSettings {
    /// TCK frequency in kHz.
    pub clock_khz: u32,
    pub wire_protocol: WireProtocol,
    /// HACR length in bits, 8 or 16.
    pub hacr_width: u8,
    /// TCK cycles spent in Run-Test/Idle between scans.
    pub idle_delay: u32,
    /// Base address of the RISC-V debug module, if not at the default location.
    pub dm_base: Option<u64>,
    /// The CPU to select after connecting.
    pub cpu_select: Option<usize>,
}

impl Default for LinkSettings {
    fn default() -> Self {
        LinkSettings {
            clock_khz: 12_000,
            wire_protocol: WireProtocol::Jtag,
            hacr_width: 8,
            idle_delay: 0,
            dm_base: None,
            cpu_select: None,
        }
    }
}

/// Settings of the target layer itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetSettings {
    /// Breakpoint instructions raise an exception in the target instead of halting it.
    pub bkpt_exception: bool,
    pub mem_access_mode: MemAccessMode,
    /// Memory addresses are virtual and translated by the hart.
    pub virtual_mem_access: bool,
    pub mem_max_mode: MemMaxMode,
    /// Address the HAD top module instead of a core behind it.
    pub select_to_hadtop: bool,
    /// Invalidate and clean the caches before every resume.
    pub cache_flush: bool,
    pub debug_arch: DebugArch,
    /// Halt every CPU while connecting, to read its identification.
    pub halt_on_connect: bool,
    /// Byte order of C-SKY targets. RISC-V targets are always little endian.
    pub endian: Endian,
}

impl Default for TargetSettings {
    fn default() -> Self {
        TargetSettings {
            bkpt_exception: false,
            mem_access_mode: MemAccessMode::Progbuf,
            virtual_mem_access: false,
            mem_max_mode: MemMaxMode::Word,
            select_to_hadtop: false,
            cache_flush: true,
            debug_arch: DebugArch::Auto,
            halt_on_connect: true,
            endian: Endian::Little,
        }
    }
}

/// The complete configuration of a debug session.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub link: LinkSettings,
    pub target: TargetSettings,
}

impl SessionConfig {
    /// Parses a YAML document and validates it.
    pub fn from_yaml_str(yaml: &str) -> Result<SessionConfig, ConfigError> {
        let config: SessionConfig = serde_yaml::from_str(yaml)?;
        config.hacr_width()?;
        Ok(config)
    }

    /// The configured HACR width.
    pub fn hacr_width(&self) -> Result<HacrWidth, ConfigError> {
        HacrWidth::from_bits(self.link.hacr_width)
            .ok_or(ConfigError::HacrWidth(self.link.hacr_width))
    }
}

/// A target setting changed at runtime with [`crate::Session::config_target`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetConfigKey {
    BkptException(bool),
    MemAccessMode(MemAccessMode),
    DmBase(u64),
    /// `true` starts a batch of memory operations, `false` ends it.
    ContinuousMemOperation(bool),
    VirtualMemAccess(bool),
    MemMaxMode(MemMaxMode),
    /// HACR width in bits.
    HacrWidth(u8),
    SelectToHadTop(bool),
    CacheFlush(bool),
}

/// A question answered by [`crate::Session::get_target_config`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetQuery {
    CpuArch,
    Xlen,
    CpuId,
    CpuName,
    /// Length of the instruction at an address.
    InsnLen(u64),
    /// The trap instruction of a software breakpoint of the given length.
    BkptInsn(u32),
    /// Run state of another CPU.
    CpuState(usize),
    DmBase,
    /// Whether the debug module is a T-HEAD implementation.
    IsTheadDm,
    GroupCount,
    ClusterCount,
    HadVersion,
    DmVersion,
    VirtualMemAccess,
}

/// An answer to a [`TargetQuery`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigValue {
    Arch(CpuArch),
    Xlen(Xlen),
    Word(u32),
    Name(String),
    Length(u32),
    Instruction(Vec<u8>),
    State(RunState),
    Address(Option<u64>),
    Flag(bool),
    Count(usize),
    Version(u8),
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn empty_document_gives_defaults() {
        let config = SessionConfig::from_yaml_str("{}").unwrap();
        assert_eq!(config, SessionConfig::default());
        assert_eq!(config.hacr_width().unwrap(), HacrWidth::Bits8);
    }

    #[test]
    fn partial_document() {
        let config = SessionConfig::from_yaml_str(
            "link:\n  wire_protocol: swd\n  hacr_width: 16\n  dm_base: 256\ntarget:\n  mem_access_mode: sysbus\n  mem_max_mode: dword\n  cache_flush: false\n",
        )
        .unwrap();

        assert_eq!(config.link.wire_protocol, WireProtocol::Swd);
        assert_eq!(config.link.clock_khz, 12_000);
        assert_eq!(config.link.dm_base, Some(0x100));
        assert_eq!(config.hacr_width().unwrap(), HacrWidth::Bits16);
        assert_eq!(config.target.mem_access_mode, MemAccessMode::Sysbus);
        assert_eq!(
            AccessWidth::from(config.target.mem_max_mode),
            AccessWidth::DoubleWord
        );
        assert!(!config.target.cache_flush);
        assert!(config.target.halt_on_connect);
    }

    #[test]
    fn invalid_hacr_width() {
        let error = SessionConfig::from_yaml_str("link:\n  hacr_width: 12\n").unwrap_err();
        assert!(matches!(error, ConfigError::HacrWidth(12)));
    }

    #[test]
    fn unknown_debug_arch() {
        let error = SessionConfig::from_yaml_str("target:\n  debug_arch: jtag\n").unwrap_err();
        assert!(matches!(error, ConfigError::Yaml(_)));
    }

    #[test]
    fn survives_serialization() {
        let mut config = SessionConfig::default();
        config.target.debug_arch = DebugArch::Had;
        config.target.endian = Endian::BigV2;
        config.link.cpu_select = Some(2);

        let yaml = serde_yaml::to_string(&config).unwrap();
        assert_eq!(SessionConfig::from_yaml_str(&yaml).unwrap(), config);
    }
}
