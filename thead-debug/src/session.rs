//! The debug session.
//!
//! A [`Session`] owns the link, the configuration it was opened with and one
//! [`CpuSessionState`] per CPU found while connecting. Operations address the currently
//! selected CPU; [`Session::target`] hands out a [`Target`] for it, and the session methods
//! named after run control operations are shortcuts for the same thing.
//!
//! ```no_run
//! use thead_debug::config::SessionConfig;
//! use thead_debug::link::fake::FakeLink;
//! use thead_debug::Session;
//!
//! # fn main() -> Result<(), thead_debug::Error> {
//! let link = FakeLink::had(0x0480_0003);
//! let mut session = Session::open(Box::new(link), SessionConfig::default())?;
//! println!("{}", session.arch_info());
//! session.halt()?;
//! # Ok(())
//! # }
//! ```

use std::ops::{Deref, DerefMut};

use crate::config::{
    ConfigError, ConfigValue, DebugArch, SessionConfig, TargetConfigKey, TargetQuery,
    TargetSettings,
};
use crate::core::dm::Dmstatus;
use crate::core::had::{HacrWidth, MAX_UNITS};
use crate::core::{CoreInterface, DebugModule, DmCore, DmParams, HadCore, HadParams};
use crate::flash::FlashAlgorithm;
use crate::identity::system_description::{SD_ADDRESS_REGISTER, SD_DATA_REGISTER};
use crate::identity::{CpuArch, CpuIdentity, HadId, SystemDescription, T_HEAD_JEP106};
use crate::link::{Link, LinkConfigKey, LinkDevice, LinkError, RegisterSpace, Xlen};
use crate::memory::Endian;
use crate::registers::csky::{self, had};
use crate::registers::riscv::dm;
use crate::registers::{FrameRegisters, RegisterCatalog, RegisterDescriptor, RegisterValue};
use crate::target::{CpuSessionState, HaltInfo, ResetKind, Target, DEFAULT_TIMEOUT};
use crate::Error;

/// CPU select value that addresses the HAD top module instead of one of its cores.
pub const HAD_TOP_SELECT: u32 = 0xff;

/// The most harts enumerated behind one debug module.
pub const MAX_HARTS: usize = 32;

const MAX_CPUID_WORDS: usize = 8;

/// A connection to a target through one link.
#[derive(Debug)]
pub struct Session {
    link: Box<dyn Link>,
    config: SessionConfig,
    flash: Option<Box<dyn FlashAlgorithm>>,
    cpus: Vec<CpuSessionState>,
    current: usize,
    connected: bool,
    had_top: bool,
    system_description: Option<SystemDescription>,
    dm_version: Option<u8>,
    thead_dm: bool,
    continuous: bool,
}

impl Session {
    /// Applies the link settings of `config` and connects to the target.
    #[tracing::instrument(skip_all)]
    pub fn open(link: Box<dyn Link>, config: SessionConfig) -> Result<Session, Error> {
        let hacr_width = config.hacr_width()?;
        tracing::info!("Opening session on link {}", link.name());

        let mut session = Session {
            link,
            config,
            flash: None,
            cpus: Vec::new(),
            current: 0,
            connected: false,
            had_top: false,
            system_description: None,
            dm_version: None,
            thead_dm: false,
            continuous: false,
        };
        session.configure_link(hacr_width)?;
        session.connect()?;
        Ok(session)
    }

    fn configure_link(&mut self, hacr_width: HacrWidth) -> Result<(), Error> {
        let settings = &self.config.link;
        let link = &mut *self.link;

        let clock = link.config(LinkConfigKey::Clock, settings.clock_khz)?;
        tracing::debug!("Link clock is {clock} kHz");
        link.config(LinkConfigKey::Cdi, settings.wire_protocol.cdi_value())?;
        link.config(LinkConfigKey::HacrLength, hacr_width.bits().into())?;
        if settings.idle_delay != 0 {
            link.config(LinkConfigKey::SetIdleDelay, settings.idle_delay)?;
        }
        if let Some(base) = settings.dm_base {
            link.config(LinkConfigKey::SetDmBase, dm_base_value(base)?)?;
        }
        link.config(
            LinkConfigKey::SetMemAccessMode,
            self.config.target.mem_access_mode.link_value(),
        )?;
        Ok(())
    }

    /// Identifies the debug module and every CPU behind it.
    ///
    /// Calling this again reconnects; breakpoints and watchpoints of the previous connection
    /// are forgotten.
    #[tracing::instrument(skip_all)]
    pub fn connect(&mut self) -> Result<(), Error> {
        self.connected = false;
        self.cpus.clear();
        self.current = 0;
        self.had_top = false;
        self.system_description = None;
        self.dm_version = None;
        self.thead_dm = false;

        let arch = match self.config.target.debug_arch {
            DebugArch::Auto => self.detect_debug_arch()?,
            arch => arch,
        };
        let settings = self.config.target.clone();
        match arch {
            DebugArch::Dm => self.connect_dm(&settings)?,
            DebugArch::Had | DebugArch::Auto => self.connect_had(&settings)?,
        }

        self.connected = true;
        let first = match self.config.link.cpu_select {
            Some(n) => n,
            None => self
                .cpus
                .iter()
                .position(|cpu| cpu.is_available())
                .unwrap_or(0),
        };
        self.select_cpu(first)?;
        if settings.select_to_hadtop && self.had_top {
            self.link.config(LinkConfigKey::CpuSelect, HAD_TOP_SELECT)?;
        }

        tracing::info!("Connected: {}", self.arch_info());
        Ok(())
    }

    /// A debug module with a known `dmstatus.version` means RISC-V, anything else HAD.
    fn detect_debug_arch(&mut self) -> Result<DebugArch, Error> {
        match self
            .link
            .read_register_u32(RegisterSpace::Dm, dm::DMSTATUS.into())
        {
            Ok(value) => {
                let version = Dmstatus::from(value).version();
                tracing::debug!("dmstatus.version = {version}");
                if (1..=3).contains(&version) {
                    Ok(DebugArch::Dm)
                } else {
                    Ok(DebugArch::Had)
                }
            }
            Err(LinkError::Unsupported) => Ok(DebugArch::Had),
            Err(error) => Err(error.into()),
        }
    }

    fn connect_dm(&mut self, settings: &TargetSettings) -> Result<(), Error> {
        let mut harts = 0;
        while harts < MAX_HARTS {
            let mut probe = DmCore::new(
                &mut *self.link,
                DmParams {
                    hart: harts,
                    ..DmParams::default()
                },
            );
            probe.select_hart()?;
            let status: Dmstatus = probe.read_dm_register()?;
            if harts == 0 {
                self.dm_version = Some(status.version() as u8);
            }
            if status.anynonexistent() {
                break;
            }
            harts += 1;
        }
        tracing::debug!("Found {harts} harts");

        for hart in 0..harts {
            let cpu = self.identify_hart(hart, settings)?;
            self.cpus.push(cpu);
        }
        Ok(())
    }

    fn identify_hart(
        &mut self,
        hart: usize,
        settings: &TargetSettings,
    ) -> Result<CpuSessionState, Error> {
        let mut params = DmParams {
            hart,
            bkpt_exception: settings.bkpt_exception,
            max_access: settings.mem_max_mode.into(),
            ..DmParams::default()
        };

        let mut core = DmCore::new(&mut *self.link, params);
        core.select_hart()?;
        let was_running = !core.core_halted()?;
        if was_running {
            core.halt(DEFAULT_TIMEOUT)?;
        }
        params.xlen = core.detect_xlen()?;

        let mut core = DmCore::new(&mut *self.link, params);
        params.triggers = core.count_triggers()?;

        let arch = match params.xlen {
            Xlen::X32 => CpuArch::Rv32,
            Xlen::X64 => CpuArch::Rv64,
        };
        let catalog = RegisterCatalog::build(&CpuIdentity::riscv(arch, &[]), params.xlen);
        let mut core = DmCore::new(&mut *self.link, params);
        let words = read_cpuid_words(|| read_identification(&mut core, &catalog, "cpuid"))?;
        if hart == 0 {
            let vendor = read_identification(&mut core, &catalog, "mvendorid")?;
            self.thead_dm = vendor == Some(T_HEAD_JEP106.into());
        }

        if was_running && !settings.halt_on_connect {
            core.run()?;
        }

        let identity = CpuIdentity::riscv(arch, &words);
        tracing::info!(
            "Hart {hart}: {} ({:?}, {} triggers)",
            identity.name(),
            params.xlen,
            params.triggers
        );
        Ok(CpuSessionState::new(
            hart,
            identity,
            DebugModule::Dm(params),
            params.xlen,
            Endian::Little,
        ))
    }

    fn connect_had(&mut self, settings: &TargetSettings) -> Result<(), Error> {
        let mut width = self.config.hacr_width()?;
        let hid = HadId::from(
            HadCore::new(&mut *self.link, had_params(width, settings)).read_had(had::HID)?,
        );
        tracing::debug!("{hid:?}");

        if let Some(reported) = HacrWidth::from_bits(hid.hacr_width()) {
            if reported != width {
                tracing::debug!("Switching to a {} bit HACR", reported.bits());
                self.link
                    .config(LinkConfigKey::HacrLength, reported.bits().into())?;
                width = reported;
            }
        }

        if !hid.is_had_top() {
            let cpu = self.identify_had_cpu(0, width, settings)?;
            self.cpus.push(cpu);
            return Ok(());
        }

        self.had_top = true;
        let mut top = HadCore::new(&mut *self.link, had_params(width, settings));
        self.system_description = SystemDescription::read(|index| {
            top.write_had(SD_ADDRESS_REGISTER, index)?;
            top.read_had(SD_DATA_REGISTER)
        })?;

        for index in 0..hid.cores() {
            let reachable = self
                .system_description
                .as_ref()
                .and_then(|description| description.cpus.get(index))
                .map_or(true, |info| info.jtag_enable());
            if !reachable {
                tracing::info!("CPU {index} is not reachable over JTAG");
                self.cpus.push(CpuSessionState::unavailable(
                    index,
                    DebugModule::Had(had_params(width, settings)),
                ));
                continue;
            }

            self.link.config(LinkConfigKey::CpuSelect, index as u32)?;
            let cpu = self.identify_had_cpu(index, width, settings)?;
            self.cpus.push(cpu);
        }
        Ok(())
    }

    fn identify_had_cpu(
        &mut self,
        index: usize,
        width: HacrWidth,
        settings: &TargetSettings,
    ) -> Result<CpuSessionState, Error> {
        let hid = HadId::from(
            HadCore::new(&mut *self.link, had_params(width, settings)).read_had(had::HID)?,
        );
        let params = HadParams {
            had_version: hid.had_version(),
            units: hid.hardware_breakpoints().min(MAX_UNITS),
            ..had_params(width, settings)
        };

        let mut core = HadCore::new(&mut *self.link, params);
        let was_running = !core.core_halted()?;
        if was_running {
            core.halt(DEFAULT_TIMEOUT)?;
        }

        let link = &mut *self.link;
        let words = read_cpuid_words(|| {
            Ok(Some(
                link.read_register_u32(RegisterSpace::Cpu, csky::CPUID_REGISTER)?,
            ))
        })?;

        if was_running && !settings.halt_on_connect {
            HadCore::new(&mut *self.link, params).run()?;
        }

        let identity = CpuIdentity::decode(&words);
        if identity.is_known() {
            tracing::info!(
                "CPU {index}: {} (HAD v{}, {} comparators)",
                identity.name(),
                params.had_version,
                params.units
            );
        } else {
            tracing::warn!(
                "CPU {index} reports the unknown id {:#010x}, using the generic register set",
                identity.id.raw()
            );
        }
        Ok(CpuSessionState::new(
            index,
            identity,
            DebugModule::Had(params),
            Xlen::X32,
            settings.endian,
        ))
    }

    /// Removes all breakpoints and watchpoints and releases the link.
    ///
    /// Failures while removing are logged; the link is closed regardless.
    #[tracing::instrument(skip_all)]
    pub fn close(mut self) -> Result<(), Error> {
        if self.connected {
            for index in 0..self.cpus.len() {
                if !self.cpus[index].is_available() {
                    continue;
                }
                if let Err(error) = self.remove_all(index) {
                    tracing::warn!("Failed to clean up CPU {index}: {error}");
                }
            }
        }
        self.connected = false;
        Ok(self.link.close()?)
    }

    fn remove_all(&mut self, index: usize) -> Result<(), Error> {
        self.select_cpu(index)?;
        let mut target = self.target()?;
        target.clear_breakpoints()?;
        target.clear_watchpoints()
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Makes `n` the CPU that subsequent operations address.
    #[tracing::instrument(skip(self))]
    pub fn select_cpu(&mut self, n: usize) -> Result<(), Error> {
        let debug = self
            .cpus
            .get(n)
            .filter(|cpu| cpu.is_available())
            .map(|cpu| *cpu.debug_module())
            .ok_or(Error::CpuUnavailable(n))?;

        match debug {
            DebugModule::Dm(params) => DmCore::new(&mut *self.link, params).select_hart()?,
            DebugModule::Had(_) if self.had_top => {
                self.link.config(LinkConfigKey::CpuSelect, n as u32)?;
            }
            DebugModule::Had(_) => {}
        }
        self.current = n;
        Ok(())
    }

    /// Selects CPU `n` until the returned guard is dropped, then restores the previous
    /// selection.
    pub fn scoped_cpu(&mut self, n: usize) -> Result<CpuScope<'_>, Error> {
        let previous = self.current;
        self.select_cpu(n)?;
        Ok(CpuScope {
            session: self,
            previous,
        })
    }

    /// Enables the direct download channel for a batch of memory operations until the
    /// returned guard is dropped or ended.
    pub fn begin_continuous(&mut self) -> Result<ContinuousOperation<'_>, Error> {
        self.set_continuous(true)?;
        Ok(ContinuousOperation {
            session: self,
            finished: false,
        })
    }

    fn set_continuous(&mut self, enabled: bool) -> Result<(), Error> {
        self.link.config(LinkConfigKey::Ddc, enabled.into())?;
        self.continuous = enabled;
        Ok(())
    }

    /// `true` while a continuous memory operation is open.
    pub fn is_continuous(&self) -> bool {
        self.continuous
    }

    /// The selected CPU together with the link.
    pub fn target(&mut self) -> Result<Target<'_>, Error> {
        if !self.connected {
            return Err(Error::NotConnected);
        }
        let current = self.current;
        let cpu = self
            .cpus
            .get_mut(current)
            .ok_or(Error::CpuUnavailable(current))?;
        let flash = self
            .flash
            .as_mut()
            .map(|flash| &mut **flash as &mut dyn FlashAlgorithm);
        Ok(Target::new(
            &mut *self.link,
            cpu,
            flash,
            &self.config.target,
        ))
    }

    /// The record of the selected CPU.
    pub fn cpu_state(&self) -> Result<&CpuSessionState, Error> {
        if !self.connected {
            return Err(Error::NotConnected);
        }
        self.cpus
            .get(self.current)
            .ok_or(Error::CpuUnavailable(self.current))
    }

    pub fn cpu(&self, n: usize) -> Option<&CpuSessionState> {
        self.cpus.get(n)
    }

    pub fn cpu_count(&self) -> usize {
        self.cpus.len()
    }

    pub fn is_multi_cpu(&self) -> bool {
        self.cpus.len() > 1
    }

    pub fn current_cpu(&self) -> usize {
        self.current
    }

    pub fn cpu_name(&self, n: usize) -> Result<String, Error> {
        self.cpus
            .get(n)
            .map(|cpu| cpu.identity().name())
            .ok_or(Error::CpuUnavailable(n))
    }

    pub fn endian(&self) -> Result<Endian, Error> {
        Ok(self.cpu_state()?.endian())
    }

    /// Comparators of the selected CPU.
    pub fn max_hw_breakpoints(&self) -> Result<usize, Error> {
        Ok(self.cpu_state()?.hardware_units())
    }

    /// Comparators of the selected CPU not claimed yet.
    pub fn left_hw_breakpoints(&self) -> Result<usize, Error> {
        Ok(self.cpu_state()?.free_hardware_units())
    }

    /// Comparators of the selected CPU that can match data accesses.
    pub fn max_watchpoints(&self) -> Result<usize, Error> {
        Ok(self.cpu_state()?.debug_module().data_units())
    }

    pub fn had_version(&self) -> Result<Option<u8>, Error> {
        Ok(self.cpu_state()?.debug_module().had_version())
    }

    pub fn debug_arch(&self) -> Result<DebugArch, Error> {
        Ok(self.cpu_state()?.debug_module().arch())
    }

    /// The System Description table of a HAD top module.
    pub fn system_description(&self) -> Option<&SystemDescription> {
        self.system_description.as_ref()
    }

    /// A one line summary of the selected CPU and its debug module.
    pub fn arch_info(&self) -> String {
        let Ok(cpu) = self.cpu_state() else {
            return "not connected".to_string();
        };
        let module = match cpu.debug_module() {
            DebugModule::Had(params) => format!("HAD v{}", params.had_version),
            DebugModule::Dm(_) => match self.dm_version {
                Some(1) => "DM v0.11".to_string(),
                Some(2) => "DM v0.13".to_string(),
                Some(3) => "DM v1.0".to_string(),
                _ => "DM".to_string(),
            },
        };
        format!(
            "{} ({}), {} CPU(s), {} hardware breakpoints, {} watchpoints",
            cpu.identity().name(),
            module,
            self.cpus.len(),
            cpu.hardware_units(),
            cpu.debug_module().data_units()
        )
    }

    /// Registers of the selected CPU.
    pub fn registers(&self) -> Result<&[RegisterDescriptor], Error> {
        Ok(self.cpu_state()?.catalog().registers())
    }

    /// HAD or debug module registers of the selected CPU.
    pub fn debug_registers(&self) -> Result<&[RegisterDescriptor], Error> {
        Ok(self.cpu_state()?.catalog().debug_registers())
    }

    pub fn register_by_name(&self, name: &str) -> Result<RegisterDescriptor, Error> {
        self.cpu_state()?.catalog().resolve_name(name)
    }

    /// The program counter, stack pointer and frame pointer of the selected CPU.
    pub fn frame_registers(&self) -> Result<Option<FrameRegisters>, Error> {
        Ok(self.cpu_state()?.catalog().frame_registers())
    }

    pub fn read_register(&mut self, name: &str) -> Result<RegisterValue, Error> {
        let register = self.register_by_name(name)?;
        self.target()?.read_register(&register)
    }

    pub fn write_register(&mut self, name: &str, value: &RegisterValue) -> Result<(), Error> {
        let register = self.register_by_name(name)?;
        self.target()?.write_register(&register, value)
    }

    pub fn read_memory(&mut self, address: u64, data: &mut [u8]) -> Result<(), Error> {
        self.target()?.read_memory(address, data)
    }

    pub fn write_memory(&mut self, address: u64, data: &[u8]) -> Result<(), Error> {
        self.target()?.write_memory(address, data)
    }

    pub fn halt(&mut self) -> Result<HaltInfo, Error> {
        self.target()?.halt()
    }

    pub fn resume(&mut self) -> Result<(), Error> {
        self.target()?.resume()
    }

    pub fn single_step(&mut self) -> Result<HaltInfo, Error> {
        self.target()?.single_step()
    }

    pub fn reset(&mut self, kind: ResetKind) -> Result<Option<HaltInfo>, Error> {
        self.target()?.reset(kind)
    }

    /// Why the selected CPU is halted, or that it is running.
    pub fn halt_info(&mut self) -> Result<HaltInfo, Error> {
        self.target()?.poll()
    }

    pub fn fileio_end(&mut self, retcode: i64, errno: i64, ctrl_c: bool) -> Result<(), Error> {
        self.target()?.fileio_end(retcode, errno, ctrl_c)
    }

    /// Sets the target description handed to front ends for the selected CPU.
    pub fn set_tdesc(&mut self, tdesc: Option<Vec<u8>>) -> Result<(), Error> {
        let current = self.current;
        self.cpus
            .get_mut(current)
            .ok_or(Error::CpuUnavailable(current))?
            .set_tdesc(tdesc);
        Ok(())
    }

    pub fn tdesc(&self) -> Result<Option<&[u8]>, Error> {
        Ok(self.cpu_state()?.tdesc())
    }

    /// Attaches the flash algorithm used for flash breakpoints, returning the previous one.
    pub fn attach_flash(
        &mut self,
        flash: Box<dyn FlashAlgorithm>,
    ) -> Option<Box<dyn FlashAlgorithm>> {
        self.flash.replace(flash)
    }

    pub fn detach_flash(&mut self) -> Option<Box<dyn FlashAlgorithm>> {
        self.flash.take()
    }

    /// Forwards a configuration key to the link and returns its answer.
    pub fn config_link(&mut self, key: LinkConfigKey, value: u32) -> Result<u32, Error> {
        Ok(self.link.config(key, value)?)
    }

    /// Lists the adapters reachable through the link driver.
    pub fn devices(&mut self) -> Result<Vec<LinkDevice>, Error> {
        Ok(self.link.devices()?)
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Changes a target setting at runtime.
    #[tracing::instrument(skip(self))]
    pub fn config_target(&mut self, key: TargetConfigKey) -> Result<(), Error> {
        match key {
            TargetConfigKey::BkptException(enabled) => {
                self.config.target.bkpt_exception = enabled;
                for cpu in &mut self.cpus {
                    cpu.debug_module_mut().set_bkpt_exception(enabled);
                }
            }
            TargetConfigKey::MemAccessMode(mode) => {
                self.link
                    .config(LinkConfigKey::SetMemAccessMode, mode.link_value())?;
                self.config.target.mem_access_mode = mode;
            }
            TargetConfigKey::DmBase(base) => {
                self.link
                    .config(LinkConfigKey::SetDmBase, dm_base_value(base)?)?;
                self.config.link.dm_base = Some(base);
            }
            TargetConfigKey::ContinuousMemOperation(enabled) => self.set_continuous(enabled)?,
            TargetConfigKey::VirtualMemAccess(enabled) => {
                self.config.target.virtual_mem_access = enabled;
            }
            TargetConfigKey::MemMaxMode(mode) => {
                self.config.target.mem_max_mode = mode;
                for cpu in &mut self.cpus {
                    cpu.debug_module_mut().set_max_access(mode.into());
                }
            }
            TargetConfigKey::HacrWidth(bits) => {
                let width = HacrWidth::from_bits(bits).ok_or(ConfigError::HacrWidth(bits))?;
                self.link.config(LinkConfigKey::HacrLength, bits.into())?;
                self.config.link.hacr_width = bits;
                for cpu in &mut self.cpus {
                    cpu.debug_module_mut().set_hacr_width(width);
                }
            }
            TargetConfigKey::SelectToHadTop(enabled) => {
                self.config.target.select_to_hadtop = enabled;
                if self.had_top && enabled {
                    self.link.config(LinkConfigKey::CpuSelect, HAD_TOP_SELECT)?;
                } else if self.had_top {
                    self.select_cpu(self.current)?;
                }
            }
            TargetConfigKey::CacheFlush(enabled) => self.config.target.cache_flush = enabled,
        }
        Ok(())
    }

    /// Answers a question about the selected CPU or the debug module.
    pub fn get_target_config(&mut self, query: TargetQuery) -> Result<ConfigValue, Error> {
        let cpu = self.cpu_state()?;
        let (isa, endian) = (cpu.isa(), cpu.endian());

        Ok(match query {
            TargetQuery::CpuArch => ConfigValue::Arch(cpu.identity().arch),
            TargetQuery::Xlen => ConfigValue::Xlen(cpu.xlen()),
            TargetQuery::CpuId => ConfigValue::Word(cpu.identity().id.raw()),
            TargetQuery::CpuName => ConfigValue::Name(cpu.identity().name()),
            TargetQuery::BkptInsn(length) => {
                ConfigValue::Instruction(isa.breakpoint_bytes(length, endian)?)
            }
            TargetQuery::HadVersion => {
                ConfigValue::Version(cpu.debug_module().had_version().unwrap_or(0))
            }
            TargetQuery::InsnLen(address) => {
                let mut bytes = [0u8; 4];
                self.read_memory(address, &mut bytes)?;
                let length = isa.decode(&bytes, endian).map_or(2, |(_, length)| length);
                ConfigValue::Length(length)
            }
            TargetQuery::CpuState(n) => ConfigValue::State(
                self.cpus
                    .get(n)
                    .ok_or(Error::CpuUnavailable(n))?
                    .run_state(),
            ),
            TargetQuery::DmBase => ConfigValue::Address(self.config.link.dm_base),
            TargetQuery::IsTheadDm => ConfigValue::Flag(self.thead_dm),
            TargetQuery::GroupCount => ConfigValue::Count(
                self.system_description
                    .as_ref()
                    .map_or(1, |description| description.group_count().max(1)),
            ),
            TargetQuery::ClusterCount => ConfigValue::Count(
                self.system_description
                    .as_ref()
                    .map_or(1, |description| description.cluster_count().max(1)),
            ),
            TargetQuery::DmVersion => ConfigValue::Version(self.dm_version.unwrap_or(0)),
            TargetQuery::VirtualMemAccess => {
                ConfigValue::Flag(self.config.target.virtual_mem_access)
            }
        })
    }
}

fn had_params(width: HacrWidth, settings: &TargetSettings) -> HadParams {
    HadParams {
        hacr_width: width,
        bkpt_exception: settings.bkpt_exception,
        endian: settings.endian,
        max_access: settings.mem_max_mode.into(),
        ..HadParams::default()
    }
}

fn dm_base_value(base: u64) -> Result<u32, Error> {
    u32::try_from(base)
        .map_err(|_| anyhow::anyhow!("debug module base {base:#x} is out of range").into())
}

/// Reads CPUID words until the first one comes around again.
fn read_cpuid_words(
    mut read: impl FnMut() -> Result<Option<u32>, Error>,
) -> Result<Vec<u32>, Error> {
    let mut words: Vec<u32> = Vec::new();
    while words.len() < MAX_CPUID_WORDS {
        let Some(word) = read()? else {
            break;
        };
        if words.first() == Some(&word) {
            break;
        }
        words.push(word);
    }
    Ok(words)
}

/// Reads an identification register. Only link failures are errors, a register the hart
/// does not implement reads as `None`.
fn read_identification(
    core: &mut dyn CoreInterface,
    catalog: &RegisterCatalog,
    name: &str,
) -> Result<Option<u32>, Error> {
    let result = catalog
        .resolve_name(name)
        .and_then(|register| core.read_core_reg(&register));
    match result {
        Ok(value) => Ok(value.as_u64().map(|value| value as u32)),
        Err(error) if error.is_link_error() => Err(error),
        Err(error) => {
            tracing::warn!("Cannot read {name}: {error}");
            Ok(None)
        }
    }
}

/// A temporary CPU selection, see [`Session::scoped_cpu`].
pub struct CpuScope<'s> {
    session: &'s mut Session,
    previous: usize,
}

impl Deref for CpuScope<'_> {
    type Target = Session;

    fn deref(&self) -> &Session {
        self.session
    }
}

impl DerefMut for CpuScope<'_> {
    fn deref_mut(&mut self) -> &mut Session {
        self.session
    }
}

impl Drop for CpuScope<'_> {
    fn drop(&mut self) {
        if let Err(error) = self.session.select_cpu(self.previous) {
            tracing::warn!(
                "Failed to select CPU {} again: {error}",
                self.previous
            );
        }
    }
}

/// An open continuous memory operation, see [`Session::begin_continuous`].
pub struct ContinuousOperation<'s> {
    session: &'s mut Session,
    finished: bool,
}

impl ContinuousOperation<'_> {
    /// Ends the operation, reporting a failure to disable the channel.
    pub fn end(mut self) -> Result<(), Error> {
        self.finished = true;
        self.session.set_continuous(false)
    }
}

impl Deref for ContinuousOperation<'_> {
    type Target = Session;

    fn deref(&self) -> &Session {
        self.session
    }
}

impl DerefMut for ContinuousOperation<'_> {
    fn deref_mut(&mut self) -> &mut Session {
        self.session
    }
}

impl Drop for ContinuousOperation<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Err(error) = self.session.set_continuous(false) {
            tracing::warn!("Failed to end the continuous memory operation: {error}");
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::breakpoint::BreakpointKind;
    use crate::config::MemMaxMode;
    use crate::link::fake::{FakeLink, Operation};
    use crate::target::{HaltReason, RunState};
    use pretty_assertions::assert_eq;

    const CK803: u32 = 0x0480_0003;
    const CK860: u32 = 0x049c_0003;

    fn open(link: &FakeLink) -> Session {
        Session::open(Box::new(link.clone()), SessionConfig::default()).unwrap()
    }

    #[test]
    fn single_had_core() {
        let link = FakeLink::had(CK803);
        let mut session = open(&link);

        assert!(session.is_connected());
        assert!(!session.is_multi_cpu());
        assert_eq!(session.debug_arch().unwrap(), DebugArch::Had);
        assert_eq!(session.cpu_name(0).unwrap(), "CK803");
        assert_eq!(session.max_hw_breakpoints().unwrap(), 4);
        assert_eq!(session.max_watchpoints().unwrap(), 2);
        assert_eq!(session.had_version().unwrap(), Some(4));
        assert_eq!(
            session.get_target_config(TargetQuery::CpuId).unwrap(),
            ConfigValue::Word(CK803)
        );
        assert!(session.arch_info().starts_with("CK803 (HAD v4)"));

        assert!(link.is_halted());
        assert_eq!(session.cpu_state().unwrap().run_state(), RunState::Unknown);
        assert_eq!(session.halt_info().unwrap().reason, HaltReason::Request);
        assert_eq!(session.cpu_state().unwrap().run_state(), RunState::Halted);
    }

    #[test]
    fn link_settings_are_applied() {
        let link = FakeLink::had(CK803);
        let config = SessionConfig::from_yaml_str(
            "link:\n  clock_khz: 6000\n  idle_delay: 4\n  dm_base: 256\n",
        )
        .unwrap();
        Session::open(Box::new(link.clone()), config).unwrap();

        let operations = link.operations();
        for (key, value) in [
            (LinkConfigKey::Clock, 6000),
            (LinkConfigKey::HacrLength, 8),
            (LinkConfigKey::SetIdleDelay, 4),
            (LinkConfigKey::SetDmBase, 256),
        ] {
            assert!(
                operations.contains(&Operation::Config { key, value }),
                "{key:?} was not applied"
            );
        }
    }

    #[test]
    fn invalid_hacr_width_is_rejected() {
        let mut config = SessionConfig::default();
        config.link.hacr_width = 12;

        let result = Session::open(Box::new(FakeLink::had(CK803)), config);
        assert!(matches!(
            result,
            Err(Error::Config(ConfigError::HacrWidth(12)))
        ));
    }

    #[test]
    fn unknown_cpu_degrades_to_the_generic_profile() {
        let link = FakeLink::had(0x0480_0006);
        let session = open(&link);

        let cpu = session.cpu_state().unwrap();
        assert_eq!(cpu.identity().arch, CpuArch::Unknown);
        assert!(!session.registers().unwrap().is_empty());
    }

    #[test]
    fn connect_skips_a_disabled_first_core() {
        let link = FakeLink::had_top(&[CK803, CK860]);
        link.disable_jtag(0);
        let session = open(&link);

        assert!(session.is_connected());
        assert!(!session.cpu(0).unwrap().is_available());
        assert_eq!(session.current_cpu(), 1);
        assert_eq!(session.cpu_name(1).unwrap(), "CK860");
    }

    #[test]
    fn had_top_enumerates_its_cores() {
        let link = FakeLink::had_top(&[CK803, CK803, CK860]);
        link.disable_jtag(1);
        let mut session = open(&link);

        assert_eq!(session.cpu_count(), 3);
        assert!(session.is_multi_cpu());
        assert!(!session.cpu(1).unwrap().is_available());
        assert_eq!(session.cpu_name(2).unwrap(), "CK860");
        assert_eq!(
            session.get_target_config(TargetQuery::ClusterCount).unwrap(),
            ConfigValue::Count(2)
        );
        assert_eq!(
            session.get_target_config(TargetQuery::GroupCount).unwrap(),
            ConfigValue::Count(1)
        );

        assert!(matches!(
            session.select_cpu(1),
            Err(Error::CpuUnavailable(1))
        ));
        assert!(matches!(
            session.select_cpu(7),
            Err(Error::CpuUnavailable(7))
        ));
        assert_eq!(session.current_cpu(), 0);

        session.select_cpu(2).unwrap();
        assert_eq!(
            session.get_target_config(TargetQuery::CpuArch).unwrap(),
            ConfigValue::Arch(CpuArch::Ck860)
        );
    }

    #[test]
    fn scoped_selection_is_restored() {
        let link = FakeLink::had_top(&[CK803, CK860]);
        let mut session = open(&link);

        {
            let mut scope = session.scoped_cpu(1).unwrap();
            assert_eq!(scope.current_cpu(), 1);
            assert_eq!(scope.halt().unwrap().cpu, 1);
        }

        assert_eq!(session.current_cpu(), 0);
        assert_eq!(
            link.operations().last(),
            Some(&Operation::Config {
                key: LinkConfigKey::CpuSelect,
                value: 0
            })
        );
    }

    #[test]
    fn riscv_harts_are_enumerated() {
        let link = FakeLink::dm_harts(Xlen::X64, 2);
        let mut session = open(&link);

        assert_eq!(session.cpu_count(), 2);
        assert_eq!(session.debug_arch().unwrap(), DebugArch::Dm);
        assert_eq!(
            session.get_target_config(TargetQuery::CpuArch).unwrap(),
            ConfigValue::Arch(CpuArch::Rv64)
        );
        assert_eq!(session.max_hw_breakpoints().unwrap(), 4);
        assert_eq!(
            session.get_target_config(TargetQuery::IsTheadDm).unwrap(),
            ConfigValue::Flag(true)
        );
        assert_eq!(
            session.get_target_config(TargetQuery::DmVersion).unwrap(),
            ConfigValue::Version(2)
        );
        assert!(session.arch_info().contains("DM v0.13"));

        session.select_cpu(1).unwrap();
        let info = session.halt_info().unwrap();
        assert_eq!(info.reason, HaltReason::Request);
        assert_eq!(info.cpu, 1);
        assert_eq!(
            session.get_target_config(TargetQuery::CpuState(0)).unwrap(),
            ConfigValue::State(RunState::Unknown)
        );
    }

    #[test]
    fn running_hart_is_resumed_after_identification() {
        let link = FakeLink::dm(Xlen::X32);
        let config = SessionConfig::from_yaml_str(
            "target:\n  debug_arch: dm\n  halt_on_connect: false\n",
        )
        .unwrap();
        let mut session = Session::open(Box::new(link.clone()), config).unwrap();

        assert!(!link.is_halted());
        assert_eq!(session.halt_info().unwrap().reason, HaltReason::Running);
        assert_eq!(
            session.get_target_config(TargetQuery::CpuArch).unwrap(),
            ConfigValue::Arch(CpuArch::Rv32)
        );
    }

    #[test]
    fn instruction_queries() {
        let link = FakeLink::dm(Xlen::X32);
        link.poke(0x100, &[0x13, 0x00, 0x00, 0x00]);
        link.poke(0x200, &[0x01, 0x00]);
        let mut session = open(&link);

        assert_eq!(
            session.get_target_config(TargetQuery::InsnLen(0x100)).unwrap(),
            ConfigValue::Length(4)
        );
        assert_eq!(
            session.get_target_config(TargetQuery::InsnLen(0x200)).unwrap(),
            ConfigValue::Length(2)
        );
        assert_eq!(
            session.get_target_config(TargetQuery::BkptInsn(4)).unwrap(),
            ConfigValue::Instruction(vec![0x73, 0x00, 0x10, 0x00])
        );
        assert!(matches!(
            session.get_target_config(TargetQuery::BkptInsn(3)),
            Err(Error::InvalidLength(3))
        ));
    }

    #[test]
    fn target_settings_change_at_runtime() {
        let link = FakeLink::dm(Xlen::X32);
        let mut session = open(&link);

        session
            .config_target(TargetConfigKey::DmBase(0x4000))
            .unwrap();
        assert_eq!(
            session.get_target_config(TargetQuery::DmBase).unwrap(),
            ConfigValue::Address(Some(0x4000))
        );

        session
            .config_target(TargetConfigKey::MemMaxMode(MemMaxMode::Byte))
            .unwrap();
        assert_eq!(session.config().target.mem_max_mode, MemMaxMode::Byte);

        session
            .config_target(TargetConfigKey::VirtualMemAccess(true))
            .unwrap();
        assert_eq!(
            session.get_target_config(TargetQuery::VirtualMemAccess).unwrap(),
            ConfigValue::Flag(true)
        );

        assert!(matches!(
            session.config_target(TargetConfigKey::HacrWidth(12)),
            Err(Error::Config(ConfigError::HacrWidth(12)))
        ));
    }

    #[test]
    fn continuous_operation_toggles_the_channel() {
        let link = FakeLink::had(CK803);
        let mut session = open(&link);

        {
            let mut batch = session.begin_continuous().unwrap();
            assert!(batch.is_continuous());
            batch.write_memory(0x2000, &[1, 2, 3, 4]).unwrap();
        }
        assert!(!session.is_continuous());

        let toggles: Vec<u32> = link
            .operations()
            .into_iter()
            .filter_map(|operation| match operation {
                Operation::Config {
                    key: LinkConfigKey::Ddc,
                    value,
                } => Some(value),
                _ => None,
            })
            .collect();
        assert_eq!(toggles, vec![1, 0]);
        assert_eq!(link.peek(0x2000, 4), vec![1, 2, 3, 4]);
    }

    #[test]
    fn registers_by_name() {
        let link = FakeLink::had(CK803);
        let mut session = open(&link);

        session
            .write_register("pc", &RegisterValue::U32(0x2000))
            .unwrap();
        assert_eq!(link.pc(), 0x2000);
        assert_eq!(
            session.read_register("$pc").unwrap(),
            RegisterValue::U32(0x2000)
        );
        assert!(matches!(
            session.read_register("nonsense"),
            Err(Error::RegisterNotFound(_))
        ));
    }

    #[test]
    fn close_restores_patched_memory() {
        let link = FakeLink::had(CK803);
        link.poke(0x1000, &[0x12, 0x34]);
        let mut session = open(&link);
        session.halt().unwrap();

        session
            .target()
            .unwrap()
            .add_breakpoint(0x1000, 2, BreakpointKind::Software)
            .unwrap();
        session.resume().unwrap();
        assert_ne!(link.peek(0x1000, 2), vec![0x12, 0x34]);

        session.close().unwrap();
        assert_eq!(link.peek(0x1000, 2), vec![0x12, 0x34]);
    }

    #[test]
    fn devices_are_listed() {
        let link = FakeLink::had(CK803);
        let mut session = open(&link);

        let devices = session.devices().unwrap();
        let selector: crate::link::LinkSelector = "c510:b210".parse().unwrap();
        assert_eq!(devices.len(), 1);
        assert!(selector.matches(&devices[0]));
    }
}
