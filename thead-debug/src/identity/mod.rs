//! CPU identification: CPUID words, the HAD-ID register and System Description records.

pub mod cpuid;
pub mod had_id;
pub mod system_description;

pub use cpuid::{CpuArch, CpuId, CpuIdentity, CpuSeries, Features};
pub use had_id::HadId;
pub use system_description::{CpuInfo, SystemDescription, T_HEAD_JEP106};
