//! System Description records of HAD top modules.
//!
//! The records live in a small word-addressed table behind the HAD top. Each record is a
//! header word followed by a contents word pointing at the record body. The table ends at the
//! first header without the magic nibble.

use bitfield::bitfield;
use jep106::JEP106Code;

use crate::Error;

/// HAD top register that selects the table word.
pub const SD_ADDRESS_REGISTER: u8 = 0x1c;
/// HAD top register that returns the selected table word.
pub const SD_DATA_REGISTER: u8 = 0x1d;
/// Magic nibble of a valid record header.
pub const SD_MAGIC: u8 = 0x9;
/// Record id of the CPU information record.
pub const SD_ID_CPU_INFO: u16 = 0x0;

/// JEP106 code of T-HEAD, as used in record headers and `mvendorid`.
pub const T_HEAD_JEP106: u16 = 0x5b7;

const MAX_RECORDS: u32 = 16;
const MAX_CPUS: u32 = 32;

bitfield! {
    /// A record header.
    #[derive(Copy, Clone, PartialEq, Eq)]
    pub struct RecordHeader(u32);
    impl Debug;
    pub u8, magic, _: 31, 28;
    pub u16, vendor, _: 27, 16;
    pub u16, sd_id, _: 15, 4;
    pub u8, version, _: 3, 0;
}

impl RecordHeader {
    /// `true` if the magic nibble is present.
    pub fn is_valid(&self) -> bool {
        self.magic() == SD_MAGIC
    }

    /// The vendor as JEP106 code.
    pub fn designer(&self) -> JEP106Code {
        let vendor = self.vendor();
        JEP106Code::new((vendor >> 7) as u8, (vendor & 0x7f) as u8)
    }
}

bitfield! {
    /// Location of the body of a record.
    #[derive(Copy, Clone, PartialEq, Eq)]
    pub struct RecordContents(u32);
    impl Debug;
    pub address, _: 31, 4;
    pub exists, _: 0;
}

bitfield! {
    /// One entry of the CPU information record.
    #[derive(Copy, Clone, PartialEq, Eq)]
    pub struct CpuInfo(u32);
    impl Debug;
    pub u8, cpu_num, _: 31, 27;
    pub u8, core_id, _: 26, 23;
    pub u8, group, _: 22, 19;
    pub u8, cluster, _: 18, 15;
    pub u8, power_domain, _: 14, 10;
    pub tee, _: 9;
    pub jtag_enable, _: 8;
}

/// The decoded System Description table.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SystemDescription {
    /// All record headers found, in table order.
    pub records: Vec<RecordHeader>,
    /// Per-core information, one entry per core.
    pub cpus: Vec<CpuInfo>,
}

impl SystemDescription {
    /// Walks the table using `read_word`, which returns the word at a table index.
    ///
    /// Returns `Ok(None)` when the first header is not a T-HEAD record.
    pub fn read(
        mut read_word: impl FnMut(u32) -> Result<u32, Error>,
    ) -> Result<Option<SystemDescription>, Error> {
        let mut description = SystemDescription::default();

        for index in 0..MAX_RECORDS {
            let header = RecordHeader(read_word(index * 2)?);
            if !header.is_valid() {
                break;
            }
            if header.vendor() != T_HEAD_JEP106 {
                tracing::debug!(
                    "Skipping system description record of vendor {:?}",
                    header.designer()
                );
                continue;
            }

            let contents = RecordContents(read_word(index * 2 + 1)?);
            description.records.push(header);

            if header.sd_id() == SD_ID_CPU_INFO && contents.exists() {
                let first = CpuInfo(read_word(contents.address())?);
                let count = (first.cpu_num() as u32 + 1).min(MAX_CPUS);
                description.cpus.push(first);
                for offset in 1..count {
                    description
                        .cpus
                        .push(CpuInfo(read_word(contents.address() + offset)?));
                }
            }
        }

        if description.records.is_empty() {
            return Ok(None);
        }

        tracing::debug!(
            "System description: {} records, {} cpus",
            description.records.len(),
            description.cpus.len()
        );
        Ok(Some(description))
    }

    /// Number of distinct groups.
    pub fn group_count(&self) -> usize {
        let mut groups: Vec<u8> = self.cpus.iter().map(|cpu| cpu.group()).collect();
        groups.sort_unstable();
        groups.dedup();
        groups.len()
    }

    /// Number of distinct clusters.
    pub fn cluster_count(&self) -> usize {
        let mut clusters: Vec<u8> = self.cpus.iter().map(|cpu| cpu.cluster()).collect();
        clusters.sort_unstable();
        clusters.dedup();
        clusters.len()
    }

    /// Whether core `n` can be reached over JTAG.
    pub fn is_available(&self, n: usize) -> bool {
        self.cpus.get(n).is_some_and(|cpu| cpu.jtag_enable())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    fn header(sd_id: u32) -> u32 {
        (0x9 << 28) | ((T_HEAD_JEP106 as u32) << 16) | (sd_id << 4) | 1
    }

    #[test]
    fn cpu_info_record() {
        let table = [
            header(0),
            (8 << 4) | 1,
            0,
            0,
            0,
            0,
            0,
            0,
            // two cpus, second one without JTAG
            (1 << 27) | (1 << 15) | (1 << 9) | (1 << 8),
            (1 << 27) | (1 << 23) | (2 << 15),
        ];

        let description = SystemDescription::read(|index| Ok(table[index as usize]))
            .unwrap()
            .unwrap();

        assert_eq!(description.records.len(), 1);
        assert_eq!(description.cpus.len(), 2);
        assert_eq!(description.cpus[1].core_id(), 1);
        assert!(description.cpus[0].tee());
        assert!(description.is_available(0));
        assert!(!description.is_available(1));
        assert!(!description.is_available(2));
        assert_eq!(description.cluster_count(), 2);
        assert_eq!(description.group_count(), 1);
    }

    #[test]
    fn missing_magic() {
        let description = SystemDescription::read(|_| Ok(0x1234_5678)).unwrap();
        assert_eq!(description, None);
    }

    #[test]
    fn designer_is_thead() {
        let header = RecordHeader(header(0));
        assert_eq!(header.designer(), JEP106Code::new(0xb, 0x37));
    }
}
