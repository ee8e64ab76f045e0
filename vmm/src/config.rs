// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use devices::{HostRange, ShmRegionConfig, TimeRole, STSHMEM_DEV_NUM, SYNCTIME_SHM_SIZE};
use hypervisor::PAGE_SIZE;
use pci::{PciBdf, NUM_BAR_REGS};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors associated with the host configuration file.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Error reading configuration file {0:?}")]
    Read(PathBuf, #[source] io::Error),
    #[error("Error parsing configuration file {0:?}")]
    Parse(PathBuf, #[source] serde_json::Error),
    #[error("Error validating configuration")]
    Validation(#[source] ValidationError),
}
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// Two partitions share an id.
    #[error("Partition id {0} is used more than once")]
    DuplicatePartitionId(u16),
    /// Only one partition may publish the global time.
    #[error("Partitions {0} and {1} are both time authorities")]
    MultipleTimeAuthorities(u16, u16),
    /// A partition maps the time page but the host provides none.
    #[error("Partition {0} maps the synchronized time page, which isn't configured")]
    SyncTimePageMissing(u16),
    #[error("Synchronized time page host address {0:#x} is not page aligned")]
    SyncTimeHostUnaligned(u64),
    #[error("Partition {0} places the synchronized time page at unaligned address {1:#x}")]
    SyncTimeGuestUnaligned(u16, u64),
    #[error("Synchronized time page at {0:#x} runs past the end of the address space")]
    SyncTimeOutOfRange(u64),
    #[error("Synchronized time page at {0:#x} overlaps the shared memory backing buffer")]
    SyncTimeOverlapsBacking(u64),
    /// Empty, unaligned or wrapping around the address space.
    #[error("Shared memory backing buffer at {0:#x} size {1:#x} is invalid")]
    BackingInvalid(u64, u64),
    #[error("Partition {0} declares device {1} more than once")]
    DuplicateBdf(u16, PciBdf),
    /// Every stshmem device needs its own pool slot.
    #[error("{0} stshmem devices configured, at most {STSHMEM_DEV_NUM} are supported")]
    TooManyStshmemDevices(usize),
}
type ValidationResult<T> = std::result::Result<T, ValidationError>;

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct SyncTimeConfig {
    pub host_base: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct PartitionSyncTimeConfig {
    pub guest_base: u64,
    pub role: TimeRole,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct StshmemConfig {
    pub bdf: PciBdf,
    pub region: String,
    /// Static BAR values. Only the shared memory BAR is used, its low bits
    /// select the BAR type.
    #[serde(default)]
    pub vbar_base: [u64; NUM_BAR_REGS],
    #[serde(default)]
    pub id: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct PartitionConfig {
    pub id: u16,
    pub name: String,
    #[serde(default)]
    pub synctime: Option<PartitionSyncTimeConfig>,
    #[serde(default)]
    pub stshmem: Vec<StshmemConfig>,
}

impl PartitionConfig {
    pub fn is_time_authority(&self) -> bool {
        self.synctime
            .as_ref()
            .is_some_and(|s| s.role == TimeRole::Authority)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct VmmConfig {
    pub shm_backing: HostRange,
    #[serde(default)]
    pub synctime: Option<SyncTimeConfig>,
    #[serde(default)]
    pub regions: Vec<ShmRegionConfig>,
    #[serde(default)]
    pub partitions: Vec<PartitionConfig>,
}

impl VmmConfig {
    /// Loads and validates the configuration stored at `path`.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| Error::Read(path.to_path_buf(), e))?;
        let config: VmmConfig =
            serde_json::from_str(&content).map_err(|e| Error::Parse(path.to_path_buf(), e))?;
        config.validate().map_err(Error::Validation)?;

        Ok(config)
    }

    pub fn validate(&self) -> ValidationResult<()> {
        let backing = self.shm_backing;
        if backing.size == 0
            || backing.base % PAGE_SIZE != 0
            || backing.size % PAGE_SIZE != 0
            || backing.checked_end().is_none()
        {
            return Err(ValidationError::BackingInvalid(backing.base, backing.size));
        }

        if let Some(synctime) = &self.synctime {
            if synctime.host_base % PAGE_SIZE != 0 {
                return Err(ValidationError::SyncTimeHostUnaligned(synctime.host_base));
            }
            let page = HostRange {
                base: synctime.host_base,
                size: SYNCTIME_SHM_SIZE,
            };
            if page.checked_end().is_none() {
                return Err(ValidationError::SyncTimeOutOfRange(page.base));
            }
            if page.overlaps(&backing) {
                return Err(ValidationError::SyncTimeOverlapsBacking(page.base));
            }
        }

        let mut ids = BTreeSet::new();
        let mut authority: Option<u16> = None;
        let mut devices = 0;
        for partition in &self.partitions {
            if !ids.insert(partition.id) {
                return Err(ValidationError::DuplicatePartitionId(partition.id));
            }

            if let Some(synctime) = &partition.synctime {
                if self.synctime.is_none() {
                    return Err(ValidationError::SyncTimePageMissing(partition.id));
                }
                if synctime.guest_base % PAGE_SIZE != 0 {
                    return Err(ValidationError::SyncTimeGuestUnaligned(
                        partition.id,
                        synctime.guest_base,
                    ));
                }
                if synctime.role == TimeRole::Authority {
                    if let Some(first) = authority {
                        return Err(ValidationError::MultipleTimeAuthorities(
                            first,
                            partition.id,
                        ));
                    }
                    authority = Some(partition.id);
                }
            }

            let mut bdfs = BTreeSet::new();
            for device in &partition.stshmem {
                if !bdfs.insert(device.bdf) {
                    return Err(ValidationError::DuplicateBdf(partition.id, device.bdf));
                }
            }
            devices += partition.stshmem.len();
        }

        if devices > STSHMEM_DEV_NUM {
            return Err(ValidationError::TooManyStshmemDevices(devices));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use vmm_sys_util::tempfile::TempFile;

    use super::*;

    const CONFIG: &str = r#"{
        "shm_backing": { "base": 1048576, "size": 1048576 },
        "synctime": { "host_base": 4194304 },
        "regions": [
            { "name": "synctime", "size": 4096 },
            { "name": "telemetry", "size": 65536 }
        ],
        "partitions": [
            {
                "id": 0,
                "name": "rt",
                "synctime": { "guest_base": 4261412864, "role": "authority" },
                "stshmem": [
                    { "bdf": "00:05.0", "region": "synctime" },
                    { "bdf": "00:06.0", "region": "telemetry", "vbar_base": [0, 0, 12, 0, 0, 0] }
                ]
            },
            {
                "id": 1,
                "name": "linux",
                "synctime": { "guest_base": 4261412864, "role": "follower" },
                "stshmem": [ { "bdf": "00:05.0", "region": "synctime", "id": "sync" } ]
            }
        ]
    }"#;

    fn sample_config() -> VmmConfig {
        serde_json::from_str(CONFIG).unwrap()
    }

    fn device(bdf: &str) -> StshmemConfig {
        StshmemConfig {
            bdf: bdf.parse().unwrap(),
            region: "synctime".to_string(),
            vbar_base: [0; NUM_BAR_REGS],
            id: None,
        }
    }

    #[test]
    fn test_parse() {
        let config = sample_config();
        assert_eq!(
            config.shm_backing,
            HostRange {
                base: 0x10_0000,
                size: 0x10_0000
            }
        );
        assert_eq!(config.regions.len(), 2);
        assert_eq!(config.partitions.len(), 2);

        let rt = &config.partitions[0];
        assert!(rt.is_time_authority());
        assert_eq!(rt.stshmem[0].bdf, PciBdf::new(0, 5, 0));
        assert_eq!(rt.stshmem[0].vbar_base, [0; NUM_BAR_REGS]);
        assert_eq!(rt.stshmem[1].vbar_base[2], 0xc);
        assert_eq!(rt.stshmem[1].id, None);

        let linux = &config.partitions[1];
        assert!(!linux.is_time_authority());
        assert_eq!(
            linux.synctime,
            Some(PartitionSyncTimeConfig {
                guest_base: 0xfe00_0000,
                role: TimeRole::Follower
            })
        );
        assert_eq!(linux.stshmem[0].id.as_deref(), Some("sync"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_errors() {
        assert!(serde_json::from_str::<VmmConfig>("{}").is_err());
        let bad_bdf = CONFIG.replace("00:06.0", "00:20.0");
        assert!(serde_json::from_str::<VmmConfig>(&bad_bdf).is_err());
        let bad_role = CONFIG.replace("follower", "observer");
        assert!(serde_json::from_str::<VmmConfig>(&bad_role).is_err());
    }

    #[test]
    fn test_validate_partitions() {
        let mut config = sample_config();
        config.partitions[1].id = 0;
        assert_eq!(
            config.validate(),
            Err(ValidationError::DuplicatePartitionId(0))
        );

        let mut config = sample_config();
        config.partitions[1].synctime.as_mut().unwrap().role = TimeRole::Authority;
        assert_eq!(
            config.validate(),
            Err(ValidationError::MultipleTimeAuthorities(0, 1))
        );

        let mut config = sample_config();
        config.partitions[1].synctime.as_mut().unwrap().guest_base = 0xfe00_0800;
        assert_eq!(
            config.validate(),
            Err(ValidationError::SyncTimeGuestUnaligned(1, 0xfe00_0800))
        );

        let mut config = sample_config();
        config.synctime = None;
        assert_eq!(
            config.validate(),
            Err(ValidationError::SyncTimePageMissing(0))
        );

        let mut config = sample_config();
        config.partitions[0].stshmem.push(device("00:05.0"));
        assert_eq!(
            config.validate(),
            Err(ValidationError::DuplicateBdf(0, PciBdf::new(0, 5, 0)))
        );
    }

    #[test]
    fn test_validate_host_layout() {
        let mut config = sample_config();
        config.synctime = Some(SyncTimeConfig {
            host_base: 0x1f_f000,
        });
        assert_eq!(
            config.validate(),
            Err(ValidationError::SyncTimeOverlapsBacking(0x1f_f000))
        );

        config.synctime = Some(SyncTimeConfig {
            host_base: 0x40_0010,
        });
        assert_eq!(
            config.validate(),
            Err(ValidationError::SyncTimeHostUnaligned(0x40_0010))
        );

        // Right after the backing buffer.
        config.synctime = Some(SyncTimeConfig {
            host_base: 0x20_0000,
        });
        assert!(config.validate().is_ok());

        config.shm_backing.size = 0;
        assert_eq!(
            config.validate(),
            Err(ValidationError::BackingInvalid(0x10_0000, 0))
        );
    }

    #[test]
    fn test_validate_address_space_end() {
        let mut config = sample_config();
        config.shm_backing = HostRange {
            base: 0xffff_ffff_ffff_f000,
            size: 0x2000,
        };
        config.synctime = Some(SyncTimeConfig { host_base: 0x1000 });
        assert_eq!(
            config.validate(),
            Err(ValidationError::BackingInvalid(0xffff_ffff_ffff_f000, 0x2000))
        );

        config.shm_backing = HostRange {
            base: 0x10_0000,
            size: 0x10_0000,
        };
        config.synctime = Some(SyncTimeConfig {
            host_base: 0xffff_ffff_ffff_f000,
        });
        assert_eq!(
            config.validate(),
            Err(ValidationError::SyncTimeOutOfRange(0xffff_ffff_ffff_f000))
        );
    }

    #[test]
    fn test_validate_device_count() {
        let mut config = sample_config();
        let extra: Vec<StshmemConfig> = (7..13).map(|d| device(&format!("00:{d:02x}.0"))).collect();
        config.partitions[0].stshmem.extend(extra);
        assert_eq!(
            config.validate(),
            Err(ValidationError::TooManyStshmemDevices(9))
        );

        config.partitions[0].stshmem.pop();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_file() {
        let file = TempFile::new().unwrap();
        file.as_file().write_all(CONFIG.as_bytes()).unwrap();
        let config = VmmConfig::from_file(file.as_path()).unwrap();
        assert_eq!(config, sample_config());

        let file = TempFile::new().unwrap();
        file.as_file().write_all(b"{ not json").unwrap();
        assert!(matches!(
            VmmConfig::from_file(file.as_path()),
            Err(Error::Parse(..))
        ));

        let file = TempFile::new().unwrap();
        let invalid = CONFIG.replace("\"id\": 1", "\"id\": 0");
        file.as_file().write_all(invalid.as_bytes()).unwrap();
        assert!(matches!(
            VmmConfig::from_file(file.as_path()),
            Err(Error::Validation(ValidationError::DuplicatePartitionId(0)))
        ));

        assert!(matches!(
            VmmConfig::from_file(Path::new("/nonexistent/stshmem.json")),
            Err(Error::Read(..))
        ));
    }
}
