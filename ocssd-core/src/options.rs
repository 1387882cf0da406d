// vim: tw=80
//! Device open options

use crate::{
    backend::BackendId,
    nvme::{NADDR_MAX, PlaneMode},
    types::*,
};
use serde_derive::{Deserialize, Serialize};

/// What, if anything, to send in each sector's out-of-band area on writes
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MetaMode {
    /// Don't transfer metadata
    #[default]
    None,
    /// A letter per sector, 'A' through 'Z' in turn
    Alpha,
    /// The same byte everywhere
    Const,
}

impl MetaMode {
    /// Byte used to fill the out-of-band area of the `i`th sector
    pub fn fill_byte(self, i: usize) -> Option<u8> {
        match self {
            MetaMode::None => None,
            MetaMode::Alpha => Some(b'A' + (i % 26) as u8),
            MetaMode::Const => Some(b'X'),
        }
    }
}

/// Options that control how a [`Device`](crate::dev::Device) is opened
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeviceOptions {
    pub backend: BackendId,
    /// Open for direct read-write access.  Otherwise, read-only.
    pub writable: bool,
    /// Overrides the plane mode derived from the geometry
    pub pmode: Option<PlaneMode>,
    pub erase_naddrs_max: Option<usize>,
    pub write_naddrs_max: Option<usize>,
    pub read_naddrs_max: Option<usize>,
    pub meta_mode: MetaMode,
}

impl DeviceOptions {
    /// Parse options written as YAML
    pub fn from_yaml(s: &str) -> Result<Self> {
        let opts: Self = serde_yaml_ng::from_str(s)
            .map_err(|_| Error::EINVAL)?;
        opts.check()?;
        Ok(opts)
    }

    fn check(&self) -> Result<()> {
        let maxes = [self.erase_naddrs_max, self.write_naddrs_max,
                     self.read_naddrs_max];
        if maxes.iter().flatten().any(|&n| n == 0 || n > NADDR_MAX) {
            return Err(Error::EINVAL);
        }
        Ok(())
    }

    /// Apply one `key=value` setting
    fn set(&mut self, prop: &str) -> Result<()> {
        let mut words = prop.splitn(2, '=');
        let key = words.next().ok_or(Error::EINVAL)?;
        let v = words.next().ok_or(Error::EINVAL)?;
        let naddrs = |v: &str| v.parse::<usize>()
            .map_err(|_| Error::EINVAL)
            .map(Some);
        match key {
            "backend" => self.backend = BackendId::try_from(v)?,
            "writable" => {
                self.writable = match v {
                    "true" | "on" => true,
                    "false" | "off" => false,
                    _ => return Err(Error::EINVAL)
                }
            },
            "pmode" => {
                self.pmode = match v {
                    "single" => Some(PlaneMode::Single),
                    "dual" => Some(PlaneMode::Dual),
                    "quad" => Some(PlaneMode::Quad),
                    _ => return Err(Error::EINVAL)
                }
            },
            "erase_naddrs_max" => self.erase_naddrs_max = naddrs(v)?,
            "write_naddrs_max" => self.write_naddrs_max = naddrs(v)?,
            "read_naddrs_max" => self.read_naddrs_max = naddrs(v)?,
            "meta_mode" => {
                self.meta_mode = match v {
                    "none" => MetaMode::None,
                    "alpha" => MetaMode::Alpha,
                    "const" => MetaMode::Const,
                    _ => return Err(Error::EINVAL)
                }
            },
            _ => return Err(Error::EINVAL)
        }
        Ok(())
    }
}

/// Parse a comma-separated list of `key=value` settings, like
/// `backend=ioctl,writable=on`.  An empty string gives the defaults.
impl TryFrom<&str> for DeviceOptions {
    type Error = Error;

    fn try_from(s: &str) -> Result<Self> {
        let mut opts = DeviceOptions::default();
        for prop in s.split(',').filter(|p| !p.is_empty()) {
            opts.set(prop)?;
        }
        opts.check()?;
        Ok(opts)
    }
}

// LCOV_EXCL_STOP
