use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{Error, Result};

pub const VISIBLE_DEVICES_ENV: &str = "CUDA_VISIBLE_DEVICES";

/// Where a tensor lives. Operations are ordered per device; nothing else is assumed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Device {
    #[default]
    Cpu,
    Accelerator(usize),
}

impl Device {
    pub fn select(ngpu: usize) -> Self {
        if ngpu > 0 {
            Device::Accelerator(0)
        } else {
            Device::Cpu
        }
    }

    pub fn ids(ngpu: usize) -> Vec<Device> {
        if ngpu == 0 {
            vec![Device::Cpu]
        } else {
            (0..ngpu).map(Device::Accelerator).collect()
        }
    }
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Accelerator(id) => write!(f, "accel:{id}"),
        }
    }
}

/// Compute backend. Only `Plane` is implemented.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Plane,
    Tch,
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Backend::Plane => write!(f, "plane"),
            Backend::Tch => write!(f, "tch"),
        }
    }
}

impl std::str::FromStr for Backend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "plane" => Ok(Backend::Plane),
            "tch" => Ok(Backend::Tch),
            _ => Err(Error::Configuration(format!("unknown backend '{s}'"))),
        }
    }
}

impl Backend {
    pub fn ensure_implemented(&self) -> Result<()> {
        match self {
            Backend::Plane => Ok(()),
            Backend::Tch => Err(Error::NotImplemented(format!("{self} backend"))),
        }
    }
}

/// Checks that the visible-devices list names exactly `ngpu` devices.
///
/// An unset variable is tolerated with a warning. Any count mismatch is a
/// configuration error and must stop the process before work begins.
pub fn check_visible_devices(ngpu: usize, visible: Option<&str>) -> Result<()> {
    if ngpu == 0 {
        return Ok(());
    }

    match visible {
        None => {
            warn!("{VISIBLE_DEVICES_ENV} is not set.");
            Ok(())
        }
        Some(visible) => {
            let count = visible.split(',').filter(|x| !x.trim().is_empty()).count();
            if count != ngpu {
                Err(Error::Configuration(format!(
                    "#gpus ({ngpu}) is not matched with {VISIBLE_DEVICES_ENV} ({visible})"
                )))
            } else {
                info!("gpu id: {:?}", (0..ngpu).collect::<Vec<_>>());
                Ok(())
            }
        }
    }
}

pub fn check_visible_devices_from_env(ngpu: usize) -> Result<()> {
    let visible = std::env::var(VISIBLE_DEVICES_ENV).ok();
    check_visible_devices(ngpu, visible.as_deref())
}
