//! State a simulated roadside unit keeps between messages.

use crate::errors::{Error, Result};
use crate::ota::{verify, Download};
use std::fmt;
use std::path::Path;
use tracing::{info, warn};

/// Position of the speed bump. Commands name the target position, so
/// applying the same command twice is the same as applying it once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BumpState {
    Deployed,
    Retracted,
}

impl BumpState {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        match std::str::from_utf8(payload).map(str::trim) {
            Ok("deploy") => Ok(BumpState::Deployed),
            Ok("retract") => Ok(BumpState::Retracted),
            _ => Err(Error::UnknownCommand(
                String::from_utf8_lossy(payload).into_owned(),
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OtaState {
    Idle,
    Downloading { firmware: String },
    Verifying { firmware: String },
    Installed { firmware: String },
}

impl fmt::Display for OtaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OtaState::Idle => f.write_str("idle"),
            OtaState::Downloading { firmware } => write!(f, "downloading({})", firmware),
            OtaState::Verifying { firmware } => write!(f, "verifying({})", firmware),
            OtaState::Installed { firmware } => write!(f, "installed({})", firmware),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Device {
    id: String,
    version: String,
    bump: BumpState,
    ota: OtaState,
}

impl Device {
    pub fn new(id: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: version.into(),
            bump: BumpState::Deployed,
            ota: OtaState::Idle,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn bump(&self) -> BumpState {
        self.bump
    }

    pub fn ota(&self) -> &OtaState {
        &self.ota
    }

    /// Returns true when the bump actually moved.
    pub fn apply_bump(&mut self, target: BumpState) -> bool {
        if self.bump == target {
            info!("{}: bump already {:?}", self.id, target);
            return false;
        }
        info!("{}: bump {:?} -> {:?}", self.id, self.bump, target);
        self.bump = target;
        true
    }

    /// Accepts an upgrade trigger unless a download is already in flight.
    pub fn begin_upgrade(&mut self, firmware: &str) -> Result<()> {
        match &self.ota {
            OtaState::Downloading { firmware: current } | OtaState::Verifying { firmware: current } => {
                return Err(Error::Busy {
                    requested: firmware.to_string(),
                    current: current.clone(),
                })
            }
            OtaState::Idle | OtaState::Installed { .. } => {}
        }
        self.transition(OtaState::Downloading {
            firmware: firmware.to_string(),
        });
        Ok(())
    }

    /// Verifies a finished download and installs it. Any failure returns the
    /// device to idle; there is no automatic retry.
    pub fn finish_download(&mut self, download: Result<Download>) -> Result<()> {
        let firmware = match &self.ota {
            OtaState::Downloading { firmware } => firmware.clone(),
            other => {
                warn!("{}: download finished while {}", self.id, other);
                return Ok(());
            }
        };

        let download = match download {
            Ok(download) => download,
            Err(e) => return Err(self.fail(e)),
        };

        self.transition(OtaState::Verifying {
            firmware: firmware.clone(),
        });
        if let Err(e) = verify(&firmware, &download) {
            return Err(self.fail(e));
        }

        self.version = installed_version(&firmware);
        info!(
            "{}: installed {} ({} bytes), now running version {}",
            self.id,
            firmware,
            download.body.len(),
            self.version
        );
        self.transition(OtaState::Installed { firmware });
        Ok(())
    }

    fn fail(&mut self, error: Error) -> Error {
        warn!("{}: upgrade failed: {}", self.id, error);
        self.transition(OtaState::Idle);
        error
    }

    fn transition(&mut self, next: OtaState) {
        info!("{}: OTA {} -> {}", self.id, self.ota, next);
        self.ota = next;
    }
}

/// The reported firmware version after installing an image: its file stem.
fn installed_version(firmware: &str) -> String {
    Path::new(firmware)
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| firmware.to_string())
}
