use std::{fmt::Debug, hash::Hash};

use strum::IntoEnumIterator;
use strum_macros::{Display, EnumIter, EnumString, IntoStaticStr};

/// A closed opcode vocabulary owned by one manager.
///
/// Every vocabulary has an `UNDEFINED` member; unknown tokens on the wire
/// decode to it instead of failing.
pub trait Opcode:
    Copy + Eq + Hash + Debug + Send + Sync + IntoEnumIterator + 'static
{
    const UNDEFINED: Self;

    /// Canonical uppercase wire token.
    fn token(self) -> &'static str;

    /// Case-insensitive lookup, falling back to `UNDEFINED`.
    fn from_token(token: &str) -> Self;
}

// -----------------------------------------------------------------------------
// Hook manager vocabulary
// -----------------------------------------------------------------------------
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, Display, IntoStaticStr, EnumIter)]
#[strum(serialize_all = "UPPERCASE", ascii_case_insensitive)]
pub enum HookOpcode {
    Undefined,
    Execute,
    Retry,
    Log,
}

impl Opcode for HookOpcode {
    const UNDEFINED: Self = HookOpcode::Undefined;

    fn token(self) -> &'static str {
        self.into()
    }

    fn from_token(token: &str) -> Self {
        token.parse().unwrap_or(Self::UNDEFINED)
    }
}

// -----------------------------------------------------------------------------
// Virtual machine manager vocabulary
// -----------------------------------------------------------------------------
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, Display, IntoStaticStr, EnumIter)]
#[strum(serialize_all = "UPPERCASE", ascii_case_insensitive)]
pub enum VmmOpcode {
    Undefined,
    Deploy,
    Shutdown,
    Reset,
    Cancel,
    Cleanup,
    Checkpoint,
    Save,
    Restore,
    Migrate,
    AttachDisk,
    DetachDisk,
    AttachNic,
    DetachNic,
    SnapshotCreate,
    SnapshotRevert,
    SnapshotDelete,
    DiskSnapshotCreate,
    ResizeDisk,
    UpdateConf,
    UpdateSg,
    #[strum(serialize = "DRIVER_CANCEL")]
    DriverCancel,
    Resize,
    Backup,
    Log,
    UpdateNic,
    BackupCancel,
}

impl VmmOpcode {
    /// Opcodes that carry a SUCCESS/FAILURE result for a VM action.
    pub fn is_action(self) -> bool {
        !matches!(self, VmmOpcode::Undefined | VmmOpcode::Log)
    }
}

impl Opcode for VmmOpcode {
    const UNDEFINED: Self = VmmOpcode::Undefined;

    fn token(self) -> &'static str {
        self.into()
    }

    fn from_token(token: &str) -> Self {
        token.parse().unwrap_or(Self::UNDEFINED)
    }
}
