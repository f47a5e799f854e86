//! Command descriptions understood by a protocol engine

use std::fmt;
use std::time::Duration;

use crate::{ConfigurationIndex, DescriptorIndex, EntityId, StreamIndex};

/// Kind of remote exclusive access an entity can grant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AccessType {
    /// Persistent ownership of the entity
    Acquire,
    /// Short-lived lock of the entity
    #[default]
    Lock,
}

/// Entity (AEM) command
#[derive(Debug, Clone, PartialEq)]
pub enum AemCommand {
    AcquireEntity { persistent: bool },
    ReleaseEntity,
    LockEntity,
    UnlockEntity,
    SetConfiguration { configuration: ConfigurationIndex },
    SetEntityName { name: String },
    SetStreamInputFormat { stream: StreamIndex, format: u64 },
    SetStreamOutputFormat { stream: StreamIndex, format: u64 },
    SetSamplingRate { audio_unit: DescriptorIndex, rate: u32 },
    StartStreamInput { stream: StreamIndex },
    StopStreamInput { stream: StreamIndex },
    SetClockSource { clock_domain: DescriptorIndex, source: DescriptorIndex },
    Identify { duration: Duration },
}

/// Stream connection (ACMP) command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcmpCommand {
    ConnectStream,
    DisconnectStream,
}

/// A stream of a given entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamIdentification {
    pub entity: EntityId,
    pub stream: StreamIndex,
}

/// Flat discriminant of every command, used for logs and diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    AcquireEntity,
    ReleaseEntity,
    LockEntity,
    UnlockEntity,
    SetConfiguration,
    SetEntityName,
    SetStreamInputFormat,
    SetStreamOutputFormat,
    SetSamplingRate,
    StartStreamInput,
    StopStreamInput,
    SetClockSource,
    Identify,
    ConnectStream,
    DisconnectStream,
}

impl AemCommand {
    pub fn kind(&self) -> CommandKind {
        match self {
            AemCommand::AcquireEntity { .. } => CommandKind::AcquireEntity,
            AemCommand::ReleaseEntity => CommandKind::ReleaseEntity,
            AemCommand::LockEntity => CommandKind::LockEntity,
            AemCommand::UnlockEntity => CommandKind::UnlockEntity,
            AemCommand::SetConfiguration { .. } => CommandKind::SetConfiguration,
            AemCommand::SetEntityName { .. } => CommandKind::SetEntityName,
            AemCommand::SetStreamInputFormat { .. } => CommandKind::SetStreamInputFormat,
            AemCommand::SetStreamOutputFormat { .. } => CommandKind::SetStreamOutputFormat,
            AemCommand::SetSamplingRate { .. } => CommandKind::SetSamplingRate,
            AemCommand::StartStreamInput { .. } => CommandKind::StartStreamInput,
            AemCommand::StopStreamInput { .. } => CommandKind::StopStreamInput,
            AemCommand::SetClockSource { .. } => CommandKind::SetClockSource,
            AemCommand::Identify { .. } => CommandKind::Identify,
        }
    }
}

impl AcmpCommand {
    pub fn kind(&self) -> CommandKind {
        match self {
            AcmpCommand::ConnectStream => CommandKind::ConnectStream,
            AcmpCommand::DisconnectStream => CommandKind::DisconnectStream,
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CommandKind::AcquireEntity => "Acquire Entity",
            CommandKind::ReleaseEntity => "Release Entity",
            CommandKind::LockEntity => "Lock Entity",
            CommandKind::UnlockEntity => "Unlock Entity",
            CommandKind::SetConfiguration => "Set Configuration",
            CommandKind::SetEntityName => "Set Entity Name",
            CommandKind::SetStreamInputFormat => "Set Stream Input Format",
            CommandKind::SetStreamOutputFormat => "Set Stream Output Format",
            CommandKind::SetSamplingRate => "Set Sampling Rate",
            CommandKind::StartStreamInput => "Start Stream Input",
            CommandKind::StopStreamInput => "Stop Stream Input",
            CommandKind::SetClockSource => "Set Clock Source",
            CommandKind::Identify => "Identify",
            CommandKind::ConnectStream => "Connect Stream",
            CommandKind::DisconnectStream => "Disconnect Stream",
        };
        f.write_str(name)
    }
}
