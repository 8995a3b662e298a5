//! Error taxonomy for the storage engine.
//!
//! Each layer gets its own `snafu`-derived enum so that `source` chains point precisely at the
//! layer that failed, matching the error kinds described for the back-end, the manager, the
//! multiplexer, and the façade.

use std::{io, path::PathBuf};

use snafu::Snafu;

/// Errors raised by a single file back-end (one shard).
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum BackEndError {
    /// A lifecycle-dependent call (`update*`/`getValues`) was made before `initialize`.
    #[snafu(display("back-end for {} was not initialized", path.display()))]
    NotInitialized { path: PathBuf },

    /// Metadata was invalid: `startTime >= endTime`, an empty configuration id, or similar.
    #[snafu(display("invalid argument: {reason}"))]
    InvalidArgument { reason: String },

    /// `create` was called against a file that already exists.
    #[snafu(display("back-end file already exists: {}", path.display()))]
    AlreadyExists { path: PathBuf },

    /// An I/O failure occurred opening, seeking, reading, or writing the shard file.
    #[snafu(display("I/O failure on {}: {source}", path.display()))]
    Io { path: PathBuf, source: io::Error },

    /// The file header failed validation: bad marker, version, checksum, or a `dataOffset`
    /// inconsistent with the fields that produced it.
    #[snafu(display("corrupt header in {}: {reason}", path.display()))]
    CorruptHeader { path: PathBuf, reason: String },

    /// A record's LRC did not match its 40 data bytes.
    #[snafu(display("corrupt record in {} at offset {offset}: {reason}", path.display()))]
    CorruptRecord {
        path: PathBuf,
        offset: u64,
        reason: String,
    },
}

/// Errors raised by the back-end manager, which owns shard lifecycle and the shard index.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ManagerError {
    /// The metadata supplied for a detail level was invalid (e.g. `startTime >= endTime`).
    #[snafu(display("invalid configuration: {reason}"))]
    InvalidConfiguration { reason: String },

    /// A shard-level operation failed.
    #[snafu(display("back-end operation failed: {source}"))]
    BackEnd { source: BackEndError },

    /// No shard could be allocated to cover the requested time (e.g. a nonsensical pool
    /// configuration with `count == 0`).
    #[snafu(display("could not allocate a shard to cover time {time}"))]
    NoShardAvailable { time: i64 },
}

/// Errors raised by a multiplexer (the virtual, multi-shard view of one stream).
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum MultiplexerError {
    #[snafu(display("invalid range: {reason}"))]
    InvalidRange { reason: String },

    #[snafu(display("back-end manager operation failed: {source}"))]
    Manager { source: ManagerError },

    /// `cleanupRelicts` was asked to purge a stream holding fewer than two samples.
    #[snafu(display("retention would leave fewer than two samples, refusing to purge"))]
    RetentionExceeded,
}

/// Errors raised by the storage-channel façade.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ChannelError {
    #[snafu(display("channel operation failed: {source}"))]
    Multiplexer { source: MultiplexerError },
}

/// Errors raised while loading `settings.xml`.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ConfigError {
    #[snafu(display("failed to read configuration file {}: {source}", path.display()))]
    ReadFailed { path: PathBuf, source: io::Error },

    #[snafu(display("failed to parse configuration file {}: {source}", path.display()))]
    Xml {
        path: PathBuf,
        source: quick_xml::DeError,
    },

    #[snafu(display("invalid configuration: {reason}"))]
    Invalid { reason: String },
}
