//! Fix acquisition
//!
//! Location fixes come from the platform provider, which is out of process.
//! The uplink only needs a stream of [`FixReading`]s; [`FixSource`] abstracts
//! where that stream comes from.

pub mod stdin_source;

pub use stdin_source::{LineFixSource, StdinFixSource};

use crate::uplink::{FixReading, UplinkController};
use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Events produced by a fix source.
#[derive(Debug, Clone, PartialEq)]
pub enum FixEvent {
    /// A fix was read.
    Fix(FixReading),
    /// No more fixes (EOF for files/stdin).
    Eof,
}

/// Trait abstracting where location fixes come from.
///
/// The run loop calls [`next_fix`](FixSource::next_fix) in a `select!` with
/// cancellation.
#[async_trait]
pub trait FixSource: Send + 'static {
    /// Read the next fix. Returns `Err` only on unrecoverable I/O errors.
    async fn next_fix(&mut self) -> Result<FixEvent>;

    /// Human-readable name for logging (e.g. "stdin", a file path).
    fn source_name(&self) -> &str;
}

/// Counters from one pass over a fix source
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForwardStats {
    /// Fixes turned into queued samples
    pub queued: u64,
    /// Fixes the controller refused (e.g. not running)
    pub refused: u64,
    /// The source reached EOF (as opposed to being cancelled)
    pub exhausted: bool,
}

/// Feed fixes from `source` into `controller` until EOF or `cancel` fires.
pub async fn forward_fixes<S: FixSource>(
    source: &mut S,
    controller: &UplinkController,
    cancel: &CancellationToken,
) -> Result<ForwardStats> {
    info!(source = source.source_name(), "Fix reader started");
    let mut stats = ForwardStats::default();

    loop {
        let event = tokio::select! {
            () = cancel.cancelled() => break,
            event = source.next_fix() => event?,
        };

        match event {
            FixEvent::Fix(fix) => match controller.on_fix(&fix) {
                Ok(_) => stats.queued += 1,
                Err(e) => {
                    stats.refused += 1;
                    warn!(error = %e, "Fix not queued");
                }
            },
            FixEvent::Eof => {
                stats.exhausted = true;
                info!(
                    source = source.source_name(),
                    queued = stats.queued,
                    refused = stats.refused,
                    "Fix source exhausted"
                );
                break;
            }
        }
    }

    Ok(stats)
}
