//! Body copy loop.
//!
//! Copies bytes from an input to an output with a fixed buffer, counting
//! bytes and read operations, and tells the caller which side failed.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

/// How a copy ended.
#[derive(Debug)]
pub enum StreamCopyResult {
    Success,
    /// Reading from the input failed.
    InputError(io::Error),
    /// Writing to the output failed.
    OutputError(io::Error),
    Canceled,
}

impl StreamCopyResult {
    pub fn is_success(&self) -> bool {
        matches!(self, StreamCopyResult::Success)
    }
}

/// Copy result plus counters.
#[derive(Debug)]
pub struct StreamCopyOutcome {
    pub result: StreamCopyResult,
    pub bytes: u64,
    /// Number of reads performed, including the final zero-length read.
    pub iops: u64,
}

/// Copy `input` to `output` until EOF, an error, or cancellation. The output
/// is flushed and shut down after EOF.
pub async fn copy<R, W>(
    input: &mut R,
    output: &mut W,
    buffer_size: usize,
    cancel: &CancellationToken,
) -> StreamCopyOutcome
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buffer = vec![0u8; buffer_size.max(1)];
    let mut bytes = 0u64;
    let mut iops = 0u64;

    let outcome = |result: StreamCopyResult, bytes: u64, iops: u64| StreamCopyOutcome { result, bytes, iops };

    loop {
        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => return outcome(StreamCopyResult::Canceled, bytes, iops),
            read = input.read(&mut buffer) => read,
        };
        iops += 1;

        let n = match read {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => return outcome(StreamCopyResult::InputError(e), bytes, iops),
        };

        let written = tokio::select! {
            biased;
            _ = cancel.cancelled() => return outcome(StreamCopyResult::Canceled, bytes, iops),
            written = output.write_all(&buffer[..n]) => written,
        };
        if let Err(e) = written {
            return outcome(StreamCopyResult::OutputError(e), bytes, iops);
        }
        bytes += n as u64;

        if let Err(e) = output.flush().await {
            return outcome(StreamCopyResult::OutputError(e), bytes, iops);
        }
    }

    if let Err(e) = output.shutdown().await {
        return outcome(StreamCopyResult::OutputError(e), bytes, iops);
    }
    outcome(StreamCopyResult::Success, bytes, iops)
}
