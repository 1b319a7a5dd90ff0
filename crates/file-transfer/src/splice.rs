//! Pumps bytes from a readable stream into a writable one in bounded chunks.
//!
//! Reads and writes are pipelined: while a chunk is being written the next one is already being
//! read, with at most one read and one write in flight at any given time. Chunks that have been
//! read but not yet written wait in a FIFO queue, so the output receives them in the same order
//! they were read.

use std::{collections::VecDeque, future::Future, io};

use futures::future::{self, BoxFuture, FutureExt};
use tokio::{
	io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
	task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::SpliceError;

/// 100 KiB
pub const DEFAULT_CHUNK_SIZE: usize = 102_400;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SpliceStats {
	/// Completed reads, including the final short (or empty) one that signals end of stream.
	pub reads: usize,
	pub writes: usize,
	pub bytes_read: u64,
	pub bytes_written: u64,
}

/// How a splice run ended. Only `Finished` means every byte of the input reached the output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpliceOutcome {
	Finished(SpliceStats),
	Cancelled(SpliceStats),
}

impl SpliceOutcome {
	#[must_use]
	pub const fn is_finished(&self) -> bool {
		matches!(self, Self::Finished(_))
	}

	#[must_use]
	pub const fn stats(&self) -> SpliceStats {
		match self {
			Self::Finished(stats) | Self::Cancelled(stats) => *stats,
		}
	}
}

pub struct StreamSplicer<R, W> {
	input: R,
	output: W,
	chunk_size: usize,
	cancel: CancellationToken,
}

impl<R, W> StreamSplicer<R, W>
where
	R: AsyncRead + Unpin + Send,
	W: AsyncWrite + Unpin + Send,
{
	pub fn new(input: R, output: W) -> Self {
		Self {
			input,
			output,
			chunk_size: DEFAULT_CHUNK_SIZE,
			cancel: CancellationToken::new(),
		}
	}

	#[must_use]
	pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
		self.chunk_size = chunk_size.max(1);
		self
	}

	#[must_use]
	pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
		self.cancel = cancel;
		self
	}

	/// Spawns the copy loop onto the runtime.
	pub fn start(self) -> JoinHandle<Result<SpliceOutcome, SpliceError>>
	where
		R: 'static,
		W: 'static,
	{
		tokio::spawn(self.run())
	}

	/// Copies the whole input into the output, then shuts the output down.
	///
	/// A read returning less than a full chunk is treated as the end of the input. Any read or
	/// write error aborts the copy, dropping both streams.
	pub async fn run(self) -> Result<SpliceOutcome, SpliceError> {
		let Self {
			input,
			output,
			chunk_size,
			cancel,
		} = self;

		let mut stats = SpliceStats::default();
		let mut pending_buffers = VecDeque::new();

		let mut reading: Option<BoxFuture<'_, (R, io::Result<Vec<u8>>)>> =
			Some(read_chunk(input, chunk_size).boxed());
		let mut writing: Option<BoxFuture<'_, (W, io::Result<u64>)>> = None;
		// Holds the output stream whenever no write is in flight
		let mut idle_output = Some(output);

		loop {
			if writing.is_none() && !pending_buffers.is_empty() {
				if cancel.is_cancelled() {
					debug!("splice cancelled with {} buffers pending", pending_buffers.len());
					return Ok(SpliceOutcome::Cancelled(stats));
				}

				if let (Some(output), Some(buf)) = (idle_output.take(), pending_buffers.pop_front()) {
					writing = Some(write_chunk(output, buf).boxed());
				}
			}

			if reading.is_none() && writing.is_none() && pending_buffers.is_empty() {
				if let Some(mut output) = idle_output.take() {
					debug!("closing output stream");
					output.shutdown().await.map_err(SpliceError::Close)?;
				}

				debug!(
					"splice finished after {} reads and {} writes, {} bytes",
					stats.reads, stats.writes, stats.bytes_written
				);
				return Ok(SpliceOutcome::Finished(stats));
			}

			tokio::select! {
				biased;

				() = cancel.cancelled() => {
					debug!("splice cancelled");
					return Ok(SpliceOutcome::Cancelled(stats));
				}

				(output, res) = in_flight(&mut writing) => {
					writing = None;
					let written = res.map_err(SpliceError::Write)?;
					stats.writes += 1;
					stats.bytes_written += written;
					idle_output = Some(output);
				}

				(input, res) = in_flight(&mut reading) => {
					reading = None;
					let data = res.map_err(SpliceError::Read)?;
					stats.reads += 1;

					let full = data.len() == chunk_size;
					if !data.is_empty() {
						stats.bytes_read += data.len() as u64;
						pending_buffers.push_back(data);
					}

					if full {
						reading = Some(read_chunk(input, chunk_size).boxed());
					} else {
						debug!("closing input stream");
						drop(input);
					}
				}
			}
		}
	}
}

pub(crate) async fn in_flight<F: Future + Unpin>(fut: &mut Option<F>) -> F::Output {
	match fut {
		Some(fut) => fut.await,
		None => future::pending().await,
	}
}

/// Reads until `chunk_size` bytes were collected or the input reached its end.
async fn read_chunk<R: AsyncRead + Unpin>(
	mut input: R,
	chunk_size: usize,
) -> (R, io::Result<Vec<u8>>) {
	let mut buf = Vec::with_capacity(chunk_size);
	let limit = u64::try_from(chunk_size).unwrap_or(u64::MAX);
	let res = (&mut input).take(limit).read_to_end(&mut buf).await;

	(input, res.map(|_| buf))
}

async fn write_chunk<W: AsyncWrite + Unpin>(mut output: W, buf: Vec<u8>) -> (W, io::Result<u64>) {
	let res = output.write_all(&buf).await;

	(output, res.map(|()| buf.len() as u64))
}
