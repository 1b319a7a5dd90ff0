use std::{
	fmt, io,
	path::{Path, PathBuf},
};

use thiserror::Error;

/// Error reported by one of the protocol collaborators (connection, channel, presence service).
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct ProtocolError(pub String);

impl ProtocolError {
	pub fn new(msg: impl Into<String>) -> Self {
		Self(msg.into())
	}
}

#[derive(Debug, Error)]
pub enum Error {
	#[error("destination path already exists: '{}'", .0.display())]
	DestinationExists(PathBuf),
	#[error("transfer was already accepted")]
	AlreadyAccepted,
	#[error("transfer has no channel to act upon yet")]
	NoChannel,
	#[error("transfer session already ended")]
	SessionEnded,
	#[error("peer doesn't expose any protocol handle")]
	NoProtocolHandle,
	#[error("local socket error: {0}")]
	Socket(#[source] io::Error),
	#[error("channel error: {0}")]
	Channel(#[source] ProtocolError),
	#[error("connection error: {0}")]
	Connection(#[source] ProtocolError),
	#[error("invalid configuration: {0}")]
	Config(String),

	#[error(transparent)]
	FileIO(#[from] FileIOError),
	#[error(transparent)]
	Splice(#[from] SpliceError),
}

/// Errors of a single splice run. Either side failing is fatal to the copy.
#[derive(Debug, Error)]
pub enum SpliceError {
	#[error("error reading from input stream: {0}")]
	Read(#[source] io::Error),
	#[error("error writing to output stream: {0}")]
	Write(#[source] io::Error),
	#[error("error closing output stream: {0}")]
	Close(#[source] io::Error),
}

/// I/O error on the local filesystem, carrying the path it happened on
#[derive(Debug, Error)]
pub struct FileIOError {
	pub path: Box<Path>,
	#[source]
	pub source: io::Error,
	pub maybe_context: Option<&'static str>,
}

impl FileIOError {
	pub fn new(path: impl AsRef<Path>, source: io::Error) -> Self {
		Self {
			path: path.as_ref().into(),
			source,
			maybe_context: None,
		}
	}

	pub fn with_context(path: impl AsRef<Path>, source: io::Error, context: &'static str) -> Self {
		Self {
			path: path.as_ref().into(),
			source,
			maybe_context: Some(context),
		}
	}

	#[must_use]
	pub fn kind(&self) -> io::ErrorKind {
		self.source.kind()
	}
}

impl fmt::Display for FileIOError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self.maybe_context {
			Some(ctx) => write!(f, "file I/O error ({ctx}): {}; path: '{}'", self.source, self.path.display()),
			None => write!(f, "file I/O error: {}; path: '{}'", self.source, self.path.display()),
		}
	}
}
