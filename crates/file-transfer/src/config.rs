use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
	channel::{SocketAccessControl, SocketAddressType},
	error::{Error, FileIOError},
	splice::DEFAULT_CHUNK_SIZE,
};

/// Settings shared by every transfer a [`TransferService`](crate::TransferService) creates
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
	/// Size of each read issued while splicing
	pub chunk_size: usize,
	/// Kind of local socket requested from channels
	pub address_type: SocketAddressType,
	pub access_control: SocketAccessControl,
	/// Buffer size of the event broadcasts, slow subscribers past it will lag
	pub event_capacity: usize,
}

impl Default for TransferConfig {
	fn default() -> Self {
		Self {
			chunk_size: DEFAULT_CHUNK_SIZE,
			address_type: SocketAddressType::default(),
			access_control: SocketAccessControl::default(),
			event_capacity: 64,
		}
	}
}

impl TransferConfig {
	/// Load from a JSON file. Missing fields take their default value.
	pub async fn load_from(path: impl AsRef<Path>) -> Result<Self, Error> {
		let path = path.as_ref();
		info!("Loading file transfer config from {path:?}");

		let json = tokio::fs::read_to_string(path)
			.await
			.map_err(|e| FileIOError::with_context(path, e, "reading transfer config"))?;

		Self::from_json(&json)
	}

	pub fn from_json(json: &str) -> Result<Self, Error> {
		let config: Self = serde_json::from_str(json).map_err(|e| Error::Config(e.to_string()))?;
		config.validate()?;
		Ok(config)
	}

	pub fn validate(&self) -> Result<(), Error> {
		if self.chunk_size == 0 {
			return Err(Error::Config("chunk_size must be greater than 0".into()));
		}
		if self.event_capacity == 0 {
			return Err(Error::Config("event_capacity must be greater than 0".into()));
		}
		Ok(())
	}
}
