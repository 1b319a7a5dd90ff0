use std::{fmt, sync::Arc};

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::{
	channel::{ChannelDetails, ChannelPath, ChannelRequest, DynChannel},
	error::ProtocolError,
};

/// Identifies a connection to the presence protocol.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId {
	pub service_name: String,
	pub object_path: String,
}

impl fmt::Display for ConnectionId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}:{}", self.service_name, self.object_path)
	}
}

/// A batch of channels announced together by a connection.
pub type NewChannels = Vec<(ChannelPath, ChannelDetails)>;

#[async_trait]
pub trait Connection: fmt::Debug + Send + Sync + 'static {
	fn id(&self) -> &ConnectionId;

	/// Resolves once the connection can serve requests.
	async fn ready(&self) -> Result<(), ProtocolError>;

	/// Subscribe to channel announcements. Announcements sent before this call are not replayed.
	fn subscribe_new_channels(&self) -> broadcast::Receiver<NewChannels>;

	/// Channels already open on this connection.
	async fn channels(&self) -> Result<NewChannels, ProtocolError>;

	async fn create_channel(
		&self,
		request: ChannelRequest,
	) -> Result<(ChannelPath, ChannelDetails), ProtocolError>;

	/// Proxy for a channel living on this connection.
	fn channel(&self, path: &ChannelPath) -> Result<DynChannel, ProtocolError>;
}

pub type DynConnection = Arc<dyn Connection>;

#[derive(Debug, Clone)]
pub enum RegistryEvent {
	ConnectionAdded(DynConnection),
	ConnectionRemoved(ConnectionId),
}

/// Keeps track of the protocol connections currently alive.
#[async_trait]
pub trait ConnectionRegistry: Send + Sync + 'static {
	async fn connections(&self) -> Vec<DynConnection>;

	fn subscribe(&self) -> broadcast::Receiver<RegistryEvent>;

	/// Open (or reuse) the connection with the given id.
	async fn open(&self, id: &ConnectionId) -> Result<DynConnection, ProtocolError>;
}

pub type DynConnectionRegistry = Arc<dyn ConnectionRegistry>;
