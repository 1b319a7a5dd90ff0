//! The file transfer channel as exposed by the underlying presence protocol.

use std::{fmt, path::PathBuf, sync::Arc};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::{
	error::ProtocolError,
	presence::Handle,
	state::{StateChangeReason, TransferState},
};

pub const CHANNEL_TYPE_FILE_TRANSFER: &str =
	"org.freedesktop.Telepathy.Channel.Type.FileTransfer.DRAFT";

/// Object path identifying a channel on its connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelPath(pub String);

impl fmt::Display for ChannelPath {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl From<&str> for ChannelPath {
	fn from(value: &str) -> Self {
		Self(value.to_owned())
	}
}

/// Kind of local socket a channel is asked for. Only sockets bound to a filesystem path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SocketAddressType {
	#[default]
	Unix,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SocketAccessControl {
	/// Any process on the local machine may connect
	#[default]
	Localhost,
	Credentials,
}

/// Address of the local socket a channel provisioned for the byte stream.
pub type SocketAddress = PathBuf;

/// Notifications a channel emits while a transfer progresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelSignal {
	StateChanged {
		state: TransferState,
		reason: StateChangeReason,
	},
	TransferredBytesChanged(u64),
	InitialOffsetDefined(u64),
}

/// Snapshot of a channel's file transfer properties.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FileTransferProperties {
	pub state: TransferState,
	pub filename: String,
	pub size: u64,
	pub description: String,
	pub content_type: String,
	pub initial_offset: u64,
	pub transferred_bytes: u64,
}

/// Immutable properties announced alongside a new channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelDetails {
	pub channel_type: String,
	pub target_handle: Handle,
	/// Whether the channel was created by a local request rather than offered by a peer.
	pub requested: bool,
}

impl ChannelDetails {
	#[must_use]
	pub fn is_incoming_file_transfer(&self) -> bool {
		self.channel_type == CHANNEL_TYPE_FILE_TRANSFER && !self.requested
	}
}

/// Request to open a new file transfer channel to a contact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRequest {
	pub channel_type: String,
	pub target_handle: Handle,
	pub content_type: String,
	pub filename: String,
	pub size: u64,
	pub description: String,
	pub initial_offset: u64,
}

#[async_trait]
pub trait Channel: fmt::Debug + Send + Sync + 'static {
	fn path(&self) -> &ChannelPath;

	/// Subscribe to the channel's signals. Signals sent before this call are not replayed.
	fn subscribe(&self) -> broadcast::Receiver<ChannelSignal>;

	async fn properties(&self) -> Result<FileTransferProperties, ProtocolError>;

	async fn target_handle(&self) -> Result<Handle, ProtocolError>;

	/// Accept an offered file, returning the socket the channel will stream the file from.
	async fn accept_file(
		&self,
		address_type: SocketAddressType,
		access_control: SocketAccessControl,
		access_control_param: &str,
		offset: u64,
	) -> Result<SocketAddress, ProtocolError>;

	/// Offer a local file, returning the socket the channel expects the file on.
	async fn provide_file(
		&self,
		address_type: SocketAddressType,
		access_control: SocketAccessControl,
		access_control_param: &str,
	) -> Result<SocketAddress, ProtocolError>;

	async fn close(&self) -> Result<(), ProtocolError>;
}

pub type DynChannel = Arc<dyn Channel>;
