use std::{
	ops::Deref,
	path::{Path, PathBuf},
	sync::Arc,
};

use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info};

use crate::{
	channel::{ChannelRequest, ChannelSignal, DynChannel, SocketAddress, CHANNEL_TYPE_FILE_TRANSFER},
	config::TransferConfig,
	connection::{ConnectionId, DynConnection, DynConnectionRegistry},
	error::{Error, FileIOError},
	presence::{Buddy, DynPresenceService, Handle, PresenceService},
	session::{
		aborted, abandon, bind_channel, Direction, Driver, FileTransfer, StreamRole,
		TransferSnapshot,
	},
	state::StateChangeReason,
};

/// What the peer is offered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingFile {
	pub path: PathBuf,
	pub title: String,
	pub description: String,
	pub mime_type: String,
}

/// A local file we offer to a peer.
#[derive(Debug, Clone)]
pub struct OutgoingTransfer {
	transfer: FileTransfer,
	source: PathBuf,
}

impl OutgoingTransfer {
	/// Offers `file` to `buddy` over the presence service's preferred connection.
	///
	/// Only the source file's size is read before returning, so a missing or unreadable file fails
	/// right away without any channel being created. Everything else (opening the connection,
	/// creating the channel, provisioning the socket) happens in the background; failures there
	/// show up as the transfer moving to `Cancelled`.
	pub async fn start(
		registry: DynConnectionRegistry,
		presence: DynPresenceService,
		buddy: Buddy,
		file: OutgoingFile,
		config: TransferConfig,
	) -> Result<Self, Error> {
		let OutgoingFile {
			path,
			title,
			description,
			mime_type,
		} = file;

		let file_size = tokio::fs::metadata(&path)
			.await
			.map_err(|e| FileIOError::with_context(&path, e, "reading source metadata"))?
			.len();

		let (transfer, mut parts) = FileTransfer::new(
			Direction::Outgoing,
			config,
			TransferSnapshot {
				buddy: Some(buddy.clone()),
				title: Some(title.clone()),
				file_size: Some(file_size),
				description: Some(description.clone()),
				mime_type: Some(mime_type.clone()),
				..Default::default()
			},
		);

		let id = transfer.id();
		info!("({id}): offering {path:?} ({file_size} bytes) to '{buddy}'");

		let request = ChannelRequest {
			channel_type: CHANNEL_TYPE_FILE_TRANSFER.to_owned(),
			target_handle: Handle(0),
			content_type: mime_type,
			filename: title,
			size: file_size,
			description,
			initial_offset: 0,
		};

		tokio::spawn({
			let transfer = transfer.clone();
			let source = path.clone();

			async move {
				// Only reaching the peer can be aborted here. Later aborts are left for the driver,
				// which closes the channel.
				let connected = tokio::select! {
					res = connect(&transfer, &registry, presence.as_ref(), &buddy) => res,
					() = aborted(&mut parts.commands_rx) => {
						info!("({id}): cancelled before a channel was created");
						abandon(&transfer, &parts.snapshot_tx, StateChangeReason::LocalStopped);
						return;
					}
				};

				let res = match connected {
					Ok((connection, target_handle)) => {
						open_channel(
							&transfer,
							&parts.snapshot_tx,
							&connection,
							presence.as_ref(),
							ChannelRequest {
								target_handle,
								..request
							},
						)
						.await
					}
					Err(e) => Err(e),
				};

				match res {
					Ok((channel, signals, address)) => {
						let driver = Driver::new(
							transfer,
							parts,
							StreamRole::Sender { source },
							channel,
							Some(address),
						);
						driver.run(signals).await;
					}
					Err(e) => {
						error!("({id}): error setting up the transfer: {e}");
						abandon(&transfer, &parts.snapshot_tx, StateChangeReason::LocalError);
					}
				}
			}
		});

		Ok(Self {
			transfer,
			source: path,
		})
	}

	#[must_use]
	pub fn source(&self) -> &Path {
		&self.source
	}

	#[must_use]
	pub fn transfer(&self) -> &FileTransfer {
		&self.transfer
	}
}

impl Deref for OutgoingTransfer {
	type Target = FileTransfer;

	fn deref(&self) -> &Self::Target {
		&self.transfer
	}
}

/// Opens the preferred connection and finds the handle `buddy` is reachable at on it.
async fn connect(
	transfer: &FileTransfer,
	registry: &DynConnectionRegistry,
	presence: &dyn PresenceService,
	buddy: &Buddy,
) -> Result<(DynConnection, Handle), Error> {
	let connection_id = presence
		.preferred_connection()
		.await
		.map_err(Error::Connection)?;
	let connection = registry
		.open(&connection_id)
		.await
		.map_err(Error::Connection)?;
	connection.ready().await.map_err(Error::Connection)?;
	debug!("({}): connection '{connection_id}' is ready", transfer.id());

	let handle = buddy_handle(presence, buddy, connection.id()).await?;

	Ok((connection, handle))
}

/// Creates the channel and asks it for the socket to provide the file on. The channel is closed
/// again if it can't be brought that far.
async fn open_channel(
	transfer: &FileTransfer,
	snapshot_tx: &watch::Sender<TransferSnapshot>,
	connection: &DynConnection,
	presence: &dyn PresenceService,
	request: ChannelRequest,
) -> Result<(DynChannel, broadcast::Receiver<ChannelSignal>, SocketAddress), Error> {
	let id = transfer.id();

	let (path, _) = connection
		.create_channel(request)
		.await
		.map_err(Error::Connection)?;
	let channel = connection.channel(&path).map_err(Error::Channel)?;

	match provide(transfer, snapshot_tx, connection, &channel, presence).await {
		Ok((signals, address)) => {
			debug!("({id}): providing file on socket {address:?}");
			Ok((channel, signals, address))
		}
		Err(e) => {
			debug!("({id}): closing channel '{path}'");
			if let Err(e) = channel.close().await {
				error!("({id}): error closing channel '{path}': {e}");
			}
			Err(e)
		}
	}
}

async fn provide(
	transfer: &FileTransfer,
	snapshot_tx: &watch::Sender<TransferSnapshot>,
	connection: &DynConnection,
	channel: &DynChannel,
	presence: &dyn PresenceService,
) -> Result<(broadcast::Receiver<ChannelSignal>, SocketAddress), Error> {
	let signals = bind_channel(
		transfer,
		snapshot_tx,
		connection.id().clone(),
		Arc::clone(channel),
		presence,
	)
	.await?;

	let config = transfer.config();
	let address = channel
		.provide_file(config.address_type, config.access_control, "")
		.await
		.map_err(Error::Channel)?;

	Ok((signals, address))
}

/// Prefers the handle living on `connection`, falling back to the first one known.
async fn buddy_handle(
	presence: &dyn PresenceService,
	buddy: &Buddy,
	connection: &ConnectionId,
) -> Result<Handle, Error> {
	let handles = presence
		.peer_protocol_handles(buddy)
		.await
		.map_err(Error::Connection)?;
	debug!("handles for '{buddy}': {handles:?}");

	handles
		.iter()
		.find(|handle| handle.bus_name == connection.service_name)
		.or_else(|| handles.first())
		.map(|handle| handle.handle)
		.ok_or(Error::NoProtocolHandle)
}
