use std::{ops::Deref, path::PathBuf};

use tracing::{debug, info};

use crate::{
	channel::{ChannelPath, DynChannel},
	config::TransferConfig,
	connection::DynConnection,
	error::{Error, FileIOError},
	presence::PresenceService,
	session::{bind_channel, Command, Direction, Driver, FileTransfer, StreamRole, TransferSnapshot},
};

/// A file a peer offered to us.
#[derive(Debug, Clone)]
pub struct IncomingTransfer {
	transfer: FileTransfer,
}

impl IncomingTransfer {
	/// Binds to the offered channel and starts following it.
	///
	/// The channel's properties are fetched before this returns, so the snapshot already carries
	/// the file's metadata.
	pub async fn new(
		connection: &DynConnection,
		path: &ChannelPath,
		presence: &dyn PresenceService,
		config: TransferConfig,
	) -> Result<Self, Error> {
		let channel = connection.channel(path).map_err(Error::Channel)?;

		Self::with_channel(connection, channel, presence, config).await
	}

	pub(crate) async fn with_channel(
		connection: &DynConnection,
		channel: DynChannel,
		presence: &dyn PresenceService,
		config: TransferConfig,
	) -> Result<Self, Error> {
		let (transfer, parts) =
			FileTransfer::new(Direction::Incoming, config, TransferSnapshot::default());

		let signals = bind_channel(
			&transfer,
			&parts.snapshot_tx,
			connection.id().clone(),
			channel.clone(),
			presence,
		)
		.await?;

		info!(
			"({}): incoming file '{}' ({} bytes) on '{}'",
			transfer.id(),
			transfer.snapshot().title.unwrap_or_default(),
			transfer.snapshot().file_size.unwrap_or_default(),
			channel.path(),
		);

		let driver = Driver::new(transfer.clone(), parts, StreamRole::Receiver, channel, None);
		tokio::spawn(driver.run(signals));

		Ok(Self { transfer })
	}

	/// Accepts the offer, saving the file to `destination` once the channel opens.
	///
	/// `destination` must not exist yet. That is checked before talking to the channel, but not
	/// atomically with creating the file later on.
	pub async fn accept(&self, destination: impl Into<PathBuf>) -> Result<(), Error> {
		let destination = destination.into();
		let id = self.id();

		if tokio::fs::try_exists(&destination)
			.await
			.map_err(|e| FileIOError::with_context(&destination, e, "checking destination"))?
		{
			return Err(Error::DestinationExists(destination));
		}

		if !self.transfer.mark_accepted() {
			return Err(Error::AlreadyAccepted);
		}

		let channel = self.transfer.channel().ok_or(Error::NoChannel)?;
		let config = self.config();

		let address = match channel
			.accept_file(config.address_type, config.access_control, "", 0)
			.await
		{
			Ok(address) => address,
			Err(e) => {
				self.transfer.unmark_accepted();
				return Err(Error::Channel(e));
			}
		};

		debug!("({id}): channel will stream from socket {address:?}");
		self.transfer.send_command(Command::Accepted {
			destination,
			address,
		})
	}

	/// Refuses the offer. Same as cancelling it.
	pub async fn decline(&self) -> Result<(), Error> {
		self.transfer.cancel().await
	}

	#[must_use]
	pub fn transfer(&self) -> &FileTransfer {
		&self.transfer
	}
}

impl Deref for IncomingTransfer {
	type Target = FileTransfer;

	fn deref(&self) -> &Self::Target {
		&self.transfer
	}
}
