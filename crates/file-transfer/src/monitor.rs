use std::{
	collections::{HashMap, HashSet},
	path::PathBuf,
	sync::{Arc, Mutex, PoisonError},
};

use tokio::{
	sync::{
		broadcast::{self, error::RecvError},
		mpsc,
	},
	task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::{
	channel::ChannelPath,
	config::TransferConfig,
	connection::{ConnectionId, DynConnection, DynConnectionRegistry, NewChannels, RegistryEvent},
	error::Error,
	incoming::IncomingTransfer,
	outgoing::{OutgoingFile, OutgoingTransfer},
	presence::{Buddy, DynPresenceService},
	session::FileTransfer,
};

/// Broadcast whenever a transfer appears, whichever side started it.
#[derive(Debug, Clone)]
pub enum NewTransfer {
	Incoming(IncomingTransfer),
	Outgoing(OutgoingTransfer),
}

impl NewTransfer {
	#[must_use]
	pub fn transfer(&self) -> &FileTransfer {
		match self {
			Self::Incoming(incoming) => incoming.transfer(),
			Self::Outgoing(outgoing) => outgoing.transfer(),
		}
	}
}

/// Entry point of the file transfer subsystem.
///
/// Start outgoing transfers with [`TransferService::start_transfer`], and call
/// [`TransferService::init`] once so incoming ones get picked up. Both kinds are announced on
/// [`TransferService::subscribe`].
pub struct TransferService {
	registry: DynConnectionRegistry,
	presence: DynPresenceService,
	config: TransferConfig,
	new_transfer_tx: broadcast::Sender<NewTransfer>,
}

impl TransferService {
	pub fn new(
		registry: DynConnectionRegistry,
		presence: DynPresenceService,
		config: TransferConfig,
	) -> Arc<Self> {
		let (new_transfer_tx, _) = broadcast::channel(config.event_capacity.max(1));

		Arc::new(Self {
			registry,
			presence,
			config,
			new_transfer_tx,
		})
	}

	#[must_use]
	pub fn subscribe(&self) -> broadcast::Receiver<NewTransfer> {
		self.new_transfer_tx.subscribe()
	}

	#[must_use]
	pub fn config(&self) -> &TransferConfig {
		&self.config
	}

	/// Starts watching every connection of the registry, present and future, for offered files.
	pub async fn init(self: &Arc<Self>) -> ConnectionMonitor {
		// Subscribe before listing so a connection showing up in between isn't missed
		let registry_events = self.registry.subscribe();

		let monitor = ConnectionMonitor {
			service: Arc::clone(self),
			watched: Arc::default(),
			stop: CancellationToken::new(),
			handle: Arc::default(),
		};

		for connection in self.registry.connections().await {
			monitor.attach(connection);
		}

		let handle = tokio::spawn(monitor.clone().follow_registry(registry_events));
		*monitor
			.handle
			.lock()
			.unwrap_or_else(PoisonError::into_inner) = Some(handle);

		info!("file transfer monitor attached");

		monitor
	}

	/// Offers a local file to `buddy`.
	///
	/// Fails right away when the file can't be read; later failures surface as the transfer being
	/// cancelled.
	pub async fn start_transfer(
		&self,
		buddy: Buddy,
		path: impl Into<PathBuf>,
		title: impl Into<String>,
		description: impl Into<String>,
		mime_type: impl Into<String>,
	) -> Result<OutgoingTransfer, Error> {
		let transfer = OutgoingTransfer::start(
			Arc::clone(&self.registry),
			Arc::clone(&self.presence),
			buddy,
			OutgoingFile {
				path: path.into(),
				title: title.into(),
				description: description.into(),
				mime_type: mime_type.into(),
			},
			self.config.clone(),
		)
		.await?;

		self.announce(NewTransfer::Outgoing(transfer.clone()));

		Ok(transfer)
	}

	fn announce(&self, transfer: NewTransfer) {
		if self.new_transfer_tx.send(transfer).is_err() {
			debug!("no one is listening for new transfers");
		}
	}

	async fn handle_new_channels(
		&self,
		connection: &DynConnection,
		channels: NewChannels,
		live: &mut LiveChannels,
	) {
		for (path, details) in channels {
			if !details.is_incoming_file_transfer() || live.contains(&path) {
				continue;
			}

			debug!("new incoming file transfer channel '{path}' on '{}'", connection.id());

			match IncomingTransfer::new(
				connection,
				&path,
				self.presence.as_ref(),
				self.config.clone(),
			)
			.await
			{
				Ok(transfer) if transfer.state().is_terminal() => {
					debug!("channel '{path}' is already '{}', skipping", transfer.state());
				}
				Ok(transfer) => {
					live.track(path, transfer.transfer());
					self.announce(NewTransfer::Incoming(transfer));
				}
				Err(e) => error!("error binding to incoming channel '{path}': {e}"),
			}
		}
	}
}

/// Channels of one connection with a transfer still running, so announcing a channel twice
/// doesn't create a second transfer for it.
struct LiveChannels {
	paths: HashSet<ChannelPath>,
	ended_tx: mpsc::UnboundedSender<ChannelPath>,
}

impl LiveChannels {
	fn contains(&self, path: &ChannelPath) -> bool {
		self.paths.contains(path)
	}

	/// Remembers `path` until `transfer` is over, its path then comes out of `ended_rx`.
	fn track(&mut self, path: ChannelPath, transfer: &FileTransfer) {
		self.paths.insert(path.clone());

		let transfer = transfer.clone();
		let ended_tx = self.ended_tx.clone();
		tokio::spawn(async move {
			transfer.wait().await;
			ended_tx.send(path).ok();
		});
	}

	fn forget(&mut self, path: &ChannelPath) {
		self.paths.remove(path);
	}
}

/// Keeps track of the connections watched for incoming transfers.
#[derive(Clone)]
pub struct ConnectionMonitor {
	service: Arc<TransferService>,
	watched: Arc<Mutex<HashMap<ConnectionId, CancellationToken>>>,
	stop: CancellationToken,
	handle: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl ConnectionMonitor {
	#[must_use]
	pub fn watched_connections(&self) -> Vec<ConnectionId> {
		let mut ids = self
			.watched
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.keys()
			.cloned()
			.collect::<Vec<_>>();
		ids.sort();
		ids
	}

	/// Stops watching the registry and every connection.
	pub async fn shutdown(&self) {
		self.stop.cancel();

		let handle = self
			.handle
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.take();
		if let Some(handle) = handle {
			if let Err(e) = handle.await {
				error!("connection monitor task failed: {e}");
			}
		}
	}

	#[instrument(skip_all)]
	async fn follow_registry(self, mut events: broadcast::Receiver<RegistryEvent>) {
		loop {
			tokio::select! {
				biased;

				() = self.stop.cancelled() => break,

				event = events.recv() => match event {
					Ok(RegistryEvent::ConnectionAdded(connection)) => self.attach(connection),
					Ok(RegistryEvent::ConnectionRemoved(id)) => self.detach(&id),
					Err(RecvError::Lagged(missed)) => {
						warn!("missed {missed} connection registry events, resyncing");
						self.resync().await;
					}
					Err(RecvError::Closed) => {
						debug!("connection registry went away");
						break;
					}
				},
			}
		}

		let ids = self.watched_connections();
		for id in ids {
			self.detach(&id);
		}
	}

	async fn resync(&self) {
		let connections = self.service.registry.connections().await;
		let alive = connections
			.iter()
			.map(|connection| connection.id().clone())
			.collect::<HashSet<_>>();

		for id in self.watched_connections() {
			if !alive.contains(&id) {
				self.detach(&id);
			}
		}

		for connection in connections {
			self.attach(connection);
		}
	}

	fn attach(&self, connection: DynConnection) {
		let id = connection.id().clone();
		let stop = self.stop.child_token();

		{
			let mut watched = self.watched.lock().unwrap_or_else(PoisonError::into_inner);
			if watched.contains_key(&id) {
				return;
			}
			watched.insert(id.clone(), stop.clone());
		}

		debug!("monitoring connection '{id}'");

		// Subscribe before listing existing channels, `LiveChannels` drops whatever shows up in both
		let new_channels = connection.subscribe_new_channels();
		tokio::spawn(watch_connection(
			Arc::clone(&self.service),
			connection,
			new_channels,
			stop,
		));
	}

	fn detach(&self, id: &ConnectionId) {
		let stop = self
			.watched
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.remove(id);

		if let Some(stop) = stop {
			debug!("no longer monitoring connection '{id}'");
			stop.cancel();
		}
	}
}

async fn watch_connection(
	service: Arc<TransferService>,
	connection: DynConnection,
	mut new_channels: broadcast::Receiver<NewChannels>,
	stop: CancellationToken,
) {
	let (ended_tx, mut ended_rx) = mpsc::unbounded_channel();
	let mut live = LiveChannels {
		paths: HashSet::new(),
		ended_tx,
	};

	list_channels(&service, &connection, &mut live).await;

	loop {
		tokio::select! {
			biased;

			() = stop.cancelled() => break,

			Some(path) = ended_rx.recv() => live.forget(&path),

			batch = new_channels.recv() => match batch {
				Ok(channels) => service.handle_new_channels(&connection, channels, &mut live).await,
				Err(RecvError::Lagged(missed)) => {
					warn!("missed {missed} channel announcements on '{}', relisting", connection.id());
					list_channels(&service, &connection, &mut live).await;
				}
				Err(RecvError::Closed) => break,
			},
		}
	}
}

async fn list_channels(
	service: &TransferService,
	connection: &DynConnection,
	live: &mut LiveChannels,
) {
	match connection.channels().await {
		Ok(channels) => service.handle_new_channels(connection, channels, live).await,
		Err(e) => warn!("error listing channels of '{}': {e}", connection.id()),
	}
}
