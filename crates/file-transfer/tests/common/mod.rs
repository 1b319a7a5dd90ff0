#![allow(dead_code)]

use std::{
	collections::HashMap,
	path::{Path, PathBuf},
	sync::{
		atomic::{AtomicUsize, Ordering},
		Arc, Mutex, PoisonError,
	},
	time::Duration,
};

use async_trait::async_trait;
use sd_file_transfer::{
	channel::{
		Channel, ChannelDetails, ChannelPath, ChannelRequest, ChannelSignal, DynChannel,
		FileTransferProperties, SocketAccessControl, SocketAddress, SocketAddressType,
		CHANNEL_TYPE_FILE_TRANSFER,
	},
	connection::{
		Connection, ConnectionId, ConnectionRegistry, DynConnection, NewChannels, RegistryEvent,
	},
	presence::{Buddy, Handle, PresenceService, ProtocolHandle},
	ProtocolError, StateChangeReason, TransferEvent, TransferState,
};
use tokio::{
	net::{UnixListener, UnixStream},
	sync::{broadcast, Notify},
	time::timeout,
};

pub const TIMEOUT: Duration = Duration::from_secs(10);

pub fn sample(len: usize) -> Vec<u8> {
	(0..len).map(|i| (i % 253) as u8).collect()
}

pub async fn within<F: std::future::Future>(fut: F) -> F::Output {
	timeout(TIMEOUT, fut).await.expect("timed out")
}

/// Drains whatever events are already buffered.
pub fn drain(rx: &mut broadcast::Receiver<TransferEvent>) -> Vec<TransferEvent> {
	let mut events = Vec::new();
	while let Ok(event) = rx.try_recv() {
		events.push(event);
	}
	events
}

pub fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
	mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug)]
pub struct MockChannel {
	path: ChannelPath,
	socket_dir: PathBuf,
	target_handle: Handle,
	props: Mutex<FileTransferProperties>,
	signals_tx: broadcast::Sender<ChannelSignal>,
	listener: tokio::sync::Mutex<Option<UnixListener>>,
	socket_ready: Notify,
	properties_failures: AtomicUsize,
	pub accept_calls: AtomicUsize,
	pub provide_calls: AtomicUsize,
	pub close_calls: AtomicUsize,
}

impl MockChannel {
	pub fn new(
		path: &str,
		socket_dir: &Path,
		target_handle: Handle,
		props: FileTransferProperties,
	) -> Arc<Self> {
		let (signals_tx, _) = broadcast::channel(64);

		Arc::new(Self {
			path: path.into(),
			socket_dir: socket_dir.to_path_buf(),
			target_handle,
			props: Mutex::new(props),
			signals_tx,
			listener: tokio::sync::Mutex::new(None),
			socket_ready: Notify::new(),
			properties_failures: AtomicUsize::new(0),
			accept_calls: AtomicUsize::new(0),
			provide_calls: AtomicUsize::new(0),
			close_calls: AtomicUsize::new(0),
		})
	}

	pub fn offered(path: &str, socket_dir: &Path, handle: Handle, name: &str, size: u64) -> Arc<Self> {
		Self::new(
			path,
			socket_dir,
			handle,
			FileTransferProperties {
				state: TransferState::Pending,
				filename: name.to_owned(),
				size,
				description: format!("{name} from a friend"),
				content_type: "application/octet-stream".to_owned(),
				initial_offset: 0,
				transferred_bytes: 0,
			},
		)
	}

	/// Sends a signal the way the protocol would, keeping the properties in sync.
	pub fn emit(&self, signal: ChannelSignal) {
		{
			let mut props = lock(&self.props);
			match signal {
				ChannelSignal::StateChanged { state, .. } => props.state = state,
				ChannelSignal::TransferredBytesChanged(count) => props.transferred_bytes = count,
				ChannelSignal::InitialOffsetDefined(offset) => props.initial_offset = offset,
			}
		}
		self.signals_tx.send(signal).ok();
	}

	pub fn set_state(&self, state: TransferState) {
		self.emit(ChannelSignal::StateChanged {
			state,
			reason: StateChangeReason::None,
		});
	}

	/// Makes the next `n` property fetches fail.
	pub fn fail_properties(&self, n: usize) {
		self.properties_failures.store(n, Ordering::SeqCst);
	}

	/// The remote end of the socket handed out by `accept_file`/`provide_file`.
	pub async fn remote_stream(&self) -> UnixStream {
		loop {
			if let Some(listener) = self.listener.lock().await.take() {
				let (stream, _) = listener.accept().await.expect("accepting local socket");
				return stream;
			}
			self.socket_ready.notified().await;
		}
	}

	async fn listen(&self, kind: &str) -> Result<SocketAddress, ProtocolError> {
		let name = self.path.0.replace('/', "_");
		let address = self.socket_dir.join(format!("{kind}{name}.sock"));
		let listener = UnixListener::bind(&address).map_err(|e| ProtocolError::new(e.to_string()))?;

		*self.listener.lock().await = Some(listener);
		self.socket_ready.notify_one();

		Ok(address)
	}
}

#[async_trait]
impl Channel for MockChannel {
	fn path(&self) -> &ChannelPath {
		&self.path
	}

	fn subscribe(&self) -> broadcast::Receiver<ChannelSignal> {
		self.signals_tx.subscribe()
	}

	async fn properties(&self) -> Result<FileTransferProperties, ProtocolError> {
		let failing = self
			.properties_failures
			.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
			.is_ok();
		if failing {
			return Err(ProtocolError::new("channel is not ready"));
		}

		Ok(lock(&self.props).clone())
	}

	async fn target_handle(&self) -> Result<Handle, ProtocolError> {
		Ok(self.target_handle)
	}

	async fn accept_file(
		&self,
		address_type: SocketAddressType,
		access_control: SocketAccessControl,
		_access_control_param: &str,
		_offset: u64,
	) -> Result<SocketAddress, ProtocolError> {
		assert_eq!(address_type, SocketAddressType::Unix);
		assert_eq!(access_control, SocketAccessControl::Localhost);
		self.accept_calls.fetch_add(1, Ordering::SeqCst);
		self.listen("accept").await
	}

	async fn provide_file(
		&self,
		address_type: SocketAddressType,
		access_control: SocketAccessControl,
		_access_control_param: &str,
	) -> Result<SocketAddress, ProtocolError> {
		assert_eq!(address_type, SocketAddressType::Unix);
		assert_eq!(access_control, SocketAccessControl::Localhost);
		self.provide_calls.fetch_add(1, Ordering::SeqCst);
		self.listen("provide").await
	}

	async fn close(&self) -> Result<(), ProtocolError> {
		self.close_calls.fetch_add(1, Ordering::SeqCst);
		self.emit(ChannelSignal::StateChanged {
			state: TransferState::Cancelled,
			reason: StateChangeReason::LocalStopped,
		});
		Ok(())
	}
}

#[derive(Debug)]
pub struct MockConnection {
	id: ConnectionId,
	socket_dir: PathBuf,
	channels: Mutex<HashMap<ChannelPath, (Arc<MockChannel>, ChannelDetails)>>,
	new_channels_tx: broadcast::Sender<NewChannels>,
	pub requests: Mutex<Vec<ChannelRequest>>,
	created: Notify,
	next_path: AtomicUsize,
}

impl MockConnection {
	pub fn new(service_name: &str, socket_dir: &Path) -> Arc<Self> {
		let (new_channels_tx, _) = broadcast::channel(64);

		Arc::new(Self {
			id: ConnectionId {
				service_name: service_name.to_owned(),
				object_path: format!("/{}", service_name.replace('.', "/")),
			},
			socket_dir: socket_dir.to_path_buf(),
			channels: Mutex::default(),
			new_channels_tx,
			requests: Mutex::default(),
			created: Notify::new(),
			next_path: AtomicUsize::new(0),
		})
	}

	/// Registers a channel without announcing it.
	pub fn insert(&self, channel: &Arc<MockChannel>, details: ChannelDetails) {
		lock(&self.channels).insert(channel.path().clone(), (Arc::clone(channel), details));
	}

	pub fn announce(&self, channels: NewChannels) {
		self.new_channels_tx.send(channels).ok();
	}

	/// A peer offers us a file.
	pub fn offer(&self, channel: &Arc<MockChannel>) {
		let details = incoming_details(channel);
		self.insert(channel, details.clone());
		self.announce(vec![(channel.path().clone(), details)]);
	}

	/// Waits for the `n`-th channel created through `create_channel`.
	pub async fn created_channel(&self, n: usize) -> Arc<MockChannel> {
		loop {
			let notified = self.created.notified();
			let found = lock(&self.channels)
				.values()
				.filter(|(_, details)| details.requested)
				.map(|(channel, _)| Arc::clone(channel))
				.collect::<Vec<_>>();
			if found.len() > n {
				let mut found = found;
				found.sort_by(|a, b| a.path().cmp(b.path()));
				return found.swap_remove(n);
			}
			notified.await;
		}
	}
}

pub fn incoming_details(channel: &MockChannel) -> ChannelDetails {
	ChannelDetails {
		channel_type: CHANNEL_TYPE_FILE_TRANSFER.to_owned(),
		target_handle: channel.target_handle,
		requested: false,
	}
}

#[async_trait]
impl Connection for MockConnection {
	fn id(&self) -> &ConnectionId {
		&self.id
	}

	async fn ready(&self) -> Result<(), ProtocolError> {
		Ok(())
	}

	fn subscribe_new_channels(&self) -> broadcast::Receiver<NewChannels> {
		self.new_channels_tx.subscribe()
	}

	async fn channels(&self) -> Result<NewChannels, ProtocolError> {
		Ok(lock(&self.channels)
			.iter()
			.map(|(path, (_, details))| (path.clone(), details.clone()))
			.collect())
	}

	async fn create_channel(
		&self,
		request: ChannelRequest,
	) -> Result<(ChannelPath, ChannelDetails), ProtocolError> {
		let n = self.next_path.fetch_add(1, Ordering::SeqCst);
		let channel = MockChannel::new(
			&format!("{}/FileTransferChannel{n}", self.id.object_path),
			&self.socket_dir,
			request.target_handle,
			FileTransferProperties {
				state: TransferState::Pending,
				filename: request.filename.clone(),
				size: request.size,
				description: request.description.clone(),
				content_type: request.content_type.clone(),
				initial_offset: request.initial_offset,
				transferred_bytes: 0,
			},
		);
		let details = ChannelDetails {
			channel_type: request.channel_type.clone(),
			target_handle: request.target_handle,
			requested: true,
		};

		lock(&self.requests).push(request);
		self.insert(&channel, details.clone());

		// Locally requested channels get announced too
		self.announce(vec![(channel.path().clone(), details.clone())]);
		self.created.notify_waiters();

		Ok((channel.path().clone(), details))
	}

	fn channel(&self, path: &ChannelPath) -> Result<DynChannel, ProtocolError> {
		lock(&self.channels)
			.get(path)
			.map(|(channel, _)| Arc::clone(channel) as DynChannel)
			.ok_or_else(|| ProtocolError::new(format!("no channel at '{path}'")))
	}
}

#[derive(Default)]
pub struct MockRegistry {
	connections: Mutex<Vec<Arc<MockConnection>>>,
	events_tx: Mutex<Option<broadcast::Sender<RegistryEvent>>>,
	pub open_calls: AtomicUsize,
}

impl MockRegistry {
	pub fn new(connections: &[Arc<MockConnection>]) -> Arc<Self> {
		let (events_tx, _) = broadcast::channel(64);

		Arc::new(Self {
			connections: Mutex::new(connections.to_vec()),
			events_tx: Mutex::new(Some(events_tx)),
			open_calls: AtomicUsize::new(0),
		})
	}

	fn send(&self, event: RegistryEvent) {
		if let Some(tx) = lock(&self.events_tx).as_ref() {
			tx.send(event).ok();
		}
	}

	pub fn add(&self, connection: &Arc<MockConnection>) {
		lock(&self.connections).push(Arc::clone(connection));
		self.send(RegistryEvent::ConnectionAdded(Arc::clone(connection) as DynConnection));
	}

	pub fn remove(&self, id: &ConnectionId) {
		lock(&self.connections).retain(|connection| connection.id() != id);
		self.send(RegistryEvent::ConnectionRemoved(id.clone()));
	}
}

#[async_trait]
impl ConnectionRegistry for MockRegistry {
	async fn connections(&self) -> Vec<DynConnection> {
		lock(&self.connections)
			.iter()
			.map(|connection| Arc::clone(connection) as DynConnection)
			.collect()
	}

	fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
		match lock(&self.events_tx).as_ref() {
			Some(tx) => tx.subscribe(),
			None => broadcast::channel(1).1,
		}
	}

	async fn open(&self, id: &ConnectionId) -> Result<DynConnection, ProtocolError> {
		self.open_calls.fetch_add(1, Ordering::SeqCst);
		lock(&self.connections)
			.iter()
			.find(|connection| connection.id() == id)
			.map(|connection| Arc::clone(connection) as DynConnection)
			.ok_or_else(|| ProtocolError::new(format!("no connection '{id}'")))
	}
}

#[derive(Default)]
pub struct MockPresence {
	pub preferred: Option<ConnectionId>,
	pub buddies: HashMap<Handle, Buddy>,
	pub handles: Vec<ProtocolHandle>,
}

impl MockPresence {
	pub fn buddy(nick: &str) -> Buddy {
		Buddy {
			object_path: format!("/org/laptop/Sugar/Presence/Buddies/{nick}"),
			nick: Some(nick.to_owned()),
		}
	}
}

#[async_trait]
impl PresenceService for MockPresence {
	async fn resolve_buddy(&self, _connection: &ConnectionId, handle: Handle) -> Option<Buddy> {
		self.buddies.get(&handle).cloned()
	}

	async fn preferred_connection(&self) -> Result<ConnectionId, ProtocolError> {
		self.preferred
			.clone()
			.ok_or_else(|| ProtocolError::new("no connection available"))
	}

	async fn peer_protocol_handles(&self, _buddy: &Buddy) -> Result<Vec<ProtocolHandle>, ProtocolError> {
		Ok(self.handles.clone())
	}
}

/// Polls `cond` until it holds.
pub async fn until(mut cond: impl FnMut() -> bool) {
	within(async {
		while !cond() {
			tokio::time::sleep(Duration::from_millis(10)).await;
		}
	})
	.await;
}
