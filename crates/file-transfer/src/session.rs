//! State shared by incoming and outgoing transfers.
//!
//! Every session has a single driver task. It is the only writer of the session's state: channel
//! signals and local commands are both consumed there, one at a time, and the result is published
//! through a [`watch`] channel (current snapshot) and a [`broadcast`] channel (discrete events).
//! Once the channel reports [`TransferState::Open`] the driver connects to the socket the channel
//! provisioned, opens the local file and splices one into the other. Which side is the source
//! depends on the session's [`StreamRole`].

use std::{
	fmt,
	io::SeekFrom,
	path::{Path, PathBuf},
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc, OnceLock,
	},
};

use futures::future::{self, BoxFuture, FutureExt};
use tokio::{
	fs::{File, OpenOptions},
	io::{AsyncSeekExt, AsyncWriteExt},
	net::UnixStream,
	sync::{
		broadcast::{self, error::RecvError},
		mpsc, watch,
	},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::{
	channel::{ChannelSignal, DynChannel, FileTransferProperties, SocketAddress},
	config::TransferConfig,
	connection::ConnectionId,
	error::{Error, FileIOError},
	presence::{Buddy, PresenceService},
	splice::{in_flight, SpliceOutcome, SpliceStats, StreamSplicer},
	state::{StateChangeReason, TransferState},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
	Incoming,
	Outgoing,
}

/// Selects which end of the splice the local file sits on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamRole {
	/// The file at `source` is read and written into the channel's socket.
	Sender { source: PathBuf },
	/// The channel's socket is read and written into the accepted destination.
	Receiver,
}

/// Observable state of a transfer.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TransferSnapshot {
	pub state: TransferState,
	pub reason: StateChangeReason,
	pub buddy: Option<Buddy>,
	pub title: Option<String>,
	pub file_size: Option<u64>,
	pub description: Option<String>,
	pub mime_type: Option<String>,
	pub initial_offset: u64,
	pub transferred_bytes: u64,
	pub destination_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
	StateChanged {
		state: TransferState,
		reason: StateChangeReason,
	},
	TransferredBytesChanged(u64),
	InitialOffsetDefined(u64),
	/// The whole file went through the local socket. Sent at most once per transfer.
	SpliceFinished(SpliceStats),
	/// Copying failed; the channel is being closed.
	SpliceFailed(String),
}

#[derive(Debug)]
pub(crate) enum Command {
	Accepted {
		destination: PathBuf,
		address: SocketAddress,
	},
	/// Stop the transfer, closing the channel if there is one already
	Abort,
}

struct Shared {
	id: Uuid,
	direction: Direction,
	config: TransferConfig,
	connection: OnceLock<ConnectionId>,
	channel: OnceLock<DynChannel>,
	snapshot: watch::Receiver<TransferSnapshot>,
	events_tx: broadcast::Sender<TransferEvent>,
	commands_tx: mpsc::UnboundedSender<Command>,
	accepted: AtomicBool,
}

/// Handle to a file transfer session. Cloning it is cheap, every clone observes the same session.
#[derive(Clone)]
pub struct FileTransfer {
	inner: Arc<Shared>,
}

impl fmt::Debug for FileTransfer {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("FileTransfer")
			.field("id", &self.inner.id)
			.field("direction", &self.inner.direction)
			.field("state", &self.inner.snapshot.borrow().state)
			.finish_non_exhaustive()
	}
}

/// The receiving ends only the driver holds.
pub(crate) struct DriverParts {
	pub(crate) snapshot_tx: watch::Sender<TransferSnapshot>,
	pub(crate) commands_rx: mpsc::UnboundedReceiver<Command>,
}

impl FileTransfer {
	pub(crate) fn new(
		direction: Direction,
		config: TransferConfig,
		initial: TransferSnapshot,
	) -> (Self, DriverParts) {
		let (snapshot_tx, snapshot) = watch::channel(initial);
		let (events_tx, _) = broadcast::channel(config.event_capacity.max(1));
		let (commands_tx, commands_rx) = mpsc::unbounded_channel();

		(
			Self {
				inner: Arc::new(Shared {
					id: Uuid::new_v4(),
					direction,
					config,
					connection: OnceLock::new(),
					channel: OnceLock::new(),
					snapshot,
					events_tx,
					commands_tx,
					accepted: AtomicBool::new(false),
				}),
			},
			DriverParts {
				snapshot_tx,
				commands_rx,
			},
		)
	}

	#[must_use]
	pub fn id(&self) -> Uuid {
		self.inner.id
	}

	#[must_use]
	pub fn direction(&self) -> Direction {
		self.inner.direction
	}

	#[must_use]
	pub fn config(&self) -> &TransferConfig {
		&self.inner.config
	}

	/// The connection hosting the channel, known once the channel is bound.
	#[must_use]
	pub fn connection_id(&self) -> Option<&ConnectionId> {
		self.inner.connection.get()
	}

	#[must_use]
	pub fn channel(&self) -> Option<&DynChannel> {
		self.inner.channel.get()
	}

	#[must_use]
	pub fn snapshot(&self) -> TransferSnapshot {
		self.inner.snapshot.borrow().clone()
	}

	#[must_use]
	pub fn state(&self) -> TransferState {
		self.inner.snapshot.borrow().state
	}

	#[must_use]
	pub fn transferred_bytes(&self) -> u64 {
		self.inner.snapshot.borrow().transferred_bytes
	}

	/// Receiver that always holds the latest snapshot.
	#[must_use]
	pub fn watch(&self) -> watch::Receiver<TransferSnapshot> {
		self.inner.snapshot.clone()
	}

	#[must_use]
	pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
		self.inner.events_tx.subscribe()
	}

	/// Resolves once `state` is reached or the session ended, returning the snapshot at that point.
	pub async fn wait_for_state(&self, state: TransferState) -> TransferSnapshot {
		let mut rx = self.watch();
		let res = rx
			.wait_for(|snapshot| snapshot.state == state || snapshot.state.is_terminal())
			.await
			.map(|snapshot| snapshot.clone());

		// The driver is gone, what we have is final
		res.unwrap_or_else(|_| rx.borrow().clone())
	}

	/// Resolves once the session driver is done: the state is terminal and no splice is running.
	pub async fn wait(&self) -> TransferSnapshot {
		let mut rx = self.watch();
		while rx.changed().await.is_ok() {}
		let snapshot = rx.borrow().clone();
		snapshot
	}

	/// Closes the channel. The resulting `Cancelled` state arrives asynchronously through the
	/// channel like any other state change.
	pub async fn cancel(&self) -> Result<(), Error> {
		match self.inner.channel.get() {
			Some(channel) => {
				debug!("({}): closing channel '{}'", self.inner.id, channel.path());
				channel.close().await.map_err(Error::Channel)
			}
			None => self.send_command(Command::Abort),
		}
	}

	pub(crate) fn send_command(&self, command: Command) -> Result<(), Error> {
		self.inner
			.commands_tx
			.send(command)
			.map_err(|_| Error::SessionEnded)
	}

	/// Marks the transfer as accepted, returning `false` if it already was.
	pub(crate) fn mark_accepted(&self) -> bool {
		!self.inner.accepted.swap(true, Ordering::AcqRel)
	}

	pub(crate) fn unmark_accepted(&self) {
		self.inner.accepted.store(false, Ordering::Release);
	}

	pub(crate) fn set_channel(&self, connection: ConnectionId, channel: DynChannel) {
		if self.inner.connection.set(connection).is_err() || self.inner.channel.set(channel).is_err() {
			warn!("({}): channel was already bound, keeping the first one", self.inner.id);
		}
	}

	pub(crate) fn emit(&self, event: TransferEvent) {
		// No subscribers is fine
		self.inner.events_tx.send(event).ok();
	}
}

/// Subscribes to the channel's signals and seeds the snapshot with the channel's current
/// properties.
///
/// Subscribing comes first so nothing the channel emits while we fetch gets lost. A peer the
/// presence service doesn't know of leaves `buddy` untouched.
pub(crate) async fn bind_channel(
	transfer: &FileTransfer,
	snapshot_tx: &watch::Sender<TransferSnapshot>,
	connection: ConnectionId,
	channel: DynChannel,
	presence: &dyn PresenceService,
) -> Result<broadcast::Receiver<ChannelSignal>, Error> {
	let id = transfer.id();
	let signals = channel.subscribe();

	let props = channel.properties().await.map_err(Error::Channel)?;
	let handle = channel.target_handle().await.map_err(Error::Channel)?;

	let buddy = presence.resolve_buddy(&connection, handle).await;
	if buddy.is_none() {
		debug!("({id}): couldn't resolve buddy for handle {handle} on '{connection}'");
	}

	let FileTransferProperties {
		state,
		filename,
		size,
		description,
		content_type,
		initial_offset,
		transferred_bytes,
	} = props;

	snapshot_tx.send_modify(|snapshot| {
		snapshot.state = state;
		snapshot.title = Some(filename);
		snapshot.file_size = Some(size);
		snapshot.description = Some(description);
		snapshot.mime_type = Some(content_type);
		snapshot.initial_offset = initial_offset;
		snapshot.transferred_bytes = transferred_bytes.min(size);
		if buddy.is_some() {
			snapshot.buddy = buddy;
		}
	});

	debug!("({id}): bound to channel '{}' in state '{state}'", channel.path());
	transfer.set_channel(connection, channel);

	Ok(signals)
}

/// Runs the session until its state is terminal and any running splice stopped.
pub(crate) struct Driver {
	transfer: FileTransfer,
	role: StreamRole,
	channel: DynChannel,
	snapshot_tx: watch::Sender<TransferSnapshot>,
	commands_rx: mpsc::UnboundedReceiver<Command>,
	socket_address: Option<SocketAddress>,
	destination: Option<PathBuf>,
	opened: bool,
	cancel: CancellationToken,
}

type SpliceFuture = BoxFuture<'static, Result<SpliceOutcome, Error>>;

impl Driver {
	pub(crate) fn new(
		transfer: FileTransfer,
		parts: DriverParts,
		role: StreamRole,
		channel: DynChannel,
		socket_address: Option<SocketAddress>,
	) -> Self {
		Self {
			transfer,
			role,
			channel,
			snapshot_tx: parts.snapshot_tx,
			commands_rx: parts.commands_rx,
			socket_address,
			destination: None,
			opened: false,
			cancel: CancellationToken::new(),
		}
	}

	fn id(&self) -> Uuid {
		self.transfer.id()
	}

	fn state(&self) -> TransferState {
		self.snapshot_tx.borrow().state
	}

	#[instrument(skip_all, fields(id = %self.id()))]
	pub(crate) async fn run(mut self, mut signals: broadcast::Receiver<ChannelSignal>) {
		let id = self.id();
		let mut splice: Option<SpliceFuture> = None;
		let mut signals_open = true;
		let mut commands_open = true;

		loop {
			if splice.is_none() {
				splice = self.maybe_open().await;
			}

			if self.state().is_terminal() && splice.is_none() {
				break;
			}

			if !signals_open && !commands_open && splice.is_none() {
				break;
			}

			tokio::select! {
				signal = signals.recv(), if signals_open => match signal {
					Ok(signal) => self.handle_signal(signal),
					Err(RecvError::Lagged(missed)) => {
						warn!("({id}): missed {missed} channel signals, refetching properties");
						self.resync().await;
					}
					Err(RecvError::Closed) => {
						signals_open = false;
						if !self.state().is_terminal() {
							warn!("({id}): channel went away without reaching a final state");
							self.set_state(TransferState::Cancelled, StateChangeReason::RemoteError);
						}
					}
				},

				command = self.commands_rx.recv(), if commands_open => match command {
					Some(command) => self.handle_command(command).await,
					None => commands_open = false,
				},

				outcome = in_flight(&mut splice) => {
					splice = None;
					self.splice_done(outcome).await;
				}
			}
		}

		debug!("({id}): session done in state '{}'", self.state());
	}

	fn handle_signal(&mut self, signal: ChannelSignal) {
		let id = self.id();
		debug!("({id}): channel signal {signal:?}");

		match signal {
			ChannelSignal::StateChanged { state, reason } => self.set_state(state, reason),
			ChannelSignal::TransferredBytesChanged(count) => self.set_transferred_bytes(count),
			ChannelSignal::InitialOffsetDefined(offset) => {
				if self.opened {
					warn!("({id}): ignoring initial offset {offset} defined after streams were opened");
					return;
				}

				self.snapshot_tx
					.send_modify(|snapshot| snapshot.initial_offset = offset);
				self.transfer.emit(TransferEvent::InitialOffsetDefined(offset));
			}
		}
	}

	async fn handle_command(&mut self, command: Command) {
		let id = self.id();

		match command {
			Command::Accepted {
				destination,
				address,
			} => {
				debug!("({id}): accepted, saving to {destination:?} from socket {address:?}");
				self.snapshot_tx
					.send_modify(|snapshot| snapshot.destination_path = Some(destination.clone()));
				self.destination = Some(destination);
				self.socket_address = Some(address);
			}
			Command::Abort => {
				if let Err(e) = self.channel.close().await {
					error!("({id}): error closing channel: {e}");
				}
			}
		}
	}

	fn set_state(&mut self, state: TransferState, reason: StateChangeReason) {
		let id = self.id();
		let current = self.state();

		if !current.can_transition_to(state) {
			if current != state {
				warn!("({id}): ignoring transition from '{current}' to '{state}'");
			}
			return;
		}

		info!("({id}): state '{current}' -> '{state}' ({reason:?})");
		self.snapshot_tx.send_modify(|snapshot| {
			snapshot.state = state;
			snapshot.reason = reason;
		});
		self.transfer
			.emit(TransferEvent::StateChanged { state, reason });

		if state == TransferState::Cancelled {
			self.cancel.cancel();
		}
	}

	fn set_transferred_bytes(&mut self, count: u64) {
		let (current, file_size) = {
			let snapshot = self.snapshot_tx.borrow();
			(snapshot.transferred_bytes, snapshot.file_size)
		};

		if count < current || file_size.is_some_and(|size| count > size) {
			warn!(
				"({}): ignoring transferred bytes {count} (currently {current}, size {file_size:?})",
				self.id()
			);
			return;
		}

		if count != current {
			self.snapshot_tx
				.send_modify(|snapshot| snapshot.transferred_bytes = count);
			self.transfer
				.emit(TransferEvent::TransferredBytesChanged(count));
		}
	}

	async fn resync(&mut self) {
		match self.channel.properties().await {
			Ok(props) => {
				self.set_state(props.state, StateChangeReason::None);
				self.set_transferred_bytes(props.transferred_bytes);
			}
			Err(e) => error!("({}): error refetching channel properties: {e}", self.id()),
		}
	}

	/// Opens both streams and builds the splice the first time everything it needs is there.
	async fn maybe_open(&mut self) -> Option<SpliceFuture> {
		if self.opened || self.state() != TransferState::Open {
			return None;
		}

		let address = self.socket_address.clone()?;
		let file = match &self.role {
			StreamRole::Sender { source } => source.clone(),
			StreamRole::Receiver => self.destination.clone()?,
		};

		self.opened = true;
		let id = self.id();
		let offset = self.snapshot_tx.borrow().initial_offset;

		match self.open_streams(&address, &file, offset).await {
			Ok(splice) => {
				debug!("({id}): streams open, splicing from offset {offset}");
				Some(splice)
			}
			Err(e) => {
				error!("({id}): error opening streams: {e}");
				self.fail(e.to_string()).await;
				None
			}
		}
	}

	async fn open_streams(
		&self,
		address: &SocketAddress,
		file: &Path,
		offset: u64,
	) -> Result<SpliceFuture, Error> {
		let id = self.id();
		let chunk_size = self.transfer.config().chunk_size;
		let cancel = self.cancel.clone();

		let socket = UnixStream::connect(address).await.map_err(Error::Socket)?;

		Ok(match self.role {
			StreamRole::Receiver => {
				let output = if offset == 0 {
					File::create(file).await
				} else {
					OpenOptions::new().create(true).append(true).open(file).await
				}
				.map_err(|e| FileIOError::with_context(file, e, "opening destination"))?;

				splice_over_socket(id, socket, output, SpliceDirection::SocketToFile, chunk_size, cancel)
					.boxed()
			}
			StreamRole::Sender { .. } => {
				debug!("({id}): opening {file:?} for reading");
				let mut input = File::open(file)
					.await
					.map_err(|e| FileIOError::with_context(file, e, "opening source"))?;
				if offset > 0 {
					input
						.seek(SeekFrom::Start(offset))
						.await
						.map_err(|e| FileIOError::with_context(file, e, "skipping to initial offset"))?;
				}

				splice_over_socket(id, socket, input, SpliceDirection::FileToSocket, chunk_size, cancel)
					.boxed()
			}
		})
	}

	async fn splice_done(&mut self, outcome: Result<SpliceOutcome, Error>) {
		let id = self.id();

		match outcome {
			Ok(SpliceOutcome::Finished(stats)) => {
				if let Some(expected) = self
					.expected_bytes()
					.filter(|&expected| expected != stats.bytes_written)
				{
					let written = stats.bytes_written;
					error!("({id}): stream ended after {written} of {expected} bytes");
					self.fail(format!("stream ended after {written} of {expected} bytes"))
						.await;
					return;
				}

				info!("({id}): splice finished, {} bytes", stats.bytes_written);
				self.transfer.emit(TransferEvent::SpliceFinished(stats));
			}
			Ok(SpliceOutcome::Cancelled(stats)) => {
				debug!("({id}): splice stopped after {} bytes", stats.bytes_written);
			}
			Err(e) => {
				error!("({id}): splice failed: {e}");
				self.fail(e.to_string()).await;
			}
		}
	}

	/// Bytes the splice has to move: whatever the file holds past the initial offset.
	fn expected_bytes(&self) -> Option<u64> {
		let snapshot = self.snapshot_tx.borrow();
		snapshot
			.file_size
			.map(|size| size.saturating_sub(snapshot.initial_offset))
	}

	/// Reports a local failure and closes the channel, which moves the session towards
	/// `Cancelled`. If even closing fails there's no channel left to report it, so the state is
	/// set locally.
	async fn fail(&mut self, error: String) {
		self.transfer.emit(TransferEvent::SpliceFailed(error));
		self.cancel.cancel();

		if let Err(e) = self.channel.close().await {
			error!("({}): error closing channel: {e}", self.id());
			self.set_state(TransferState::Cancelled, StateChangeReason::LocalError);
		}
	}
}

/// Publishes `Cancelled` for a session that never got a channel to report it.
pub(crate) fn abandon(
	transfer: &FileTransfer,
	snapshot_tx: &watch::Sender<TransferSnapshot>,
	reason: StateChangeReason,
) {
	let state = TransferState::Cancelled;
	snapshot_tx.send_modify(|snapshot| {
		snapshot.state = state;
		snapshot.reason = reason;
	});
	transfer.emit(TransferEvent::StateChanged { state, reason });
}

/// Waits for a command that stops the session before it has a channel.
pub(crate) async fn aborted(commands_rx: &mut mpsc::UnboundedReceiver<Command>) {
	loop {
		match commands_rx.recv().await {
			Some(Command::Abort) => return,
			Some(command) => debug!("ignoring {command:?} before a channel exists"),
			// Nobody can abort anymore
			None => return future::pending().await,
		}
	}
}

#[derive(Debug, Clone, Copy)]
enum SpliceDirection {
	SocketToFile,
	FileToSocket,
}

/// Splices between the socket and the file, then closes the socket whatever the outcome was.
async fn splice_over_socket(
	id: Uuid,
	mut socket: UnixStream,
	mut file: File,
	direction: SpliceDirection,
	chunk_size: usize,
	cancel: CancellationToken,
) -> Result<SpliceOutcome, Error> {
	let outcome = match direction {
		SpliceDirection::SocketToFile => {
			StreamSplicer::new(&mut socket, &mut file)
				.with_chunk_size(chunk_size)
				.with_cancellation(cancel)
				.run()
				.await
		}
		SpliceDirection::FileToSocket => {
			StreamSplicer::new(&mut file, &mut socket)
				.with_chunk_size(chunk_size)
				.with_cancellation(cancel)
				.run()
				.await
		}
	};

	// Already shut down when the socket was the output, the peer may have hung up too
	if let Err(e) = socket.shutdown().await {
		debug!("({id}): socket shutdown: {e}");
	}
	drop(socket);

	Ok(outcome?)
}
