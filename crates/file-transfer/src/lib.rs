//! Peer to peer file transfers on top of a presence protocol.
//!
//! The presence protocol negotiates a file transfer channel with the remote peer and hands us a
//! local socket. This crate follows each channel's state machine and, once the channel is open,
//! splices bytes between that socket and the local file.
//!
//! The protocol itself (connections, channels, the presence service resolving peers) is supplied
//! by the application through the traits in [`channel`], [`connection`] and [`presence`].

#![warn(
	clippy::all,
	clippy::pedantic,
	clippy::correctness,
	clippy::perf,
	clippy::style,
	clippy::suspicious,
	clippy::complexity,
	clippy::nursery,
	clippy::unwrap_used,
	unused_qualifications,
	rust_2018_idioms,
	trivial_casts,
	trivial_numeric_casts,
	unused_allocation,
	clippy::unnecessary_cast,
	clippy::cast_lossless,
	clippy::cast_possible_truncation,
	clippy::cast_possible_wrap,
	clippy::cast_precision_loss,
	clippy::cast_sign_loss,
	clippy::dbg_macro,
	clippy::deprecated_cfg_attr,
	clippy::separated_literal_suffix,
	deprecated
)]
#![forbid(deprecated_in_future)]
#![allow(clippy::missing_errors_doc, clippy::module_name_repetitions)]

pub mod channel;
pub mod connection;
pub mod presence;

mod config;
mod error;
mod incoming;
mod monitor;
mod outgoing;
mod session;
mod splice;
mod state;

pub use config::TransferConfig;
pub use error::{Error, FileIOError, ProtocolError, SpliceError};
pub use incoming::IncomingTransfer;
pub use monitor::{ConnectionMonitor, NewTransfer, TransferService};
pub use outgoing::{OutgoingFile, OutgoingTransfer};
pub use session::{Direction, FileTransfer, StreamRole, TransferEvent, TransferSnapshot};
pub use splice::{SpliceOutcome, SpliceStats, StreamSplicer, DEFAULT_CHUNK_SIZE};
pub use state::{StateChangeReason, TransferState};
