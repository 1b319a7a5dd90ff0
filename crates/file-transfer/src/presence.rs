use std::{fmt, sync::Arc};

use async_trait::async_trait;

use crate::{connection::ConnectionId, error::ProtocolError};

/// Protocol scoped numeric identifier of a remote contact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(pub u32);

impl fmt::Display for Handle {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "#{}", self.0)
	}
}

/// Identity of a remote peer as known by the presence service.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Buddy {
	pub object_path: String,
	pub nick: Option<String>,
}

impl fmt::Display for Buddy {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match &self.nick {
			Some(nick) => write!(f, "{nick} ({})", self.object_path),
			None => f.write_str(&self.object_path),
		}
	}
}

/// Where a buddy can be reached on a specific protocol connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProtocolHandle {
	pub bus_name: String,
	pub object_path: String,
	pub handle: Handle,
}

#[async_trait]
pub trait PresenceService: Send + Sync + 'static {
	/// Returns `None` when the handle doesn't belong to any buddy the service knows of.
	async fn resolve_buddy(&self, connection: &ConnectionId, handle: Handle) -> Option<Buddy>;

	async fn preferred_connection(&self) -> Result<ConnectionId, ProtocolError>;

	async fn peer_protocol_handles(&self, buddy: &Buddy) -> Result<Vec<ProtocolHandle>, ProtocolError>;
}

pub type DynPresenceService = Arc<dyn PresenceService>;
