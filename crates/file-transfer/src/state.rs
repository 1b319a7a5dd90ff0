use std::fmt;

/// Lifecycle state of a file transfer channel.
///
/// The numeric values match the ones the protocol puts on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u32)]
pub enum TransferState {
	#[default]
	None = 0,
	Pending = 1,
	Accepted = 2,
	Open = 3,
	Completed = 4,
	Cancelled = 5,
}

impl TransferState {
	#[must_use]
	pub const fn is_terminal(self) -> bool {
		matches!(self, Self::Completed | Self::Cancelled)
	}

	/// States only ever move forward. The one exception is `Cancelled`, reachable from
	/// any state that isn't terminal yet.
	#[must_use]
	pub fn can_transition_to(self, next: Self) -> bool {
		if self.is_terminal() {
			return false;
		}

		match next {
			Self::Cancelled => true,
			next => (next as u32) > (self as u32),
		}
	}
}

impl TryFrom<u32> for TransferState {
	type Error = u32;

	fn try_from(value: u32) -> Result<Self, Self::Error> {
		Ok(match value {
			0 => Self::None,
			1 => Self::Pending,
			2 => Self::Accepted,
			3 => Self::Open,
			4 => Self::Completed,
			5 => Self::Cancelled,
			other => return Err(other),
		})
	}
}

impl fmt::Display for TransferState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let name = match self {
			Self::None => "none",
			Self::Pending => "pending",
			Self::Accepted => "accepted",
			Self::Open => "open",
			Self::Completed => "completed",
			Self::Cancelled => "cancelled",
		};
		f.write_str(name)
	}
}

/// Why the channel moved to its current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u32)]
pub enum StateChangeReason {
	#[default]
	None = 0,
	Requested = 1,
	LocalStopped = 2,
	RemoteStopped = 3,
	LocalError = 4,
	RemoteError = 5,
}

impl From<u32> for StateChangeReason {
	fn from(value: u32) -> Self {
		match value {
			1 => Self::Requested,
			2 => Self::LocalStopped,
			3 => Self::RemoteStopped,
			4 => Self::LocalError,
			5 => Self::RemoteError,
			// Unknown reasons carry no information we can act upon
			_ => Self::None,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	const ALL: [TransferState; 6] = [
		TransferState::None,
		TransferState::Pending,
		TransferState::Accepted,
		TransferState::Open,
		TransferState::Completed,
		TransferState::Cancelled,
	];

	#[test]
	fn never_moves_backwards() {
		for from in ALL {
			for to in ALL {
				if from.can_transition_to(to) && to != TransferState::Cancelled {
					assert!((to as u32) > (from as u32), "{from} -> {to}");
				}
			}
		}
	}

	#[test]
	fn cancel_from_any_live_state() {
		for from in [
			TransferState::None,
			TransferState::Pending,
			TransferState::Accepted,
			TransferState::Open,
		] {
			assert!(from.can_transition_to(TransferState::Cancelled));
		}

		assert!(!TransferState::Completed.can_transition_to(TransferState::Cancelled));
		assert!(!TransferState::Cancelled.can_transition_to(TransferState::Cancelled));
	}

	#[test]
	fn wire_values() {
		for state in ALL {
			assert_eq!(TransferState::try_from(state as u32), Ok(state));
		}
		assert_eq!(TransferState::try_from(42), Err(42));
		assert_eq!(StateChangeReason::from(3), StateChangeReason::RemoteStopped);
		assert_eq!(StateChangeReason::from(99), StateChangeReason::None);
	}
}
