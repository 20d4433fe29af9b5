use std::error::Error;
use std::fmt;
use std::fmt::Display;

use crate::steps::StepId;
use crate::ParticipantId;

/// This enum contains all error messages this library can return. Most API functions will
/// generally return a [`Result<_, SteplockError>`].
///
/// [`Result<_, SteplockError>`]: std::result::Result
#[derive(Debug, Clone, PartialEq)]
pub enum SteplockError {
    /// The server was constructed with parameters outside the supported caps.
    InvalidSetup {
        /// Further specifies which parameter was rejected.
        info: String,
    },
    /// A datagram was fed for a connection index the session cannot address.
    ConnectionIndexOutOfRange {
        /// The rejected index.
        connection_index: usize,
    },
    /// The transport announced a connect for an index that is already in use.
    AlreadyConnected {
        /// The index that was already connected.
        connection_index: u8,
    },
    /// A request arrived for a connection the server does not know about.
    UnknownConnection {
        /// The index the request arrived on.
        connection_index: u8,
    },
    /// The command octet of a datagram does not name any known command.
    UnknownCommand {
        /// The unrecognized command octet.
        command: u8,
    },
    /// A datagram ended before its payload was complete.
    TruncatedDatagram,
    /// A request decoded fine but asked for something no well-behaved client asks for.
    InvalidRequest {
        /// Further specifies why the request was invalid.
        info: String,
    },
    /// A join could not be satisfied because every participant slot is taken.
    ParticipantsExhausted,
    /// A join could not be satisfied because every participant connection slot is taken.
    ConnectionsExhausted,
    /// A step was written at a different id than the ring expected. Rings are dense; this is a
    /// programming error, never a wire condition.
    UnexpectedWriteStepId {
        /// The id the ring would have accepted.
        expected: StepId,
        /// The id the write carried.
        encountered: StepId,
    },
    /// A step was requested outside the window the ring currently holds.
    ReadOutsideWindow {
        /// The requested id.
        requested: StepId,
    },
    /// The ring has no room for another step.
    WindowFull,
    /// A step payload exceeded the configured maximum.
    StepPayloadTooLarge {
        /// Size of the offending payload.
        octet_count: usize,
        /// The configured maximum.
        max_octet_count: usize,
    },
    /// A client sent predicted steps that leave a gap in front of its ring.
    StepIdGap {
        /// The next id the connection's ring accepts.
        expected: StepId,
        /// The first id the client offered.
        encountered: StepId,
    },
    /// A client submitted a step for a participant that does not belong to its connection.
    ForeignParticipant {
        /// The participant id the client named.
        participant_id: ParticipantId,
    },
    /// A serialized game state exceeded the configured maximum.
    GameStateTooLarge {
        /// Size of the offending snapshot.
        octet_count: usize,
        /// The configured maximum.
        max_octet_count: usize,
    },
    /// A blob-stream status arrived for a channel with no active transfer.
    UnknownBlobChannel {
        /// The channel the client named.
        channel: u8,
    },
    /// The game cannot be re-initialized while a state download is still in flight.
    BlobStreamActive,
    /// The underlying transport failed.
    Transport {
        /// Further specifies the transport failure.
        info: String,
    },
}

impl SteplockError {
    /// Distinguishes errors caused by a misbehaving client (suppress log spam, keep serving)
    /// from internal bugs (log as soft error).
    pub fn is_external(&self) -> bool {
        matches!(
            self,
            SteplockError::ConnectionIndexOutOfRange { .. }
                | SteplockError::AlreadyConnected { .. }
                | SteplockError::UnknownConnection { .. }
                | SteplockError::UnknownCommand { .. }
                | SteplockError::TruncatedDatagram
                | SteplockError::InvalidRequest { .. }
                | SteplockError::ParticipantsExhausted
                | SteplockError::ConnectionsExhausted
                | SteplockError::StepIdGap { .. }
                | SteplockError::ForeignParticipant { .. }
                | SteplockError::UnknownBlobChannel { .. }
        )
    }
}

impl Display for SteplockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SteplockError::InvalidSetup { info } => {
                write!(f, "Invalid setup: {}", info)
            }
            SteplockError::ConnectionIndexOutOfRange { connection_index } => {
                write!(f, "Connection index {} is out of range.", connection_index)
            }
            SteplockError::AlreadyConnected { connection_index } => {
                write!(f, "Connection {} is already connected.", connection_index)
            }
            SteplockError::UnknownConnection { connection_index } => {
                write!(f, "No connected client on index {}.", connection_index)
            }
            SteplockError::UnknownCommand { command } => {
                write!(f, "Unknown command octet {:02X}.", command)
            }
            SteplockError::TruncatedDatagram => {
                write!(f, "Datagram ended before its payload was complete.")
            }
            SteplockError::InvalidRequest { info } => {
                write!(f, "Invalid request: {}", info)
            }
            SteplockError::ParticipantsExhausted => {
                write!(f, "All participant slots are taken.")
            }
            SteplockError::ConnectionsExhausted => {
                write!(f, "All participant connection slots are taken.")
            }
            SteplockError::UnexpectedWriteStepId {
                expected,
                encountered,
            } => {
                write!(
                    f,
                    "Step ring expected a write at {}, but {} was written.",
                    expected, encountered
                )
            }
            SteplockError::ReadOutsideWindow { requested } => {
                write!(f, "Step {} is outside the stored window.", requested)
            }
            SteplockError::WindowFull => {
                write!(f, "Step ring is full.")
            }
            SteplockError::StepPayloadTooLarge {
                octet_count,
                max_octet_count,
            } => {
                write!(
                    f,
                    "Step payload of {} octets exceeds the maximum of {}.",
                    octet_count, max_octet_count
                )
            }
            SteplockError::StepIdGap {
                expected,
                encountered,
            } => {
                write!(
                    f,
                    "Predicted steps start at {} but the connection expects {}.",
                    encountered, expected
                )
            }
            SteplockError::ForeignParticipant { participant_id } => {
                write!(
                    f,
                    "Participant {} does not belong to the sending connection.",
                    participant_id
                )
            }
            SteplockError::GameStateTooLarge {
                octet_count,
                max_octet_count,
            } => {
                write!(
                    f,
                    "Game state of {} octets exceeds the maximum of {}.",
                    octet_count, max_octet_count
                )
            }
            SteplockError::UnknownBlobChannel { channel } => {
                write!(f, "No active blob stream on channel {}.", channel)
            }
            SteplockError::BlobStreamActive => {
                write!(
                    f,
                    "The game state cannot be replaced while a download is in flight."
                )
            }
            SteplockError::Transport { info } => {
                write!(f, "Transport failure: {}", info)
            }
        }
    }
}

impl Error for SteplockError {}

impl From<std::io::Error> for SteplockError {
    fn from(err: std::io::Error) -> Self {
        SteplockError::Transport {
            info: err.to_string(),
        }
    }
}
