//! # Steplock
//! Steplock is the authoritative server core of a deterministic lockstep multiplayer system.
//! Clients stream predicted inputs ("steps") over an unreliable datagram transport; the server
//! merges the streams of all participating clients into a single authoritative step sequence,
//! redistributes that sequence, and bootstraps late joiners with a serialized game state
//! snapshot plus the step tail needed to fast-forward.
//!
//! The server never simulates the game itself: step payloads are opaque octet blobs that only
//! the host application interprets.

#![forbid(unsafe_code)] // let us try
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub use error::SteplockError;
pub use game::GameStateSnapshot;
pub use network::blob_stream::BlobStreamIn;
pub use network::messages::{
    CombinedStep, Command, DownloadGameStateChunk, DownloadGameStateRequest,
    DownloadGameStateResponse, DownloadGameStateStatus, DownloadStateResult, GameStepRequest,
    GameStepResponse, JoinGameRequest, JoinGameResponse, JoinedParticipant, ParticipantStep,
};
pub use network::udp_transport::UdpMultiTransport;
pub use server::{Server, ServerSetup};
pub use steps::StepId;
pub use transport_connection::ConnectionPhase;

pub(crate) mod composer;
pub(crate) mod connection;
pub(crate) mod error;
pub(crate) mod game;
pub(crate) mod participant;
pub(crate) mod server;
pub(crate) mod stats;
pub(crate) mod steps;
pub(crate) mod transport_connection;
pub(crate) mod network {
    pub(crate) mod blob_stream;
    pub(crate) mod messages;
    pub(crate) mod ordered_datagram;
    pub(crate) mod udp_transport;
}
pub(crate) mod requests {
    pub(crate) mod download_state;
    pub(crate) mod game_step;
    pub(crate) mod join_game;
}

// #############
// # CONSTANTS #
// #############

/// The number of steps every ring buffer can hold at the same time, per participant connection
/// and for the authoritative sequence.
pub const WINDOW_SIZE: usize = 64;

/// Hard cap on the payload size of a single participant's step for one tick.
pub const MAX_SINGLE_STEP_OCTETS: usize = 24;

/// Upper bound on simultaneous transport connections in one session. The cap is what an 8-bit
/// participant index and the 8-bit datagram sequence can encode.
pub const MAX_TRANSPORT_CONNECTIONS: usize = 64;

/// The most local players a single connection can bundle.
pub const MAX_LOCAL_PLAYERS: usize = 4;

/// Largest serialized game state snapshot the server accepts.
pub const MAX_GAME_STATE_OCTETS: usize = 65535;

/// All datagrams, both directions, stay at or below this size. Oversized step-range replies are
/// truncated at step boundaries instead.
pub const DATAGRAM_MAX_SIZE: usize = 1200;

/// Each player slot is identified by a participant id. Id 0 is reserved for "empty"; assigned
/// ids start at 1.
pub type ParticipantId = u8;

// #############
// #  TRAITS   #
// #############

/// The datagram transport the server consumes. Implementations multiplex several client
/// sessions onto small integer connection indices that stay stable for the lifetime of the
/// transport-level session.
///
/// Delivery is expected to be unreliable and unordered, UDP-like; the server filters stale
/// datagrams itself and tolerates loss.
pub trait MultiTransport {
    /// Polls for a single inbound datagram, non-blocking. Returns the connection index it
    /// arrived on and the number of octets written into `buf`, or `None` when nothing is
    /// pending.
    fn receive(&mut self, buf: &mut [u8]) -> Result<Option<(u8, usize)>, SteplockError>;

    /// Sends one datagram to the client behind `connection_index`, best effort.
    fn send_to(&mut self, connection_index: u8, data: &[u8]) -> Result<(), SteplockError>;
}
