use bytes::Buf;
use log::{debug, error, trace, warn};

use crate::connection::ParticipantConnections;
use crate::error::SteplockError;
use crate::game::{Game, GameStateSnapshot};
use crate::network::messages::{
    Command, DownloadGameStateChunk, DownloadGameStateRequest, DownloadGameStateStatus,
    GameStepRequest, JoinGameRequest,
};
use crate::requests::{download_state, game_step, join_game};
use crate::stats::RatePerSecond;
use crate::steps::StepId;
use crate::transport_connection::{ConnectionPhase, TransportConnection};
use crate::{
    MultiTransport, DATAGRAM_MAX_SIZE, MAX_GAME_STATE_OCTETS, MAX_LOCAL_PLAYERS,
    MAX_SINGLE_STEP_OCTETS, MAX_TRANSPORT_CONNECTIONS,
};

/// Bounded transport drain per update so a datagram flood cannot starve the tick.
const DATAGRAMS_PER_UPDATE: usize = 32;

const STATS_PERIOD_MS: u64 = 1000;
const STATS_LOG_UPDATE_INTERVAL: u64 = 3000;

/// A joiner that has to replay more than this many ticks cannot catch up from steps alone
/// (the per-connection window is smaller) and needs a fresh snapshot instead. Keeping the
/// threshold above the window also stops the host from re-serializing state every tick.
const REASONABLE_CATCHUP_STEP_COUNT: i32 = 80;

/// Construction parameters for a [`Server`]. All caps are validated by [`Server::new`].
#[derive(Debug, Clone)]
pub struct ServerSetup {
    /// Version the host application runs; download requests with any other version are
    /// refused.
    pub application_version: u32,
    /// Transport connection slots to preallocate, at most [`MAX_TRANSPORT_CONNECTIONS`].
    pub max_connection_count: usize,
    /// Participant slots in the game, at most [`MAX_TRANSPORT_CONNECTIONS`].
    pub max_participant_count: usize,
    /// Players a single connection may bundle, at most [`MAX_LOCAL_PLAYERS`].
    pub max_participants_per_connection: usize,
    /// Payload cap for one participant's step, at most [`MAX_SINGLE_STEP_OCTETS`].
    pub max_single_participant_step_octet_count: usize,
    /// Snapshot size cap, at most [`MAX_GAME_STATE_OCTETS`].
    pub max_game_state_octet_count: usize,
}

impl Default for ServerSetup {
    fn default() -> Self {
        Self {
            application_version: 0,
            max_connection_count: MAX_TRANSPORT_CONNECTIONS,
            max_participant_count: MAX_TRANSPORT_CONNECTIONS,
            max_participants_per_connection: MAX_LOCAL_PLAYERS,
            max_single_participant_step_octet_count: MAX_SINGLE_STEP_OCTETS,
            max_game_state_octet_count: MAX_GAME_STATE_OCTETS,
        }
    }
}

/// The authoritative lockstep server. Owns every connection slot, the participant registry
/// and the authoritative step sequence; strictly single-threaded and driven by
/// [`Server::update`] at tick cadence.
pub struct Server {
    application_version: u32,
    max_participants_per_connection: usize,
    max_single_participant_step_octet_count: usize,
    max_game_state_octet_count: usize,
    transport: Box<dyn MultiTransport>,
    transport_connections: Vec<TransportConnection>,
    connections: ParticipantConnections,
    game: Game,
    authoritative_steps_per_second: RatePerSecond,
    stats_counter: u64,
}

impl Server {
    /// Creates a server with preallocated connection and participant slots.
    ///
    /// # Errors
    /// - Returns [`SteplockError::InvalidSetup`] when any cap in the setup exceeds its
    ///   supported maximum.
    pub fn new(
        setup: ServerSetup,
        transport: Box<dyn MultiTransport>,
    ) -> Result<Self, SteplockError> {
        if setup.max_connection_count > MAX_TRANSPORT_CONNECTIONS {
            return Err(SteplockError::InvalidSetup {
                info: format!(
                    "{} connections requested, at most {} are supported",
                    setup.max_connection_count, MAX_TRANSPORT_CONNECTIONS
                ),
            });
        }
        if setup.max_participant_count > MAX_TRANSPORT_CONNECTIONS {
            return Err(SteplockError::InvalidSetup {
                info: format!(
                    "{} participants requested, at most {} are supported",
                    setup.max_participant_count, MAX_TRANSPORT_CONNECTIONS
                ),
            });
        }
        if setup.max_participants_per_connection > MAX_LOCAL_PLAYERS {
            return Err(SteplockError::InvalidSetup {
                info: format!(
                    "{} local players per connection requested, at most {} are supported",
                    setup.max_participants_per_connection, MAX_LOCAL_PLAYERS
                ),
            });
        }
        if setup.max_single_participant_step_octet_count > MAX_SINGLE_STEP_OCTETS {
            return Err(SteplockError::InvalidSetup {
                info: format!(
                    "single step octet count {} requested, at most {} is supported",
                    setup.max_single_participant_step_octet_count, MAX_SINGLE_STEP_OCTETS
                ),
            });
        }
        if setup.max_game_state_octet_count > MAX_GAME_STATE_OCTETS {
            return Err(SteplockError::InvalidSetup {
                info: format!(
                    "game state octet count {} requested, at most {} is supported",
                    setup.max_game_state_octet_count, MAX_GAME_STATE_OCTETS
                ),
            });
        }

        let per_participant = 2 + setup.max_single_participant_step_octet_count;
        let max_connection_combined = 1 + setup.max_participants_per_connection * per_participant;
        let max_game_combined = 1 + setup.max_participant_count * per_participant;

        Ok(Self {
            application_version: setup.application_version,
            max_participants_per_connection: setup.max_participants_per_connection,
            max_single_participant_step_octet_count: setup
                .max_single_participant_step_octet_count,
            max_game_state_octet_count: setup.max_game_state_octet_count,
            transport,
            transport_connections: (0..setup.max_connection_count)
                .map(|index| TransportConnection::new(index as u8))
                .collect(),
            connections: ParticipantConnections::new(
                setup.max_connection_count,
                max_connection_combined,
            ),
            game: Game::new(max_game_combined, setup.max_participant_count),
            authoritative_steps_per_second: RatePerSecond::new(0, STATS_PERIOD_MS),
            stats_counter: 0,
        })
    }

    /// Drives the server one tick: drains a bounded number of datagrams from the transport,
    /// replies to them and keeps the periodic stats. `now_ms` is an opaque monotonic
    /// millisecond counter supplied by the caller.
    pub fn update(&mut self, now_ms: u64) -> Result<(), SteplockError> {
        self.read_from_transport()?;

        self.authoritative_steps_per_second.update(now_ms);
        self.stats_counter += 1;
        if self.stats_counter % STATS_LOG_UPDATE_INTERVAL == 0 {
            self.authoritative_steps_per_second
                .debug_output("composedSteps", "steps/s");
            for connection in self.transport_connections.iter().filter(|c| c.is_used) {
                if let Some(steps_behind) = connection.steps_behind_stats.average() {
                    debug!(
                        "connection {}: avg {} steps behind",
                        connection.transport_connection_id, steps_behind
                    );
                }
            }
            for connection in self.connections.iter_used() {
                if let Some(buffer_depth) =
                    connection.incoming_step_count_in_buffer_stats.average()
                {
                    debug!(
                        "participant connection {}: avg {} incoming steps buffered",
                        connection.id, buffer_depth
                    );
                }
            }
        }
        Ok(())
    }

    fn read_from_transport(&mut self) -> Result<(), SteplockError> {
        let mut datagram = [0u8; DATAGRAM_MAX_SIZE];
        for _ in 0..DATAGRAMS_PER_UPDATE {
            let (connection_index, octet_count) = match self.transport.receive(&mut datagram)? {
                Some(received) => received,
                None => return Ok(()),
            };
            if connection_index as usize >= self.transport_connections.len() {
                warn!(
                    "dropping datagram on illegal connection index {}",
                    connection_index
                );
                continue;
            }
            if !self.transport_connections[connection_index as usize].is_used {
                self.connection_connected(connection_index)?;
            }

            match self.feed(connection_index, &datagram[..octet_count]) {
                Ok(replies) => {
                    for reply in &replies {
                        self.transport.send_to(connection_index, reply)?;
                    }
                }
                // a failing request never stops the pump; the next datagram is processed
                Err(err) if err.is_external() => {
                    debug!(
                        "ignoring bad datagram on connection {}: {}",
                        connection_index, err
                    );
                }
                Err(err) => {
                    error!(
                        "problem handling datagram on connection {}: {}",
                        connection_index, err
                    );
                }
            }
        }
        Ok(())
    }

    /// Handles one inbound datagram from the client behind `connection_index` and returns the
    /// reply datagrams to put on the wire. Most commands produce exactly one reply; a
    /// blob-stream progress report may legally produce several.
    pub fn feed(
        &mut self,
        connection_index: u8,
        data: &[u8],
    ) -> Result<Vec<Vec<u8>>, SteplockError> {
        if connection_index as usize >= MAX_TRANSPORT_CONNECTIONS
            || connection_index as usize >= self.transport_connections.len()
        {
            return Err(SteplockError::ConnectionIndexOutOfRange {
                connection_index: connection_index as usize,
            });
        }
        let transport_connection = &mut self.transport_connections[connection_index as usize];
        if !transport_connection.is_used {
            return Err(SteplockError::UnknownConnection { connection_index });
        }

        let mut buf: &[u8] = data;
        if !transport_connection.ordered_in.receive(&mut buf)? {
            trace!(
                "dropping out-of-order datagram on connection {}",
                connection_index
            );
            return Ok(Vec::new());
        }
        if !buf.has_remaining() {
            return Err(SteplockError::TruncatedDatagram);
        }
        let command = match Command::from_octet(buf.get_u8()) {
            Ok(command) => command,
            Err(err) => {
                // garbage from the wire is logged and ignored, the connection stays intact
                warn!("connection {}: {}", connection_index, err);
                return Ok(Vec::new());
            }
        };
        trace!(
            "feed: {:?} octet_count {} on connection {}",
            command,
            data.len(),
            connection_index
        );

        let mut datagrams = Vec::new();
        match command {
            Command::DownloadGameStateStatus => {
                // special case: a progress report may fan out into several chunk datagrams
                let status = DownloadGameStateStatus::decode(&mut buf)?;
                let chunks = download_state::handle_download_game_state_status(
                    transport_connection,
                    &status,
                )?;
                for chunk in &chunks {
                    datagrams.push(chunk_datagram(transport_connection, chunk));
                }
            }
            Command::JoinGameRequest => {
                let request = JoinGameRequest::decode(&mut buf)?;
                let response = join_game::handle_join_game(
                    &mut self.game,
                    &mut self.connections,
                    transport_connection,
                    self.max_participants_per_connection,
                    &request,
                )?;
                datagrams.push(reply_datagram(
                    transport_connection,
                    Command::JoinGameResponse,
                    |out| response.encode(out),
                ));
            }
            Command::GameStep => {
                let request = GameStepRequest::decode(&mut buf)?;
                let response = game_step::handle_game_step(
                    &mut self.game,
                    &mut self.connections,
                    transport_connection,
                    &mut self.authoritative_steps_per_second,
                    self.max_single_participant_step_octet_count,
                    &request,
                )?;
                datagrams.push(reply_datagram(
                    transport_connection,
                    Command::GameStepResponse,
                    |out| response.encode(out),
                ));
            }
            Command::DownloadGameStateRequest => {
                let request = DownloadGameStateRequest::decode(&mut buf)?;
                let (response, chunks) = download_state::handle_download_game_state(
                    &self.game,
                    transport_connection,
                    self.application_version,
                    &request,
                )?;
                datagrams.push(reply_datagram(
                    transport_connection,
                    Command::DownloadGameStateResponse,
                    |out| response.encode(out),
                ));
                for chunk in &chunks {
                    datagrams.push(chunk_datagram(transport_connection, chunk));
                }
            }
            unexpected => {
                warn!(
                    "connection {} sent server-to-client command {:?}, ignoring",
                    connection_index, unexpected
                );
            }
        }

        if buf.has_remaining() {
            warn!(
                "connection {}: {} trailing octets after {:?} payload",
                connection_index,
                buf.remaining(),
                command
            );
        }
        Ok(datagrams)
    }

    /// Tells the server a connection came up on the transport layer. The pump calls this
    /// automatically for unseen indices.
    ///
    /// # Errors
    /// - Returns [`SteplockError::AlreadyConnected`] when the index is in use.
    pub fn connection_connected(&mut self, connection_index: u8) -> Result<(), SteplockError> {
        let transport_connection = self
            .transport_connections
            .get_mut(connection_index as usize)
            .ok_or(SteplockError::ConnectionIndexOutOfRange {
                connection_index: connection_index as usize,
            })?;
        if transport_connection.is_used {
            warn!("connection {} already connected", connection_index);
            return Err(SteplockError::AlreadyConnected { connection_index });
        }
        debug!("connection {} connected", connection_index);
        transport_connection.connect(rand::random::<u64>());
        Ok(())
    }

    /// Tells the server a connection dropped on the transport layer. Releases the connection's
    /// participants and its step ring; the composer continues without them.
    pub fn connection_disconnected(&mut self, connection_index: u8) -> Result<(), SteplockError> {
        let transport_connection = self
            .transport_connections
            .get_mut(connection_index as usize)
            .ok_or(SteplockError::ConnectionIndexOutOfRange {
                connection_index: connection_index as usize,
            })?;
        if !transport_connection.is_used {
            return Err(SteplockError::UnknownConnection { connection_index });
        }

        let found = self
            .connections
            .find_by_transport_connection_id(connection_index)
            .map(|connection| (connection.id as usize, connection.participants.clone()));
        if let Some((slot, participants)) = found {
            for joined in participants {
                self.game.participants.release(joined.participant_id);
            }
            self.connections.release(slot);
        }
        transport_connection.disconnect();
        debug!("connection {} disconnected", connection_index);
        Ok(())
    }

    /// True when the host application should serialize a fresh snapshot and hand it over via
    /// [`Server::set_game_state`]: the authoritative frontier has moved further past the
    /// snapshot than a joiner could replay from steps alone.
    pub fn must_provide_game_state(&self) -> bool {
        let ticks_since_last_state = self
            .game
            .authoritative_steps
            .expected_write_id()
            .delta(self.game.latest_state.step_id);
        ticks_since_last_state > REASONABLE_CATCHUP_STEP_COUNT
    }

    /// Replaces the snapshot handed to late joiners. Should be called when
    /// [`Server::must_provide_game_state`] reports true.
    pub fn set_game_state(&mut self, state: &[u8], step_id: StepId) -> Result<(), SteplockError> {
        if state.len() > self.max_game_state_octet_count {
            return Err(SteplockError::GameStateTooLarge {
                octet_count: state.len(),
                max_octet_count: self.max_game_state_octet_count,
            });
        }
        debug!(
            "game state was set locally for step {} ({} octets)",
            step_id,
            state.len()
        );
        self.game.set_state(step_id, state);
        Ok(())
    }

    /// Restarts the session with a new game state: empties the authoritative ring at
    /// `step_id`, drops every participant and resets all participant connections. Transport
    /// sessions survive; clients are expected to re-join.
    ///
    /// # Errors
    /// - Returns [`SteplockError::BlobStreamActive`] while any snapshot download is in
    ///   flight; the streamed blob must stay valid until its last ack.
    pub fn re_init_with_game(
        &mut self,
        state: &[u8],
        step_id: StepId,
        now_ms: u64,
    ) -> Result<(), SteplockError> {
        if self
            .transport_connections
            .iter()
            .any(|connection| connection.blob_stream_out.is_some())
        {
            return Err(SteplockError::BlobStreamActive);
        }
        if state.len() > self.max_game_state_octet_count {
            return Err(SteplockError::GameStateTooLarge {
                octet_count: state.len(),
                max_octet_count: self.max_game_state_octet_count,
            });
        }

        self.game.reinit(step_id, state);
        self.connections.reset_all();
        self.authoritative_steps_per_second.reinit(now_ms);
        self.stats_counter = 0;
        debug!("server re-initialized with game state at step {}", step_id);
        Ok(())
    }

    /// Resets the server. Historically a no-op, kept for API compatibility;
    /// [`Server::re_init_with_game`] is the real reset path.
    pub fn reset(&mut self) {}

    /// The next authoritative step id that will be composed.
    pub fn next_authoritative_step_id(&self) -> StepId {
        self.game.authoritative_steps.expected_write_id()
    }

    /// The oldest authoritative step still held in the ring.
    pub fn oldest_authoritative_step_id(&self) -> StepId {
        self.game.authoritative_steps.expected_read_id()
    }

    /// Number of authoritative steps currently buffered.
    pub fn authoritative_step_count(&self) -> usize {
        self.game.authoritative_steps.len()
    }

    /// The snapshot currently handed to late joiners.
    pub fn latest_state(&self) -> &GameStateSnapshot {
        &self.game.latest_state
    }

    /// Number of participants currently in the game.
    pub fn participant_count(&self) -> usize {
        self.game.participants.count()
    }

    /// The handshake phase of a transport connection, if that index is connected.
    pub fn connection_phase(&self, connection_index: u8) -> Option<ConnectionPhase> {
        self.transport_connections
            .get(connection_index as usize)
            .filter(|connection| connection.is_used)
            .map(|connection| connection.phase)
    }

    /// True while the transport connection has a live participant connection in the game.
    pub fn has_participant_connection(&self, connection_index: u8) -> bool {
        self.transport_connections
            .get(connection_index as usize)
            .and_then(|connection| connection.assigned_participant_connection)
            .and_then(|slot| self.connections.get(slot))
            .map(|connection| connection.is_used)
            .unwrap_or(false)
    }

    /// Freezes or thaws authoritative composition. Inbound steps still buffer while frozen.
    /// Debugging hook.
    pub fn debug_set_frozen(&mut self, frozen: bool) {
        self.game.debug_is_frozen = frozen;
    }
}

fn reply_datagram(
    transport_connection: &mut TransportConnection,
    command: Command,
    write_payload: impl FnOnce(&mut Vec<u8>),
) -> Vec<u8> {
    let mut out = Vec::with_capacity(DATAGRAM_MAX_SIZE);
    transport_connection.ordered_out.prepare(&mut out);
    out.push(command.to_octet());
    write_payload(&mut out);
    transport_connection.ordered_out.commit();
    out
}

fn chunk_datagram(
    transport_connection: &mut TransportConnection,
    chunk: &DownloadGameStateChunk,
) -> Vec<u8> {
    reply_datagram(
        transport_connection,
        Command::DownloadGameStateChunk,
        |out| chunk.encode(out),
    )
}

// #########
// # TESTS #
// #########
