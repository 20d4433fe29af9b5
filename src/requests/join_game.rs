use log::{debug, warn};

use crate::connection::ParticipantConnections;
use crate::error::SteplockError;
use crate::game::Game;
use crate::network::messages::{JoinGameRequest, JoinGameResponse, JoinedParticipant};
use crate::transport_connection::TransportConnection;
use crate::MAX_LOCAL_PLAYERS;

/// Handles a join request: allocates a participant connection plus one participant per
/// requested local player and wires the references. A join from a connection that already has
/// an assignment is answered idempotently with the existing one, so clients can retransmit
/// joins freely. A full participant pool is answered with an empty assignment.
pub(crate) fn handle_join_game(
    game: &mut Game,
    connections: &mut ParticipantConnections,
    transport_connection: &mut TransportConnection,
    max_participants_per_connection: usize,
    request: &JoinGameRequest,
) -> Result<JoinGameResponse, SteplockError> {
    if let Some(slot) = transport_connection.assigned_participant_connection {
        if let Some(existing) = connections.get(slot).filter(|connection| connection.is_used)
        {
            debug!(
                "transport connection {} re-joined, answering with existing assignment",
                transport_connection.transport_connection_id
            );
            return Ok(JoinGameResponse {
                nonce: request.nonce,
                connection_secret: transport_connection.connection_secret,
                participants: existing.participants.clone(),
            });
        }
    }

    validate_local_indexes(&request.local_indexes, max_participants_per_connection)?;

    let refused = JoinGameResponse {
        nonce: request.nonce,
        connection_secret: 0,
        participants: Vec::new(),
    };

    let slot = match connections.create(
        transport_connection.transport_connection_id,
        game.authoritative_steps.expected_write_id(),
    ) {
        Ok(slot) => slot,
        Err(err) => {
            warn!("join refused: {}", err);
            return Ok(refused);
        }
    };

    let mut joined = Vec::with_capacity(request.local_indexes.len());
    for &local_index in &request.local_indexes {
        match game.participants.create(local_index) {
            Ok(participant_id) => {
                if let Some(participant) = game.participants.get(participant_id) {
                    debug!(
                        "created participant {} for local player {}",
                        participant.id, participant.local_index
                    );
                }
                joined.push(JoinedParticipant {
                    local_index,
                    participant_id,
                });
            }
            Err(err) => {
                warn!("join refused: {}", err);
                for already_joined in &joined {
                    game.participants.release(already_joined.participant_id);
                }
                connections.release(slot);
                return Ok(refused);
            }
        }
    }

    let connection = connections
        .get_mut(slot)
        .expect("slot was just allocated from this pool");
    connection.participants = joined.clone();
    transport_connection.assigned_participant_connection = Some(slot);

    debug!(
        "transport connection {} joined with {} participant(s), steps start at {}",
        transport_connection.transport_connection_id,
        joined.len(),
        game.authoritative_steps.expected_write_id()
    );

    Ok(JoinGameResponse {
        nonce: request.nonce,
        connection_secret: transport_connection.connection_secret,
        participants: joined,
    })
}

fn validate_local_indexes(
    local_indexes: &[u8],
    max_participants_per_connection: usize,
) -> Result<(), SteplockError> {
    let most_allowed = max_participants_per_connection.min(MAX_LOCAL_PLAYERS);
    if local_indexes.is_empty() || local_indexes.len() > most_allowed {
        return Err(SteplockError::InvalidRequest {
            info: format!(
                "a join needs 1 to {} local players, got {}",
                most_allowed,
                local_indexes.len()
            ),
        });
    }
    for (position, &local_index) in local_indexes.iter().enumerate() {
        if local_index as usize >= MAX_LOCAL_PLAYERS {
            return Err(SteplockError::InvalidRequest {
                info: format!("local player index {} is out of range", local_index),
            });
        }
        if local_indexes[..position].contains(&local_index) {
            return Err(SteplockError::InvalidRequest {
                info: format!("local player index {} appears twice", local_index),
            });
        }
    }
    Ok(())
}

// #########
// # TESTS #
// #########

#[cfg(test)]
mod join_game_tests {
    use super::*;
    use crate::steps::StepId;

    const MAX_COMBINED: usize = 128;

    fn setup() -> (Game, ParticipantConnections, TransportConnection) {
        let mut game = Game::new(MAX_COMBINED, 2);
        game.reinit(StepId(0x100), &[0]);
        let connections = ParticipantConnections::new(2, MAX_COMBINED);
        let mut transport_connection = TransportConnection::new(0);
        transport_connection.connect(0x5EC4E7);
        (game, connections, transport_connection)
    }

    #[test]
    fn test_join_assigns_participants_and_inits_ring() {
        let (mut game, mut connections, mut transport_connection) = setup();
        let request = JoinGameRequest {
            nonce: 99,
            local_indexes: vec![0, 1],
        };
        let response =
            handle_join_game(&mut game, &mut connections, &mut transport_connection, 2, &request)
                .unwrap();
        assert_eq!(response.nonce, 99);
        assert_eq!(response.connection_secret, 0x5EC4E7);
        assert_eq!(response.participants.len(), 2);
        assert_eq!(response.participants[0].participant_id, 1);
        assert_eq!(response.participants[1].participant_id, 2);

        let slot = transport_connection.assigned_participant_connection.unwrap();
        let connection = connections.get(slot).unwrap();
        assert_eq!(connection.steps.expected_write_id(), StepId(0x100));
    }

    #[test]
    fn test_second_join_is_idempotent() {
        let (mut game, mut connections, mut transport_connection) = setup();
        let request = JoinGameRequest {
            nonce: 1,
            local_indexes: vec![0],
        };
        let first =
            handle_join_game(&mut game, &mut connections, &mut transport_connection, 2, &request)
                .unwrap();
        let again = JoinGameRequest {
            nonce: 2,
            local_indexes: vec![0],
        };
        let second =
            handle_join_game(&mut game, &mut connections, &mut transport_connection, 2, &again)
                .unwrap();
        assert_eq!(first.participants, second.participants);
        assert_eq!(first.connection_secret, second.connection_secret);
        assert_eq!(second.nonce, 2);
        assert_eq!(game.participants.count(), 1);
    }

    #[test]
    fn test_full_pool_is_refused_with_empty_assignment() {
        let (mut game, mut connections, mut transport_connection) = setup();
        let request = JoinGameRequest {
            nonce: 1,
            local_indexes: vec![0, 1],
        };
        handle_join_game(&mut game, &mut connections, &mut transport_connection, 2, &request)
            .unwrap();

        let mut other = TransportConnection::new(1);
        other.connect(7);
        let refused =
            handle_join_game(&mut game, &mut connections, &mut other, 2, &request).unwrap();
        assert!(refused.participants.is_empty());
        assert_eq!(refused.connection_secret, 0);
        assert!(other.assigned_participant_connection.is_none());
        // the connection slot grabbed during the attempt was rolled back
        assert_eq!(game.participants.count(), 2);
        assert!(connections.find_by_transport_connection_id(1).is_none());
    }

    #[test]
    fn test_malformed_local_indexes_are_rejected() {
        let (mut game, mut connections, mut transport_connection) = setup();
        let empty = JoinGameRequest {
            nonce: 1,
            local_indexes: vec![],
        };
        assert!(
            handle_join_game(&mut game, &mut connections, &mut transport_connection, 2, &empty)
                .is_err()
        );
        let duplicate = JoinGameRequest {
            nonce: 1,
            local_indexes: vec![0, 0],
        };
        assert!(handle_join_game(
            &mut game,
            &mut connections,
            &mut transport_connection,
            2,
            &duplicate
        )
        .is_err());
    }
}
