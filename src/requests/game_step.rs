use log::{debug, trace, warn};

use crate::composer::compose_authoritative_steps;
use crate::connection::ParticipantConnections;
use crate::error::SteplockError;
use crate::game::Game;
use crate::network::messages::{GameStepRequest, GameStepResponse};
use crate::stats::RatePerSecond;
use crate::steps::StepId;
use crate::transport_connection::TransportConnection;
use crate::{DATAGRAM_MAX_SIZE, WINDOW_SIZE};

/// Octets of a step response datagram that are not step payload: the two framing octets, the
/// command octet, the start id and the count.
const RESPONSE_OVERHEAD: usize = 3 + 5;

const NO_RANGES_LOG_INTERVAL: usize = 60;

/// Handles a step request: drains authoritative back-pressure, buffers the client's new
/// predicted steps, runs the composer and answers with the authoritative range the client is
/// waiting for.
pub(crate) fn handle_game_step(
    game: &mut Game,
    connections: &mut ParticipantConnections,
    transport_connection: &mut TransportConnection,
    authoritative_steps_per_second: &mut RatePerSecond,
    max_single_participant_step_octet_count: usize,
    request: &GameStepRequest,
) -> Result<GameStepResponse, SteplockError> {
    discard_authoritative_steps_if_buffer_getting_full(game)?;

    let slot = transport_connection
        .assigned_participant_connection
        .filter(|&slot| {
            connections
                .get(slot)
                .map(|connection| connection.is_used)
                .unwrap_or(false)
        })
        .ok_or(SteplockError::UnknownConnection {
            connection_index: transport_connection.transport_connection_id,
        })?;

    receive_incoming_steps(
        connections,
        slot,
        max_single_participant_step_octet_count,
        request,
    )?;

    if !game.debug_is_frozen {
        let advanced = compose_authoritative_steps(game, connections)?;
        authoritative_steps_per_second.add(advanced as u32);
    }

    let steps_behind = game
        .authoritative_steps
        .expected_write_id()
        .delta(request.waiting_for_step_id);
    transport_connection.steps_behind_stats.add(steps_behind);

    Ok(build_step_ranges(
        game,
        transport_connection,
        request.waiting_for_step_id,
    ))
}

/// Keeps the authoritative ring from eating the whole window: everything past a third of it
/// is dropped from the oldest end. Joiners that fall further behind than the ring reaches
/// must re-download the state snapshot anyway.
fn discard_authoritative_steps_if_buffer_getting_full(
    game: &mut Game,
) -> Result<(), SteplockError> {
    let max_capacity = WINDOW_SIZE / 3;
    let step_count = game.authoritative_steps.len();
    if step_count > max_capacity {
        let steps_to_drop = step_count - max_capacity;
        debug!(
            "discarding {} old authoritative steps, buffer getting full",
            steps_to_drop
        );
        game.authoritative_steps.discard_count(steps_to_drop)?;
        trace!(
            "oldest step after discard is {} with count {}",
            game.authoritative_steps.expected_read_id(),
            game.authoritative_steps.len()
        );
    }
    Ok(())
}

fn receive_incoming_steps(
    connections: &mut ParticipantConnections,
    slot: usize,
    max_single_participant_step_octet_count: usize,
    request: &GameStepRequest,
) -> Result<(), SteplockError> {
    let connection = connections
        .get_mut(slot)
        .expect("slot checked by the caller");

    let expected = connection.steps.expected_write_id();
    if request.first_predicted_step_id.delta(expected) > 0 {
        return Err(SteplockError::StepIdGap {
            expected,
            encountered: request.first_predicted_step_id,
        });
    }

    let mut dropped_count = 0;
    for (offset, combined) in request.steps.iter().enumerate() {
        let step_id = request.first_predicted_step_id.add(offset as u32);
        if step_id.is_before(connection.steps.expected_write_id()) {
            // stale retransmit of a tick that is already composed or buffered
            dropped_count += 1;
            continue;
        }
        if combined.participants.len() != connection.participants.len() {
            return Err(SteplockError::InvalidRequest {
                info: format!(
                    "combined step carries {} participants, the connection has {}",
                    combined.participants.len(),
                    connection.participants.len()
                ),
            });
        }
        for (position, participant_step) in combined.participants.iter().enumerate() {
            if !connection.has_participant(participant_step.participant_id) {
                return Err(SteplockError::ForeignParticipant {
                    participant_id: participant_step.participant_id,
                });
            }
            if combined.participants[..position]
                .iter()
                .any(|earlier| earlier.participant_id == participant_step.participant_id)
            {
                return Err(SteplockError::InvalidRequest {
                    info: format!(
                        "participant {} appears twice in one combined step",
                        participant_step.participant_id
                    ),
                });
            }
            if participant_step.payload.len() > max_single_participant_step_octet_count {
                return Err(SteplockError::StepPayloadTooLarge {
                    octet_count: participant_step.payload.len(),
                    max_octet_count: max_single_participant_step_octet_count,
                });
            }
        }
        if connection.steps.len() == WINDOW_SIZE {
            // the client is further ahead than the window; it will resend
            warn!(
                "incoming step ring full for connection {}, dropping the rest of the batch",
                slot
            );
            break;
        }
        let mut raw = Vec::with_capacity(combined.encoded_len());
        combined.encode(&mut raw);
        connection.steps.write(step_id, &raw)?;
    }
    if dropped_count > 0 {
        trace!("skipped {} stale predicted steps", dropped_count);
    }

    let buffer_depth = connection.steps.len() as i32;
    connection.incoming_step_count_in_buffer_stats.add(buffer_depth);
    Ok(())
}

/// Collects the reply range: every authoritative step from the client's waiting-for id that
/// still fits the datagram. Oversized ranges truncate at step boundaries.
fn build_step_ranges(
    game: &Game,
    transport_connection: &mut TransportConnection,
    waiting_for_step_id: StepId,
) -> GameStepResponse {
    let mut remaining = DATAGRAM_MAX_SIZE - RESPONSE_OVERHEAD;
    let mut payloads = Vec::new();
    for (_, raw) in game
        .authoritative_steps
        .read_range(waiting_for_step_id, u8::MAX as usize)
    {
        let cost = 2 + raw.len();
        if cost > remaining {
            break;
        }
        remaining -= cost;
        payloads.push(raw.to_vec());
    }

    if payloads.is_empty() {
        transport_connection.no_ranges_to_send_counter += 1;
        if transport_connection.no_ranges_to_send_counter % NO_RANGES_LOG_INTERVAL == 0 {
            debug!(
                "no authoritative ranges to send to connection {} ({} times)",
                transport_connection.transport_connection_id,
                transport_connection.no_ranges_to_send_counter
            );
        }
    } else {
        transport_connection.next_authoritative_step_id_to_send =
            waiting_for_step_id.add(payloads.len() as u32);
    }

    GameStepResponse {
        start_step_id: waiting_for_step_id,
        payloads,
    }
}

// #########
// # TESTS #
// #########
