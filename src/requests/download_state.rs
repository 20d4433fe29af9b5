use log::{debug, warn};

use crate::error::SteplockError;
use crate::game::Game;
use crate::network::blob_stream::BlobStreamOut;
use crate::network::messages::{
    DownloadGameStateChunk, DownloadGameStateRequest, DownloadGameStateResponse,
    DownloadGameStateStatus, DownloadStateResult,
};
use crate::transport_connection::TransportConnection;

/// Handles a download request: checks the application version, assigns a blob-stream channel
/// for the latest snapshot and answers with the handshake plus the first chunk burst. A retry
/// with the same client request id is answered idempotently; a new request id restarts the
/// download on a fresh channel.
pub(crate) fn handle_download_game_state(
    game: &Game,
    transport_connection: &mut TransportConnection,
    application_version: u32,
    request: &DownloadGameStateRequest,
) -> Result<(DownloadGameStateResponse, Vec<DownloadGameStateChunk>), SteplockError> {
    if request.application_version != application_version {
        warn!(
            "refusing state download: client runs application version {}, server runs {}",
            request.application_version, application_version
        );
        return Ok((
            DownloadGameStateResponse {
                client_request_id: request.client_request_id,
                result: DownloadStateResult::WrongApplicationVersion,
            },
            Vec::new(),
        ));
    }

    let is_retry = transport_connection.blob_stream_out.is_some()
        && transport_connection.blob_stream_out_client_request_id == request.client_request_id;
    if !is_retry {
        let channel = transport_connection.allocate_blob_stream_channel();
        transport_connection.blob_stream_out =
            Some(BlobStreamOut::new(game.latest_state.blob.clone()));
        transport_connection.blob_stream_out_channel = channel;
        transport_connection.blob_stream_out_client_request_id = request.client_request_id;
        transport_connection.set_game_state_tick_id(game.latest_state.step_id);
        debug!(
            "state download for connection {}: {} octets at {} on channel {}",
            transport_connection.transport_connection_id,
            game.latest_state.blob.len(),
            game.latest_state.step_id,
            channel
        );
    }

    let channel = transport_connection.blob_stream_out_channel;
    let stream = transport_connection
        .blob_stream_out
        .as_ref()
        .expect("stream was just ensured above");
    let response = DownloadGameStateResponse {
        client_request_id: request.client_request_id,
        result: DownloadStateResult::Ok {
            blob_channel: channel,
            total_octet_count: stream.total_octet_count(),
            step_id: game.latest_state.step_id,
        },
    };
    Ok((response, stream.burst(channel)))
}

/// Handles a blob-stream progress report: advances the transfer and emits the next burst.
/// Once the client's progress covers the whole blob the stream is released and the channel
/// becomes reusable.
pub(crate) fn handle_download_game_state_status(
    transport_connection: &mut TransportConnection,
    status: &DownloadGameStateStatus,
) -> Result<Vec<DownloadGameStateChunk>, SteplockError> {
    let channel = transport_connection.blob_stream_out_channel;
    let stream = transport_connection
        .blob_stream_out
        .as_mut()
        .filter(|_| channel == status.channel)
        .ok_or(SteplockError::UnknownBlobChannel {
            channel: status.channel,
        })?;

    stream.receive_status(status.waiting_for_chunk_id);
    if stream.is_complete() {
        debug!(
            "state download on channel {} complete after {} chunks",
            channel,
            stream.chunk_count()
        );
        transport_connection.blob_stream_out = None;
        return Ok(Vec::new());
    }
    Ok(stream.burst(channel))
}

// #########
// # TESTS #
// #########

#[cfg(test)]
mod download_state_tests {
    use super::*;
    use crate::steps::StepId;
    use crate::transport_connection::ConnectionPhase;

    const APPLICATION_VERSION: u32 = 7;

    fn fixture() -> (Game, TransportConnection) {
        let mut game = Game::new(128, 4);
        game.reinit(StepId(0x151), &[0xFE, 0xFE]);
        let mut transport_connection = TransportConnection::new(1);
        transport_connection.connect(1);
        (game, transport_connection)
    }

    fn request(client_request_id: u8, application_version: u32) -> DownloadGameStateRequest {
        DownloadGameStateRequest {
            client_request_id,
            application_version,
        }
    }

    #[test]
    fn test_download_assigns_channel_and_phase() {
        let (game, mut transport_connection) = fixture();
        let (response, chunks) = handle_download_game_state(
            &game,
            &mut transport_connection,
            APPLICATION_VERSION,
            &request(1, APPLICATION_VERSION),
        )
        .unwrap();

        assert_eq!(
            response.result,
            DownloadStateResult::Ok {
                blob_channel: 127,
                total_octet_count: 2,
                step_id: StepId(0x151),
            }
        );
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].payload, vec![0xFE, 0xFE]);
        assert_eq!(
            transport_connection.phase,
            ConnectionPhase::InitialStateDetermined
        );
        assert_eq!(
            transport_connection.next_authoritative_step_id_to_send,
            StepId(0x152)
        );
    }

    #[test]
    fn test_version_mismatch_opens_nothing() {
        let (game, mut transport_connection) = fixture();
        let (response, chunks) = handle_download_game_state(
            &game,
            &mut transport_connection,
            APPLICATION_VERSION,
            &request(1, APPLICATION_VERSION - 1),
        )
        .unwrap();

        assert_eq!(
            response.result,
            DownloadStateResult::WrongApplicationVersion
        );
        assert!(chunks.is_empty());
        assert!(transport_connection.blob_stream_out.is_none());
        assert_eq!(transport_connection.phase, ConnectionPhase::Idle);
    }

    #[test]
    fn test_same_request_id_is_idempotent() {
        let (game, mut transport_connection) = fixture();
        let (first, _) = handle_download_game_state(
            &game,
            &mut transport_connection,
            APPLICATION_VERSION,
            &request(9, APPLICATION_VERSION),
        )
        .unwrap();
        let (second, _) = handle_download_game_state(
            &game,
            &mut transport_connection,
            APPLICATION_VERSION,
            &request(9, APPLICATION_VERSION),
        )
        .unwrap();
        assert_eq!(first, second);

        // a fresh request id restarts on the next channel down
        let (third, _) = handle_download_game_state(
            &game,
            &mut transport_connection,
            APPLICATION_VERSION,
            &request(10, APPLICATION_VERSION),
        )
        .unwrap();
        assert_eq!(
            third.result,
            DownloadStateResult::Ok {
                blob_channel: 126,
                total_octet_count: 2,
                step_id: StepId(0x151),
            }
        );
    }

    #[test]
    fn test_status_completes_and_releases_stream() {
        let (game, mut transport_connection) = fixture();
        handle_download_game_state(
            &game,
            &mut transport_connection,
            APPLICATION_VERSION,
            &request(1, APPLICATION_VERSION),
        )
        .unwrap();

        let chunks = handle_download_game_state_status(
            &mut transport_connection,
            &DownloadGameStateStatus {
                channel: 127,
                waiting_for_chunk_id: 0,
            },
        )
        .unwrap();
        assert_eq!(chunks.len(), 1);

        let done = handle_download_game_state_status(
            &mut transport_connection,
            &DownloadGameStateStatus {
                channel: 127,
                waiting_for_chunk_id: 1,
            },
        )
        .unwrap();
        assert!(done.is_empty());
        assert!(transport_connection.blob_stream_out.is_none());

        // the channel is gone now
        let result = handle_download_game_state_status(
            &mut transport_connection,
            &DownloadGameStateStatus {
                channel: 127,
                waiting_for_chunk_id: 1,
            },
        );
        assert_eq!(
            result,
            Err(SteplockError::UnknownBlobChannel { channel: 127 })
        );
    }

    #[test]
    fn test_status_on_wrong_channel_is_rejected() {
        let (game, mut transport_connection) = fixture();
        handle_download_game_state(
            &game,
            &mut transport_connection,
            APPLICATION_VERSION,
            &request(1, APPLICATION_VERSION),
        )
        .unwrap();
        let result = handle_download_game_state_status(
            &mut transport_connection,
            &DownloadGameStateStatus {
                channel: 5,
                waiting_for_chunk_id: 0,
            },
        );
        assert_eq!(result, Err(SteplockError::UnknownBlobChannel { channel: 5 }));
    }
}
