//! Every datagram, both directions, is framed the same way: octet 0 carries the wrapping
//! sequence id, octet 1 is reserved, octet 2 is the command id and everything after it is the
//! command payload described by the structs in this module. Multi-octet integers are
//! big-endian.

use bytes::{Buf, BufMut};

use crate::error::SteplockError;
use crate::steps::StepId;
use crate::ParticipantId;

/// The command octet of a datagram.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// Client asks to join with one or more local players.
    JoinGameRequest = 0x01,
    /// Server's assignment of participant ids.
    JoinGameResponse = 0x02,
    /// Client submits predicted steps and acks authoritative progress.
    GameStep = 0x03,
    /// Server redistributes a range of authoritative steps.
    GameStepResponse = 0x04,
    /// Client asks for a full game state download.
    DownloadGameStateRequest = 0x05,
    /// Server's download handshake reply.
    DownloadGameStateResponse = 0x06,
    /// Client reports blob-stream progress.
    DownloadGameStateStatus = 0x07,
    /// Server ships one blob-stream chunk.
    DownloadGameStateChunk = 0x08,
}

impl Command {
    /// Parses a command octet.
    pub fn from_octet(octet: u8) -> Result<Command, SteplockError> {
        match octet {
            0x01 => Ok(Command::JoinGameRequest),
            0x02 => Ok(Command::JoinGameResponse),
            0x03 => Ok(Command::GameStep),
            0x04 => Ok(Command::GameStepResponse),
            0x05 => Ok(Command::DownloadGameStateRequest),
            0x06 => Ok(Command::DownloadGameStateResponse),
            0x07 => Ok(Command::DownloadGameStateStatus),
            0x08 => Ok(Command::DownloadGameStateChunk),
            command => Err(SteplockError::UnknownCommand { command }),
        }
    }

    /// The octet this command is written as.
    pub fn to_octet(self) -> u8 {
        self as u8
    }
}

fn ensure(buf: &impl Buf, needed: usize) -> Result<(), SteplockError> {
    if buf.remaining() < needed {
        return Err(SteplockError::TruncatedDatagram);
    }
    Ok(())
}

/// One participant's opaque input payload inside a combined step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantStep {
    /// The participant this payload belongs to.
    pub participant_id: ParticipantId,
    /// The opaque application payload. Empty for a forced step, which the application reads as
    /// "no new input".
    pub payload: Vec<u8>,
}

/// The inputs of every participant of one connection (client to server) or of the whole game
/// (server to client) for a single tick, concatenated in ascending participant-id order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CombinedStep {
    /// Per-participant payloads, ascending by participant id.
    pub participants: Vec<ParticipantStep>,
}

impl CombinedStep {
    /// Wire size of the combined payload, without the length prefix carried by step frames.
    pub fn encoded_len(&self) -> usize {
        1 + self
            .participants
            .iter()
            .map(|step| 2 + step.payload.len())
            .sum::<usize>()
    }

    /// Writes `participant_count, (participant_id, step_len, step octets)*`.
    pub fn encode(&self, out: &mut impl BufMut) {
        out.put_u8(self.participants.len() as u8);
        for step in &self.participants {
            out.put_u8(step.participant_id);
            out.put_u8(step.payload.len() as u8);
            out.put_slice(&step.payload);
        }
    }

    /// Reads a combined payload written by [`CombinedStep::encode`].
    pub fn decode(buf: &mut impl Buf) -> Result<Self, SteplockError> {
        ensure(buf, 1)?;
        let participant_count = buf.get_u8();
        let mut participants = Vec::with_capacity(participant_count as usize);
        for _ in 0..participant_count {
            ensure(buf, 2)?;
            let participant_id = buf.get_u8();
            let step_len = buf.get_u8() as usize;
            ensure(buf, step_len)?;
            let mut payload = vec![0u8; step_len];
            buf.copy_to_slice(&mut payload);
            participants.push(ParticipantStep {
                participant_id,
                payload,
            });
        }
        Ok(Self { participants })
    }
}

/// Client to server: request to join the game with the listed local players.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinGameRequest {
    /// Client-chosen value echoed back in the response so the client can match replies to
    /// requests across retries.
    pub nonce: u64,
    /// The local player indexes (0-based within the connection) that want a participant slot.
    pub local_indexes: Vec<u8>,
}

impl JoinGameRequest {
    /// Writes the request payload.
    pub fn encode(&self, out: &mut impl BufMut) {
        out.put_u64(self.nonce);
        out.put_u8(self.local_indexes.len() as u8);
        for index in &self.local_indexes {
            out.put_u8(*index);
        }
    }

    /// Reads a request payload.
    pub fn decode(buf: &mut impl Buf) -> Result<Self, SteplockError> {
        ensure(buf, 9)?;
        let nonce = buf.get_u64();
        let count = buf.get_u8() as usize;
        ensure(buf, count)?;
        let mut local_indexes = Vec::with_capacity(count);
        for _ in 0..count {
            local_indexes.push(buf.get_u8());
        }
        Ok(Self {
            nonce,
            local_indexes,
        })
    }
}

/// One assigned player slot in a join response.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct JoinedParticipant {
    /// The local player index the client asked for.
    pub local_index: u8,
    /// The participant id the server assigned to it.
    pub participant_id: ParticipantId,
}

/// Server to client: the participant assignment for a join request. An empty assignment means
/// the join was refused (participant pool exhausted).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinGameResponse {
    /// Echo of the request nonce.
    pub nonce: u64,
    /// The session secret of the connection; zero on a refused join.
    pub connection_secret: u64,
    /// Assigned slots, one per requested local player.
    pub participants: Vec<JoinedParticipant>,
}

impl JoinGameResponse {
    /// Writes the response payload.
    pub fn encode(&self, out: &mut impl BufMut) {
        out.put_u64(self.nonce);
        out.put_u64(self.connection_secret);
        out.put_u8(self.participants.len() as u8);
        for joined in &self.participants {
            out.put_u8(joined.local_index);
            out.put_u8(joined.participant_id);
        }
    }

    /// Reads a response payload.
    pub fn decode(buf: &mut impl Buf) -> Result<Self, SteplockError> {
        ensure(buf, 17)?;
        let nonce = buf.get_u64();
        let connection_secret = buf.get_u64();
        let count = buf.get_u8() as usize;
        ensure(buf, count * 2)?;
        let mut participants = Vec::with_capacity(count);
        for _ in 0..count {
            participants.push(JoinedParticipant {
                local_index: buf.get_u8(),
                participant_id: buf.get_u8(),
            });
        }
        Ok(Self {
            nonce,
            connection_secret,
            participants,
        })
    }
}

/// Client to server: a contiguous run of predicted steps plus the client's ack of
/// authoritative progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GameStepRequest {
    /// The next authoritative step the client is waiting for.
    pub waiting_for_step_id: StepId,
    /// Id of the first predicted step in this datagram.
    pub first_predicted_step_id: StepId,
    /// The predicted steps, one per tick starting at `first_predicted_step_id`.
    pub steps: Vec<CombinedStep>,
}

impl GameStepRequest {
    /// Writes the request payload.
    pub fn encode(&self, out: &mut impl BufMut) {
        out.put_u32(self.waiting_for_step_id.0);
        out.put_u32(self.first_predicted_step_id.0);
        out.put_u8(self.steps.len() as u8);
        for step in &self.steps {
            out.put_u16(step.encoded_len() as u16);
            step.encode(out);
        }
    }

    /// Reads a request payload.
    pub fn decode(buf: &mut impl Buf) -> Result<Self, SteplockError> {
        ensure(buf, 9)?;
        let waiting_for_step_id = StepId(buf.get_u32());
        let first_predicted_step_id = StepId(buf.get_u32());
        let count = buf.get_u8() as usize;
        let mut steps = Vec::with_capacity(count);
        for _ in 0..count {
            ensure(buf, 2)?;
            let combined_len = buf.get_u16() as usize;
            ensure(buf, combined_len)?;
            let mut combined = buf.copy_to_bytes(combined_len);
            let step = CombinedStep::decode(&mut combined)?;
            if combined.has_remaining() {
                return Err(SteplockError::TruncatedDatagram);
            }
            steps.push(step);
        }
        Ok(Self {
            waiting_for_step_id,
            first_predicted_step_id,
            steps,
        })
    }
}

/// Server to client: a range of authoritative steps starting at the id the client was waiting
/// for. Payloads are the combined-step encoding of [`CombinedStep`], kept as raw octets here
/// because the server serves them straight out of its ring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GameStepResponse {
    /// Id of the first step in `payloads`.
    pub start_step_id: StepId,
    /// Combined-step payloads for consecutive ticks; may be empty when the client is current.
    pub payloads: Vec<Vec<u8>>,
}

impl GameStepResponse {
    /// Writes the response payload.
    pub fn encode(&self, out: &mut impl BufMut) {
        out.put_u32(self.start_step_id.0);
        out.put_u8(self.payloads.len() as u8);
        for payload in &self.payloads {
            out.put_u16(payload.len() as u16);
            out.put_slice(payload);
        }
    }

    /// Reads a response payload.
    pub fn decode(buf: &mut impl Buf) -> Result<Self, SteplockError> {
        ensure(buf, 5)?;
        let start_step_id = StepId(buf.get_u32());
        let count = buf.get_u8() as usize;
        let mut payloads = Vec::with_capacity(count);
        for _ in 0..count {
            ensure(buf, 2)?;
            let combined_len = buf.get_u16() as usize;
            ensure(buf, combined_len)?;
            let mut payload = vec![0u8; combined_len];
            buf.copy_to_slice(&mut payload);
            payloads.push(payload);
        }
        Ok(Self {
            start_step_id,
            payloads,
        })
    }
}

/// Client to server: ask for a serialized game state download.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DownloadGameStateRequest {
    /// Client-chosen id; retries with the same id are answered idempotently.
    pub client_request_id: u8,
    /// The application version the client was built against.
    pub application_version: u32,
}

impl DownloadGameStateRequest {
    /// Writes the request payload.
    pub fn encode(&self, out: &mut impl BufMut) {
        out.put_u8(self.client_request_id);
        out.put_u32(self.application_version);
    }

    /// Reads a request payload.
    pub fn decode(buf: &mut impl Buf) -> Result<Self, SteplockError> {
        ensure(buf, 5)?;
        Ok(Self {
            client_request_id: buf.get_u8(),
            application_version: buf.get_u32(),
        })
    }
}

/// Outcome of a download handshake.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DownloadStateResult {
    /// The download was accepted and a blob stream was assigned.
    Ok {
        /// The blob-stream channel the chunks will arrive on.
        blob_channel: u8,
        /// Total size of the serialized state.
        total_octet_count: u32,
        /// The tick the snapshot was taken at; authoritative steps resume at the next id.
        step_id: StepId,
    },
    /// The client runs a different application version; no stream was opened. The client is
    /// expected to disconnect.
    WrongApplicationVersion,
}

/// Server to client: reply to a [`DownloadGameStateRequest`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DownloadGameStateResponse {
    /// Echo of the client request id.
    pub client_request_id: u8,
    /// Outcome of the handshake.
    pub result: DownloadStateResult,
}

impl DownloadGameStateResponse {
    const RESULT_OK: u8 = 0;
    const RESULT_WRONG_APPLICATION_VERSION: u8 = 1;

    /// Writes the response payload.
    pub fn encode(&self, out: &mut impl BufMut) {
        out.put_u8(self.client_request_id);
        match self.result {
            DownloadStateResult::Ok {
                blob_channel,
                total_octet_count,
                step_id,
            } => {
                out.put_u8(Self::RESULT_OK);
                out.put_u8(blob_channel);
                out.put_u32(total_octet_count);
                out.put_u32(step_id.0);
            }
            DownloadStateResult::WrongApplicationVersion => {
                out.put_u8(Self::RESULT_WRONG_APPLICATION_VERSION);
            }
        }
    }

    /// Reads a response payload.
    pub fn decode(buf: &mut impl Buf) -> Result<Self, SteplockError> {
        ensure(buf, 2)?;
        let client_request_id = buf.get_u8();
        let result = match buf.get_u8() {
            Self::RESULT_OK => {
                ensure(buf, 9)?;
                DownloadStateResult::Ok {
                    blob_channel: buf.get_u8(),
                    total_octet_count: buf.get_u32(),
                    step_id: StepId(buf.get_u32()),
                }
            }
            Self::RESULT_WRONG_APPLICATION_VERSION => DownloadStateResult::WrongApplicationVersion,
            _ => return Err(SteplockError::TruncatedDatagram),
        };
        Ok(Self {
            client_request_id,
            result,
        })
    }
}

/// Client to server: progress report for an active blob stream. The server answers with a
/// burst of chunks from `waiting_for_chunk_id` onward.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DownloadGameStateStatus {
    /// The assigned blob-stream channel.
    pub channel: u8,
    /// The lowest chunk id the client has not received yet. Equal to the chunk count once the
    /// transfer is complete.
    pub waiting_for_chunk_id: u32,
}

impl DownloadGameStateStatus {
    /// Writes the status payload.
    pub fn encode(&self, out: &mut impl BufMut) {
        out.put_u8(self.channel);
        out.put_u32(self.waiting_for_chunk_id);
    }

    /// Reads a status payload.
    pub fn decode(buf: &mut impl Buf) -> Result<Self, SteplockError> {
        ensure(buf, 5)?;
        Ok(Self {
            channel: buf.get_u8(),
            waiting_for_chunk_id: buf.get_u32(),
        })
    }
}

/// Server to client: one chunk of the serialized game state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadGameStateChunk {
    /// The assigned blob-stream channel.
    pub channel: u8,
    /// Position of this chunk in the blob.
    pub chunk_id: u32,
    /// The chunk octets; every chunk except the last carries the full chunk size.
    pub payload: Vec<u8>,
}

impl DownloadGameStateChunk {
    /// Writes the chunk payload.
    pub fn encode(&self, out: &mut impl BufMut) {
        out.put_u8(self.channel);
        out.put_u32(self.chunk_id);
        out.put_u16(self.payload.len() as u16);
        out.put_slice(&self.payload);
    }

    /// Reads a chunk payload.
    pub fn decode(buf: &mut impl Buf) -> Result<Self, SteplockError> {
        ensure(buf, 7)?;
        let channel = buf.get_u8();
        let chunk_id = buf.get_u32();
        let octet_count = buf.get_u16() as usize;
        ensure(buf, octet_count)?;
        let mut payload = vec![0u8; octet_count];
        buf.copy_to_slice(&mut payload);
        Ok(Self {
            channel,
            chunk_id,
            payload,
        })
    }
}

// #########
// # TESTS #
// #########

#[cfg(test)]
mod messages_tests {
    use super::*;

    #[test]
    fn test_game_step_request_roundtrip() {
        let request = GameStepRequest {
            waiting_for_step_id: StepId(0x100),
            first_predicted_step_id: StepId(0x102),
            steps: vec![
                CombinedStep {
                    participants: vec![
                        ParticipantStep {
                            participant_id: 1,
                            payload: vec![0xAA, 0xBB],
                        },
                        ParticipantStep {
                            participant_id: 2,
                            payload: vec![],
                        },
                    ],
                },
                CombinedStep {
                    participants: vec![ParticipantStep {
                        participant_id: 1,
                        payload: vec![0xCC],
                    }],
                },
            ],
        };
        let mut out = Vec::new();
        request.encode(&mut out);
        let decoded = GameStepRequest::decode(&mut &out[..]).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn test_join_roundtrip() {
        let request = JoinGameRequest {
            nonce: 0xDEAD_BEEF_0042,
            local_indexes: vec![0, 1],
        };
        let mut out = Vec::new();
        request.encode(&mut out);
        assert_eq!(JoinGameRequest::decode(&mut &out[..]).unwrap(), request);

        let response = JoinGameResponse {
            nonce: 0xDEAD_BEEF_0042,
            connection_secret: 7,
            participants: vec![
                JoinedParticipant {
                    local_index: 0,
                    participant_id: 1,
                },
                JoinedParticipant {
                    local_index: 1,
                    participant_id: 2,
                },
            ],
        };
        let mut out = Vec::new();
        response.encode(&mut out);
        assert_eq!(JoinGameResponse::decode(&mut &out[..]).unwrap(), response);
    }

    #[test]
    fn test_download_response_roundtrip() {
        let ok = DownloadGameStateResponse {
            client_request_id: 3,
            result: DownloadStateResult::Ok {
                blob_channel: 127,
                total_octet_count: 2,
                step_id: StepId(0x151),
            },
        };
        let mut out = Vec::new();
        ok.encode(&mut out);
        assert_eq!(DownloadGameStateResponse::decode(&mut &out[..]).unwrap(), ok);

        let mismatch = DownloadGameStateResponse {
            client_request_id: 3,
            result: DownloadStateResult::WrongApplicationVersion,
        };
        let mut out = Vec::new();
        mismatch.encode(&mut out);
        assert_eq!(
            DownloadGameStateResponse::decode(&mut &out[..]).unwrap(),
            mismatch
        );
    }

    #[test]
    fn test_truncated_decode_fails() {
        let request = GameStepRequest {
            waiting_for_step_id: StepId(1),
            first_predicted_step_id: StepId(1),
            steps: vec![CombinedStep {
                participants: vec![ParticipantStep {
                    participant_id: 1,
                    payload: vec![0xAA],
                }],
            }],
        };
        let mut out = Vec::new();
        request.encode(&mut out);
        for len in 0..out.len() {
            let result = GameStepRequest::decode(&mut &out[..len]);
            assert_eq!(result, Err(SteplockError::TruncatedDatagram));
        }
    }

    #[test]
    fn test_unknown_command_octet() {
        assert_eq!(
            Command::from_octet(0x77),
            Err(SteplockError::UnknownCommand { command: 0x77 })
        );
        assert_eq!(
            Command::from_octet(Command::GameStep.to_octet()),
            Ok(Command::GameStep)
        );
    }

    #[test]
    fn test_chunk_roundtrip() {
        let chunk = DownloadGameStateChunk {
            channel: 126,
            chunk_id: 4,
            payload: vec![9; 1024],
        };
        let mut out = Vec::new();
        chunk.encode(&mut out);
        assert_eq!(
            DownloadGameStateChunk::decode(&mut &out[..]).unwrap(),
            chunk
        );
    }
}
