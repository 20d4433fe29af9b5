use crate::network::blob_stream::BlobStreamOut;
use crate::network::ordered_datagram::{OrderedDatagramIn, OrderedDatagramOut};
use crate::stats::RollingAverage;
use crate::steps::StepId;

const STEPS_BEHIND_STAT_PERIOD: usize = 60;
const FIRST_BLOB_STREAM_CHANNEL: u8 = 127;

/// Where a transport connection stands in the state-bootstrap handshake.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ConnectionPhase {
    /// Connected, no snapshot negotiated yet.
    Idle,
    /// A snapshot was assigned; authoritative steps resume after its tick.
    InitialStateDetermined,
    /// The transport session dropped and the client may come back under the same connection.
    PendingReconnect,
}

/// Per-datagram-session state of one client: ordered-datagram framing, handshake phase and
/// the outbound snapshot transfer, if one is running. Created when the transport reports an
/// unseen connection index, destroyed on disconnect.
#[derive(Debug)]
pub(crate) struct TransportConnection {
    pub is_used: bool,
    pub transport_connection_id: u8,
    /// Slot of the participant connection a successful join assigned, stale after a release.
    pub assigned_participant_connection: Option<usize>,
    pub ordered_in: OrderedDatagramIn,
    pub ordered_out: OrderedDatagramOut,
    pub phase: ConnectionPhase,
    /// Frontier of authoritative steps this client has been brought up to.
    pub next_authoritative_step_id_to_send: StepId,
    pub blob_stream_out: Option<BlobStreamOut>,
    pub blob_stream_out_channel: u8,
    pub blob_stream_out_client_request_id: u8,
    next_blob_stream_channel: u8,
    /// Ticks a step reply went out without any range in it. Diagnostic only.
    pub no_ranges_to_send_counter: usize,
    pub steps_behind_stats: RollingAverage,
    /// Random secret handed out in the join response.
    pub connection_secret: u64,
}

impl TransportConnection {
    pub(crate) fn new(transport_connection_id: u8) -> Self {
        Self {
            is_used: false,
            transport_connection_id,
            assigned_participant_connection: None,
            ordered_in: OrderedDatagramIn::new(),
            ordered_out: OrderedDatagramOut::new(),
            phase: ConnectionPhase::Idle,
            next_authoritative_step_id_to_send: StepId(0),
            blob_stream_out: None,
            blob_stream_out_channel: 0,
            blob_stream_out_client_request_id: 0,
            next_blob_stream_channel: FIRST_BLOB_STREAM_CHANNEL,
            no_ranges_to_send_counter: 0,
            steps_behind_stats: RollingAverage::new(STEPS_BEHIND_STAT_PERIOD),
            connection_secret: 0,
        }
    }

    /// Arms the slot when the transport-level session comes up.
    pub(crate) fn connect(&mut self, connection_secret: u64) {
        self.is_used = true;
        self.assigned_participant_connection = None;
        self.ordered_in = OrderedDatagramIn::new();
        self.ordered_out = OrderedDatagramOut::new();
        self.phase = ConnectionPhase::Idle;
        self.next_authoritative_step_id_to_send = StepId(0);
        self.blob_stream_out = None;
        self.blob_stream_out_channel = 0;
        self.blob_stream_out_client_request_id = 0;
        self.next_blob_stream_channel = FIRST_BLOB_STREAM_CHANNEL;
        self.no_ranges_to_send_counter = 0;
        self.steps_behind_stats = RollingAverage::new(STEPS_BEHIND_STAT_PERIOD);
        self.connection_secret = connection_secret;
    }

    pub(crate) fn disconnect(&mut self) {
        self.is_used = false;
        self.assigned_participant_connection = None;
        self.ordered_in.reset();
        self.blob_stream_out = None;
        self.phase = ConnectionPhase::Idle;
    }

    /// Records which snapshot tick this client downloads; authoritative steps for it resume
    /// right after that tick.
    pub(crate) fn set_game_state_tick_id(&mut self, step_id: StepId) {
        self.phase = ConnectionPhase::InitialStateDetermined;
        self.next_authoritative_step_id_to_send = step_id.next();
    }

    /// Hands out the next blob-stream channel, decrementing from 127 and wrapping back to it
    /// past 0. One stream per connection, so the previous stream is always gone by the time a
    /// channel could repeat.
    pub(crate) fn allocate_blob_stream_channel(&mut self) -> u8 {
        let channel = self.next_blob_stream_channel;
        self.next_blob_stream_channel = match self.next_blob_stream_channel {
            0 => FIRST_BLOB_STREAM_CHANNEL,
            value => value - 1,
        };
        channel
    }
}

// #########
// # TESTS #
// #########

#[cfg(test)]
mod transport_connection_tests {
    use super::*;

    #[test]
    fn test_channel_allocation_decrements_and_wraps() {
        let mut connection = TransportConnection::new(0);
        connection.connect(1);
        assert_eq!(connection.allocate_blob_stream_channel(), 127);
        assert_eq!(connection.allocate_blob_stream_channel(), 126);
        for _ in 0..126 {
            connection.allocate_blob_stream_channel();
        }
        // 0 was just handed out, the allocator wraps
        assert_eq!(connection.allocate_blob_stream_channel(), 127);
    }

    #[test]
    fn test_state_tick_id_advances_send_frontier() {
        let mut connection = TransportConnection::new(3);
        connection.connect(1);
        connection.set_game_state_tick_id(StepId(0x151));
        assert_eq!(connection.phase, ConnectionPhase::InitialStateDetermined);
        assert_eq!(
            connection.next_authoritative_step_id_to_send,
            StepId(0x152)
        );
    }

    #[test]
    fn test_disconnect_clears_session_state() {
        let mut connection = TransportConnection::new(0);
        connection.connect(42);
        connection.phase = ConnectionPhase::InitialStateDetermined;
        connection.assigned_participant_connection = Some(2);
        connection.disconnect();
        assert!(!connection.is_used);
        assert_eq!(connection.phase, ConnectionPhase::Idle);
        assert!(connection.assigned_participant_connection.is_none());
        assert!(connection.blob_stream_out.is_none());
    }
}
