//! RTP and RTCP wire handling and receive side sequencing.

mod id;
pub use id::{seq_distance, Pt, SessionId, Ssrc};

mod header;
pub use header::{RtpHeader, RTP_HEADER_LEN};

mod control;
pub use control::{extend_u16, ntp_now, ReportSchedule, REPORT_INTERVAL};
pub use control::{ControlPacket, ReceptionReport, ReceptionStats, SenderInfo};

mod reorder;
pub use reorder::{ReorderBuffer, Sequencer};

/// Largest datagram read from a media socket.
pub const DATAGRAM_MAX_PACKET_SIZE: usize = 2000;
