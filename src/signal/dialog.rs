use std::collections::HashMap;
use std::net::SocketAddr;

use super::message::{NameAddr, Request, Response, Uri};
use super::{CallVariant, DialogId, MediaParams};

/// Who placed the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// The peer called us.
    Incoming,
    /// We called the peer.
    Outgoing,
}

/// Where the call is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Setup sent or received, no answer yet.
    Ringing,
    /// Answered.
    Connected,
}

/// Negotiation state of one call leg.
#[derive(Debug)]
pub struct Dialog {
    pub id: DialogId,
    pub party: String,
    pub direction: Direction,
    pub phase: Phase,
    /// CANCEL sent, waiting for the INVITE to end.
    pub cancelling: bool,
    /// Inbound dialog got the ACK for our 200.
    pub confirmed: bool,
    pub variant: CallVariant,
    pub video: bool,
    /// Our From (outgoing) or To (incoming) including our tag.
    pub local: NameAddr,
    /// The peer's address, with its tag once known.
    pub remote: NameAddr,
    /// Where in-dialog requests are addressed. The peer's Contact when known.
    pub target: Uri,
    /// Where messages for this dialog are sent.
    pub peer: SocketAddr,
    /// Our CSeq counter.
    pub cseq: u32,
    /// CSeq of our INVITE, for ACK and CANCEL.
    pub invite_cseq: u32,
    /// CSeq of the peer's INVITE, to spot retransmissions.
    pub remote_cseq: u32,
    pub local_media: Option<MediaParams>,
    pub remote_media: Option<MediaParams>,
    /// The peer's INVITE, kept to answer it.
    pub invite: Option<Request>,
    /// Our last response to that INVITE, resent on retransmissions.
    pub last_response: Option<Response>,
    pub payload: Option<Vec<u8>>,
}

impl Dialog {
    /// Set the media parameters of one side unless already negotiated.
    ///
    /// Keys are immutable once set, so an existing value is kept.
    pub fn set_remote_media(&mut self, media: MediaParams) {
        if self.remote_media.is_none() {
            self.remote_media = Some(media);
        }
    }

    /// Next CSeq for a new request in this dialog.
    pub fn next_cseq(&mut self) -> u32 {
        self.cseq += 1;
        self.cseq
    }
}

/// Active dialogs keyed by remote party.
#[derive(Debug, Default)]
pub struct DialogTable {
    dialogs: HashMap<String, Dialog>,
}

impl DialogTable {
    pub fn insert(&mut self, dialog: Dialog) -> Option<Dialog> {
        self.dialogs.insert(dialog.party.clone(), dialog)
    }

    pub fn get(&self, party: &str) -> Option<&Dialog> {
        self.dialogs.get(party)
    }

    pub fn remove(&mut self, party: &str) -> Option<Dialog> {
        self.dialogs.remove(party)
    }

    /// The party owning the given Call-ID.
    pub fn party_of(&self, call_id: &str) -> Option<String> {
        self.dialogs
            .values()
            .find(|d| d.id.as_str() == call_id)
            .map(|d| d.party.clone())
    }

    pub fn by_call_id(&self, call_id: &str) -> Option<&Dialog> {
        self.dialogs.values().find(|d| d.id.as_str() == call_id)
    }

    pub fn by_call_id_mut(&mut self, call_id: &str) -> Option<&mut Dialog> {
        self.dialogs.values_mut().find(|d| d.id.as_str() == call_id)
    }

    pub fn len(&self) -> usize {
        self.dialogs.len()
    }

    pub fn parties(&self) -> impl Iterator<Item = &str> {
        self.dialogs.keys().map(String::as_str)
    }
}
