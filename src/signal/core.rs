use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::config::EngineConfig;
use crate::crypto::KeyGen;
use crate::event::{CallEvent, CallEventKind, DisconnectCause};
use crate::sdp::{MediaLine, SessionBody};
use crate::util::{b64, Pii};

use super::auth::{Credentials, DigestChallenge};
use super::cause::CauseTable;
use super::dialog::{Dialog, DialogTable, Direction, Phase};
use super::ids::IdGen;
use super::message::{Message, Method, NameAddr, Request, Response, Uri};
use super::ports::PortAllocator;
use super::register::Registration;
use super::{DialogId, Effects, Incoming, MediaParams, Negotiated, SetupRequest, SignalError};

const MAX_FORWARDS: u32 = 70;

/// Base64 of the higher-level payload embedded in a setup.
const PAYLOAD_HEADER: &str = "X-Payload";

const ALLOW: &str = "INVITE, ACK, BYE, CANCEL, OPTIONS";

/// A request we sent and haven't seen a final response to.
#[derive(Debug)]
struct Outstanding {
    request: Request,
    dest: SocketAddr,
    cseq: u32,
    auth_retried: bool,
}

/// What we need from a valid inbound INVITE.
struct Offer {
    call_id: String,
    cseq: u32,
    from: NameAddr,
    to: NameAddr,
    media: MediaParams,
    payload: Option<Vec<u8>>,
}

/// The signaling state machine.
///
/// Holds registration, the dialog table and every request awaiting a final
/// response. Operations return [`Effects`]: the messages to send and the events to
/// surface. Nothing here blocks or touches the network.
///
/// ```
/// # use callcore::{EngineConfig, SetupRequest};
/// # use callcore::crypto::KeyGen;
/// # use callcore::signal::Signaling;
/// let config = EngineConfig::new().set_user("1001");
/// let mut sig = Signaling::new(config, "10.0.0.2:5060".parse().unwrap(), KeyGen::default());
///
/// let (id, effects) = sig.setup_call(SetupRequest::new("2001")).unwrap();
/// assert_eq!(effects.transmit.len(), 1);
/// assert!(sig.has_dialog("2001"));
/// # let _ = id;
/// ```
#[derive(Debug)]
pub struct Signaling {
    config: EngineConfig,
    local_addr: SocketAddr,
    ids: IdGen,
    ports: PortAllocator,
    keys: KeyGen,
    causes: CauseTable,
    dialogs: DialogTable,
    outstanding: HashMap<(String, Method), Outstanding>,
    registration: Registration,
}

impl Signaling {
    /// A state machine advertising `local_addr` in Via, Contact and session bodies.
    pub fn new(config: EngineConfig, local_addr: SocketAddr, keys: KeyGen) -> Self {
        let mut ids = IdGen::new(local_addr.ip().to_string());
        let (min, max) = config.rtp_port_range();
        let registration = Registration::new(ids.call_id(), ids.tag());

        Signaling {
            causes: CauseTable::new(config.cause_overrides()),
            ports: PortAllocator::new(min, max),
            config,
            local_addr,
            ids,
            keys,
            dialogs: DialogTable::default(),
            outstanding: HashMap::new(),
            registration,
        }
    }

    /// The configuration in use.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The address advertised in Via and Contact.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Whether the server accepted our binding and it hasn't lapsed.
    pub fn is_registered(&self) -> bool {
        self.registration.is_registered()
    }

    /// Whether a dialog exists for the party.
    pub fn has_dialog(&self, party: &str) -> bool {
        self.dialogs.get(party).is_some()
    }

    /// The dialog id for the party.
    pub fn dialog_id(&self, party: &str) -> Option<DialogId> {
        self.dialogs.get(party).map(|d| d.id.clone())
    }

    /// Number of active dialogs.
    pub fn dialog_count(&self) -> usize {
        self.dialogs.len()
    }

    /// Parties with an active dialog.
    pub fn parties(&self) -> Vec<String> {
        self.dialogs.parties().map(String::from).collect()
    }

    /// The higher-level payload embedded in the party's setup, if any.
    pub fn payload(&self, party: &str) -> Option<&[u8]> {
        self.dialogs.get(party)?.payload.as_deref()
    }

    /// Whether the party's inbound call was answered and the answer acknowledged.
    pub fn is_confirmed(&self, party: &str) -> bool {
        self.dialogs.get(party).map(|d| d.confirmed).unwrap_or(false)
    }

    /// Send REGISTER with the configured expiry.
    pub fn register(&mut self) -> Effects {
        let expires = self.config.register_expiry().as_secs() as u32;
        self.send_register(expires)
    }

    /// Remove our binding with `Expires: 0`.
    pub fn unregister(&mut self) -> Effects {
        self.send_register(0)
    }

    fn send_register(&mut self, expires: u32) -> Effects {
        let mut effects = Effects::default();

        let user = self.config.user().to_string();
        let call_id = self.registration.call_id.clone();
        let tag = self.registration.from_tag.clone();
        let cseq = self.registration.next_cseq();

        let req = self.register_request(&user, expires, &call_id, &tag, cseq, false);

        self.registration.sent(expires == 0);

        debug!("REGISTER {} expires {}", Pii(&user), expires);
        self.track(&req, self.config.server_addr());
        effects.send(self.config.server_addr(), req);
        effects
    }

    fn register_request(
        &mut self,
        user: &str,
        expires: u32,
        call_id: &str,
        tag: &str,
        cseq: u32,
        wildcard: bool,
    ) -> Request {
        let domain = self.domain();
        let aor = NameAddr::new(Uri::new(user, domain.clone(), None));
        let from = aor.clone().with_tag(tag);
        let uri = Uri {
            user: None,
            host: domain,
            port: None,
        };

        let mut req = self.new_request(Method::Register, uri, &from, &aor, call_id, cseq);
        if wildcard {
            req.headers.set("Contact", "*");
        }
        req.headers.push("Expires", expires);
        req
    }

    /// Time driven work: the registration refresh.
    pub fn poll(&mut self, now: Instant) -> Effects {
        if self.registration.refresh_due(now) {
            debug!("Registration refresh due");
            return self.register();
        }
        Effects::default()
    }

    /// Update addressing for future messages.
    ///
    /// A new local address only changes what future messages advertise. A new
    /// server address starts a fresh registration towards it.
    pub fn reregister(
        &mut self,
        new_local: Option<SocketAddr>,
        new_server: Option<SocketAddr>,
    ) -> Effects {
        if let Some(local) = new_local {
            if local != self.local_addr {
                info!("Local address {} -> {}", Pii(self.local_addr), Pii(local));
                self.local_addr = local;
                self.ids.set_host(local.ip().to_string());
            }
        }

        if let Some(server) = new_server {
            if server != self.config.server_addr() {
                info!("Server {} -> {}", Pii(self.config.server_addr()), Pii(server));
                let config = std::mem::take(&mut self.config);
                self.config = config.set_server_addr(server);

                let old = std::mem::replace(
                    &mut self.registration,
                    Registration::new(self.ids.call_id(), self.ids.tag()),
                );
                self.forget(&old.call_id);

                return self.register();
            }
        }

        Effects::default()
    }

    /// Place a call.
    ///
    /// A dialog already existing for the called party is torn down first.
    pub fn setup_call(&mut self, req: SetupRequest) -> Result<(DialogId, Effects), SignalError> {
        let called = req.called.trim().to_string();
        if called.is_empty() {
            return Err(SignalError::InvalidParty);
        }

        let mut effects = Effects::default();

        if let Some(mut old) = self.dialogs.remove(&called) {
            info!("Replacing dialog {} for {}", old.id, Pii(&called));
            self.send_teardown(&mut old, &mut effects);
            self.forget_unless_cancelling(&old);
            effects
                .events
                .push(release(&old, DisconnectCause::NormalClearing, None));
        }

        let call_id = self.ids.call_id();
        let domain = req.domain.clone().unwrap_or_else(|| self.domain());
        let target = Uri::new(
            format!("{}{}", req.variant.prefix(), called),
            domain.clone(),
            None,
        );

        let calling = req
            .calling
            .clone()
            .unwrap_or_else(|| self.config.user().to_string());
        let mut local = NameAddr::new(Uri::new(calling, domain, None)).with_tag(self.ids.tag());
        local.display = self.config.display_name().map(String::from);
        let remote = NameAddr::new(target.clone());

        let encrypt = self.config.encryption();
        let media = self.local_media(req.video, encrypt, encrypt);

        let cseq = 1;
        let mut invite = self.new_request(
            Method::Invite,
            target.clone(),
            &local,
            &remote,
            &call_id,
            cseq,
        );
        invite.headers.push("Content-Type", "application/sdp");
        if let Some(payload) = &req.payload {
            invite.headers.push(PAYLOAD_HEADER, b64::encode(payload));
        }
        invite.body = self.body_for(&media);

        let dest = self.config.server_addr();
        self.track(&invite, dest);
        effects.send(dest, invite);

        let id = DialogId::from(call_id);
        info!("Setup {} to {}", id, Pii(target.to_string()));

        self.dialogs.insert(Dialog {
            id: id.clone(),
            party: called,
            direction: Direction::Outgoing,
            phase: Phase::Ringing,
            cancelling: false,
            confirmed: false,
            variant: req.variant,
            video: req.video,
            local,
            remote,
            target,
            peer: dest,
            cseq,
            invite_cseq: cseq,
            remote_cseq: 0,
            local_media: Some(media),
            remote_media: None,
            invite: None,
            last_response: None,
            payload: req.payload,
        });

        Ok((id, effects))
    }

    /// Undo a setup whose INVITE could not be sent.
    ///
    /// Erases the dialog and surfaces RELEASE with [`DisconnectCause::NetworkFailure`].
    pub fn abort_setup(&mut self, id: &DialogId) -> Effects {
        let mut effects = Effects::default();

        let Some(party) = self.dialogs.party_of(id.as_str()) else {
            return effects;
        };
        if let Some(d) = self.dialogs.remove(&party) {
            warn!("Setup {} failed to send", d.id);
            self.forget(d.id.as_str());
            effects
                .events
                .push(release(&d, DisconnectCause::NetworkFailure, None));
        }

        effects
    }

    /// Answer a ringing inbound call.
    pub fn connect_call(&mut self, party: &str) -> Result<(Negotiated, Effects), SignalError> {
        let Some(mut d) = self.dialogs.remove(party) else {
            return Err(SignalError::NoDialog(party.to_string()));
        };

        let result = self.answer(&mut d);
        self.dialogs.insert(d);
        result
    }

    fn answer(&mut self, d: &mut Dialog) -> Result<(Negotiated, Effects), SignalError> {
        if d.direction != Direction::Incoming || d.phase != Phase::Ringing {
            return Err(SignalError::InvalidState(format!(
                "{:?} {:?}",
                d.direction, d.phase
            )));
        }

        let (Some(remote), Some(invite)) = (d.remote_media.clone(), d.invite.as_ref()) else {
            return Err(SignalError::InvalidState("no offer".into()));
        };

        // Only encrypt what the caller offered to encrypt.
        let encrypt = self.config.encryption();
        let media = self.local_media(
            d.video,
            encrypt && remote.audio_key.is_some(),
            encrypt && remote.video_key.is_some(),
        );

        let mut ok = Response::for_request(invite, 200, d.local.tag.as_deref());
        ok.headers.push("Contact", self.contact());
        ok.headers.push("Content-Type", "application/sdp");
        ok.body = self.body_for(&media);

        d.phase = Phase::Connected;
        d.local_media = Some(media.clone());
        d.last_response = Some(ok.clone());

        info!("Connect {} from {}", d.id, Pii(&d.party));

        let mut effects = Effects::default();
        effects.send(d.peer, ok);

        Ok((
            Negotiated {
                dialog: d.id.clone(),
                local: media,
                remote,
            },
            effects,
        ))
    }

    /// End the call with the party. `false` if there is no dialog.
    ///
    /// A ringing outbound dialog is cancelled and kept until the network confirms
    /// the end. Every other dialog is erased immediately.
    pub fn release_call(&mut self, party: &str) -> (bool, Effects) {
        let mut effects = Effects::default();

        let Some(mut d) = self.dialogs.remove(party) else {
            return (false, effects);
        };

        if d.cancelling {
            debug!("Dropping dialog {} already being cancelled", d.id);
            self.forget(d.id.as_str());
            return (true, effects);
        }

        info!("Release {} with {}", d.id, Pii(party));
        self.send_teardown(&mut d, &mut effects);

        if d.cancelling {
            self.dialogs.insert(d);
        }

        (true, effects)
    }

    /// The message ending a dialog in its current phase. Marks the dialog
    /// cancelling when that message is CANCEL.
    fn send_teardown(&mut self, d: &mut Dialog, effects: &mut Effects) {
        match (d.direction, d.phase) {
            (Direction::Incoming, Phase::Ringing) => {
                if let Some(invite) = &d.invite {
                    let decline = Response::for_request(invite, 603, d.local.tag.as_deref());
                    effects.send(d.peer, decline);
                }
            }
            (Direction::Outgoing, Phase::Ringing) => {
                let cancel = self.new_request(
                    Method::Cancel,
                    d.target.clone(),
                    &d.local,
                    &NameAddr::new(d.remote.uri.clone()),
                    d.id.as_str(),
                    d.invite_cseq,
                );
                self.track(&cancel, d.peer);
                effects.send(d.peer, cancel);
                d.cancelling = true;
            }
            (_, Phase::Connected) => {
                let bye = self.in_dialog_request(d, Method::Bye);
                self.track(&bye, d.peer);
                effects.send(d.peer, bye);
            }
        }
    }

    /// A request within an established dialog with the next CSeq.
    fn in_dialog_request(&mut self, d: &mut Dialog, method: Method) -> Request {
        let cseq = d.next_cseq();
        self.new_request(method, d.target.clone(), &d.local, &d.remote, d.id.as_str(), cseq)
    }

    fn ack(&mut self, d: &Dialog, to: Option<NameAddr>) -> Request {
        let to = to.unwrap_or_else(|| d.remote.clone());
        let mut ack = self.new_request(
            Method::Ack,
            d.target.clone(),
            &d.local,
            &to,
            d.id.as_str(),
            d.invite_cseq,
        );
        ack.headers.remove("Contact");
        ack
    }

    /// Handle one inbound datagram from `from`.
    pub fn process_incoming(&mut self, raw: &[u8], from: SocketAddr, now: Instant) -> Incoming {
        let message = match Message::parse(raw) {
            Ok(m) => m,
            Err(e) => {
                debug!("Drop unparsable message from {}: {}", Pii(from), e);
                return Incoming::default();
            }
        };

        let effects = match message {
            Message::Request(r) => self.handle_request(r, from),
            Message::Response(r) => self.handle_response(r, now),
        };

        effects.into()
    }

    fn handle_request(&mut self, req: Request, from: SocketAddr) -> Effects {
        trace!("Received {} {} from {}", req.method, Pii(&req.uri), Pii(from));

        match req.method {
            Method::Invite => self.on_invite(req, from),
            Method::Ack => {
                self.on_ack(&req);
                Effects::default()
            }
            Method::Bye | Method::Cancel => self.on_peer_end(req, from),
            Method::Options => {
                let mut ok = Response::for_request(&req, 200, None);
                ok.headers.push("Allow", ALLOW);
                let mut effects = Effects::default();
                effects.send(from, ok);
                effects
            }
            _ => {
                debug!("Not implemented: {}", req.method);
                let mut effects = Effects::default();
                effects.send(from, Response::for_request(&req, 501, None));
                effects
            }
        }
    }

    fn on_invite(&mut self, req: Request, from: SocketAddr) -> Effects {
        let mut effects = Effects::default();

        let offer = match validate_invite(&req) {
            Ok(v) => v,
            Err(e) => {
                warn!("Bad INVITE from {}: {}", Pii(from), e);
                effects.send(from, Response::for_request(&req, 400, None));
                return effects;
            }
        };

        if let Some(party) = self.dialogs.party_of(&offer.call_id) {
            if let Some(mut d) = self.dialogs.remove(&party) {
                self.on_invite_in_dialog(&mut d, &req, offer.cseq, from, &mut effects);
                self.dialogs.insert(d);
            }
            return effects;
        }

        let target = req.uri.user().to_string();
        if !self.config.owns_target(&target) {
            info!("INVITE for foreign target {}", Pii(&target));
            effects.send(from, Response::for_request(&req, 404, None));
            if self.config.unregister_foreign() && !target.is_empty() {
                self.unregister_foreign(&target, &mut effects);
            }
            return effects;
        }

        let party = offer.from.uri.user().to_string();

        if let Some(old) = self.dialogs.remove(&party) {
            info!("Replacing stale dialog {} for {}", old.id, Pii(&party));
            self.forget(old.id.as_str());
            effects
                .events
                .push(release(&old, DisconnectCause::NormalClearing, None));
        }

        let local_tag = self.ids.tag();
        let local = offer.to.clone().with_tag(local_tag.clone());
        let target = req
            .headers
            .contact()
            .map(|c| c.uri)
            .unwrap_or_else(|| offer.from.uri.clone());

        effects.send(from, Response::for_request(&req, 100, None));
        let ringing = Response::for_request(&req, 180, Some(&local_tag));
        effects.send(from, ringing.clone());

        let id = DialogId::from(offer.call_id);
        let video = offer.media.video_port.is_some();

        info!("Incoming {} from {}", id, Pii(&party));

        effects.events.push(CallEvent {
            dialog: id.clone(),
            party: party.clone(),
            kind: CallEventKind::Setup {
                display_name: offer.from.display.clone(),
                video,
                remote: offer.media.clone(),
                payload: offer.payload.clone(),
            },
        });

        self.dialogs.insert(Dialog {
            id,
            party,
            direction: Direction::Incoming,
            phase: Phase::Ringing,
            cancelling: false,
            confirmed: false,
            variant: Default::default(),
            video,
            local,
            remote: offer.from,
            target,
            peer: from,
            cseq: 0,
            invite_cseq: 0,
            remote_cseq: offer.cseq,
            local_media: None,
            remote_media: Some(offer.media),
            invite: Some(req),
            last_response: Some(ringing),
            payload: offer.payload,
        });

        effects
    }

    /// INVITE carrying the Call-ID of a dialog we already have.
    fn on_invite_in_dialog(
        &mut self,
        d: &mut Dialog,
        req: &Request,
        cseq: u32,
        from: SocketAddr,
        effects: &mut Effects,
    ) {
        if d.direction == Direction::Incoming && cseq == d.remote_cseq {
            trace!("INVITE retransmission {}", d.id);
            if let Some(resp) = &d.last_response {
                effects.send(from, resp.clone());
            }
            return;
        }

        if d.phase != Phase::Connected {
            effects.send(from, Response::for_request(req, 491, None));
            return;
        }

        // A refresh of a connected call. Media stays as negotiated.
        debug!("Re-INVITE {} answered with current media", d.id);
        let mut ok = Response::for_request(req, 200, d.local.tag.as_deref());
        ok.headers.push("Contact", self.contact());
        if let Some(media) = d.local_media.clone() {
            ok.headers.push("Content-Type", "application/sdp");
            ok.body = self.body_for(&media);
        }

        d.remote_cseq = cseq;
        d.last_response = Some(ok.clone());
        effects.send(from, ok);
    }

    fn unregister_foreign(&mut self, user: &str, effects: &mut Effects) {
        let call_id = self.ids.call_id();
        let tag = self.ids.tag();
        let req = self.register_request(user, 0, &call_id, &tag, 1, true);

        info!("Unregistering stale binding of {}", Pii(user));
        self.track(&req, self.config.server_addr());
        effects.send(self.config.server_addr(), req);
    }

    fn on_ack(&mut self, req: &Request) {
        let Some(call_id) = req.headers.call_id() else {
            return;
        };
        match self.dialogs.by_call_id_mut(call_id) {
            Some(d) if d.direction == Direction::Incoming && d.phase == Phase::Connected => {
                debug!("ACK confirms {}", d.id);
                d.confirmed = true;
            }
            _ => trace!("ACK for no connected dialog {}", call_id),
        }
    }

    /// Peer BYE or CANCEL. Always answered 200, the dialog only ends if the
    /// Call-ID matches.
    fn on_peer_end(&mut self, req: Request, from: SocketAddr) -> Effects {
        let mut effects = Effects::default();
        effects.send(from, Response::for_request(&req, 200, None));

        let Some(call_id) = req.headers.call_id() else {
            return effects;
        };
        let Some(party) = self.dialogs.party_of(call_id) else {
            debug!("{} for unknown dialog {}, ignored", req.method, call_id);
            return effects;
        };
        let Some(d) = self.dialogs.remove(&party) else {
            return effects;
        };

        if req.method == Method::Cancel {
            if d.direction != Direction::Incoming || d.phase != Phase::Ringing {
                debug!("CANCEL for {} in {:?}, ignored", d.id, d.phase);
                self.dialogs.insert(d);
                return effects;
            }
            if let Some(invite) = &d.invite {
                let terminated = Response::for_request(invite, 487, d.local.tag.as_deref());
                effects.send(d.peer, terminated);
            }
        }

        info!("Peer ended {} with {}", d.id, req.method);
        self.forget(d.id.as_str());
        effects
            .events
            .push(release(&d, DisconnectCause::NormalClearing, None));

        effects
    }

    fn handle_response(&mut self, resp: Response, now: Instant) -> Effects {
        let (Some(call_id), Some((cseq, method))) = (
            resp.headers.call_id().map(String::from),
            resp.headers.cseq(),
        ) else {
            debug!("Drop response {} without Call-ID or CSeq", resp.code);
            return Effects::default();
        };

        trace!("Received {} {} for {} {}", resp.code, resp.reason, method, call_id);

        if resp.is_provisional() {
            return self.on_provisional(&call_id, &method, &resp);
        }

        if self.is_stale(&call_id, &method, cseq) {
            return self.on_stale(&call_id, &method, cseq, &resp);
        }

        if resp.code == 401 || resp.code == 407 {
            if let Some(effects) = self.retry_with_auth(&call_id, &method, &resp) {
                return effects;
            }
        }

        let outstanding = self.outstanding.remove(&(call_id.clone(), method.clone()));

        match method {
            Method::Register => {
                self.on_register_response(&call_id, &resp, outstanding, now);
                Effects::default()
            }
            Method::Invite => self.on_invite_response(&call_id, resp),
            _ => self.on_other_response(&call_id, &method, &resp),
        }
    }

    /// Whether a final response answers a request we already superseded.
    fn is_stale(&self, call_id: &str, method: &Method, cseq: u32) -> bool {
        let key = (call_id.to_string(), method.clone());
        if let Some(out) = self.outstanding.get(&key) {
            return cseq < out.cseq;
        }
        match method {
            Method::Invite => self
                .dialogs
                .by_call_id(call_id)
                .map(|d| d.direction == Direction::Outgoing && cseq < d.invite_cseq)
                .unwrap_or(false),
            Method::Register => {
                call_id == self.registration.call_id && cseq < self.registration.cseq
            }
            _ => false,
        }
    }

    /// A retransmitted final response to a superseded request.
    ///
    /// A non-2xx to an INVITE is acknowledged again, anything else is dropped.
    fn on_stale(
        &mut self,
        call_id: &str,
        method: &Method,
        cseq: u32,
        resp: &Response,
    ) -> Effects {
        let mut effects = Effects::default();

        debug!("Stale {} to {} {} (CSeq {})", resp.code, method, call_id, cseq);

        if *method != Method::Invite || resp.is_success() {
            return effects;
        }

        if let Some(party) = self.dialogs.party_of(call_id) {
            if let Some(d) = self.dialogs.remove(&party) {
                let mut ack = self.ack(&d, resp.headers.to_addr());
                ack.headers.set("CSeq", format!("{} {}", cseq, Method::Ack));
                effects.send(d.peer, ack);
                self.dialogs.insert(d);
            }
        }

        effects
    }

    fn on_provisional(&mut self, call_id: &str, method: &Method, resp: &Response) -> Effects {
        let mut effects = Effects::default();

        if *method != Method::Invite || !(resp.code == 180 || resp.code == 183) {
            return effects;
        }

        match self.dialogs.by_call_id_mut(call_id) {
            Some(d) if d.direction == Direction::Outgoing && d.phase == Phase::Ringing => {
                debug!("Alert {}", d.id);
                effects.events.push(CallEvent {
                    dialog: d.id.clone(),
                    party: d.party.clone(),
                    kind: CallEventKind::Alert,
                });
            }
            _ => trace!("{} for no ringing dialog {}", resp.code, call_id),
        }

        effects
    }

    /// Resend a challenged request once with credentials.
    ///
    /// `None` when the request was already retried or the challenge can't be
    /// answered, in which case the response counts as a failure.
    fn retry_with_auth(
        &mut self,
        call_id: &str,
        method: &Method,
        resp: &Response,
    ) -> Option<Effects> {
        let key = (call_id.to_string(), method.clone());
        let out = self.outstanding.get(&key)?;

        if out.auth_retried {
            warn!("{} {} challenged again, giving up", method, call_id);
            return None;
        }

        let (challenge_header, auth_header) = if resp.code == 407 {
            ("Proxy-Authenticate", "Proxy-Authorization")
        } else {
            ("WWW-Authenticate", "Authorization")
        };

        let Some(challenge) = resp.headers.get(challenge_header).and_then(DigestChallenge::parse)
        else {
            warn!("{} without usable {}", resp.code, challenge_header);
            return None;
        };

        let mut req = out.request.clone();
        let dest = out.dest;

        let creds = Credentials {
            user: self.config.user(),
            password: self.config.password(),
        };
        let cnonce = format!("{:08x}", fastrand::u32(..));
        let Some(authorization) =
            creds.authorize(method.as_str(), &req.uri.to_string(), &challenge, &cnonce)
        else {
            warn!("Unsupported digest challenge: {:?}", challenge.algorithm);
            return None;
        };

        let mut effects = Effects::default();

        // The challenged INVITE is still a transaction that wants its ACK.
        if *method == Method::Invite {
            if let Some(party) = self.dialogs.party_of(call_id) {
                if let Some(d) = self.dialogs.remove(&party) {
                    let ack = self.ack(&d, resp.headers.to_addr());
                    effects.send(d.peer, ack);
                    self.dialogs.insert(d);
                }
            }
        }

        let cseq = req.headers.cseq().map(|(n, _)| n + 1).unwrap_or(1);
        req.headers.set("CSeq", format!("{} {}", cseq, method));
        let via = self.via();
        req.headers.set("Via", via);
        req.headers.set(auth_header, authorization);

        if let Some(d) = self.dialogs.by_call_id_mut(call_id) {
            d.cseq = d.cseq.max(cseq);
            if *method == Method::Invite {
                d.invite_cseq = cseq;
            }
        }
        if self.registration.call_id == call_id {
            self.registration.cseq = self.registration.cseq.max(cseq);
        }

        debug!("Retrying {} {} with credentials", method, call_id);

        self.outstanding.insert(
            key,
            Outstanding {
                request: req.clone(),
                dest,
                cseq,
                auth_retried: true,
            },
        );
        effects.send(dest, req);

        Some(effects)
    }

    fn on_register_response(
        &mut self,
        call_id: &str,
        resp: &Response,
        outstanding: Option<Outstanding>,
        now: Instant,
    ) {
        if call_id != self.registration.call_id {
            debug!("REGISTER {} for other binding {}", resp.code, call_id);
            return;
        }

        if !resp.is_success() {
            warn!("Registration failed: {} {}", resp.code, resp.reason);
            self.registration.failed();
            return;
        }

        let requested = outstanding.and_then(|o| o.request.headers.expires());
        let granted = resp
            .headers
            .contact()
            .and_then(|c| c.expires)
            .or_else(|| resp.headers.expires())
            .or(requested)
            .unwrap_or(self.config.register_expiry().as_secs() as u32);

        self.registration
            .accepted(Duration::from_secs(granted as u64), now);

        if self.registration.is_registered() {
            info!("Registered for {}s", granted);
        } else {
            info!("Unregistered");
        }
    }

    fn on_invite_response(&mut self, call_id: &str, resp: Response) -> Effects {
        let mut effects = Effects::default();

        let Some(party) = self.dialogs.party_of(call_id) else {
            debug!("{} to INVITE for unknown dialog {}", resp.code, call_id);
            return effects;
        };
        let Some(mut d) = self.dialogs.remove(&party) else {
            return effects;
        };

        if d.direction != Direction::Outgoing {
            self.dialogs.insert(d);
            return effects;
        }

        if !resp.is_success() {
            let cause = if d.cancelling {
                DisconnectCause::NormalClearing
            } else {
                self.causes.lookup(resp.code)
            };

            if d.variant.acks_failure() {
                let ack = self.ack(&d, resp.headers.to_addr());
                effects.send(d.peer, ack);
            }

            info!(
                "Call {} to {} ended: {} {}",
                d.id,
                Pii(&d.party),
                resp.code,
                resp.reason
            );
            self.forget(d.id.as_str());
            effects.events.push(release(&d, cause, Some(resp.code)));
            return effects;
        }

        if d.remote.tag.is_none() {
            d.remote.tag = resp.headers.to_addr().and_then(|t| t.tag);
        }
        if d.phase == Phase::Ringing {
            if let Some(contact) = resp.headers.contact() {
                d.target = contact.uri;
            }
        }

        let ack = self.ack(&d, None);
        effects.send(d.peer, ack);

        if d.phase == Phase::Connected {
            trace!("2xx retransmission for {}", d.id);
            self.dialogs.insert(d);
            return effects;
        }

        if d.cancelling {
            info!("{} answered while cancelling, hanging up", d.id);
            let bye = self.in_dialog_request(&mut d, Method::Bye);
            self.track(&bye, d.peer);
            effects.send(d.peer, bye);
            self.forget_unless_bye(d.id.as_str());
            effects.events.push(release(
                &d,
                DisconnectCause::NormalClearing,
                Some(resp.code),
            ));
            return effects;
        }

        let remote = SessionBody::parse(&resp.body)
            .map_err(SignalError::from)
            .and_then(|b| MediaParams::from_body(&b).map_err(SignalError::from));

        match (remote, d.local_media.clone()) {
            (Ok(remote), Some(local)) => {
                d.set_remote_media(remote);
                d.phase = Phase::Connected;
                info!("Connected {} to {}", d.id, Pii(&d.party));

                if let Some(remote) = d.remote_media.clone() {
                    effects.events.push(CallEvent {
                        dialog: d.id.clone(),
                        party: d.party.clone(),
                        kind: CallEventKind::Connect { local, remote },
                    });
                }
                self.dialogs.insert(d);
            }
            (remote, _) => {
                if let Err(e) = remote {
                    warn!("Unusable answer for {}: {}", d.id, e);
                }
                let bye = self.in_dialog_request(&mut d, Method::Bye);
                self.track(&bye, d.peer);
                effects.send(d.peer, bye);
                self.forget_unless_bye(d.id.as_str());
                effects
                    .events
                    .push(release(&d, DisconnectCause::Other, Some(resp.code)));
            }
        }

        effects
    }

    /// Final response to BYE, CANCEL or anything else we sent in a dialog.
    fn on_other_response(&mut self, call_id: &str, method: &Method, resp: &Response) -> Effects {
        let mut effects = Effects::default();

        if resp.is_success() {
            trace!("{} {} confirmed", method, call_id);
            return effects;
        }

        let Some(party) = self.dialogs.party_of(call_id) else {
            debug!("{} to {} for unknown dialog {}", resp.code, method, call_id);
            return effects;
        };
        let Some(d) = self.dialogs.remove(&party) else {
            return effects;
        };

        let cause = if d.cancelling {
            DisconnectCause::NormalClearing
        } else {
            self.causes.lookup(resp.code)
        };

        warn!("{} to {} for {}, releasing", resp.code, method, d.id);
        self.forget(d.id.as_str());
        effects.events.push(release(&d, cause, Some(resp.code)));

        effects
    }

    /// Drop everything outstanding for the Call-ID.
    fn forget(&mut self, call_id: &str) {
        self.outstanding.retain(|(c, _), _| c != call_id);
    }

    /// Like `forget`, but keep a BYE so it can still be authenticated.
    fn forget_unless_bye(&mut self, call_id: &str) {
        self.outstanding
            .retain(|(c, m), _| c != call_id || *m == Method::Bye);
    }

    fn forget_unless_cancelling(&mut self, d: &Dialog) {
        if d.cancelling {
            self.outstanding
                .retain(|(c, m), _| c != d.id.as_str() || *m == Method::Cancel);
        } else {
            self.forget_unless_bye(d.id.as_str());
        }
    }

    fn track(&mut self, req: &Request, dest: SocketAddr) {
        let Some(call_id) = req.headers.call_id() else {
            return;
        };
        let cseq = req.headers.cseq().map(|(n, _)| n).unwrap_or(0);
        self.outstanding.insert(
            (call_id.to_string(), req.method.clone()),
            Outstanding {
                request: req.clone(),
                dest,
                cseq,
                auth_retried: false,
            },
        );
    }

    fn new_request(
        &mut self,
        method: Method,
        uri: Uri,
        from: &NameAddr,
        to: &NameAddr,
        call_id: &str,
        cseq: u32,
    ) -> Request {
        let mut req = Request::new(method.clone(), uri);
        req.headers.push("Via", self.via());
        req.headers.push("Max-Forwards", MAX_FORWARDS);
        req.headers.push("From", from);
        req.headers.push("To", to);
        req.headers.push("Call-ID", call_id);
        req.headers.push("CSeq", format!("{} {}", cseq, method));
        req.headers.push("Contact", self.contact());
        req.headers.push("User-Agent", self.config.user_agent());
        req
    }

    fn via(&mut self) -> String {
        format!(
            "SIP/2.0/UDP {};branch={};rport",
            self.local_addr,
            self.ids.branch()
        )
    }

    fn contact(&self) -> NameAddr {
        NameAddr::new(Uri::new(
            self.config.user(),
            self.local_addr.ip().to_string(),
            Some(self.local_addr.port()),
        ))
    }

    /// Host part of URIs: the configured domain, else the server address.
    fn domain(&self) -> String {
        if self.config.domain().is_empty() {
            self.config.server_addr().ip().to_string()
        } else {
            self.config.domain().to_string()
        }
    }

    fn local_media(&mut self, video: bool, audio_key: bool, video_key: bool) -> MediaParams {
        MediaParams {
            addr: self.local_addr.ip(),
            audio_port: self.ports.next_port(),
            audio_pt: self.config.audio_profile().pt(),
            audio_key: audio_key.then(|| self.keys.generate()),
            video_port: video.then(|| self.ports.next_port()),
            video_key: (video && video_key).then(|| self.keys.generate()),
        }
    }

    fn body_for(&mut self, media: &MediaParams) -> String {
        let mut lines = vec![MediaLine::audio(
            self.config.audio_profile(),
            media.audio_port,
            media.audio_key.clone(),
        )];
        if let Some(port) = media.video_port {
            lines.push(MediaLine::video(port, media.video_key.clone()));
        }

        SessionBody {
            session_id: self.ids.session_id(),
            version: 1,
            addr: media.addr,
            media: lines,
        }
        .to_string()
    }
}

fn release(d: &Dialog, cause: DisconnectCause, code: Option<u16>) -> CallEvent {
    CallEvent {
        dialog: d.id.clone(),
        party: d.party.clone(),
        kind: CallEventKind::Release { cause, code },
    }
}

/// Check the mandatory headers and the body of an unsolicited INVITE.
fn validate_invite(req: &Request) -> Result<Offer, SignalError> {
    let h = &req.headers;

    h.get("Via").ok_or(SignalError::MissingHeader("Via"))?;
    let call_id = h
        .call_id()
        .filter(|c| !c.is_empty())
        .ok_or(SignalError::MissingHeader("Call-ID"))?;
    let from = h
        .from_addr()
        .filter(|f| !f.uri.user().is_empty())
        .ok_or(SignalError::MissingHeader("From"))?;
    let to = h.to_addr().ok_or(SignalError::MissingHeader("To"))?;
    let cseq = match h.cseq() {
        Some((n, Method::Invite)) => n,
        _ => return Err(SignalError::MissingHeader("CSeq")),
    };

    let body = SessionBody::parse(&req.body)?;
    let media = MediaParams::from_body(&body)?;

    let payload = match h.get(PAYLOAD_HEADER) {
        Some(v) => Some(
            b64::decode(v).ok_or_else(|| SignalError::Parse("payload not base64".into()))?,
        ),
        None => None,
    };

    Ok(Offer {
        call_id: call_id.to_string(),
        cseq,
        from,
        to,
        media,
        payload,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::signal::CallVariant;

    fn sig() -> Signaling {
        let config = EngineConfig::new()
            .set_user("1001")
            .set_password("pw")
            .set_domain("dispatch")
            .set_server_addr("10.0.0.1:5060".parse().unwrap());
        Signaling::new(config, "10.0.0.2:5060".parse().unwrap(), KeyGen::default())
    }

    fn request(e: &Effects, i: usize) -> &Request {
        match &e.transmit[i].message {
            Message::Request(r) => r,
            m => panic!("not a request: {m}"),
        }
    }

    #[test]
    fn setup_tracks_invite() {
        let mut s = sig();
        let (id, e) = s
            .setup_call(SetupRequest::new("2001").set_variant(CallVariant::Group))
            .unwrap();
        let invite = request(&e, 0);
        assert_eq!(invite.uri.to_string(), "sip:grp_2001@dispatch");
        assert_eq!(invite.headers.call_id(), Some(id.as_str()));
        assert!(s
            .outstanding
            .contains_key(&(id.as_str().to_string(), Method::Invite)));
    }

    #[test]
    fn abort_clears_everything() {
        let mut s = sig();
        let (id, _) = s.setup_call(SetupRequest::new("2001")).unwrap();
        let e = s.abort_setup(&id);
        assert_eq!(s.dialog_count(), 0);
        assert!(s.outstanding.is_empty());
        assert!(matches!(
            e.events[0].kind,
            CallEventKind::Release {
                cause: DisconnectCause::NetworkFailure,
                code: None
            }
        ));
    }

    #[test]
    fn empty_party_rejected() {
        let mut s = sig();
        assert!(matches!(
            s.setup_call(SetupRequest::new("  ")),
            Err(SignalError::InvalidParty)
        ));
    }

    #[test]
    fn local_address_change_without_handshake() {
        let mut s = sig();
        let e = s.reregister(Some("10.0.0.9:5060".parse().unwrap()), None);
        assert!(e.transmit.is_empty());

        let (_, e) = s.setup_call(SetupRequest::new("2001")).unwrap();
        let via = request(&e, 0).headers.get("Via").unwrap();
        assert!(via.contains("10.0.0.9:5060"));
    }

    #[test]
    fn server_change_registers_again() {
        let mut s = sig();
        let e = s.reregister(None, Some("10.0.0.7:5060".parse().unwrap()));
        assert_eq!(e.transmit.len(), 1);
        assert_eq!(e.transmit[0].dest, "10.0.0.7:5060".parse().unwrap());
        assert_eq!(request(&e, 0).method, Method::Register);
    }
}
