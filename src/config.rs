use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::event::{DisconnectCause, MediaKind};
use crate::rtp::Pt;
use crate::sdp::AudioProfile;

/// Configuration of a [`SignalingEngine`][crate::SignalingEngine].
///
/// Credentials, the server address and the RTP port range are supplied by the
/// surrounding application. The config is serde (de)serializable so the application
/// can keep it in whatever storage it uses.
///
/// ```
/// # use callcore::EngineConfig;
/// let config = EngineConfig::new()
///     .set_user("1001")
///     .set_domain("dispatch.example")
///     .set_rtp_port_range(40000, 40100);
///
/// assert_eq!(config.rtp_port_range(), (40000, 40100));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    user: String,
    password: String,
    display_name: Option<String>,
    aliases: Vec<String>,
    domain: String,
    server_addr: SocketAddr,
    local_addr: Option<SocketAddr>,
    rtp_port_min: u16,
    rtp_port_max: u16,
    encryption: bool,
    audio_profile: AudioProfile,
    register_expiry: Duration,
    user_agent: String,
    unregister_foreign: bool,
    causes: HashMap<u16, DisconnectCause>,
}

impl EngineConfig {
    /// Creates a new default config.
    pub fn new() -> Self {
        EngineConfig::default()
    }

    /// The user part we register and place calls as.
    pub fn user(&self) -> &str {
        &self.user
    }

    /// Set the user part we register as.
    pub fn set_user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    /// Password used to answer authentication challenges.
    pub fn password(&self) -> &str {
        &self.password
    }

    /// Set the password used to answer authentication challenges.
    pub fn set_password(mut self, password: impl Into<String>) -> Self {
        self.password = password.into();
        self
    }

    /// Display name put in the From header.
    pub fn display_name(&self) -> Option<&str> {
        self.display_name.as_deref()
    }

    /// Set the display name put in the From header.
    pub fn set_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    /// Additional user parts an inbound call may target and still be ours.
    ///
    /// Group numbers the console listens to go here.
    pub fn aliases(&self) -> &[String] {
        &self.aliases
    }

    /// Add a user part that counts as ours for inbound calls.
    pub fn add_alias(mut self, alias: impl Into<String>) -> Self {
        self.aliases.push(alias.into());
        self
    }

    /// Checks whether an inbound request target belongs to this console.
    pub fn owns_target(&self, user: &str) -> bool {
        self.user == user || self.aliases.iter().any(|a| a == user)
    }

    /// The domain used in URIs when a call doesn't name one.
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Set the domain used in URIs.
    pub fn set_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = domain.into();
        self
    }

    /// The address of the VOIP server all signaling goes to.
    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    /// Set the address of the VOIP server.
    pub fn set_server_addr(mut self, addr: SocketAddr) -> Self {
        self.server_addr = addr;
        self
    }

    /// Address advertised in Via/Contact and session bodies.
    ///
    /// If unset, the engine uses the local address of its transport.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Set the address advertised in Via/Contact and session bodies.
    pub fn set_local_addr(mut self, addr: SocketAddr) -> Self {
        self.local_addr = Some(addr);
        self
    }

    /// The inclusive range RTP ports are allocated from.
    ///
    /// Defaults to `(40000, 40998)`.
    pub fn rtp_port_range(&self) -> (u16, u16) {
        (self.rtp_port_min, self.rtp_port_max)
    }

    /// Set the range RTP ports are allocated from.
    ///
    /// Only even ports in the range are handed out, the odd port above each is
    /// used for RTCP.
    pub fn set_rtp_port_range(mut self, min: u16, max: u16) -> Self {
        self.rtp_port_min = min;
        self.rtp_port_max = max;
        self
    }

    /// Whether new call legs get a fresh media key.
    pub fn encryption(&self) -> bool {
        self.encryption
    }

    /// Toggle media encryption for new call legs.
    pub fn set_encryption(mut self, enabled: bool) -> Self {
        self.encryption = enabled;
        self
    }

    /// The fixed audio profile offered and answered.
    pub fn audio_profile(&self) -> AudioProfile {
        self.audio_profile
    }

    /// Select one of the two fixed audio profiles.
    pub fn set_audio_profile(mut self, profile: AudioProfile) -> Self {
        self.audio_profile = profile;
        self
    }

    /// Requested registration lifetime.
    ///
    /// Defaults to 3600 seconds.
    pub fn register_expiry(&self) -> Duration {
        self.register_expiry
    }

    /// Set the requested registration lifetime.
    pub fn set_register_expiry(mut self, expiry: Duration) -> Self {
        self.register_expiry = expiry;
        self
    }

    /// Value of the User-Agent header.
    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    /// Set the User-Agent header.
    pub fn set_user_agent(mut self, ua: impl Into<String>) -> Self {
        self.user_agent = ua.into();
        self
    }

    /// Whether a call for a foreign target triggers an unregister of that mapping.
    pub fn unregister_foreign(&self) -> bool {
        self.unregister_foreign
    }

    /// When enabled, an inbound call aimed at a user that isn't ours makes the
    /// engine send `REGISTER` with `Expires: 0` for that user, to clear a stale
    /// binding on the server.
    pub fn set_unregister_foreign(mut self, enabled: bool) -> Self {
        self.unregister_foreign = enabled;
        self
    }

    /// Overrides of the failure-code to disconnect-cause table.
    pub fn cause_overrides(&self) -> &HashMap<u16, DisconnectCause> {
        &self.causes
    }

    /// Map a failure status code to a specific disconnect cause.
    pub fn set_cause(mut self, code: u16, cause: DisconnectCause) -> Self {
        self.causes.insert(code, cause);
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            user: String::new(),
            password: String::new(),
            display_name: None,
            aliases: vec![],
            domain: "localhost".into(),
            server_addr: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 5060)),
            local_addr: None,
            rtp_port_min: 40000,
            rtp_port_max: 40998,
            encryption: false,
            audio_profile: AudioProfile::Pcma,
            register_expiry: Duration::from_secs(3600),
            user_agent: concat!("callcore/", env!("CARGO_PKG_VERSION")).into(),
            unregister_foreign: false,
            causes: HashMap::new(),
        }
    }
}

/// Configuration of one [`MediaSession`][crate::MediaSession].
///
/// Usually obtained from [`Negotiated::media_config`][crate::Negotiated::media_config]
/// once a call is connected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConfig {
    kind: MediaKind,
    local_port: u16,
    remote_addr: SocketAddr,
    payload_type: Pt,
    clock_rate: u32,
    packet_time: Duration,
    max_delay: Duration,
    stats_interval: Duration,
    local_key: Option<String>,
    remote_key: Option<String>,
}

impl MediaConfig {
    /// Creates a config for the given kind with the fixed defaults of that kind.
    ///
    /// Audio defaults to PCMA at 20ms packet time, video to H264 at 90kHz.
    pub fn new(kind: MediaKind, local_port: u16, remote_addr: SocketAddr) -> Self {
        let (payload_type, clock_rate, packet_time) = match kind {
            MediaKind::Audio => (8.into(), 8000, Duration::from_millis(20)),
            MediaKind::Video => (96.into(), 90_000, Duration::from_millis(40)),
        };

        MediaConfig {
            kind,
            local_port,
            remote_addr,
            payload_type,
            clock_rate,
            packet_time,
            max_delay: Duration::from_millis(200),
            stats_interval: Duration::from_secs(3),
            local_key: None,
            remote_key: None,
        }
    }

    /// Audio or video.
    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    /// Local RTP port. Always even, RTCP uses the port above.
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Remote RTP address. RTCP goes to the port above.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Payload type put in every sent packet.
    pub fn payload_type(&self) -> Pt {
        self.payload_type
    }

    /// Set the payload type.
    pub fn set_payload_type(mut self, pt: Pt) -> Self {
        self.payload_type = pt;
        self
    }

    /// Media clock rate in Hz.
    pub fn clock_rate(&self) -> u32 {
        self.clock_rate
    }

    /// Set the media clock rate.
    pub fn set_clock_rate(mut self, rate: u32) -> Self {
        self.clock_rate = rate;
        self
    }

    /// Duration of media in one packet.
    pub fn packet_time(&self) -> Duration {
        self.packet_time
    }

    /// Set the packet time. This is also the receive timeout of the session thread.
    pub fn set_packet_time(mut self, ptime: Duration) -> Self {
        self.packet_time = ptime;
        self
    }

    /// Longest delay tolerated while waiting for a missing packet.
    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    /// Set the tolerated reordering delay. The reorder buffer holds
    /// `max_delay / packet_time` packets.
    pub fn set_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// How often receive bitrate is reported to the sink.
    pub fn stats_interval(&self) -> Duration {
        self.stats_interval
    }

    /// Set how often receive bitrate is reported.
    pub fn set_stats_interval(mut self, interval: Duration) -> Self {
        self.stats_interval = interval;
        self
    }

    /// Our media key, if encryption was negotiated.
    pub fn local_key(&self) -> Option<&str> {
        self.local_key.as_deref()
    }

    /// The peer's media key, if encryption was negotiated.
    pub fn remote_key(&self) -> Option<&str> {
        self.remote_key.as_deref()
    }

    /// Set both keys. They are handed to the cipher untouched.
    pub fn set_keys(mut self, local: Option<String>, remote: Option<String>) -> Self {
        self.local_key = local;
        self.remote_key = remote;
        self
    }

    /// Number of media clock ticks in one packet.
    pub fn frame_ticks(&self) -> u32 {
        (self.packet_time.as_millis() as u64 * self.clock_rate as u64 / 1000) as u32
    }

    /// Capacity of the reorder buffer derived from delay and packet time.
    pub fn reorder_capacity(&self) -> usize {
        let ptime = self.packet_time.as_millis().max(1);
        ((self.max_delay.as_millis() / ptime) as usize).max(1)
    }
}
