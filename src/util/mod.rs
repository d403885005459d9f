mod pii;
pub(crate) use pii::Pii;

/// Standard base64 for media keys and embedded payloads.
pub(crate) mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;

    pub fn encode(data: &[u8]) -> String {
        STANDARD.encode(data)
    }

    pub fn decode(s: &str) -> Option<Vec<u8>> {
        STANDARD.decode(s.trim()).ok()
    }
}
