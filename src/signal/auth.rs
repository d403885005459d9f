//! Digest authentication (MD5) for 401/407 challenges.

/// A parsed `WWW-Authenticate` or `Proxy-Authenticate` value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestChallenge {
    /// Protection realm.
    pub realm: String,
    /// Server nonce.
    pub nonce: String,
    /// Only MD5 (or absent) is supported.
    pub algorithm: Option<String>,
    /// Offered quality of protection values, comma separated.
    pub qop: Option<String>,
    /// Opaque value echoed back.
    pub opaque: Option<String>,
}

impl DigestChallenge {
    /// Parse a challenge header value. `None` if it isn't a usable digest challenge.
    pub fn parse(value: &str) -> Option<DigestChallenge> {
        let value = value.trim();
        let (scheme, params) = value.split_once(' ')?;
        if !scheme.eq_ignore_ascii_case("digest") {
            return None;
        }

        let mut realm = None;
        let mut nonce = None;
        let mut algorithm = None;
        let mut qop = None;
        let mut opaque = None;

        for part in split_params(params) {
            let Some((k, v)) = part.split_once('=') else {
                continue;
            };
            let v = v.trim().trim_matches('"').to_string();
            match k.trim().to_ascii_lowercase().as_str() {
                "realm" => realm = Some(v),
                "nonce" => nonce = Some(v),
                "algorithm" => algorithm = Some(v),
                "qop" => qop = Some(v),
                "opaque" => opaque = Some(v),
                _ => {}
            }
        }

        Some(DigestChallenge {
            realm: realm?,
            nonce: nonce?,
            algorithm,
            qop,
            opaque,
        })
    }
}

/// Split on commas outside quotes.
fn split_params(s: &str) -> Vec<&str> {
    let mut parts = vec![];
    let mut quoted = false;
    let mut start = 0;

    for (i, c) in s.char_indices() {
        match c {
            '"' => quoted = !quoted,
            ',' if !quoted => {
                parts.push(s[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(s[start..].trim());

    parts.into_iter().filter(|p| !p.is_empty()).collect()
}

fn md5_hex(s: &str) -> String {
    format!("{:x}", md5::compute(s.as_bytes()))
}

/// Credentials answering one challenge.
#[derive(Debug)]
pub struct Credentials<'a> {
    /// User name.
    pub user: &'a str,
    /// Password.
    pub password: &'a str,
}

impl Credentials<'_> {
    /// The `Authorization` value for `method` on `uri`.
    ///
    /// `cnonce` is only used when the challenge asks for `qop=auth`. `None` when
    /// the challenge wants an algorithm other than MD5.
    pub fn authorize(
        &self,
        method: &str,
        uri: &str,
        challenge: &DigestChallenge,
        cnonce: &str,
    ) -> Option<String> {
        if let Some(alg) = &challenge.algorithm {
            if !alg.eq_ignore_ascii_case("MD5") {
                return None;
            }
        }

        let qop = challenge
            .qop
            .as_deref()
            .and_then(|q| q.split(',').map(str::trim).find(|q| *q == "auth"));

        let ha1 = md5_hex(&format!("{}:{}:{}", self.user, challenge.realm, self.password));
        let ha2 = md5_hex(&format!("{}:{}", method, uri));

        // We answer each challenge once, so the nonce count is always 1.
        let nc = "00000001";

        let response = match qop {
            Some(qop) => md5_hex(&format!(
                "{}:{}:{}:{}:{}:{}",
                ha1, challenge.nonce, nc, cnonce, qop, ha2
            )),
            None => md5_hex(&format!("{}:{}:{}", ha1, challenge.nonce, ha2)),
        };

        let mut v = format!(
            "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", response=\"{}\"",
            self.user, challenge.realm, challenge.nonce, uri, response
        );
        if challenge.algorithm.is_some() {
            v.push_str(", algorithm=MD5");
        }
        if let Some(opaque) = &challenge.opaque {
            v.push_str(&format!(", opaque=\"{}\"", opaque));
        }
        if let Some(qop) = qop {
            v.push_str(&format!(", qop={}, nc={}, cnonce=\"{}\"", qop, nc, cnonce));
        }

        Some(v)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_challenge() {
        let c = DigestChallenge::parse(
            r#"Digest realm="dispatch", nonce="abc,def", qop="auth,auth-int", algorithm=MD5"#,
        )
        .unwrap();
        assert_eq!(c.realm, "dispatch");
        assert_eq!(c.nonce, "abc,def");
        assert_eq!(c.qop.as_deref(), Some("auth,auth-int"));
        assert_eq!(c.algorithm.as_deref(), Some("MD5"));

        assert!(DigestChallenge::parse(r#"Basic realm="x""#).is_none());
        assert!(DigestChallenge::parse(r#"Digest realm="x""#).is_none());
    }

    #[test]
    fn rfc2617_response() {
        // The worked example of RFC 2617 section 3.5.
        let c = DigestChallenge {
            realm: "testrealm@host.com".into(),
            nonce: "dcd98b7102dd2f0e8b11d0f600bfb0c093".into(),
            algorithm: None,
            qop: Some("auth,auth-int".into()),
            opaque: Some("5ccc069c403ebaf9f0171e9517f40e41".into()),
        };
        let creds = Credentials {
            user: "Mufasa",
            password: "Circle Of Life",
        };
        let v = creds
            .authorize("GET", "/dir/index.html", &c, "0a4f113b")
            .unwrap();
        assert!(v.contains("response=\"6629fae49393a05397450978507c4ef1\""));
        assert!(v.contains("qop=auth, nc=00000001, cnonce=\"0a4f113b\""));
    }

    #[test]
    fn unsupported_algorithm() {
        let c = DigestChallenge {
            realm: "r".into(),
            nonce: "n".into(),
            algorithm: Some("SHA-256".into()),
            qop: None,
            opaque: None,
        };
        let creds = Credentials {
            user: "u",
            password: "p",
        };
        assert!(creds.authorize("REGISTER", "sip:x", &c, "c").is_none());
    }
}
