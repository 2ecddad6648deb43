use std::fmt;
use std::str::FromStr;

/// RTSP request method (RFC 2326 §10).
///
/// Methods outside the RFC set are kept verbatim in [`Method::Other`] so that
/// the server can answer them with `405 Method Not Allowed` instead of
/// failing to parse the request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    Options,
    Describe,
    Announce,
    Setup,
    Play,
    Pause,
    Teardown,
    GetParameter,
    SetParameter,
    Record,
    Redirect,
    Other(String),
}

impl Method {
    pub fn as_str(&self) -> &str {
        match self {
            Method::Options => "OPTIONS",
            Method::Describe => "DESCRIBE",
            Method::Announce => "ANNOUNCE",
            Method::Setup => "SETUP",
            Method::Play => "PLAY",
            Method::Pause => "PAUSE",
            Method::Teardown => "TEARDOWN",
            Method::GetParameter => "GET_PARAMETER",
            Method::SetParameter => "SET_PARAMETER",
            Method::Record => "RECORD",
            Method::Redirect => "REDIRECT",
            Method::Other(name) => name,
        }
    }

    /// Whether `token` can be a method name: `1*( ALPHA / "_" / "-" )`.
    pub(crate) fn is_token(token: &str) -> bool {
        !token.is_empty()
            && token
                .bytes()
                .all(|b| b.is_ascii_uppercase() || b == b'_' || b == b'-')
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "OPTIONS" => Method::Options,
            "DESCRIBE" => Method::Describe,
            "ANNOUNCE" => Method::Announce,
            "SETUP" => Method::Setup,
            "PLAY" => Method::Play,
            "PAUSE" => Method::Pause,
            "TEARDOWN" => Method::Teardown,
            "GET_PARAMETER" => Method::GetParameter,
            "SET_PARAMETER" => Method::SetParameter,
            "RECORD" => Method::Record,
            "REDIRECT" => Method::Redirect,
            other => Method::Other(other.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_methods_round_trip() {
        for name in ["OPTIONS", "SETUP", "GET_PARAMETER", "TEARDOWN"] {
            let method: Method = name.parse().unwrap();
            assert_eq!(method.as_str(), name);
            assert!(!matches!(method, Method::Other(_)));
        }
    }

    #[test]
    fn unknown_method_is_preserved() {
        let method: Method = "FLUSH".parse().unwrap();
        assert_eq!(method, Method::Other("FLUSH".to_string()));
        assert_eq!(method.to_string(), "FLUSH");
    }

    #[test]
    fn token_check() {
        assert!(Method::is_token("GET_PARAMETER"));
        assert!(!Method::is_token("get"));
        assert!(!Method::is_token(""));
        assert!(!Method::is_token("RTSP/1.0"));
    }
}
