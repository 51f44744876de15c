use smol_str::SmolStr;

/// SIP request methods the user-agent core produces or consumes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    Invite,
    Ack,
    Bye,
    Cancel,
    Update,
    Info,
    Message,
    Refer,
    Subscribe,
    Notify,
    Options,
    Unknown(SmolStr),
}

impl Method {
    /// Returns the canonical uppercase token for this method.
    pub fn as_str(&self) -> &str {
        match self {
            Method::Invite => "INVITE",
            Method::Ack => "ACK",
            Method::Bye => "BYE",
            Method::Cancel => "CANCEL",
            Method::Update => "UPDATE",
            Method::Info => "INFO",
            Method::Message => "MESSAGE",
            Method::Refer => "REFER",
            Method::Subscribe => "SUBSCRIBE",
            Method::Notify => "NOTIFY",
            Method::Options => "OPTIONS",
            Method::Unknown(token) => token.as_str(),
        }
    }

    /// Parses a method token, returning `Unknown` for extension methods.
    pub fn from_token(token: &str) -> Self {
        if token.eq_ignore_ascii_case("INVITE") {
            Method::Invite
        } else if token.eq_ignore_ascii_case("ACK") {
            Method::Ack
        } else if token.eq_ignore_ascii_case("BYE") {
            Method::Bye
        } else if token.eq_ignore_ascii_case("CANCEL") {
            Method::Cancel
        } else if token.eq_ignore_ascii_case("UPDATE") {
            Method::Update
        } else if token.eq_ignore_ascii_case("INFO") {
            Method::Info
        } else if token.eq_ignore_ascii_case("MESSAGE") {
            Method::Message
        } else if token.eq_ignore_ascii_case("REFER") {
            Method::Refer
        } else if token.eq_ignore_ascii_case("SUBSCRIBE") {
            Method::Subscribe
        } else if token.eq_ignore_ascii_case("NOTIFY") {
            Method::Notify
        } else if token.eq_ignore_ascii_case("OPTIONS") {
            Method::Options
        } else {
            Method::Unknown(SmolStr::new(token.to_owned()))
        }
    }

    /// Returns true when requests of this method refresh the dialog target
    /// (RFC 3261 §12.2 plus the NOTIFY rule of RFC 6665 §4.5.3).
    pub fn is_target_refresh(&self) -> bool {
        matches!(self, Method::Invite | Method::Update | Method::Notify)
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
