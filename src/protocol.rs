use std::fmt;

// Codes carried in res,FAIL-<code> replies
/// Slot or serial number was not found on the relay
pub const CODE_NOT_FOUND: u16 = 1043;
/// Exit agent could not reach the requested target
pub const CODE_DIAL_FAILED: u16 = 1044;

/// Target name that makes the exit agent serve the connection
/// through its embedded SOCKS5 server instead of dialing out
pub const SOCKS5_TARGET: &str = "s5";

/// Command represents the control messages exchanged over websocket
/// connections. Every connection sends exactly one of these as its
/// first frame, which classifies it; afterwards only command channels
/// carry further Commands (Dial and Heartbeat, relay -> exit).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `server-server,<slot>` - exit agent registers a slot
    Register { slot: String },
    /// `server-data,<serial>` - exit agent supplies the exit-side data
    /// channel for a pending handshake
    OpenData { serial: String },
    /// `server-data,<serial>,<target>` - relay asks the exit agent to
    /// dial a target (command channel only)
    Dial { serial: String, target: String },
    /// `client-data,<slot>,<serial>,<target>` - entrance agent requests
    /// a tunneled connection; the sending socket is the data channel
    Tunnel {
        slot: String,
        serial: String,
        target: String,
    },
    /// `heart-beat` - relay-originated liveness probe
    Heartbeat,
}

/// Command implementation block
impl Command {
    /// parse converts one text frame into a Command, or None when the
    /// frame has an unknown prefix or the wrong number of fields
    pub fn parse(text: &str) -> Option<Self> {
        let fields: Vec<&str> = text.split(',').collect();
        match (fields[0], fields.len()) {
            ("server-server", 2) => Some(Command::Register {
                slot: fields[1].to_string(),
            }),
            ("server-data", 2) => Some(Command::OpenData {
                serial: fields[1].to_string(),
            }),
            ("server-data", 3) => Some(Command::Dial {
                serial: fields[1].to_string(),
                target: fields[2].to_string(),
            }),
            ("client-data", 4) => Some(Command::Tunnel {
                slot: fields[1].to_string(),
                serial: fields[2].to_string(),
                target: fields[3].to_string(),
            }),
            ("heart-beat", 1) => Some(Command::Heartbeat),
            _ => None,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Register { slot } => write!(f, "server-server,{slot}"),
            Command::OpenData { serial } => write!(f, "server-data,{serial}"),
            Command::Dial { serial, target } => write!(f, "server-data,{serial},{target}"),
            Command::Tunnel {
                slot,
                serial,
                target,
            } => write!(f, "client-data,{slot},{serial},{target}"),
            Command::Heartbeat => write!(f, "heart-beat"),
        }
    }
}

/// Reply represents the `res,...` answers to Commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Ok,
    Fail,
    FailCode(u16),
}

/// Reply implementation block
impl Reply {
    /// parse converts one text frame into a Reply, or None for
    /// anything that is not a `res,` frame
    pub fn parse(text: &str) -> Option<Self> {
        match text.strip_prefix("res,")? {
            "OK" => Some(Reply::Ok),
            "FAIL" => Some(Reply::Fail),
            rest => rest
                .strip_prefix("FAIL-")
                .and_then(|code| code.parse().ok())
                .map(Reply::FailCode),
        }
    }

    /// is_ok reports whether a raw reply frame is `res,OK`
    pub fn is_ok(text: &str) -> bool {
        Reply::parse(text) == Some(Reply::Ok)
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Ok => write!(f, "res,OK"),
            Reply::Fail => write!(f, "res,FAIL"),
            Reply::FailCode(code) => write!(f, "res,FAIL-{code}"),
        }
    }
}
