use {
    core::time::Duration,
    derive_more::{Display, From},
    serde::{Deserialize, Serialize},
    std::{net::SocketAddr, string::ToString},
};

/// A received datagram together with its sender.
#[derive(Clone, Debug, PartialEq)]
pub struct Packet {
    pub addr: SocketAddr,
    pub data: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StringAddr {
    pub host: String,
    pub port: u16,
}

/// Server endpoint: either already resolved or a name to resolve before connecting.
#[derive(Clone, Debug, PartialEq, Eq, From, Serialize, Deserialize)]
pub enum Host {
    A(SocketAddr),
    S(StringAddr),
}

impl<S> From<(S, u16)> for Host
where
    S: ToString,
{
    fn from((host, port): (S, u16)) -> Self {
        Host::S(StringAddr {
            host: host.to_string(),
            port,
        })
    }
}

pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(2500);

/// Largest UDP payload we are prepared to receive.
pub const DEFAULT_MAX_DATAGRAM_SIZE: usize = 65535;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    pub send_timeout: Duration,
    pub recv_timeout: Duration,
    pub max_datagram_size: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            send_timeout: DEFAULT_TIMEOUT,
            recv_timeout: DEFAULT_TIMEOUT,
            max_datagram_size: DEFAULT_MAX_DATAGRAM_SIZE,
        }
    }
}

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Serialize, Deserialize)]
pub enum Os {
    Linux,
    Windows,
    #[display(fmt = "N/A")]
    Unknown,
}

impl From<u8> for Os {
    fn from(v: u8) -> Self {
        match v {
            b'l' => Os::Linux,
            _ => Os::Windows,
        }
    }
}

/// Optional trailer of an info reply, selected by the extra data flag.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtraData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub steam_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tv_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tv_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keywords: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub game_id: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub protocol: u8,
    pub name: String,
    pub map: String,
    pub folder: String,
    pub game: String,
    pub app_id: i16,
    pub players: i16,
    pub max_players: i16,
    pub bots: i16,
    pub dedicated: bool,
    pub os: Os,
    pub password: bool,
    pub secure: bool,
    pub version: String,
    #[serde(default)]
    pub extra: ExtraData,
}

impl ServerInfo {
    /// Stand-in record returned when the server could not be queried.
    pub fn unavailable(reason: &str) -> Self {
        const NA: &str = "N/A";

        Self {
            protocol: 0,
            name: format!("{} ({})", NA, reason),
            map: NA.into(),
            folder: NA.into(),
            game: NA.into(),
            app_id: -1,
            players: -1,
            max_players: -1,
            bots: -1,
            dedicated: false,
            os: Os::Unknown,
            password: false,
            secure: false,
            version: NA.into(),
            extra: ExtraData::default(),
        }
    }

    pub fn is_available(&self) -> bool {
        self.app_id != -1
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Player {
    pub name: String,
    pub score: i32,
    /// Seconds connected.
    pub duration: f32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub name: String,
    pub value: String,
}
