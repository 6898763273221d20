#![forbid(unsafe_code)]

pub mod eventsub;
pub mod helix;
pub mod transport;


pub use helix::{HelixClient, TwitchTokenRefresher};
pub use transport::{EventSubTransportConfig, TwitchEventSubTransport};

/// Default Helix REST base URL.
pub const HELIX_BASE_URL: &str = "https://api.twitch.tv";
/// Default EventSub websocket endpoint.
pub const EVENTSUB_WS_URL: &str = "wss://eventsub.wss.twitch.tv/ws";
/// Default OAuth token endpoint.
pub const TOKEN_URL: &str = "https://id.twitch.tv/oauth2/token";
