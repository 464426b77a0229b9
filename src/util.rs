use std::net::Ipv4Addr;

const API_PORT: &str = "DELFIN_API_PORT";

const DEFAULT_API_PORT: u16 = 8190;

pub fn get_default_api_port() -> u16 {
    DEFAULT_API_PORT
}

pub fn get_api_port() -> Option<u16> {
    std::env::var(API_PORT).ok().and_then(|res| res.parse().ok())
}

const API_ADDR: &str = "DELFIN_API_ADDR";

const DEFAULT_ADDR: Ipv4Addr = Ipv4Addr::new(0, 0, 0, 0);

pub fn get_api_addr() -> Ipv4Addr {
    let addr_from_env = std::env::var(API_ADDR);
    addr_from_env.map_or(DEFAULT_ADDR, |res| res.parse().unwrap_or(DEFAULT_ADDR))
}

const API_TOKEN: &str = "DELFIN_API_TOKEN";

pub fn get_api_token() -> Option<String> {
    std::env::var(API_TOKEN).ok().filter(|token| !token.is_empty())
}

const CONFIG_PATH: &str = "DELFIN_CONFIG";

pub const DEFAULT_CONFIG_PATH: &str = "/etc/delfin/delfin.json";

/// Config file path from the environment, if set
pub fn get_config_path() -> Option<String> {
    std::env::var(CONFIG_PATH).ok().filter(|path| !path.is_empty())
}

const COORDINATION_ENDPOINT: &str = "DELFIN_COORDINATION_ENDPOINT";

pub fn get_coordination_endpoint() -> Option<String> {
    std::env::var(COORDINATION_ENDPOINT).ok().filter(|e| !e.is_empty())
}

const TRANSPORT_URL: &str = "DELFIN_TRANSPORT_URL";

pub fn get_transport_url() -> Option<String> {
    std::env::var(TRANSPORT_URL).ok().filter(|u| !u.is_empty())
}

const LOG_LEVEL: &str = "DELFIN_LOG";

pub fn get_log_level() -> Option<String> {
    std::env::var(LOG_LEVEL).ok()
}

const INSTANCE_ID: &str = "DELFIN_INSTANCE_ID";

/// Identity of this process instance
///
/// `DELFIN_INSTANCE_ID`, falling back to the host name (container id under
/// compose) plus pid, so two replicas on one host stay distinct.
pub fn instance_id() -> String {
    if let Ok(id) = std::env::var(INSTANCE_ID)
        && !id.is_empty()
    {
        return id;
    }

    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "delfin".to_string());
    format!("{host}-{}", std::process::id())
}
