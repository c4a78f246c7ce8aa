//! Monitor configuration
//!
//! Connection settings for the CTI provider plus the merge routing rule,
//! loaded from environment variables.

use std::time::Duration;

/// Routing rule for the inbound call-merge workflow: an offer on the route
/// point DN triggers a merge of the two configured parties toward the
/// destination DN.
#[derive(Debug, Clone)]
pub struct MergeRule {
    /// Route point DN that triggers the workflow
    pub route_point_dn: String,

    /// Route point terminal name (tracked for readiness)
    pub route_point_terminal: String,

    /// First party terminal name
    pub first_terminal: String,

    /// First party address DN
    pub first_address: String,

    /// Second party terminal name
    pub second_terminal: String,

    /// Second party address DN
    pub second_address: String,

    /// Destination DN dialed into the new call
    pub destination: String,

    /// Interval between join polls
    pub join_poll_interval: Duration,

    /// Number of join polls before the sequence aborts
    pub join_poll_attempts: u32,
}

impl Default for MergeRule {
    fn default() -> Self {
        Self {
            route_point_dn: "885016".to_string(),
            route_point_terminal: "CTIRoutePoint88".to_string(),
            first_terminal: "CSFAMCKENZIE".to_string(),
            first_address: "5016".to_string(),
            second_terminal: "CSFAPEREZ".to_string(),
            second_address: "5017".to_string(),
            destination: "4030".to_string(),
            join_poll_interval: Duration::from_secs(1),
            join_poll_attempts: 10,
        }
    }
}

impl MergeRule {
    /// Override rule fields from environment variables, keeping defaults for
    /// anything unset.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            route_point_dn: std::env::var("ROUTE_POINT_DN").unwrap_or(defaults.route_point_dn),
            route_point_terminal: std::env::var("ROUTE_POINT_TERMINAL")
                .unwrap_or(defaults.route_point_terminal),
            first_terminal: std::env::var("FIRST_TERMINAL").unwrap_or(defaults.first_terminal),
            first_address: std::env::var("FIRST_ADDRESS").unwrap_or(defaults.first_address),
            second_terminal: std::env::var("SECOND_TERMINAL").unwrap_or(defaults.second_terminal),
            second_address: std::env::var("SECOND_ADDRESS").unwrap_or(defaults.second_address),
            destination: std::env::var("MERGE_DESTINATION").unwrap_or(defaults.destination),
            join_poll_interval: std::env::var("JOIN_POLL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.join_poll_interval),
            join_poll_attempts: std::env::var("JOIN_POLL_ATTEMPTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.join_poll_attempts),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.route_point_dn.is_empty() {
            return Err("route point DN is required".to_string());
        }
        if self.first_terminal.is_empty() || self.first_address.is_empty() {
            return Err("first party terminal and address are required".to_string());
        }
        if self.second_terminal.is_empty() || self.second_address.is_empty() {
            return Err("second party terminal and address are required".to_string());
        }
        if self.destination.is_empty() {
            return Err("merge destination DN is required".to_string());
        }
        if self.join_poll_attempts == 0 {
            return Err("join poll attempts must be at least 1".to_string());
        }
        Ok(())
    }
}

/// Top-level monitor configuration
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// CTI server address (host or host:port)
    pub cti_address: String,

    /// CTI application user login
    pub username: String,

    /// CTI application user password
    pub password: String,

    /// WebSocket listen port
    pub ws_port: u16,

    /// Line DNs pushed to clients in the roster message
    pub monitored_lines: Vec<String>,

    /// Interval between keep-alive pushes
    pub keepalive_interval: Duration,

    /// Merge routing rule
    pub rule: MergeRule,
}

impl MonitorConfig {
    /// Create config from environment variables. Returns `None` when any of
    /// the required provider credentials is missing.
    pub fn from_env() -> Option<Self> {
        let cti_address = std::env::var("CUCM_ADDRESS").ok()?;
        let username = std::env::var("CTI_USERNAME").ok()?;
        let password = std::env::var("CTI_PASSWORD").ok()?;

        let ws_port = std::env::var("WS_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(7000);

        let monitored_lines = std::env::var("MONITORED_LINES")
            .map(|v| {
                v.split(',')
                    .map(|dn| dn.trim().to_string())
                    .filter(|dn| !dn.is_empty())
                    .collect()
            })
            .unwrap_or_else(|_| vec!["5016".to_string(), "5017".to_string()]);

        let keepalive_interval = std::env::var("KEEPALIVE_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(5));

        Some(Self {
            cti_address,
            username,
            password,
            ws_port,
            monitored_lines,
            keepalive_interval,
            rule: MergeRule::from_env(),
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.cti_address.is_empty() {
            return Err("CTI server address is required".to_string());
        }
        if self.username.is_empty() {
            return Err("CTI username is required".to_string());
        }
        if self.password.is_empty() {
            return Err("CTI password is required".to_string());
        }
        if self.monitored_lines.is_empty() {
            return Err("at least one monitored line is required".to_string());
        }
        self.rule.validate()
    }

    /// Provider connection string handed to the call-control client
    pub fn provider_string(&self) -> String {
        format!(
            "{};login={};passwd={}",
            self.cti_address, self.username, self.password
        )
    }
}
