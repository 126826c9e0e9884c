use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Process configuration that does not come from the command line.
///
/// Load-balancer credentials and the registry payload are read from the
/// unprefixed `NS_*` / `APP_INFO` variables; tunables use `LBSYNC_*` or
/// `lbsync.toml` / `lbsync.json` in the working directory.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ns_ip: Option<String>,
    pub ns_user: String,
    pub ns_password: String,
    pub ns_protocol: String,
    /// Appliances usually present self-signed certificates.
    pub ns_verify_tls: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_info: Option<String>,
    pub lb_method: String,
    pub request_timeout_secs: u64,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ns_ip: None,
            ns_user: "nsroot".into(),
            ns_password: "nsroot".into(),
            ns_protocol: "http".into(),
            ns_verify_tls: false,
            app_info: None,
            lb_method: "ROUNDROBIN".into(),
            request_timeout_secs: 10,
            backoff_base_ms: 500,
            backoff_max_ms: 30_000,
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let mut config: Config = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file("lbsync.toml"))
            .merge(Json::file("lbsync.json"))
            .merge(Env::prefixed("LBSYNC_"))
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

        // Credentials and the registry payload are taken verbatim; figment
        // would otherwise coerce numeric passwords and JSON-looking values.
        if let Ok(ip) = std::env::var("NS_IP") {
            config.ns_ip = Some(ip);
        }
        if let Ok(user) = std::env::var("NS_USER") {
            config.ns_user = user;
        }
        if let Ok(password) = std::env::var("NS_PASSWORD") {
            config.ns_password = password;
        }
        if let Ok(secret_file) = std::env::var("NS_PASSWORD_FILE") {
            config.ns_password = std::fs::read_to_string(secret_file)?.trim().to_string();
        }
        if let Ok(protocol) = std::env::var("NS_PROTOCOL") {
            config.ns_protocol = protocol.to_lowercase();
        }
        if let Ok(app_info) = std::env::var("APP_INFO") {
            config.app_info = Some(app_info);
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.ns_ip.as_deref().map_or(true, str::is_empty) {
            anyhow::bail!("NS_IP is required");
        }
        if self.app_info.as_deref().map_or(true, str::is_empty) {
            anyhow::bail!("APP_INFO is required");
        }
        if !matches!(self.ns_protocol.as_str(), "http" | "https") {
            anyhow::bail!("NS_PROTOCOL must be http or https, got {}", self.ns_protocol);
        }
        Ok(())
    }

    /// Base URL of the NITRO API, e.g. `http://10.0.0.5`.
    pub fn nitro_base_url(&self) -> String {
        format!(
            "{}://{}",
            self.ns_protocol,
            self.ns_ip.as_deref().unwrap_or_default()
        )
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn reads_unprefixed_and_prefixed_env() {
        Jail::expect_with(|jail| {
            jail.set_env("NS_IP", "10.0.0.5");
            jail.set_env("NS_USER", "admin");
            jail.set_env("APP_INFO", r#"{"apps": []}"#);
            jail.set_env("NS_PASSWORD", "12345");
            jail.set_env("LBSYNC_REQUEST_TIMEOUT_SECS", "3");

            let config = Config::load().map_err(|e| e.to_string())?;
            assert_eq!(config.ns_ip.as_deref(), Some("10.0.0.5"));
            assert_eq!(config.ns_user, "admin");
            assert_eq!(config.ns_password, "12345");
            assert_eq!(config.app_info.as_deref(), Some(r#"{"apps": []}"#));
            assert_eq!(config.request_timeout(), Duration::from_secs(3));
            assert_eq!(config.nitro_base_url(), "http://10.0.0.5");
            Ok(())
        });
    }

    #[test]
    fn toml_file_is_overridden_by_env() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "lbsync.toml",
                r#"
                ns_ip = "192.168.1.1"
                lb_method = "LEASTCONNECTION"
                app_info = '{"apps": []}'
                "#,
            )?;
            jail.set_env("NS_IP", "10.0.0.9");

            let config = Config::load().map_err(|e| e.to_string())?;
            assert_eq!(config.ns_ip.as_deref(), Some("10.0.0.9"));
            assert_eq!(config.lb_method, "LEASTCONNECTION");
            Ok(())
        });
    }

    #[test]
    fn missing_required_values_fail() {
        Jail::expect_with(|jail| {
            jail.set_env("APP_INFO", r#"{"apps": []}"#);
            assert!(Config::load().is_err());

            jail.set_env("NS_IP", "10.0.0.5");
            jail.set_env("NS_PROTOCOL", "ftp");
            assert!(Config::load().is_err());
            Ok(())
        });
    }
}
