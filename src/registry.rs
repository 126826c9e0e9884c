//! The set of managed applications.
//!
//! The registry is parsed once at startup from the `APP_INFO` payload and
//! is read-only afterwards:
//!
//! ```json
//! {"appkey": "com.example.lb.appname",
//!  "apps": [{"name": "foo", "lb_ip": "10.0.0.10", "lb_port": "80"},
//!           {"name": "bar", "sg_name": "bar-pool"}]}
//! ```
//!
//! The payload may also be supplied base64 encoded.

use std::collections::HashSet;

use base64::engine::general_purpose;
use base64::Engine;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("invalid registry JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("registry payload looks base64 encoded but does not decode: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("decoded registry payload is not UTF-8")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("application name must not be empty")]
    EmptyName,
    #[error("application {0} is listed more than once")]
    Duplicate(String),
    #[error("application {app}: invalid lb_port {value:?}")]
    InvalidPort { app: String, value: String },
    #[error("application {0}: lb_ip and lb_port must be set together")]
    PartialFrontend(String),
}

#[derive(Debug, Deserialize)]
struct RawRegistry {
    #[serde(default)]
    appkey: Option<String>,
    apps: Vec<RawApp>,
}

#[derive(Debug, Deserialize)]
struct RawApp {
    name: String,
    lb_ip: Option<String>,
    lb_port: Option<String>,
    lb_name: Option<String>,
    sg_name: Option<String>,
}

/// Front-end listener requested for an application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frontend {
    pub vip: String,
    pub port: u16,
}

/// One managed application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppDescriptor {
    pub name: String,
    lb_name: Option<String>,
    sg_name: Option<String>,
    pub frontend: Option<Frontend>,
}

impl AppDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            lb_name: None,
            sg_name: None,
            frontend: None,
        }
    }

    pub fn with_lb_name(mut self, lb_name: impl Into<String>) -> Self {
        self.lb_name = Some(lb_name.into());
        self
    }

    pub fn with_sg_name(mut self, sg_name: impl Into<String>) -> Self {
        self.sg_name = Some(sg_name.into());
        self
    }

    pub fn with_frontend(mut self, vip: impl Into<String>, port: u16) -> Self {
        self.frontend = Some(Frontend {
            vip: vip.into(),
            port,
        });
        self
    }

    /// Virtual server name: the explicit `lb_name`, else the sanitized app name.
    pub fn lb_name(&self) -> String {
        self.lb_name
            .clone()
            .unwrap_or_else(|| sanitize_name(&self.name))
    }

    /// Service group name: the explicit `sg_name`, else the sanitized app name.
    pub fn sg_name(&self) -> String {
        self.sg_name
            .clone()
            .unwrap_or_else(|| sanitize_name(&self.name))
    }
}

/// Load-balancer object names cannot contain `/`, which scheduler app ids
/// (`/group/app`) do.
pub fn sanitize_name(name: &str) -> String {
    name.replace('/', "_").trim_start_matches('_').to_string()
}

#[derive(Debug, Clone, Default)]
pub struct AppRegistry {
    appkey: Option<String>,
    apps: Vec<AppDescriptor>,
}

impl AppRegistry {
    /// Parses a registry payload, decoding it first when it consists only
    /// of base64 alphabet characters.
    pub fn parse(payload: &str) -> Result<Self, RegistryError> {
        let payload = payload.trim();
        let json = if looks_like_base64(payload) {
            String::from_utf8(general_purpose::STANDARD.decode(payload)?)?
        } else {
            payload.to_string()
        };

        let raw: RawRegistry = serde_json::from_str(&json)?;
        let mut seen = HashSet::new();
        let mut apps = Vec::with_capacity(raw.apps.len());

        for app in raw.apps {
            if app.name.is_empty() {
                return Err(RegistryError::EmptyName);
            }
            if !seen.insert(app.name.clone()) {
                return Err(RegistryError::Duplicate(app.name));
            }

            let mut descriptor = match (app.lb_ip, app.lb_port) {
                (Some(vip), Some(port)) => {
                    let port = port.trim().parse::<u16>().map_err(|_| {
                        RegistryError::InvalidPort {
                            app: app.name.clone(),
                            value: port.clone(),
                        }
                    })?;
                    AppDescriptor::new(app.name).with_frontend(vip, port)
                }
                (None, None) => AppDescriptor::new(app.name),
                _ => return Err(RegistryError::PartialFrontend(app.name)),
            };
            if let Some(lb_name) = app.lb_name {
                descriptor = descriptor.with_lb_name(lb_name);
            }
            if let Some(sg_name) = app.sg_name {
                descriptor = descriptor.with_sg_name(sg_name);
            }
            apps.push(descriptor);
        }

        Ok(Self {
            appkey: raw.appkey.filter(|k| !k.is_empty()),
            apps,
        })
    }

    /// Container label key used by the swarm source.
    pub fn appkey(&self) -> Option<&str> {
        self.appkey.as_deref()
    }

    pub fn apps(&self) -> &[AppDescriptor] {
        &self.apps
    }

    #[cfg(test)]
    pub fn get(&self, name: &str) -> Option<&AppDescriptor> {
        self.apps.iter().find(|a| a.name == name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.apps.iter().map(|a| a.name.as_str())
    }
}

fn looks_like_base64(s: &str) -> bool {
    !s.is_empty()
        && s
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'+' || b == b'/' || b == b'=')
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAYLOAD: &str = r#"{"appkey": "com.example.lb.appname",
        "apps": [{"name": "foo0", "lb_ip": "10.220.73.122", "lb_port": "443"},
                 {"name": "/web/foo1", "lb_name": "front", "sg_name": "pool"},
                 {"name": "foo2"}]}"#;

    #[test]
    fn parses_plain_json() {
        let reg = AppRegistry::parse(PAYLOAD).unwrap();
        assert_eq!(reg.appkey(), Some("com.example.lb.appname"));
        assert_eq!(reg.apps().len(), 3);

        let foo0 = reg.get("foo0").unwrap();
        assert_eq!(
            foo0.frontend,
            Some(Frontend {
                vip: "10.220.73.122".into(),
                port: 443
            })
        );
        assert_eq!(foo0.lb_name(), "foo0");
    }

    #[test]
    fn decodes_base64_payload() {
        let encoded = general_purpose::STANDARD.encode(PAYLOAD);
        let reg = AppRegistry::parse(&encoded).unwrap();
        assert_eq!(reg.names().collect::<Vec<_>>(), ["foo0", "/web/foo1", "foo2"]);
    }

    #[test]
    fn names_default_to_sanitized_app_name() {
        let reg = AppRegistry::parse(PAYLOAD).unwrap();
        let foo1 = reg.get("/web/foo1").unwrap();
        assert_eq!(foo1.lb_name(), "front");
        assert_eq!(foo1.sg_name(), "pool");

        let plain = AppDescriptor::new("/web/foo1");
        assert_eq!(plain.lb_name(), "web_foo1");
        assert_eq!(plain.sg_name(), "web_foo1");
    }

    #[test]
    fn rejects_duplicates() {
        let err = AppRegistry::parse(r#"{"apps": [{"name": "a"}, {"name": "a"}]}"#).unwrap_err();
        assert!(matches!(err, RegistryError::Duplicate(n) if n == "a"));
    }

    #[test]
    fn rejects_bad_port() {
        let err = AppRegistry::parse(
            r#"{"apps": [{"name": "a", "lb_ip": "10.0.0.1", "lb_port": "http"}]}"#,
        )
        .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidPort { .. }));
    }

    #[test]
    fn rejects_half_frontend() {
        let err =
            AppRegistry::parse(r#"{"apps": [{"name": "a", "lb_ip": "10.0.0.1"}]}"#).unwrap_err();
        assert!(matches!(err, RegistryError::PartialFrontend(_)));
    }

    #[test]
    fn rejects_malformed_json() {
        assert!(matches!(
            AppRegistry::parse("{not json").unwrap_err(),
            RegistryError::Json(_)
        ));
    }
}
