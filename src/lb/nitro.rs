//! NetScaler NITRO REST client.

use super::{LbSession, LoadBalancer};
use crate::error::LbError;
use crate::types::{BackendSet, Endpoint};
use async_trait::async_trait;
use log::{debug, info};
use reqwest::header::COOKIE;
use reqwest::{Client, Method, Response, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

/// NITRO "No such resource".
const ERR_NO_SUCH_RESOURCE: i64 = 258;
/// NITRO "Resource already exists".
const ERR_ALREADY_EXISTS: i64 = 273;
/// Idle timeout requested for each session, in seconds.
const SESSION_TIMEOUT_SECS: u64 = 600;
const SERVICE_TYPE: &str = "HTTP";

pub struct NitroClient {
    base_url: Url,
    username: String,
    password: String,
    client: Client,
}

impl NitroClient {
    pub fn new(
        base_url: &str,
        username: impl Into<String>,
        password: impl Into<String>,
        timeout: Duration,
        verify_tls: bool,
    ) -> anyhow::Result<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| anyhow::anyhow!("Invalid NITRO address {}: {}", base_url, e))?;
        Ok(Self {
            base_url,
            username: username.into(),
            password: password.into(),
            client: Client::builder()
                .timeout(timeout)
                .danger_accept_invalid_certs(!verify_tls)
                .build()?,
        })
    }
}

#[async_trait]
impl LoadBalancer for NitroClient {
    async fn login(&self) -> Result<Box<dyn LbSession>, LbError> {
        let url = config_url(&self.base_url, &["login"])?;
        let body = json!({
            "login": {
                "username": self.username,
                "password": self.password,
                "timeout": SESSION_TIMEOUT_SECS,
            }
        });
        let response = self.client.post(url).json(&body).send().await?;
        let value = check(response).await?;

        let token = value
            .get("sessionid")
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| LbError::Session("login response carries no sessionid".into()))?;
        debug!("Logged in to {}", self.base_url);

        Ok(Box::new(NitroSession {
            base_url: self.base_url.clone(),
            client: self.client.clone(),
            token: token.to_string(),
        }))
    }
}

struct NitroSession {
    base_url: Url,
    client: Client,
    token: String,
}

#[derive(Debug, Deserialize)]
struct LbVserver {
    name: String,
    ipv46: Option<String>,
    port: Option<u16>,
}

#[derive(Debug, Deserialize)]
struct VserverGroupBinding {
    servicegroupname: String,
}

#[derive(Debug, Deserialize)]
struct GroupMemberBinding {
    ip: Option<String>,
    port: Option<u16>,
}

impl NitroSession {
    async fn request(
        &self,
        method: Method,
        url: Url,
        body: Option<Value>,
    ) -> Result<Value, LbError> {
        let mut request = self
            .client
            .request(method, url)
            .header(COOKIE, format!("NITRO_AUTH_TOKEN={}", self.token));
        if let Some(body) = body {
            request = request.json(&body);
        }
        check(request.send().await?).await
    }

    /// Objects of `resource` named `name`. A missing object is `NotFound`;
    /// an object with no entries (e.g. no bindings) is an empty list.
    async fn get<T: DeserializeOwned>(&self, resource: &str, name: &str) -> Result<Vec<T>, LbError> {
        let url = config_url(&self.base_url, &[resource, name])?;
        let value = self.request(Method::GET, url, None).await?;
        match value.get(resource) {
            Some(items) => serde_json::from_value(items.clone())
                .map_err(|e| LbError::Malformed(format!("{}: {}", resource, e))),
            None => Ok(Vec::new()),
        }
    }

    async fn add(&self, method: Method, resource: &str, object: Value) -> Result<(), LbError> {
        let url = config_url(&self.base_url, &[resource])?;
        self.request(method, url, Some(json!({ resource: object })))
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl LbSession for NitroSession {
    async fn ensure_virtual_server(
        &self,
        name: &str,
        vip: &str,
        port: u16,
        method: &str,
    ) -> Result<(), LbError> {
        match self.get::<LbVserver>("lbvserver", name).await {
            Ok(existing) => {
                if let Some(lb) = existing.first() {
                    if lb.ipv46.as_deref() == Some(vip) && lb.port == Some(port) {
                        info!("LB {} is already configured", name);
                        return Ok(());
                    }
                    return Err(LbError::Conflict(format!(
                        "LB {} already configured with a different VIP/port: {}:{}",
                        lb.name,
                        lb.ipv46.as_deref().unwrap_or("?"),
                        lb.port.map(|p| p.to_string()).unwrap_or_else(|| "?".into())
                    )));
                }
            }
            Err(LbError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        info!("Creating LB {} on {}:{}", name, vip, port);
        self.add(
            Method::POST,
            "lbvserver",
            json!({
                "name": name,
                "ipv46": vip,
                "port": port,
                "servicetype": SERVICE_TYPE,
                "lbmethod": method,
            }),
        )
        .await
    }

    async fn ensure_service_group(&self, name: &str) -> Result<(), LbError> {
        match self.get::<Value>("servicegroup", name).await {
            Ok(existing) if !existing.is_empty() => {
                debug!("Service group {} already configured", name);
                return Ok(());
            }
            Ok(_) | Err(LbError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        info!("Creating service group {}", name);
        self.add(
            Method::POST,
            "servicegroup",
            json!({ "servicegroupname": name, "servicetype": SERVICE_TYPE }),
        )
        .await
    }

    async fn bind_group_to_server(&self, server: &str, group: &str) -> Result<(), LbError> {
        match self
            .get::<VserverGroupBinding>("lbvserver_servicegroup_binding", server)
            .await
        {
            Ok(bindings) if bindings.iter().any(|b| b.servicegroupname == group) => {
                debug!("LB {} is already bound to service group {}", server, group);
                return Ok(());
            }
            Ok(_) | Err(LbError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        info!("Binding service group {} to LB {}", group, server);
        self.add(
            Method::PUT,
            "lbvserver_servicegroup_binding",
            json!({ "name": server, "servicegroupname": group }),
        )
        .await
    }

    async fn list_group_members(&self, group: &str) -> Result<BackendSet, LbError> {
        let bindings = self
            .get::<GroupMemberBinding>("servicegroup_servicegroupmember_binding", group)
            .await?;
        // Port 0 entries are server-level bindings, not members.
        Ok(bindings
            .into_iter()
            .filter_map(|b| match (b.ip, b.port) {
                (Some(ip), Some(port)) if port != 0 => Some(Endpoint::new(ip, port).canonical()),
                _ => None,
            })
            .collect())
    }

    async fn add_group_member(&self, group: &str, member: &Endpoint) -> Result<(), LbError> {
        let result = self
            .add(
                Method::PUT,
                "servicegroup_servicegroupmember_binding",
                json!({ "servicegroupname": group, "ip": member.host, "port": member.port }),
            )
            .await;
        match result {
            Err(LbError::Api { code, .. }) if code == ERR_ALREADY_EXISTS => Ok(()),
            other => other,
        }
    }

    async fn remove_group_member(&self, group: &str, member: &Endpoint) -> Result<(), LbError> {
        let mut url = config_url(
            &self.base_url,
            &["servicegroup_servicegroupmember_binding", group],
        )?;
        url.set_query(Some(&member_args(member)));
        match self.request(Method::DELETE, url, None).await {
            Err(LbError::NotFound(_)) => Ok(()),
            other => other.map(|_| ()),
        }
    }

    async fn logout(self: Box<Self>) -> Result<(), LbError> {
        let url = config_url(&self.base_url, &["logout"])?;
        self.request(Method::POST, url, Some(json!({ "logout": {} })))
            .await
            .map(|_| ())
    }
}

/// `args` filter selecting one member. Values are percent-encoded so the
/// colons of an IPv6 address are not read as separators.
fn member_args(member: &Endpoint) -> String {
    format!(
        "args=ip:{},port:{}",
        urlencoding::encode(&member.host),
        member.port
    )
}

fn config_url(base: &Url, segments: &[&str]) -> Result<Url, LbError> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| LbError::Session(format!("{} cannot be a base URL", base)))?
        .pop_if_empty()
        .extend(["nitro", "v1", "config"])
        .extend(segments);
    Ok(url)
}

/// Maps a NITRO response to its JSON body or an error.
async fn check(response: Response) -> Result<Value, LbError> {
    let status = response.status();
    let text = response.text().await?;
    if text.trim().is_empty() {
        return if status.is_success() {
            Ok(Value::Null)
        } else {
            Err(LbError::Api {
                code: i64::from(status.as_u16()),
                message: status.to_string(),
            })
        };
    }

    let value: Value = serde_json::from_str(&text)
        .map_err(|e| LbError::Malformed(format!("HTTP {}: {}", status, e)))?;
    let code = value.get("errorcode").and_then(Value::as_i64).unwrap_or(0);
    let message = value
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    match code {
        0 if status.is_success() => Ok(value),
        0 => Err(LbError::Api {
            code: i64::from(status.as_u16()),
            message: text,
        }),
        ERR_NO_SUCH_RESOURCE => Err(LbError::NotFound(message)),
        code => Err(LbError::Api { code, message }),
    }
}
