//! Marathon REST API source.
//!
//! Backends come from `GET /v2/apps/<app>`; each task contributes its host
//! and first allocated port. Changes are picked up from the `/v2/events`
//! server-sent event stream.

use super::lines::LineBuffer;
use super::DiscoverySource;
use crate::error::DiscoveryError;
use crate::registry::AppDescriptor;
use crate::types::{BackendSet, ChangeEvent, Endpoint};
use async_trait::async_trait;
use futures_util::StreamExt;
use log::{debug, info, warn};
use reqwest::header::ACCEPT;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::mpsc;

/// Task states after which an app's task list may look different.
const RELEVANT_TASK_STATES: [&str; 5] = [
    "TASK_RUNNING",
    "TASK_FINISHED",
    "TASK_FAILED",
    "TASK_KILLED",
    "TASK_LOST",
];

#[derive(Debug, Clone, Default)]
pub struct MarathonOptions {
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub timeout: Duration,
}

pub struct MarathonSource {
    base_url: String,
    auth: Option<(String, String)>,
    /// Client for short requests; carries the request timeout.
    client: Client,
    /// Client for the event stream, which stays open indefinitely.
    stream_client: Client,
}

#[derive(Debug, Deserialize)]
struct AppResponse {
    app: MarathonApp,
}

#[derive(Debug, Deserialize)]
struct MarathonApp {
    #[serde(default)]
    tasks: Vec<MarathonTask>,
}

#[derive(Debug, Deserialize)]
struct MarathonTask {
    host: String,
    #[serde(default)]
    ports: Vec<u16>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusUpdate {
    event_type: String,
    app_id: Option<String>,
    host: Option<String>,
    task_status: Option<String>,
}

impl MarathonSource {
    pub fn new(opts: &MarathonOptions) -> reqwest::Result<Self> {
        let client = Client::builder().timeout(opts.timeout).build()?;
        let stream_client = Client::builder().connect_timeout(opts.timeout).build()?;
        let auth = match (&opts.username, &opts.password) {
            (Some(user), Some(password)) => Some((user.clone(), password.clone())),
            _ => None,
        };

        Ok(Self {
            base_url: opts.url.trim_end_matches('/').to_string(),
            auth,
            client,
            stream_client,
        })
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.auth {
            Some((user, password)) => request.basic_auth(user, Some(password)),
            None => request,
        }
    }
}

/// Marathon app ids are absolute paths; registry names are not.
fn app_id(name: &str) -> String {
    format!("/{}", name.trim_start_matches('/'))
}

#[async_trait]
impl DiscoverySource for MarathonSource {
    async fn resolve(&self, app: &AppDescriptor) -> Result<BackendSet, DiscoveryError> {
        let url = format!("{}/v2/apps{}", self.base_url, app_id(&app.name));
        let response = self
            .authorize(self.client.get(&url))
            .header(ACCEPT, "application/json")
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(DiscoveryError::NotFound(app.name.clone()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DiscoveryError::Unavailable(format!(
                "GET {} returned HTTP {}: {}",
                url, status, body
            )));
        }

        let body: AppResponse = response.json().await?;
        Ok(body
            .app
            .tasks
            .into_iter()
            .filter_map(|task| match task.ports.first() {
                Some(&port) => Some(Endpoint::new(task.host, port)),
                None => {
                    debug!("Task on {} for {} has no ports, skipping", task.host, app.name);
                    None
                }
            })
            .collect())
    }

    async fn watch(
        &self,
        app: &AppDescriptor,
        events: mpsc::Sender<ChangeEvent>,
    ) -> Result<(), DiscoveryError> {
        let url = format!("{}/v2/events", self.base_url);
        let response = self
            .authorize(self.stream_client.get(&url))
            .header(ACCEPT, "text/event-stream")
            .send()
            .await?
            .error_for_status()?;
        info!("Subscribed to Marathon events for app {}", app.name);
        if events.send(ChangeEvent::subscribed(&app.name)).await.is_err() {
            return Ok(());
        }

        let mut lines = LineBuffer::new();
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            for line in lines.push(&chunk?) {
                let Some(change) = classify_line(&app.name, &line) else {
                    continue;
                };
                if events.send(change).await.is_err() {
                    return Ok(());
                }
            }
        }
        Ok(())
    }
}

/// Turns one SSE line into a change event for `app`.
///
/// Returns `None` for non-data lines, events other than
/// `status_update_event`, and updates about other apps.
fn classify_line(app: &str, line: &str) -> Option<ChangeEvent> {
    let data = line.strip_prefix("data:")?.trim();
    let update: StatusUpdate = match serde_json::from_str(data) {
        Ok(update) => update,
        Err(e) => {
            warn!("Ignoring malformed Marathon event: {}", e);
            return None;
        }
    };
    if update.event_type != "status_update_event" {
        return None;
    }
    if update.app_id.as_deref() != Some(app_id(app).as_str()) {
        return None;
    }

    let status = update.task_status.unwrap_or_default();
    let reason = format!(
        "task on {:.12} is {}",
        update.host.unwrap_or_default(),
        status
    );
    if RELEVANT_TASK_STATES.contains(&status.as_str()) {
        Some(ChangeEvent::relevant(app, reason))
    } else {
        Some(ChangeEvent::ignored(app, reason))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn status_line(app_id: &str, status: &str) -> String {
        format!(
            "data: {}",
            json!({
                "eventType": "status_update_event",
                "appId": app_id,
                "host": "agent-1",
                "taskStatus": status,
                "taskId": "web.1234",
            })
        )
    }

    fn source(url: &str) -> MarathonSource {
        MarathonSource::new(&MarathonOptions {
            url: format!("{}/", url),
            username: Some("ops".into()),
            password: Some("secret".into()),
            timeout: Duration::from_secs(5),
        })
        .unwrap()
    }

    #[test]
    fn staging_is_not_relevant_running_is() {
        let staging = classify_line("web", &status_line("/web", "TASK_STAGING")).unwrap();
        assert!(!staging.relevant);

        let running = classify_line("web", &status_line("/web", "TASK_RUNNING")).unwrap();
        assert!(running.relevant);
        assert_eq!(running.app, "web");
    }

    #[test]
    fn other_apps_and_event_types_are_dropped() {
        assert!(classify_line("web", &status_line("/api", "TASK_RUNNING")).is_none());
        assert!(classify_line(
            "web",
            r#"data: {"eventType": "deployment_success", "appId": "/web"}"#
        )
        .is_none());
        assert!(classify_line("web", "event: status_update_event").is_none());
        assert!(classify_line("web", "data: not json").is_none());
    }

    #[tokio::test]
    async fn resolves_first_port_of_each_task() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/apps/web"))
            .and(header("authorization", "Basic b3BzOnNlY3JldA=="))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "app": {"id": "/web", "tasks": [
                    {"host": "10.0.0.1", "ports": [31000, 31001]},
                    {"host": "10.0.0.2", "ports": [31002]},
                    {"host": "10.0.0.3", "ports": []},
                ]}
            })))
            .mount(&server)
            .await;

        let backends = source(&server.uri())
            .resolve(&AppDescriptor::new("web"))
            .await
            .unwrap();
        let expected: BackendSet = [Endpoint::new("10.0.0.1", 31000), Endpoint::new("10.0.0.2", 31002)]
            .into_iter()
            .collect();
        assert_eq!(backends, expected);
    }

    #[tokio::test]
    async fn missing_app_is_not_found_server_error_is_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/apps/gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v2/apps/broken"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let src = source(&server.uri());
        assert!(matches!(
            src.resolve(&AppDescriptor::new("gone")).await,
            Err(DiscoveryError::NotFound(_))
        ));
        assert!(matches!(
            src.resolve(&AppDescriptor::new("broken")).await,
            Err(DiscoveryError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn watch_forwards_events_until_stream_ends() {
        let server = MockServer::start().await;
        let body = format!(
            "event: status_update_event\n{}\n\n{}\n\n{}\n\n",
            status_line("/web", "TASK_STAGING"),
            status_line("/other", "TASK_RUNNING"),
            status_line("/web", "TASK_KILLED"),
        );
        Mock::given(method("GET"))
            .and(path("/v2/events"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(body),
            )
            .mount(&server)
            .await;

        let (tx, mut rx) = mpsc::channel(8);
        source(&server.uri())
            .watch(&AppDescriptor::new("web"), tx)
            .await
            .unwrap();

        assert!(rx.recv().await.unwrap().is_subscription());
        let first = rx.recv().await.unwrap();
        assert!(!first.relevant);
        let second = rx.recv().await.unwrap();
        assert!(second.relevant);
        assert!(rx.recv().await.is_none());
    }
}
