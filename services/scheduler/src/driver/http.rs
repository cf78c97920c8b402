//! HTTP driver for the resource manager's scheduler API.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures_util::stream::{self, StreamExt};
use reqwest::header::{HeaderValue, ACCEPT};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use super::recordio::RecordIoDecoder;
use super::wire;
use super::{ClusterDriver, DriverError, DriverResult, EventStream, ExecutorMessage, FrameworkInfo, SchedulerEvent};
use crate::builder::LaunchGroup;

const SCHEDULER_PATH: &str = "/api/v1/scheduler";
const STREAM_ID_HEADER: &str = "Mesos-Stream-Id";

#[derive(Debug, Default)]
struct Session {
    /// Base URL of the resource manager that accepted the subscription.
    endpoint: Option<String>,
    stream_id: Option<String>,
    framework_id: Option<String>,
}

/// Driver speaking JSON over HTTP, with the event stream framed as RecordIO.
pub struct HttpDriver {
    client: reqwest::Client,
    masters: Vec<String>,
    session: Arc<RwLock<Session>>,
}

impl HttpDriver {
    pub fn new(masters: Vec<String>) -> DriverResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            masters,
            session: Arc::new(RwLock::new(Session::default())),
        })
    }

    /// Framework id assigned by the last SUBSCRIBED event.
    pub fn framework_id(&self) -> Option<String> {
        self.session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .framework_id
            .clone()
    }

    fn target(&self) -> DriverResult<(String, Option<String>, String)> {
        let session = self.session.read().unwrap_or_else(PoisonError::into_inner);
        match (&session.endpoint, &session.framework_id) {
            (Some(endpoint), Some(fid)) => Ok((endpoint.clone(), session.stream_id.clone(), fid.clone())),
            _ => Err(DriverError::NotSubscribed),
        }
    }

    async fn call(&self, build: impl FnOnce(&str) -> DriverResult<Value>) -> DriverResult<()> {
        let (endpoint, stream_id, framework_id) = self.target()?;
        let body = build(&framework_id)?;
        let kind = body["type"].as_str().unwrap_or_default().to_string();

        let mut request = self
            .client
            .post(format!("{endpoint}{SCHEDULER_PATH}"))
            .timeout(Duration::from_secs(30))
            .json(&body);
        if let Some(stream_id) = stream_id {
            request = request.header(STREAM_ID_HEADER, stream_id);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            let code = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            error!(call = %kind, status = code, body = %body, "Scheduler call rejected");
            return Err(DriverError::Status { code, body });
        }

        debug!(call = %kind, "Scheduler call accepted");
        Ok(())
    }
}

#[async_trait]
impl ClusterDriver for HttpDriver {
    async fn subscribe(&self, framework: &FrameworkInfo) -> DriverResult<EventStream> {
        let body = wire::subscribe_call(framework);
        let mut last_error = DriverError::NoMaster;

        for master in &self.masters {
            let master = master.trim_end_matches('/');
            debug!(master = %master, "Subscribing");

            let response = match self
                .client
                .post(format!("{master}{SCHEDULER_PATH}"))
                .header(ACCEPT, HeaderValue::from_static("application/json"))
                .json(&body)
                .send()
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    warn!(master = %master, error = %e, "Resource manager unreachable");
                    last_error = e.into();
                    continue;
                }
            };

            if !response.status().is_success() {
                let code = response.status().as_u16();
                let body = response.text().await.unwrap_or_default();
                warn!(master = %master, status = code, body = %body, "Subscription refused");
                last_error = DriverError::Status { code, body };
                continue;
            }

            // Redirects to the leading master are followed by the client.
            let endpoint = {
                let url = response.url();
                let mut base = format!("{}://{}", url.scheme(), url.host_str().unwrap_or_default());
                if let Some(port) = url.port() {
                    base.push_str(&format!(":{port}"));
                }
                base
            };
            let stream_id = response
                .headers()
                .get(STREAM_ID_HEADER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);

            {
                let mut session = self.session.write().unwrap_or_else(PoisonError::into_inner);
                session.endpoint = Some(endpoint.clone());
                session.stream_id = stream_id;
                session.framework_id = framework.id.clone();
            }
            info!(endpoint = %endpoint, "Subscribed to resource manager");

            return Ok(event_stream(response, self.session.clone()));
        }

        Err(last_error)
    }

    async fn launch(&self, group: &LaunchGroup) -> DriverResult<()> {
        self.call(|fid| wire::accept_call(fid, group)).await
    }

    async fn decline(&self, offer_ids: &[String], refuse: Duration) -> DriverResult<()> {
        if offer_ids.is_empty() {
            return Ok(());
        }
        self.call(|fid| Ok(wire::decline_call(fid, offer_ids, refuse))).await
    }

    async fn shutdown(&self, agent_id: &str, executor_id: &str) -> DriverResult<()> {
        self.call(|fid| Ok(wire::shutdown_call(fid, agent_id, executor_id)))
            .await
    }

    async fn acknowledge(&self, agent_id: &str, task_id: &str, uuid: &str) -> DriverResult<()> {
        self.call(|fid| Ok(wire::acknowledge_call(fid, agent_id, task_id, uuid)))
            .await
    }

    async fn message(&self, agent_id: &str, executor_id: &str, message: &ExecutorMessage) -> DriverResult<()> {
        self.call(|fid| wire::message_call(fid, agent_id, executor_id, message))
            .await
    }

    async fn reconcile(&self, tasks: &[(String, String)]) -> DriverResult<()> {
        self.call(|fid| Ok(wire::reconcile_call(fid, tasks))).await
    }
}

/// Turns the chunked response body into decoded events.
fn event_stream(response: reqwest::Response, session: Arc<RwLock<Session>>) -> EventStream {
    let state = (response.bytes_stream().boxed(), RecordIoDecoder::new(), false);

    stream::unfold(state, move |(mut body, mut decoder, done)| {
        let session = session.clone();
        async move {
            if done {
                return None;
            }
            loop {
                match decoder.next_record() {
                    Ok(Some(record)) => match wire::decode_event(&record, Utc::now()) {
                        Ok(Some(event)) => {
                            if let SchedulerEvent::Subscribed { framework_id, .. } = &event {
                                session
                                    .write()
                                    .unwrap_or_else(PoisonError::into_inner)
                                    .framework_id = Some(framework_id.clone());
                            }
                            return Some((Ok(event), (body, decoder, false)));
                        }
                        Ok(None) => continue,
                        Err(e) => {
                            warn!(error = %e, "Skipping undecodable event");
                            continue;
                        }
                    },
                    Ok(None) => {}
                    Err(e) => return Some((Err(e), (body, decoder, true))),
                }

                match body.next().await {
                    Some(Ok(chunk)) => decoder.push(&chunk),
                    Some(Err(e)) => return Some((Err(e.into()), (body, decoder, true))),
                    None => return Some((Err(DriverError::StreamClosed), (body, decoder, true))),
                }
            }
        }
    })
    .boxed()
}
