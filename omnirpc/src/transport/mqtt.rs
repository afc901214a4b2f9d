use std::{
    sync::{Arc, OnceLock},
    time::Duration,
};

use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use serde::Serialize;

use super::{Transport, TransportOptions, TransportSink};
use crate::{
    OutgoingPacket, TaskSupervisor,
    error::{Error, ErrorKind, Result},
    packet::CODE_BAD_REQUEST,
};

const DEFAULT_PORT: u16 = 1883;
const REQUEST_QUEUE_SIZE: usize = 64;
const SEND_FAILED: &str = "Unable to send packet via MQTT.";

/// Request envelope as published: the plain packet plus the topic prefix the
/// device should answer on.
#[derive(Serialize)]
struct MqttRequest<'a> {
    #[serde(flatten)]
    packet: &'a OutgoingPacket,
    src: &'a str,
}

/// Publishes requests on `<device>/rpc` and listens for responses on
/// `<client_id>/rpc`, where `<device>` is the path of the address.
pub struct MqttTransport {
    client: AsyncClient,
    eventloop: Mutex<Option<EventLoop>>,
    client_id: String,
    request_topic: String,
    response_topic: String,
    reconnect_period: Duration,
    sink: OnceLock<TransportSink>,
    task_supervisor: TaskSupervisor,
}

impl MqttTransport {
    /// # Errors
    ///
    /// Returns `ErrorKind::InvalidAddress` when the URL has no host.
    pub fn new(url: &url::Url, options: &TransportOptions) -> Result<Self> {
        let host = url
            .host_str()
            .ok_or_else(|| Error::new(ErrorKind::InvalidAddress, format!("missing host: {url}")))?;
        let port = url.port().unwrap_or(DEFAULT_PORT);
        let device = url.path().trim_start_matches('/');
        let client_id = options
            .client_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let mut mqtt_options = MqttOptions::new(client_id.clone(), host, port);
        mqtt_options.set_keep_alive(options.keep_alive);
        let (client, eventloop) = AsyncClient::new(mqtt_options, REQUEST_QUEUE_SIZE);

        Ok(Self {
            client,
            eventloop: Mutex::new(Some(eventloop)),
            request_topic: format!("{device}/rpc"),
            response_topic: format!("{client_id}/rpc"),
            client_id,
            reconnect_period: options.reconnect_period,
            sink: OnceLock::new(),
            task_supervisor: TaskSupervisor::default(),
        })
    }

    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    #[must_use]
    pub fn request_topic(&self) -> &str {
        &self.request_topic
    }

    #[must_use]
    pub fn response_topic(&self) -> &str {
        &self.response_topic
    }

    fn encode(&self, packet: &OutgoingPacket) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&MqttRequest {
            packet,
            src: &self.client_id,
        })?)
    }

    async fn start_event_loop(
        mut eventloop: EventLoop,
        client: AsyncClient,
        response_topic: Arc<str>,
        reconnect_period: Duration,
        sink: TransportSink,
    ) {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    // clean sessions forget subscriptions, renew them on every connect.
                    if let Err(e) = client.try_subscribe(&*response_topic, QoS::AtLeastOnce) {
                        sink.error(Error::new(ErrorKind::MqttSubscribeFailed, e.to_string()));
                    }
                    sink.debug(format!("subscribed to {response_topic}"));
                    sink.open();
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    if publish.topic == *response_topic {
                        sink.deliver(&publish.payload);
                    } else {
                        tracing::debug!("ignore message on topic {}", publish.topic);
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    sink.error(Error::new(ErrorKind::MqttConnectionFailed, e.to_string()));
                    sink.close(None, e.to_string());
                    if sink.is_closed() {
                        return;
                    }
                    sink.debug(format!("reconnecting in {reconnect_period:?}"));
                    tokio::time::sleep(reconnect_period).await;
                }
            }
        }
    }
}

impl Transport for MqttTransport {
    fn start(&self, sink: TransportSink) {
        let Some(eventloop) = self.eventloop.lock().take() else {
            tracing::warn!("mqtt transport already started");
            return;
        };
        let _ = self.sink.set(sink.clone());
        self.task_supervisor.spawn(Self::start_event_loop(
            eventloop,
            self.client.clone(),
            Arc::from(self.response_topic.as_str()),
            self.reconnect_period,
            sink,
        ));
    }

    fn send(&self, packet: OutgoingPacket) {
        let Some(sink) = self.sink.get() else {
            tracing::error!("mqtt transport used before start, drop request {}", packet.id);
            return;
        };

        let payload = match self.encode(&packet) {
            Ok(payload) => payload,
            Err(e) => {
                sink.fail(&packet, CODE_BAD_REQUEST, &e.msg);
                return;
            }
        };

        if let Err(e) = self
            .client
            .try_publish(self.request_topic.as_str(), QoS::ExactlyOnce, false, payload)
        {
            sink.error(Error::new(ErrorKind::MqttPublishFailed, e.to_string()));
            sink.fail(&packet, CODE_BAD_REQUEST, SEND_FAILED);
        }
    }
}

impl std::fmt::Debug for MqttTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttTransport")
            .field("client_id", &self.client_id)
            .field("request_topic", &self.request_topic)
            .field("response_topic", &self.response_topic)
            .finish()
    }
}
