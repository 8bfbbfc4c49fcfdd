//! MQTT sink built on the blocking rumqttc client.
//!
//! Publishes use QoS 1. A background thread drives the connection and forwards
//! connection acknowledgements, publish acknowledgements and errors over a channel;
//! a publish is confirmed once one PubAck per message arrived before the deadline.
//! Requests are queued without blocking: while the broker is down the queue fills
//! and further publishes fail immediately.

use crate::retry::Attempt;
use crate::sinks::{BusMessage, MessageBusSink, SinkError};
use log::{debug, info, warn};
use rumqttc::{Client, Connection, Event, MqttOptions, Packet, QoS};
use std::sync::Mutex;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::Duration;

const KEEP_ALIVE: Duration = Duration::from_secs(30);
const REQUEST_CHANNEL_CAPACITY: usize = 64;
const RECONNECT_PAUSE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub topic_root: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum LinkEvent {
    Connected,
    Acked,
    Failed(String),
}

struct Link {
    client: Client,
    events: Receiver<LinkEvent>,
}

pub struct MqttSink {
    link: Mutex<Link>,
}

fn drive_connection(mut connection: Connection, events: Sender<LinkEvent>) {
    for notification in connection.iter() {
        let event = match notification {
            Ok(Event::Incoming(Packet::ConnAck(_))) => Some(LinkEvent::Connected),
            Ok(Event::Incoming(Packet::PubAck(_))) => Some(LinkEvent::Acked),
            Ok(_) => None,
            Err(e) => Some(LinkEvent::Failed(e.to_string())),
        };
        let failed = matches!(event, Some(LinkEvent::Failed(_)));
        if let Some(event) = event
            && events.send(event).is_err()
        {
            // sink dropped
            break;
        }
        if failed {
            // the next iteration reconnects
            thread::sleep(RECONNECT_PAUSE);
        }
    }
    debug!("MQTT event loop stopped");
}

impl MqttSink {
    /// Connects and waits for the broker's acknowledgement; failure here is a
    /// startup precondition failure.
    pub fn connect(settings: &MqttSettings) -> Result<Self, String> {
        let sink = Self::start(settings)?;
        let link = sink
            .link
            .lock()
            .map_err(|_| "MQTT link mutex poisoned".to_string())?;
        match link.events.recv_timeout(settings.timeout) {
            Ok(LinkEvent::Connected) => {
                info!("Connected to MQTT broker {}:{}", settings.host, settings.port);
            }
            Ok(LinkEvent::Failed(e)) => {
                return Err(format!(
                    "MQTT connection to {}:{} failed: {}",
                    settings.host, settings.port, e
                ));
            }
            Ok(LinkEvent::Acked) | Err(RecvTimeoutError::Timeout) => {
                return Err(format!(
                    "MQTT broker {}:{} did not acknowledge the connection within {}s",
                    settings.host,
                    settings.port,
                    settings.timeout.as_secs()
                ));
            }
            Err(RecvTimeoutError::Disconnected) => return Err("MQTT event loop stopped".to_string()),
        }
        drop(link);
        Ok(sink)
    }

    /// Spawns the event loop without waiting for the broker.
    fn start(settings: &MqttSettings) -> Result<Self, String> {
        // brokers drop the older session when two clients share an id
        let client_id = format!("{}-{:04x}", settings.client_id, rand::random::<u16>());
        debug!("MQTT client id {}", client_id);
        let mut options = MqttOptions::new(client_id, settings.host.clone(), settings.port);
        options.set_keep_alive(KEEP_ALIVE);
        if let (Some(username), Some(password)) = (&settings.username, &settings.password) {
            options.set_credentials(username.clone(), password.clone());
        }

        let (client, connection) = Client::new(options, REQUEST_CHANNEL_CAPACITY);
        let (tx, rx) = mpsc::channel();
        thread::Builder::new()
            .name("mqtt-eventloop".to_string())
            .spawn(move || drive_connection(connection, tx))
            .map_err(|e| format!("spawning MQTT event loop failed: {}", e))?;

        Ok(MqttSink {
            link: Mutex::new(Link { client, events: rx }),
        })
    }
}

impl MessageBusSink for MqttSink {
    fn name(&self) -> &str {
        "mqtt"
    }

    fn publish(&self, messages: &[BusMessage], attempt: Attempt) -> Result<(), SinkError> {
        if messages.is_empty() {
            return Ok(());
        }

        let link = self
            .link
            .lock()
            .map_err(|_| SinkError::Connection("MQTT link mutex poisoned".to_string()))?;

        // leftovers from an earlier attempt that timed out
        let mut stale = 0;
        while link.events.try_recv().is_ok() {
            stale += 1;
        }
        if stale > 0 {
            debug!("Discarded {} stale MQTT event(s)", stale);
        }

        for (queued, message) in messages.iter().enumerate() {
            link.client
                .try_publish(message.topic.clone(), QoS::AtLeastOnce, false, message.payload.clone())
                .map_err(|e| {
                    SinkError::Connection(format!(
                        "MQTT request queue rejected '{}' after {} of {} message(s): {}",
                        message.topic,
                        queued,
                        messages.len(),
                        e
                    ))
                })?;
        }

        let mut pending = messages.len();
        while pending > 0 {
            if attempt.expired() {
                return Err(SinkError::Timeout(format!(
                    "{} of {} MQTT publish(es) unacknowledged",
                    pending,
                    messages.len()
                )));
            }
            match link.events.recv_timeout(attempt.remaining()) {
                Ok(LinkEvent::Acked) => pending -= 1,
                Ok(LinkEvent::Connected) => debug!("MQTT connection re-established"),
                Ok(LinkEvent::Failed(e)) => {
                    warn!("MQTT connection error: {}", e);
                    return Err(SinkError::Connection(e));
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(SinkError::Connection("MQTT event loop stopped".to_string()));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Instant;

    fn unreachable() -> MqttSettings {
        MqttSettings {
            host: "127.0.0.1".to_string(),
            port: 1,
            client_id: "ecobee-timescale-test".to_string(),
            username: None,
            password: None,
            topic_root: "ecobee".to_string(),
            timeout: Duration::from_secs(2),
        }
    }

    #[test]
    fn unreachable_broker_fails_at_startup() {
        let err = MqttSink::connect(&unreachable()).err().expect("connect must fail");
        assert!(err.contains("127.0.0.1:1"), "{}", err);
    }

    #[test]
    fn publish_to_a_down_broker_returns_within_the_attempt() {
        let sink = MqttSink::start(&unreachable()).unwrap();
        let messages: Vec<BusMessage> = (0..REQUEST_CHANNEL_CAPACITY * 2)
            .map(|i| BusMessage {
                topic: format!("ecobee/1/runtime/field_{}", i),
                payload: i.to_string(),
            })
            .collect();

        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let attempt = Attempt {
                number: 1,
                deadline: Instant::now() + Duration::from_secs(2),
            };
            let _ = tx.send(sink.publish(&messages, attempt));
        });

        let result = rx
            .recv_timeout(Duration::from_secs(10))
            .expect("publish blocked past its attempt deadline");
        assert!(result.is_err());
    }
}
