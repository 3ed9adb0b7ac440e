use async_trait::async_trait;
use edgeguard_common::{RecordingControl, SegmentEvent};
use serde::Serialize;
use std::{sync::Mutex, thread::JoinHandle};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use zmq::{Context, Socket, PUB, SUB};

use super::{ControlPublisher, TOPIC_RECORDING_OUTPUT, TOPIC_RECORDING_SEGMENTS};
use crate::{
    config::MessagingConfig,
    error::{NodeError, Result},
};

/// Bind for wildcard endpoints, connect otherwise.
fn attach(socket: &Socket, endpoint: &str) -> Result<()> {
    if endpoint.starts_with("tcp://*:") {
        socket.bind(endpoint)?;
    } else {
        socket.connect(endpoint)?;
    }
    Ok(())
}

fn encode_frames<T: Serialize>(topic: &str, message: &T) -> Result<[Vec<u8>; 2]> {
    Ok([topic.as_bytes().to_vec(), serde_json::to_vec(message)?])
}

/// `[topic, payload]` from a received multipart message.
fn split_frames(mut frames: Vec<Vec<u8>>) -> Result<(String, Vec<u8>)> {
    if frames.len() != 2 {
        return Err(NodeError::MessagingError(format!(
            "expected 2 frames, got {}",
            frames.len()
        )));
    }

    let payload = frames.pop().unwrap_or_default();
    let topic = frames.pop().unwrap_or_default();
    let topic = String::from_utf8(topic)
        .map_err(|e| NodeError::MessagingError(format!("topic is not UTF-8: {}", e)))?;

    Ok((topic, payload))
}

pub struct ZmqPublisher {
    socket: Mutex<Socket>,
}

impl ZmqPublisher {
    pub fn new(context: &Context, config: &MessagingConfig) -> Result<Self> {
        info!("Initializing ZeroMQ publisher on {}", config.pub_endpoint);

        let socket = context.socket(PUB)?;
        socket.set_sndhwm(config.high_water_mark)?;
        socket.set_sndtimeo(config.send_timeout_ms)?;
        attach(&socket, &config.pub_endpoint)?;

        Ok(Self {
            socket: Mutex::new(socket),
        })
    }

    fn send<T: Serialize>(&self, topic: &str, message: &T) -> Result<()> {
        let frames = encode_frames(topic, message)?;
        let socket = self.socket.lock().unwrap_or_else(|e| e.into_inner());
        socket.send_multipart(frames, 0)?;
        Ok(())
    }
}

#[async_trait]
impl ControlPublisher for ZmqPublisher {
    #[instrument(skip(self, control), level = "debug")]
    async fn publish_recording_control(&self, control: &RecordingControl) -> Result<()> {
        self.send(TOPIC_RECORDING_OUTPUT, control)
    }

    #[instrument(skip(self, event), level = "debug")]
    async fn publish_segment_event(&self, event: &SegmentEvent) -> Result<()> {
        self.send(TOPIC_RECORDING_SEGMENTS, event)
    }
}

/// Receives `[topic, payload]` messages on a dedicated thread and forwards
/// them to the async side until cancelled or the receiver goes away.
pub struct ZmqSubscriber {
    handle: JoinHandle<()>,
}

impl ZmqSubscriber {
    pub fn spawn(
        context: &Context,
        config: &MessagingConfig,
        sender: mpsc::Sender<(String, Vec<u8>)>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        info!("Subscribing to {}", config.sub_endpoint);

        let socket = context.socket(SUB)?;
        socket.set_subscribe(b"")?;
        socket.set_rcvtimeo(config.receive_poll_ms as i32)?;
        attach(&socket, &config.sub_endpoint)?;

        let handle = std::thread::Builder::new()
            .name("zmq-subscriber".to_string())
            .spawn(move || receive_loop(socket, sender, cancel))?;

        Ok(Self { handle })
    }

    pub fn join(self) {
        if self.handle.join().is_err() {
            error!("ZeroMQ subscriber thread panicked");
        }
    }
}

fn receive_loop(socket: Socket, sender: mpsc::Sender<(String, Vec<u8>)>, cancel: CancellationToken) {
    while !cancel.is_cancelled() {
        let frames = match socket.recv_multipart(0) {
            Ok(frames) => frames,
            Err(zmq::Error::EAGAIN) => continue,
            Err(e) => {
                error!("ZeroMQ receive failed: {}", e);
                continue;
            }
        };

        let message = match split_frames(frames) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping inbound message: {}", e);
                continue;
            }
        };

        debug!("Received message on topic {}", message.0);
        if sender.blocking_send(message).is_err() {
            debug!("Inbound channel closed");
            break;
        }
    }

    info!("ZeroMQ subscriber stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frames_carry_topic_and_json() {
        let frames = encode_frames(TOPIC_RECORDING_OUTPUT, &RecordingControl::single("P1", false)).unwrap();
        assert_eq!(frames[0], b"recordingOutput".to_vec());
        let decoded: RecordingControl = serde_json::from_slice(&frames[1]).unwrap();
        assert_eq!(decoded, RecordingControl::single("P1", false));
    }

    #[test]
    fn test_split_frames() {
        let (topic, payload) = split_frames(vec![b"inference".to_vec(), b"{}".to_vec()]).unwrap();
        assert_eq!(topic, "inference");
        assert_eq!(payload, b"{}".to_vec());

        assert!(split_frames(vec![b"inference".to_vec()]).is_err());
        assert!(split_frames(vec![vec![0xff, 0xfe], b"{}".to_vec()]).is_err());
    }
}
