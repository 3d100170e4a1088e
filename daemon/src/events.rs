/*
Copyright 2022 The Kuasar Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

use std::sync::Arc;

use futures::StreamExt;
use log::{debug, error};
use podshim_common::{
    api::{
        containerd::{
            events::{
                ContainerCreate, ContainerDelete, TaskExit, TaskStart, CONTAINER_CREATE,
                CONTAINER_DELETE, TASK_EXIT, TASK_START,
            },
            type_name, Envelope,
        },
        shim::Event,
    },
    error::{Error, Result},
    signal::ExitSignal,
};
use prost::Message;
use tokio::sync::mpsc::{channel, Receiver};

use crate::client::EventService;

const EVENT_CHANNEL_SIZE: usize = 128;

/// Maps a containerd envelope to a container or task event. Other event
/// types map to `None`.
fn to_event(envelope: &Envelope) -> Result<Option<Event>> {
    let any = match &envelope.event {
        Some(a) => a,
        None => return Ok(None),
    };
    let decode_err =
        |e: prost::DecodeError| Error::InvalidArgument(format!("failed to decode {}: {}", any.type_url, e));
    let event = match type_name(any) {
        CONTAINER_CREATE => {
            let e = ContainerCreate::decode(any.value.as_slice()).map_err(decode_err)?;
            Event {
                id: e.id,
                name: "container.create".to_string(),
            }
        }
        CONTAINER_DELETE => {
            let e = ContainerDelete::decode(any.value.as_slice()).map_err(decode_err)?;
            Event {
                id: e.id,
                name: "container.delete".to_string(),
            }
        }
        TASK_START => {
            let e = TaskStart::decode(any.value.as_slice()).map_err(decode_err)?;
            Event {
                id: format!("{}/{}", e.container_id, e.pid),
                name: "task.start".to_string(),
            }
        }
        TASK_EXIT => {
            let e = TaskExit::decode(any.value.as_slice()).map_err(decode_err)?;
            Event {
                id: format!("{}/{}", e.container_id, e.pid),
                name: "task.exit".to_string(),
            }
        }
        _ => return Ok(None),
    };
    Ok(Some(event))
}

/// Streams container and task events of every namespace. The stream ends
/// when the subscription breaks or an event cannot be decoded.
pub async fn subscribe(
    events: Arc<dyn EventService>,
    exit: Arc<ExitSignal>,
) -> Result<Receiver<Event>> {
    let mut stream = events.subscribe(vec![]).await?;
    let (tx, rx) = channel(EVENT_CHANNEL_SIZE);
    tokio::spawn(async move {
        loop {
            let envelope = tokio::select! {
                e = stream.next() => e,
                _ = exit.wait() => return,
                _ = tx.closed() => return,
            };
            let envelope = match envelope {
                Some(Ok(e)) => e,
                Some(Err(e)) => {
                    error!("event subscription broken: {}", e);
                    return;
                }
                None => return,
            };
            match to_event(&envelope) {
                Ok(Some(event)) => {
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
                Ok(None) => debug!("skipping event {}", envelope.topic),
                Err(e) => {
                    error!("failed to unmarshal event: {}", e);
                    return;
                }
            }
        }
    });
    Ok(rx)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use podshim_common::{
        api::{
            containerd::{
                events::{ContainerCreate, ImageCreate, TaskExit, TaskStart, IMAGE_CREATE},
                Envelope,
            },
            shim::Event,
        },
        signal::ExitSignal,
    };
    use prost::Message;
    use prost_types::Any;

    use super::subscribe;
    use crate::client::fake::Fakes;

    fn envelope<M: Message>(type_url: &str, msg: &M) -> Envelope {
        Envelope {
            namespace: "k8s.io".to_string(),
            topic: "/test".to_string(),
            event: Some(Any {
                type_url: type_url.to_string(),
                value: msg.encode_to_vec(),
            }),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_subscribe() {
        let fakes = Fakes::default();
        let sender = fakes.events.push_sender();
        let mut rx = subscribe(fakes.backend().events, Arc::new(ExitSignal::default()))
            .await
            .unwrap();

        sender
            .send(Ok(envelope(
                "containerd.events.ContainerCreate",
                &ContainerCreate {
                    id: "c1".to_string(),
                    image: "busybox".to_string(),
                },
            )))
            .unwrap();
        sender
            .send(Ok(envelope(IMAGE_CREATE, &ImageCreate::default())))
            .unwrap();
        sender
            .send(Ok(envelope(
                "type.googleapis.com/containerd.events.TaskStart",
                &TaskStart {
                    container_id: "c1".to_string(),
                    pid: 42,
                },
            )))
            .unwrap();
        sender
            .send(Ok(envelope(
                "containerd.events.TaskExit",
                &TaskExit {
                    container_id: "c1".to_string(),
                    id: "c1".to_string(),
                    pid: 42,
                    exit_status: 0,
                    exited_at: None,
                },
            )))
            .unwrap();
        drop(sender);

        let mut got = vec![];
        while let Some(event) = rx.recv().await {
            got.push(event);
        }
        let event = |id: &str, name: &str| Event {
            id: id.to_string(),
            name: name.to_string(),
        };
        assert_eq!(
            got,
            vec![
                event("c1", "container.create"),
                event("c1/42", "task.start"),
                event("c1/42", "task.exit"),
            ]
        );
        assert_eq!(fakes.events.subscriptions(), vec![Vec::<String>::new()]);
    }

    #[tokio::test]
    async fn test_undecodable_event_ends_stream() {
        let fakes = Fakes::default();
        let sender = fakes.events.push_sender();
        let mut rx = subscribe(fakes.backend().events, Arc::new(ExitSignal::default()))
            .await
            .unwrap();

        let mut broken = envelope("containerd.events.ContainerDelete", &ContainerCreate::default());
        if let Some(any) = broken.event.as_mut() {
            any.value = b"\xff\xff".to_vec();
        }
        sender.send(Ok(broken)).unwrap();
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_subscribe_unavailable() {
        let fakes = Fakes::default();
        assert!(
            subscribe(fakes.backend().events, Arc::new(ExitSignal::default()))
                .await
                .is_err()
        );
    }
}
