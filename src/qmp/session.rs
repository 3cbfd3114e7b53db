//! The session task: sole owner of the QMP connection.
//!
//! Callers submit commands over a channel; the task serialises them into
//! a FIFO stream, keeps at most one command in flight, and correlates
//! responses by order (QMP has no request ids). Asynchronous events are
//! fanned out to the subscriber and matched against the head command's
//! event filter.

use std::collections::VecDeque;
use std::future;
use std::os::unix::io::RawFd;
use std::sync::Arc;

use log::{debug, warn};
use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot, watch, Notify};

use crate::error::{Error, Result};
use crate::qmp::codec::{self, LineCodec, Message, QmpEvent, Response};

/// Completion condition tied to an asynchronous event.
///
/// A command carrying a filter only completes once a successful response
/// *and* a matching event have both arrived, in either order.
pub(crate) struct EventFilter {
    /// Event name to wait for.
    pub(crate) name: String,
    /// Optional `data` key/value the event must carry.
    pub(crate) data_match: Option<(String, Value)>,
}

impl EventFilter {
    fn matches(&self, event: &QmpEvent) -> bool {
        if event.name != self.name {
            return false;
        }
        match &self.data_match {
            Some((key, value)) => {
                event.data.as_ref().and_then(|data| data.get(key)) == Some(value)
            }
            None => true,
        }
    }
}

/// A submitted command, queued until the peer's response finalises it.
pub(crate) struct QmpCommand {
    pub(crate) name: String,
    pub(crate) arguments: Option<Map<String, Value>>,
    /// File descriptor to pass as SCM_RIGHTS alongside the command.
    pub(crate) oob_fd: Option<RawFd>,
    pub(crate) filter: Option<EventFilter>,
    /// Reply sink. The caller dropping its receiver is the cancellation
    /// signal for this command.
    pub(crate) reply: oneshot::Sender<Result<Value>>,
}

/// The head of the queue: written to the peer, response pending.
struct InFlight {
    command: QmpCommand,
    /// A successful response arrived but an event filter is still open.
    response_received: bool,
    /// The saved `return` value while waiting on the event.
    response: Option<Value>,
    /// Caller gave up; the response must still be drained before the
    /// next command may be written.
    cancelled: bool,
}

/// Write queued commands until one is in flight.
///
/// Commands whose caller has already gone away are dropped from the queue
/// interior without ever reaching the peer.
async fn promote(
    codec: &mut LineCodec,
    inflight: &mut Option<InFlight>,
    pending: &mut VecDeque<QmpCommand>,
) -> Result<()> {
    while inflight.is_none() {
        let command = match pending.pop_front() {
            Some(command) => command,
            None => return Ok(()),
        };
        if command.reply.is_closed() {
            debug!("dropping cancelled command '{}' before write", command.name);
            continue;
        }

        let payload = codec::encode_command(&command.name, command.arguments.as_ref())?;
        match command.oob_fd {
            Some(fd) => codec.write_line_with_fd(&payload, fd).await?,
            None => codec.write_line(&payload).await?,
        }

        *inflight = Some(InFlight {
            command,
            response_received: false,
            response: None,
            cancelled: false,
        });
    }

    Ok(())
}

/// Resolves when the head command's caller goes away.
///
/// Pending forever when there is no head, or when the head was already
/// marked cancelled (its response drain is what advances the queue).
async fn head_cancelled(inflight: &mut Option<InFlight>) {
    match inflight {
        Some(head) if !head.cancelled => head.command.reply.closed().await,
        _ => future::pending().await,
    }
}

async fn handle_message(
    message: Message,
    codec: &mut LineCodec,
    inflight: &mut Option<InFlight>,
    pending: &mut VecDeque<QmpCommand>,
    event_tx: &mpsc::UnboundedSender<QmpEvent>,
) -> Result<()> {
    match message {
        Message::Greeting(_) => {
            // The greeting was consumed before the loop started
            warn!("discarding unexpected greeting");
        }
        Message::Event(event) => {
            // Subscriber first, in arrival order. A missing subscriber is fine.
            let _ = event_tx.send(event.clone());

            let completes_head = match inflight {
                Some(head) => match &head.command.filter {
                    Some(filter) => filter.matches(&event),
                    None => false,
                },
                None => false,
            };
            if completes_head {
                let response_received = inflight
                    .as_ref()
                    .map(|head| head.response_received)
                    .unwrap_or(false);
                if response_received {
                    if let Some(head) = inflight.take() {
                        let response = head.response.unwrap_or(Value::Null);
                        let _ = head.command.reply.send(Ok(response));
                    }
                    promote(codec, inflight, pending).await?;
                } else if let Some(head) = inflight.as_mut() {
                    // The response, when it arrives, completes the command
                    head.command.filter = None;
                }
            }
        }
        Message::Response(response) => {
            if inflight.is_none() {
                warn!("discarding response with no queued command: {response:?}");
                return Ok(());
            }

            match response {
                Response::Err(raw) => {
                    debug!("peer error object: {raw}");
                    if let Some(head) = inflight.take() {
                        if !head.cancelled {
                            let desc = codec::error_desc(&raw);
                            let _ = head.command.reply.send(Err(Error::Peer(desc)));
                        }
                    }
                    promote(codec, inflight, pending).await?;
                }
                Response::Ok(value) => {
                    let (cancelled, has_filter) = match inflight.as_ref() {
                        Some(head) => (head.cancelled, head.command.filter.is_some()),
                        None => (false, false),
                    };
                    if cancelled {
                        // Response drained; the queue may advance now
                        inflight.take();
                        promote(codec, inflight, pending).await?;
                    } else if has_filter {
                        if let Some(head) = inflight.as_mut() {
                            head.response_received = true;
                            head.response = Some(value);
                        }
                    } else {
                        if let Some(head) = inflight.take() {
                            let _ = head.command.reply.send(Ok(value));
                        }
                        promote(codec, inflight, pending).await?;
                    }
                }
            }
        }
    }

    Ok(())
}

/// Session main loop. Runs until shutdown, peer disconnect, or a
/// transport error, then drains.
pub(crate) async fn run(
    mut codec: LineCodec,
    mut cmd_rx: mpsc::Receiver<QmpCommand>,
    event_tx: mpsc::UnboundedSender<QmpEvent>,
    disconnect_tx: watch::Sender<bool>,
    shutdown: Arc<Notify>,
) {
    let mut inflight: Option<InFlight> = None;
    let mut pending: VecDeque<QmpCommand> = VecDeque::new();

    let exit: Option<Error> = loop {
        // Callers that gave up while still queued are removed here, from
        // the queue interior; ordering of the rest is untouched.
        pending.retain(|command| !command.reply.is_closed());

        tokio::select! {
            submitted = cmd_rx.recv() => match submitted {
                Some(command) => {
                    pending.push_back(command);
                    if let Err(e) = promote(&mut codec, &mut inflight, &mut pending).await {
                        break Some(e);
                    }
                }
                // All session handles dropped
                None => break None,
            },
            line = codec.read_line() => match line {
                Ok(Some(line)) => {
                    let message = match codec::parse_message(&line) {
                        Ok(message) => message,
                        Err(e) => break Some(e),
                    };
                    if let Err(e) = handle_message(
                        message,
                        &mut codec,
                        &mut inflight,
                        &mut pending,
                        &event_tx,
                    )
                    .await
                    {
                        break Some(e);
                    }
                }
                // Peer closed the connection
                Ok(None) => break None,
                Err(e) => break Some(e),
            },
            _ = head_cancelled(&mut inflight) => {
                let response_received = inflight
                    .as_ref()
                    .map(|head| head.response_received)
                    .unwrap_or(false);
                if response_received {
                    // Response already drained; safe to advance past it
                    inflight.take();
                    if let Err(e) = promote(&mut codec, &mut inflight, &mut pending).await {
                        break Some(e);
                    }
                } else if let Some(head) = inflight.as_mut() {
                    // The peer still owes us a response. It must be
                    // consumed before the next command goes out.
                    head.cancelled = true;
                    head.command.filter = None;
                }
            },
            _ = shutdown.notified() => break None,
        }
    };

    if let Some(e) = exit {
        warn!("QMP session exiting: {e}");
    }

    // Draining: outstanding and late-arriving commands all fail, the
    // event channel closes, and the disconnect signal fires exactly once.
    for command in inflight.take().map(|head| head.command).into_iter().chain(pending.drain(..)) {
        let _ = command.reply.send(Err(Error::LoopExiting));
    }
    cmd_rx.close();
    while let Ok(command) = cmd_rx.try_recv() {
        let _ = command.reply.send(Err(Error::LoopExiting));
    }
    drop(event_tx);
    disconnect_tx.send_replace(true);
}
