//! Live dual-stream monitor.
//!
//! One task per link owns its port, read buffer and codec. Decoded frames are
//! handed to a single event-loop task over a channel; only that task touches
//! the [`Correlator`]. Writes injected through the [`MonitorHandle`] go to the
//! link task of the chosen direction, which flushes before replying.

use crate::codec::{DecodeOutcome, FrameCodec};
use crate::config::MonitorConfig;
use crate::correlator::{Correlator, MonitorEvent, MonitorSnapshot};
use crate::error::HaierError;
use crate::frame::{Direction, Frame};
use crate::serial::{Connect, SerialConnector, connect_with_retry};
use bytes::{Bytes, BytesMut};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How long an injected frame may take to reach the port
const WRITE_TIMEOUT: Duration = Duration::from_secs(2);

/// What a link task reports to the event loop
#[derive(Debug)]
enum LinkMessage {
    Decoded {
        direction: Direction,
        raw_timestamp: i64,
        outcome: DecodeOutcome,
    },
    Down {
        direction: Direction,
        error: String,
    },
    Restored {
        direction: Direction,
    },
    Failed {
        direction: Direction,
        error: String,
    },
}

#[derive(Debug)]
struct WriteRequest {
    frame: Frame,
    reply: oneshot::Sender<Result<Bytes, HaierError>>,
}

/// Control surface of a running monitor
#[derive(Debug)]
pub struct MonitorHandle {
    outbound_writes: mpsc::Sender<WriteRequest>,
    inbound_writes: mpsc::Sender<WriteRequest>,
    stop: watch::Sender<bool>,
    snapshot: watch::Receiver<MonitorSnapshot>,
    event_loop: JoinHandle<MonitorSnapshot>,
}

impl MonitorHandle {
    /// Encode `frame` and write it to the port carrying `direction` traffic.
    /// Returns the bytes written once they are flushed.
    pub async fn send(&self, direction: Direction, frame: Frame) -> Result<Bytes, HaierError> {
        let writes = match direction {
            Direction::Outbound => &self.outbound_writes,
            Direction::Inbound => &self.inbound_writes,
        };
        let (reply, response) = oneshot::channel();
        writes
            .send(WriteRequest { frame, reply })
            .await
            .map_err(|_| HaierError::ChannelClosed)?;
        response.await.map_err(|_| HaierError::LinkClosed)?
    }

    pub fn snapshot(&self) -> MonitorSnapshot {
        *self.snapshot.borrow()
    }

    /// Watch channel updated after every processed message
    pub fn subscribe(&self) -> watch::Receiver<MonitorSnapshot> {
        self.snapshot.clone()
    }

    /// Ask both links to close and wait for the event loop to drain
    pub async fn stop(self) -> Result<MonitorSnapshot, HaierError> {
        self.stop.send_replace(true);
        self.wait().await
    }

    /// Wait until both links have closed on their own
    pub async fn wait(self) -> Result<MonitorSnapshot, HaierError> {
        // links treat a dropped stop sender as a stop request
        let MonitorHandle { stop, event_loop, .. } = self;
        let last = event_loop.await.map_err(|e| HaierError::Io(std::io::Error::other(e)));
        drop(stop);
        last
    }
}

pub struct DualStreamMonitor;

impl DualStreamMonitor {
    /// Validate the configuration, open both serial ports and start
    /// monitoring. Nothing is spawned unless both ports open.
    pub async fn start(
        config: MonitorConfig,
    ) -> Result<(MonitorHandle, mpsc::UnboundedReceiver<MonitorEvent>), HaierError> {
        config.validate()?;
        let outbound = SerialConnector::new(config.outbound.clone())?;
        let inbound = SerialConnector::new(config.inbound.clone())?;
        Self::start_with(outbound, inbound, config).await
    }

    /// Start over arbitrary connectors. Only the correlation part of the
    /// configuration is checked.
    pub async fn start_with<O, I>(
        mut outbound: O,
        mut inbound: I,
        config: MonitorConfig,
    ) -> Result<(MonitorHandle, mpsc::UnboundedReceiver<MonitorEvent>), HaierError>
    where
        O: Connect,
        I: Connect,
    {
        config.validate_correlation()?;
        let outbound_stream = connect_with_retry(&mut outbound).await?;
        let inbound_stream = connect_with_retry(&mut inbound).await?;
        info!(
            outbound = outbound.port_name(),
            inbound = inbound.port_name(),
            "Monitoring both streams"
        );

        let (link_tx, link_rx) = mpsc::channel(config.channel_capacity);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = watch::channel(false);
        let (snapshot_tx, snapshot_rx) = watch::channel(MonitorSnapshot::default());
        let (outbound_writes, outbound_write_rx) = mpsc::channel(8);
        let (inbound_writes, inbound_write_rx) = mpsc::channel(8);

        tokio::spawn(run_link(LinkTask {
            connector: outbound,
            stream: outbound_stream,
            direction: Direction::Outbound,
            links: link_tx.clone(),
            writes: outbound_write_rx,
            stop: stop_rx.clone(),
        }));
        tokio::spawn(run_link(LinkTask {
            connector: inbound,
            stream: inbound_stream,
            direction: Direction::Inbound,
            links: link_tx,
            writes: inbound_write_rx,
            stop: stop_rx,
        }));
        let event_loop = tokio::spawn(run_event_loop(Correlator::new(config), link_rx, event_tx, snapshot_tx));

        Ok((
            MonitorHandle {
                outbound_writes,
                inbound_writes,
                stop: stop_tx,
                snapshot: snapshot_rx,
                event_loop,
            },
            event_rx,
        ))
    }
}

async fn run_event_loop(
    mut correlator: Correlator,
    mut links: mpsc::Receiver<LinkMessage>,
    events: mpsc::UnboundedSender<MonitorEvent>,
    snapshot: watch::Sender<MonitorSnapshot>,
) -> MonitorSnapshot {
    // ends once both link tasks have dropped their senders
    while let Some(message) = links.recv().await {
        let produced = match message {
            LinkMessage::Decoded {
                direction,
                raw_timestamp,
                outcome,
            } => match outcome {
                DecodeOutcome::Frame(frame) => correlator.observe_frame(direction, raw_timestamp, frame),
                DecodeOutcome::Resync { discarded, reason } => {
                    correlator.observe_resync(direction, discarded, reason)
                }
                DecodeOutcome::NeedMoreBytes => Vec::new(),
            },
            LinkMessage::Down { direction, error } => vec![MonitorEvent::LinkDown { direction, error }],
            LinkMessage::Restored { direction } => vec![MonitorEvent::LinkRestored { direction }],
            LinkMessage::Failed { direction, error } => vec![MonitorEvent::LinkFailed { direction, error }],
        };
        for event in produced {
            // a consumer that went away does not stop correlation
            let _ = events.send(event);
        }
        snapshot.send_replace(correlator.snapshot());
    }

    for event in correlator.finish() {
        let _ = events.send(event);
    }
    let last = correlator.snapshot();
    snapshot.send_replace(last);
    info!(
        frames = last.stats.frames(),
        paired = last.stats.paired,
        unpaired = last.stats.unpaired,
        sessions = last.stats.sessions,
        "Monitor stopped"
    );
    last
}

struct LinkTask<C: Connect> {
    connector: C,
    stream: C::Stream,
    direction: Direction,
    links: mpsc::Sender<LinkMessage>,
    writes: mpsc::Receiver<WriteRequest>,
    stop: watch::Receiver<bool>,
}

enum LinkExit {
    Stopped,
    Broken(HaierError),
}

async fn run_link<C: Connect>(task: LinkTask<C>) {
    let LinkTask {
        mut connector,
        mut stream,
        direction,
        links,
        mut writes,
        mut stop,
    } = task;
    let mut codec = FrameCodec::default();
    let mut buf = BytesMut::with_capacity(1024);

    loop {
        let exit = pump(&mut stream, &mut buf, &mut codec, direction, &links, &mut writes, &mut stop).await;
        // bytes of a frame cut short are reported, not lost
        let drained = forward(&links, direction, codec.decode_available(&mut buf, true)).await;
        buf.clear();
        let exit = match (exit, drained) {
            (LinkExit::Broken(_), Err(e)) => LinkExit::Broken(e),
            (exit, _) => exit,
        };

        let error = match exit {
            LinkExit::Stopped => {
                info!(%direction, port = connector.port_name(), "Link closed");
                return;
            }
            LinkExit::Broken(error) => error,
        };
        if !error.is_transport() {
            error!(%direction, port = connector.port_name(), %error, "Link abandoned");
            let _ = links
                .send(LinkMessage::Failed {
                    direction,
                    error: error.to_string(),
                })
                .await;
            return;
        }
        error!(%direction, port = connector.port_name(), %error, "Link failed");
        let _ = links
            .send(LinkMessage::Down {
                direction,
                error: error.to_string(),
            })
            .await;

        tokio::select! {
            reopened = connect_with_retry(&mut connector) => match reopened {
                Ok(next) => {
                    stream = next;
                    let _ = links.send(LinkMessage::Restored { direction }).await;
                }
                Err(e) => {
                    let _ = links
                        .send(LinkMessage::Failed {
                            direction,
                            error: e.to_string(),
                        })
                        .await;
                    return;
                }
            },
            _ = stop_requested(&mut stop) => return,
        }
    }
}

/// Resolves once a stop is requested or the handle is gone. The `watch::Ref`
/// is released before returning.
async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stopped| *stopped).await.map(|_| ());
}

/// Read and write until the link breaks or a stop is requested
async fn pump<S>(
    stream: &mut S,
    buf: &mut BytesMut,
    codec: &mut FrameCodec,
    direction: Direction,
    links: &mpsc::Sender<LinkMessage>,
    writes: &mut mpsc::Receiver<WriteRequest>,
    stop: &mut watch::Receiver<bool>,
) -> LinkExit
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let stopped = *stop.borrow();
    if stopped {
        return LinkExit::Stopped;
    }
    loop {
        tokio::select! {
            _ = stop_requested(stop) => return LinkExit::Stopped,
            read = stream.read_buf(buf) => match read {
                Ok(0) => return LinkExit::Broken(HaierError::LinkClosed),
                Ok(n) => {
                    debug!(%direction, n, "Read bytes");
                    if let Err(e) = forward(links, direction, codec.decode_available(buf, false)).await {
                        return LinkExit::Broken(e);
                    }
                }
                Err(e) => return LinkExit::Broken(e.into()),
            },
            Some(request) = writes.recv() => {
                let bytes = match codec.encode(&request.frame) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        warn!(%direction, error = %e, "Refusing to inject frame");
                        let _ = request.reply.send(Err(e));
                        continue;
                    }
                };
                let written = tokio::time::timeout(WRITE_TIMEOUT, async {
                    stream.write_all(&bytes).await?;
                    stream.flush().await?;
                    Ok::<_, HaierError>(())
                })
                .await
                .map_err(HaierError::from)
                .and_then(|written| written);
                match written {
                    Ok(()) => {
                        debug!(%direction, bytes = hex::encode(&bytes), "Injected frame");
                        let _ = request.reply.send(Ok(bytes));
                    }
                    Err(e) => {
                        warn!(%direction, error = %e, "Write failed");
                        let _ = request.reply.send(Err(e));
                        return LinkExit::Broken(HaierError::LinkClosed);
                    }
                }
            }
        }
    }
}

/// Hand decoded data to the event loop. Fails only once the event loop is gone.
async fn forward(
    links: &mpsc::Sender<LinkMessage>,
    direction: Direction,
    outcomes: Vec<DecodeOutcome>,
) -> Result<(), HaierError> {
    if outcomes.is_empty() {
        return Ok(());
    }
    let raw_timestamp = chrono::Utc::now().timestamp_millis();
    for outcome in outcomes {
        if links
            .send(LinkMessage::Decoded {
                direction,
                raw_timestamp,
                outcome,
            })
            .await
            .is_err()
        {
            warn!(%direction, "Event loop gone, dropping decoded data");
            return Err(HaierError::ChannelClosed);
        }
    }
    Ok(())
}
