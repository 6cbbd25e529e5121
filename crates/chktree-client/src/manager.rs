//! Async request manager
//!
//! A download runs as three tasks sharing one [`DaemonConnection`]:
//! - the reader drains the connection into the inbound channel and resets
//!   the connection when the stream gets out of sync;
//! - the writer sends queued queries and reports failed writes back as
//!   inbound events;
//! - the logic task owns the block tree and the [`RequestTable`] and is the
//!   only consumer of replies, so no state is shared between tasks.
//!
//! Traffic and priority reports reach the logic task through a
//! [`DownloadControl`] handle.
//!
//! Teardown closes the connection, stops the reader and writer, clears the
//! table and frees whatever is left of the tree.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, warn};

use chktree_core::{
    BlockTree, ClientMessage, ContentBlock, DaemonMessage, NodeContext, ProgressStats,
};

use crate::connection::{DaemonConnection, TransportError};
use crate::error::ClientError;
use crate::policy::TrafficKind;
use crate::requests::RequestTable;

const INBOUND_QUEUE: usize = 256;

/// Events for the logic task
#[derive(Debug)]
enum Inbound {
    Message(DaemonMessage),
    SendFailed(TransportError),
    Closed(TransportError),
}

/// Observations from the daemon
#[derive(Debug)]
enum Control {
    Traffic {
        kind: Option<TrafficKind>,
        bytes: u64,
        peers: u32,
    },
    AveragePriority(u32),
}

/// Feeds daemon observations into a running download
///
/// Recorded traffic is the cover an anonymity policy spends on queries; with
/// a positive receive policy nothing is sent until some has been recorded.
/// Reports arriving after the download ended are dropped.
#[derive(Debug, Clone)]
pub struct DownloadControl {
    tx: mpsc::UnboundedSender<Control>,
}

impl DownloadControl {
    /// Report `bytes` of traffic of `kind` from `peers` distinct peers
    pub fn record_traffic(&self, kind: Option<TrafficKind>, bytes: u64, peers: u32) {
        let _ = self.tx.send(Control::Traffic { kind, bytes, peers });
    }

    /// Report the average query priority the daemon currently sees
    pub fn observe_average_priority(&self, average: u32) {
        let _ = self.tx.send(Control::AveragePriority(average));
    }
}

/// Handle to a running download
pub struct RequestManager {
    shutdown: oneshot::Sender<()>,
    progress: watch::Receiver<ProgressStats>,
    control: DownloadControl,
    logic: JoinHandle<Result<ProgressStats, ClientError>>,
}

impl RequestManager {
    /// Start downloading `tree` over `conn`
    ///
    /// `ctx` must carry the IOContext of the target file. Must be called
    /// from within a tokio runtime.
    pub fn spawn(
        conn: Arc<dyn DaemonConnection>,
        tree: BlockTree,
        ctx: NodeContext,
        table: RequestTable,
        send_queue: usize,
    ) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
        let (outbound_tx, outbound_rx) = mpsc::channel(send_queue.max(1));
        let (progress_tx, progress_rx) = watch::channel(ctx.stats);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        let reader = tokio::spawn(read_loop(conn.clone(), inbound_tx.clone()));
        let writer = tokio::spawn(write_loop(conn.clone(), outbound_rx, inbound_tx));

        let download = Download {
            tree,
            ctx,
            table,
            outbound: outbound_tx,
            progress: progress_tx,
        };
        let logic = tokio::spawn(download.run(
            conn,
            inbound_rx,
            control_rx,
            shutdown_rx,
            [reader, writer],
        ));

        Self {
            shutdown: shutdown_tx,
            progress: progress_rx,
            control: DownloadControl { tx: control_tx },
            logic,
        }
    }

    /// Progress updates; the last value stays readable after the download ends
    pub fn progress(&self) -> watch::Receiver<ProgressStats> {
        self.progress.clone()
    }

    pub fn control(&self) -> DownloadControl {
        self.control.clone()
    }

    /// Wait until the file is complete or the download fails
    pub async fn wait(self) -> Result<ProgressStats, ClientError> {
        let Self {
            shutdown, logic, ..
        } = self;
        let result = logic.await.map_err(|e| {
            error!("Download task failed: {}", e);
            ClientError::Aborted
        })?;
        drop(shutdown);
        result
    }

    /// Abort the download and release everything it holds
    ///
    /// Returns the progress reached so far.
    pub async fn destroy(self) -> Result<ProgressStats, ClientError> {
        let Self {
            shutdown, logic, ..
        } = self;
        let _ = shutdown.send(());
        logic.await.map_err(|e| {
            error!("Download task failed: {}", e);
            ClientError::Aborted
        })?
    }
}

async fn read_loop(conn: Arc<dyn DaemonConnection>, tx: mpsc::Sender<Inbound>) {
    loop {
        match conn.recv().await {
            Ok(msg) => {
                if tx.send(Inbound::Message(msg)).await.is_err() {
                    break;
                }
            }
            Err(TransportError::Protocol(e)) => {
                error!("Received unexpected data from daemon: {}", e);
                if let Err(e) = conn.reset().await {
                    let _ = tx.send(Inbound::Closed(e)).await;
                    break;
                }
            }
            Err(e) => {
                debug!("Daemon connection closed: {}", e);
                let _ = tx.send(Inbound::Closed(e)).await;
                break;
            }
        }
    }
}

async fn write_loop(
    conn: Arc<dyn DaemonConnection>,
    mut rx: mpsc::Receiver<ClientMessage>,
    tx: mpsc::Sender<Inbound>,
) {
    while let Some(msg) = rx.recv().await {
        if let Err(e) = conn.send(&msg).await {
            warn!("Could not send request to daemon: {}", e);
            if tx.send(Inbound::SendFailed(e)).await.is_err() {
                break;
            }
        }
    }
}

/// State owned by the logic task
struct Download {
    tree: BlockTree,
    ctx: NodeContext,
    table: RequestTable,
    outbound: mpsc::Sender<ClientMessage>,
    progress: watch::Sender<ProgressStats>,
}

impl Download {
    async fn run(
        mut self,
        conn: Arc<dyn DaemonConnection>,
        inbound: mpsc::Receiver<Inbound>,
        control: mpsc::UnboundedReceiver<Control>,
        shutdown: oneshot::Receiver<()>,
        io_tasks: [JoinHandle<()>; 2],
    ) -> Result<ProgressStats, ClientError> {
        let result = self.drive(inbound, control, shutdown).await;

        for task in io_tasks {
            task.abort();
        }
        conn.close().await;
        self.teardown();
        result.map(|()| self.ctx.stats)
    }

    async fn drive(
        &mut self,
        mut inbound: mpsc::Receiver<Inbound>,
        mut control: mpsc::UnboundedReceiver<Control>,
        mut shutdown: oneshot::Receiver<()>,
    ) -> Result<(), ClientError> {
        self.start()?;

        let timer = sleep_until(Instant::now());
        tokio::pin!(timer);
        let mut armed = false;

        loop {
            if self.is_complete() {
                debug!("Download complete: {} bytes", self.ctx.stats.progress);
                return Ok(());
            }
            if self.table.take_wake() || !armed {
                if let Some(next) = self.schedule() {
                    timer.as_mut().reset(Instant::now() + next);
                    armed = true;
                }
            }

            tokio::select! {
                _ = &mut shutdown => {
                    debug!("Download canceled at {} bytes", self.ctx.stats.progress);
                    return Ok(());
                }
                event = inbound.recv() => match event {
                    Some(event) => self.handle(event)?,
                    None => return Err(TransportError::Disconnected.into()),
                },
                Some(cmd) = control.recv() => self.apply(cmd),
                _ = &mut timer, if armed => {
                    armed = false;
                }
            }
        }
    }

    fn start(&mut self) -> Result<(), ClientError> {
        if let Some(root) = self.tree.root() {
            self.table.tick();
            self.tree.download(root, &mut self.ctx, &mut self.table)?;
        }
        self.publish();
        Ok(())
    }

    fn is_complete(&self) -> bool {
        self.tree.root().is_none()
    }

    fn schedule(&mut self) -> Option<Duration> {
        self.table.tick();
        let schedule = self.table.run_schedule(&mut self.outbound);
        for node in schedule.unavailable {
            self.tree.print(node, 0);
        }
        self.publish();
        schedule.next
    }

    fn handle(&mut self, event: Inbound) -> Result<(), ClientError> {
        self.table.tick();
        match event {
            Inbound::Message(DaemonMessage::ReturnValue(value)) => {
                self.table.on_return_value(value)
            }
            Inbound::Message(DaemonMessage::ResultChk(block)) => self.receive(&block)?,
            Inbound::SendFailed(e) => {
                debug!("Send failed: {}", e);
                self.table.on_send_failed();
            }
            Inbound::Closed(e) => return Err(e.into()),
        }
        self.publish();
        Ok(())
    }

    fn apply(&mut self, cmd: Control) {
        match cmd {
            Control::Traffic { kind, bytes, peers } => {
                self.table.record_traffic(kind, bytes, peers)
            }
            Control::AveragePriority(average) => self.table.observe_average_priority(average),
        }
    }

    /// Route a reply to the node waiting for it
    fn receive(&mut self, reply: &ContentBlock) -> Result<(), ClientError> {
        let Some((node, handler, query)) = self.table.match_reply(reply) else {
            return Ok(());
        };
        self.table.stats().apply_to(&mut self.ctx.stats);
        let result = self.tree.receive(
            node,
            handler,
            &query,
            reply,
            &mut self.ctx,
            &mut self.table,
        );
        if let Err(e) = result {
            error!("Download aborted: {}", e);
            self.table.abort_all();
            return Err(e.into());
        }
        Ok(())
    }

    fn publish(&mut self) {
        self.table.stats().apply_to(&mut self.ctx.stats);
        self.progress.send_replace(self.ctx.stats);
    }

    fn teardown(&mut self) {
        self.table.print();
        self.table.clear();
        if let Some(root) = self.tree.root() {
            self.tree.done(root, &mut self.table);
        }
        self.publish();
    }
}
