use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use common::{Bar, Order, Timeframe};
use compiler::FsmState;
use engine::StrategyEngine;

/// Messages delivered to an instance task. Bars arrive in monotonic-time
/// order and are processed one at a time; reconciliation and close requests
/// interleave on the same queue so they can never race a bar.
pub enum InstanceMsg {
    Bar(Bar),
    /// Broker truth for this symbol; replaces the local open-order set.
    Reconcile(Vec<Order>),
    /// Point-in-time view for the evaluator.
    Snapshot(oneshot::Sender<InstanceSnapshot>),
    /// Cancel open entries and stop the task.
    Close {
        reason: String,
        done: oneshot::Sender<()>,
    },
}

#[derive(Debug, Clone)]
pub struct InstanceSnapshot {
    pub state: FsmState,
    pub position_size: f64,
    pub bar_count: u64,
}

/// Handle the orchestrator keeps per live strategy.
pub struct InstanceHandle {
    pub strategy_id: String,
    pub symbol: String,
    pub timeframe: Timeframe,
    tx: mpsc::Sender<InstanceMsg>,
    task: JoinHandle<()>,
}

impl InstanceHandle {
    /// Spawn the instance task around a warmed-up engine.
    pub fn spawn(strategy_id: String, engine: StrategyEngine) -> Self {
        let symbol = engine.symbol().to_string();
        let timeframe = engine.ir().timeframe;
        let (tx, rx) = mpsc::channel(64);
        let id = strategy_id.clone();
        let task = tokio::spawn(run_instance(id, engine, rx));
        Self {
            strategy_id,
            symbol,
            timeframe,
            tx,
            task,
        }
    }

    pub async fn send(&self, msg: InstanceMsg) -> bool {
        self.tx.send(msg).await.is_ok()
    }

    pub async fn snapshot(&self) -> Option<InstanceSnapshot> {
        let (reply, rx) = oneshot::channel();
        if !self.send(InstanceMsg::Snapshot(reply)).await {
            return None;
        }
        rx.await.ok()
    }

    /// Ask the task to cancel entries and stop, then wait for it.
    pub async fn close(self, reason: &str) {
        let (done, ack) = oneshot::channel();
        if self
            .send(InstanceMsg::Close {
                reason: reason.to_string(),
                done,
            })
            .await
        {
            let _ = ack.await;
        }
        let _ = self.task.await;
    }

    /// Drop the sender and wait for in-flight bars to settle (shutdown
    /// path; leaves broker state untouched). Abandons the task after the
    /// grace window.
    pub async fn drain(self, grace: std::time::Duration) {
        drop(self.tx);
        if tokio::time::timeout(grace, self.task).await.is_err() {
            warn!("instance did not settle within grace window; abandoning");
        }
    }
}

async fn run_instance(
    strategy_id: String,
    mut engine: StrategyEngine,
    mut rx: mpsc::Receiver<InstanceMsg>,
) {
    info!(
        %strategy_id,
        symbol = %engine.symbol(),
        state = %engine.fsm_state(),
        "instance task started"
    );

    while let Some(msg) = rx.recv().await {
        match msg {
            InstanceMsg::Bar(bar) => {
                if let Err(e) = engine.process_bar(&bar, false).await {
                    // An instance failure never propagates to siblings.
                    error!(
                        %strategy_id,
                        symbol = %engine.symbol(),
                        timestamp_ms = bar.timestamp_ms,
                        error = %e,
                        "bar processing failed"
                    );
                }
            }
            InstanceMsg::Reconcile(orders) => {
                engine.replace_open_orders(orders);
            }
            InstanceMsg::Snapshot(reply) => {
                let _ = reply.send(InstanceSnapshot {
                    state: engine.fsm_state(),
                    position_size: engine.state.position_size,
                    bar_count: engine.state.bar_count,
                });
            }
            InstanceMsg::Close { reason, done } => {
                info!(%strategy_id, symbol = %engine.symbol(), %reason, "closing instance");
                if let Err(e) = engine.cancel_all_entries().await {
                    warn!(
                        %strategy_id,
                        error = %e,
                        "cancellation during close failed; broker may retain orders"
                    );
                }
                let _ = done.send(());
                break;
            }
        }
    }

    info!(%strategy_id, "instance task stopped");
}
