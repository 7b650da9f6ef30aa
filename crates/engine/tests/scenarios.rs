//! End-to-end bar-loop scenarios driving the FSM engine against a scripted
//! broker.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use common::{
    AccountSnapshot, Bar, BrokerAdapter, CancellationResult, Error, ExecutionEnv, FailedCancel,
    Order, OrderKind, OrderPlan, OrderSide, Result, Timeframe,
};
use compiler::expr::{parse, Expr};
use compiler::{
    ActionSpec, CompiledIr, ExecConfig, FreezePoint, FsmState, LevelSpec, PlanIr, RiskConfig,
    StateTransition, TargetIr,
};
use engine::StrategyEngine;

// ─── Scripted broker ──────────────────────────────────────────────────────────

struct ScriptedBroker {
    submit_calls: AtomicUsize,
    /// When false, submissions silently return no orders (the broker "ate"
    /// the plan).
    submit_creates_orders: bool,
    open_orders: Mutex<Vec<Order>>,
    /// Order ids that refuse to cancel.
    refuse_cancel: HashSet<String>,
}

impl ScriptedBroker {
    fn new(submit_creates_orders: bool) -> Self {
        Self {
            submit_calls: AtomicUsize::new(0),
            submit_creates_orders,
            open_orders: Mutex::new(Vec::new()),
            refuse_cancel: HashSet::new(),
        }
    }

    fn refusing_cancel(ids: &[&str]) -> Self {
        Self {
            refuse_cancel: ids.iter().map(|s| s.to_string()).collect(),
            ..Self::new(true)
        }
    }

    fn submit_count(&self) -> usize {
        self.submit_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BrokerAdapter for ScriptedBroker {
    async fn submit_order_plan(
        &self,
        plan: &OrderPlan,
        _env: &ExecutionEnv,
    ) -> Result<Vec<Order>> {
        self.submit_calls.fetch_add(1, Ordering::SeqCst);
        if !self.submit_creates_orders {
            return Ok(Vec::new());
        }
        let orders = vec![
            Order::leg(&plan.symbol, plan.side, plan.qty, plan.entry_price, OrderKind::Entry, "b1"),
            Order::leg(
                &plan.symbol,
                plan.side.opposite(),
                plan.qty,
                plan.targets[0].price,
                OrderKind::TakeProfit,
                "b1",
            ),
            Order::leg(
                &plan.symbol,
                plan.side.opposite(),
                plan.qty,
                plan.stop_price,
                OrderKind::StopLoss,
                "b1",
            ),
        ];
        *self.open_orders.lock().await = orders.clone();
        Ok(orders)
    }

    async fn submit_market_order(
        &self,
        symbol: &str,
        qty: f64,
        side: OrderSide,
        _env: &ExecutionEnv,
    ) -> Result<Order> {
        Ok(Order::market(symbol, side, qty))
    }

    async fn cancel_open_entries(
        &self,
        _symbol: &str,
        orders: &[Order],
        _env: &ExecutionEnv,
    ) -> Result<CancellationResult> {
        let mut result = CancellationResult::default();
        let mut remaining = self.open_orders.lock().await;
        for order in orders {
            if self.refuse_cancel.contains(&order.id) {
                result.failed.push(FailedCancel {
                    order_id: order.id.clone(),
                    reason: "exchange refused".to_string(),
                });
            } else {
                remaining.retain(|o| o.id != order.id);
                result.succeeded.push(order.id.clone());
            }
        }
        Ok(result)
    }

    async fn get_open_orders(&self, _symbol: &str, _env: &ExecutionEnv) -> Result<Vec<Order>> {
        Ok(self.open_orders.lock().await.clone())
    }

    async fn account(&self, _env: &ExecutionEnv) -> Result<AccountSnapshot> {
        Ok(AccountSnapshot {
            buying_power: 100_000.0,
            equity: 100_000.0,
        })
    }
}

// ─── Test IR construction ─────────────────────────────────────────────────────

fn static_plan(stop: f64) -> PlanIr {
    PlanIr {
        id: "plan-1".to_string(),
        side: OrderSide::Buy,
        qty: 10.0,
        entry: LevelSpec::Static(101.0),
        entry_lo: LevelSpec::Static(100.5),
        entry_hi: LevelSpec::Static(101.5),
        stop: LevelSpec::Static(stop),
        targets: vec![TargetIr {
            price: LevelSpec::Static(106.0),
            ratio: 1.0,
        }],
        mode: common::PlanMode::Single,
    }
}

fn transition(from: FsmState, to: FsmState, when: Expr, actions: Vec<ActionSpec>) -> StateTransition {
    StateTransition {
        from,
        to,
        when,
        actions,
        label: format!("{from}->{to}"),
    }
}

/// The canonical scaffold used by S1-S3: arm on `rsi < 30`, trigger on
/// `close > ema20`, invalidate on `close < stop`.
fn scenario_ir(stop: f64, extra: Vec<StateTransition>, freeze: Option<FreezePoint>) -> CompiledIr {
    let mut transitions = vec![
        transition(
            FsmState::Idle,
            FsmState::Armed,
            parse("rsi < 30", "rules.arm").unwrap(),
            vec![],
        ),
        transition(
            FsmState::Armed,
            FsmState::Placed,
            parse("close > ema20", "rules.trigger").unwrap(),
            vec![ActionSpec::SubmitOrderPlan {
                plan_id: "plan-1".to_string(),
            }],
        ),
        transition(
            FsmState::Placed,
            FsmState::Exited,
            parse("close < stop", "rules.invalidate").unwrap(),
            vec![ActionSpec::CancelEntries],
        ),
    ];
    transitions.extend(extra);
    transitions.push(transition(
        FsmState::Placed,
        FsmState::Managing,
        Expr::Bool(true),
        vec![],
    ));
    transitions.push(transition(
        FsmState::Managing,
        FsmState::Exited,
        parse("close < stop", "rules.invalidate").unwrap(),
        vec![ActionSpec::CancelEntries],
    ));

    CompiledIr {
        symbol: "SPY".to_string(),
        timeframe: Timeframe::M5,
        initial_state: FsmState::Idle,
        feature_plan: Vec::new(),
        transitions,
        order_plans: vec![static_plan(stop)],
        execution: ExecConfig {
            entry_timeout_bars: None,
            rth_only: false,
            freeze_levels_on: freeze,
        },
        risk: RiskConfig {
            max_risk_per_trade: 0.01,
        },
    }
}

fn bar(i: usize, close: f64) -> Bar {
    Bar {
        timestamp_ms: i as i64 * 300_000,
        open: close,
        high: close + 1.0,
        low: close - 1.0,
        close,
        volume: 100.0,
    }
}

fn live_env() -> ExecutionEnv {
    ExecutionEnv {
        allow_live_orders: true,
        allow_cancel_entries: true,
        ..ExecutionEnv::default()
    }
}

const CLOSES: [f64; 5] = [100.0, 99.0, 98.0, 101.0, 95.0];
const RSI: [f64; 5] = [40.0, 35.0, 28.0, 27.0, 29.0];

/// Drive the five scenario bars, forcing `rsi`/`ema20` (and optionally
/// `atr`) the way the scripted scenarios require, collecting the state
/// after each bar.
async fn run_bars(
    engine: &mut StrategyEngine,
    closes: &[f64],
    rsi: &[f64],
    atr: Option<&[f64]>,
) -> Vec<FsmState> {
    let mut states = Vec::new();
    for i in 0..closes.len() {
        engine.state.record_feature("rsi", rsi[i]);
        engine.state.record_feature("ema20", 99.5);
        if let Some(atr) = atr {
            engine.state.record_feature("atr", atr[i]);
        }
        engine.process_bar(&bar(i, closes[i]), false).await.unwrap();
        states.push(engine.fsm_state());
    }
    states
}

// ─── S1: arm / trigger / exit ─────────────────────────────────────────────────

#[tokio::test]
async fn s1_arm_trigger_exit_path() {
    let broker = Arc::new(ScriptedBroker::new(true));
    let ir = Arc::new(scenario_ir(97.0, vec![], None));
    let mut engine = StrategyEngine::new(ir, broker.clone(), live_env()).unwrap();

    let states = run_bars(&mut engine, &CLOSES, &RSI, None).await;
    assert_eq!(
        states,
        vec![
            FsmState::Idle,
            FsmState::Idle,
            FsmState::Armed,
            FsmState::Placed,
            FsmState::Exited,
        ]
    );
    assert_eq!(broker.submit_count(), 1, "exactly one submission, at bar 4");
}

// ─── S2: MANAGING gate ────────────────────────────────────────────────────────

#[tokio::test]
async fn s2_managing_gate_blocks_on_silent_submission_failure() {
    // Broker accepts the plan but creates nothing; stop is far below so the
    // invalidate rule stays quiet.
    let broker = Arc::new(ScriptedBroker::new(false));
    let ir = Arc::new(scenario_ir(90.0, vec![], None));
    let mut engine = StrategyEngine::new(ir, broker.clone(), live_env()).unwrap();

    let states = run_bars(&mut engine, &CLOSES, &RSI, None).await;
    assert_eq!(states[3], FsmState::Placed);
    assert_eq!(
        states[4],
        FsmState::Placed,
        "MANAGING gate must hold with no orders and a flat position"
    );
    assert_eq!(broker.submit_count(), 1);
}

#[tokio::test]
async fn managing_gate_opens_on_nonzero_position() {
    let broker = Arc::new(ScriptedBroker::new(false));
    let ir = Arc::new(scenario_ir(90.0, vec![], None));
    let mut engine = StrategyEngine::new(ir, broker, live_env()).unwrap();

    let states = run_bars(&mut engine, &CLOSES[..4], &RSI[..4], None).await;
    assert_eq!(states[3], FsmState::Placed);

    // A fill notification arrives between bars.
    engine.update_position(10.0, OrderSide::Buy);
    engine.state.record_feature("rsi", 50.0);
    engine.state.record_feature("ema20", 99.5);
    engine.process_bar(&bar(4, 102.0), false).await.unwrap();
    assert_eq!(engine.fsm_state(), FsmState::Managing);
}

// ─── S3: sticky PLACED ────────────────────────────────────────────────────────

#[tokio::test]
async fn s3_sticky_placed_defers_disarm_to_next_bar() {
    let disarm = transition(
        FsmState::Placed,
        FsmState::Idle,
        parse("close < ema20", "rules.disarm").unwrap(),
        vec![ActionSpec::CancelEntries],
    );
    let broker = Arc::new(ScriptedBroker::new(true));
    // Stop far below so the invalidate edge stays quiet and the disarm edge
    // decides bar 5.
    let ir = Arc::new(scenario_ir(90.0, vec![disarm], None));
    let mut engine = StrategyEngine::new(ir, broker, live_env()).unwrap();

    let states = run_bars(&mut engine, &CLOSES, &RSI, None).await;
    assert_eq!(states[3], FsmState::Placed, "trigger wins the triggering bar");
    assert_eq!(
        states[4],
        FsmState::Idle,
        "disarm fires on the following bar once the dwell has elapsed"
    );
}

#[tokio::test]
async fn sticky_placed_blocks_exit_at_state_bar_count_zero() {
    let disarm = transition(
        FsmState::Placed,
        FsmState::Idle,
        Expr::Bool(true),
        vec![],
    );
    let broker = Arc::new(ScriptedBroker::new(false));
    let mut ir = scenario_ir(90.0, vec![disarm], None);
    ir.initial_state = FsmState::Placed;
    let mut engine = StrategyEngine::new(Arc::new(ir), broker, live_env()).unwrap();

    // Bar 1: freshly loaded into PLACED with state_bar_count = 0; the
    // always-true disarm must not fire.
    engine.process_bar(&bar(0, 100.0), false).await.unwrap();
    assert_eq!(engine.fsm_state(), FsmState::Placed);

    // Bar 2: dwell elapsed; the same predicate now fires.
    engine.process_bar(&bar(1, 100.0), false).await.unwrap();
    assert_eq!(engine.fsm_state(), FsmState::Idle);
}

// ─── S4: freeze-on-armed ──────────────────────────────────────────────────────

#[tokio::test]
async fn s4_levels_frozen_at_arming_bar() {
    let mut ir = scenario_ir(90.0, vec![], Some(FreezePoint::Armed));
    ir.order_plans[0].stop =
        LevelSpec::Dynamic(parse("close - 1.2 * atr", "plan.stop").unwrap());
    let broker = Arc::new(ScriptedBroker::new(true));
    let mut engine = StrategyEngine::new(Arc::new(ir), broker, live_env()).unwrap();

    // atr changes every bar; arming happens at bar 3 (rsi 28).
    let atr = [2.0, 2.5, 3.0, 4.0, 5.0];
    run_bars(&mut engine, &CLOSES, &RSI, Some(&atr)).await;

    assert!(engine.state.levels_frozen);
    let frozen_stop = engine.levels[0].stop;
    let arming_bar_stop = 98.0 - 1.2 * 3.0;
    assert!(
        (frozen_stop - arming_bar_stop).abs() < 1e-9,
        "stop must equal the value computed on the arming bar: {frozen_stop} vs {arming_bar_stop}"
    );
}

// ─── Single transition per bar ────────────────────────────────────────────────

#[tokio::test]
async fn at_most_one_transition_commits_per_bar() {
    // Both the arm and an IDLE->EXITED edge are true on bar 1; only the
    // first declared edge may fire.
    let extra = transition(FsmState::Idle, FsmState::Exited, Expr::Bool(true), vec![]);
    let broker = Arc::new(ScriptedBroker::new(true));
    let mut ir = scenario_ir(90.0, vec![], None);
    ir.transitions.push(extra);
    let mut engine = StrategyEngine::new(Arc::new(ir), broker, live_env()).unwrap();

    engine.state.record_feature("rsi", 10.0);
    engine.state.record_feature("ema20", 99.5);
    engine.process_bar(&bar(0, 100.0), false).await.unwrap();
    assert_eq!(engine.fsm_state(), FsmState::Armed);
}

// ─── Entry timeout ────────────────────────────────────────────────────────────

#[tokio::test]
async fn entry_timer_expiry_disarms_after_countdown() {
    let ir = CompiledIr {
        symbol: "SPY".to_string(),
        timeframe: Timeframe::M5,
        initial_state: FsmState::Idle,
        feature_plan: Vec::new(),
        transitions: vec![
            transition(
                FsmState::Idle,
                FsmState::Armed,
                parse("rsi < 30", "rules.arm").unwrap(),
                vec![ActionSpec::StartTimer {
                    name: "entry_timeout".to_string(),
                    bars: 2,
                }],
            ),
            transition(
                FsmState::Armed,
                FsmState::Placed,
                parse("close > 1000", "rules.trigger").unwrap(),
                vec![],
            ),
            transition(
                FsmState::Armed,
                FsmState::Idle,
                parse("entry_timer_expired", "rules.disarm").unwrap(),
                vec![],
            ),
        ],
        order_plans: vec![static_plan(97.0)],
        execution: ExecConfig {
            entry_timeout_bars: Some(2),
            rth_only: false,
            freeze_levels_on: None,
        },
        risk: RiskConfig {
            max_risk_per_trade: 0.01,
        },
    };

    let broker = Arc::new(ScriptedBroker::new(true));
    let mut engine = StrategyEngine::new(Arc::new(ir), broker, live_env()).unwrap();

    let mut states = Vec::new();
    for i in 0..3 {
        engine.state.record_feature("rsi", 10.0);
        engine.process_bar(&bar(i, 100.0), false).await.unwrap();
        states.push(engine.fsm_state());
    }

    // Armed on bar 1; the two-bar countdown runs through bar 2 and fires
    // the escape on bar 3.
    assert_eq!(
        states,
        vec![FsmState::Armed, FsmState::Armed, FsmState::Idle]
    );
}

// ─── Cancellation atomicity at the engine ─────────────────────────────────────

#[tokio::test]
async fn failed_cancellations_stay_in_open_orders() {
    let broker = Arc::new(ScriptedBroker::refusing_cancel(&["stubborn"]));
    let ir = Arc::new(scenario_ir(90.0, vec![], None));
    let mut engine = StrategyEngine::new(ir, broker, live_env()).unwrap();

    engine.state.open_orders = vec![
        Order {
            id: "friendly".to_string(),
            ..Order::market("SPY", OrderSide::Buy, 10.0)
        },
        Order {
            id: "stubborn".to_string(),
            ..Order::market("SPY", OrderSide::Buy, 10.0)
        },
    ];

    let result = engine.cancel_all_entries().await;
    assert!(matches!(result, Err(Error::CancellationFailure { .. })));

    let remaining: Vec<&str> = engine
        .state
        .open_orders
        .iter()
        .map(|o| o.id.as_str())
        .collect();
    assert_eq!(remaining, vec!["stubborn"]);
}

// ─── Replay suppression ───────────────────────────────────────────────────────

#[tokio::test]
async fn replay_reaches_state_without_side_effects() {
    let broker = Arc::new(ScriptedBroker::new(true));
    let ir = Arc::new(scenario_ir(97.0, vec![], None));
    let mut engine = StrategyEngine::new(ir, broker.clone(), live_env()).unwrap();

    for i in 0..4 {
        engine.state.record_feature("rsi", RSI[i]);
        engine.state.record_feature("ema20", 99.5);
        engine.process_bar(&bar(i, CLOSES[i]), true).await.unwrap();
    }

    assert_eq!(engine.fsm_state(), FsmState::Placed);
    assert_eq!(broker.submit_count(), 0, "replay must not touch the broker");
}

// ─── Kill switch ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn kill_switch_blocks_submission_but_commits_state() {
    let broker = Arc::new(ScriptedBroker::new(true));
    let ir = Arc::new(scenario_ir(90.0, vec![], None));
    let env = ExecutionEnv {
        allow_live_orders: false,
        ..live_env()
    };
    let mut engine = StrategyEngine::new(ir, broker.clone(), env).unwrap();

    let states = run_bars(&mut engine, &CLOSES[..4], &RSI[..4], None).await;
    assert_eq!(states[3], FsmState::Placed);
    assert_eq!(broker.submit_count(), 0);
}
