
use crate::context::VehicleContext;
use crate::schema::{
    Command, CommandAck, CommandDetail, CommandType, GotoParams, TelemetrySnapshot,
};
use crate::vehicle::flight_mode::FlightMode;
use crate::{info, warn};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// A `goto` parked while the engine waits for telemetry to confirm the
/// internally issued switch to GUIDED. Evaluated against every snapshot;
/// the deadline resolves the original command as failed.
#[derive(Debug, Clone)]
struct PendingModeSwitch {
    goto_id: String,
    params: GotoParams,
    deadline: Instant,
}

#[derive(Debug, Default)]
struct EngineState {
    /// Idempotency window: membership set plus insertion order for
    /// size-capped eviction.
    processed: HashSet<String>,
    processed_order: VecDeque<String>,
    /// Commands with a non-terminal ack outstanding, at most one per type.
    in_flight: Vec<(CommandType, String)>,
    pending_switch: Option<PendingModeSwitch>,
    helper_seq: u64,
}

/// Validates, deduplicates and dispatches operator commands, tracks their
/// lifecycle and produces acknowledgments on the context's ack channel.
///
/// State machine per command: `accepted -> executing -> {completed|failed}`
/// or `accepted -> rejected`; validation and precondition failures are
/// resolved here and never reach a backend. Every command gets exactly one
/// terminal ack, funneled through [`CommandController::emit`].
pub struct CommandController {
    ctx: Arc<VehicleContext>,
    auto_mode_switch: bool,
    state: Mutex<EngineState>,
}

impl CommandController {
    /// Size cap of the idempotency window.
    const PROCESSED_CAP: usize = 1024;
    /// Bounded wait for telemetry to confirm the GUIDED switch.
    const MODE_SWITCH_TIMEOUT: Duration = Duration::from_secs(2);
    /// Longest accepted command id.
    const MAX_ID_LEN: usize = 64;

    pub fn new(ctx: Arc<VehicleContext>) -> Self {
        let auto_mode_switch = ctx.config().auto_mode_switch;
        Self { ctx, auto_mode_switch, state: Mutex::new(EngineState::default()) }
    }

    /// Processes one raw inbound command through validation, dedup, safety
    /// checks and dispatch. All outcomes surface as acks on the context's
    /// ack channel.
    pub async fn handle_command(&self, raw: Command) {
        info!("Received command {} ({})", raw.kind, raw.id);

        if raw.id.is_empty() || raw.id.len() > Self::MAX_ID_LEN {
            let id = if raw.id.is_empty() { "unknown" } else { raw.id.as_str() };
            self.emit(CommandAck::rejected(
                id,
                "Validation error: id must be a non-empty string of at most 64 chars",
            ))
            .await;
            return;
        }

        // Shape and range validation, no backend involved.
        let detail = match CommandDetail::parse(&raw.kind, &raw.params) {
            Ok(detail) => detail,
            Err(e) => {
                self.emit(CommandAck::rejected(&raw.id, &e.to_string())).await;
                return;
            }
        };

        // Idempotency wins over every later check: a replayed id gets the
        // duplicate rejection even when the precondition outcome has since
        // changed. The id is only recorded once the command is accepted.
        if self.is_duplicate(&raw.id).await {
            warn!("Duplicate command id {}", raw.id);
            self.emit(CommandAck::rejected(&raw.id, "Duplicate command id")).await;
            return;
        }

        let telemetry = self.ctx.latest_telemetry().await;

        // Safety preconditions against the latest snapshot.
        if let Err(reason) = command_allowed(&detail, telemetry.as_ref()) {
            self.emit(CommandAck::rejected(&raw.id, &reason)).await;
            return;
        }

        let in_hold = telemetry
            .as_ref()
            .is_some_and(|t| t.mode == FlightMode::Hold.to_string());
        let hold_gated = detail.kind() == CommandType::Goto && in_hold;
        if hold_gated && !self.auto_mode_switch {
            self.emit(CommandAck::rejected(
                &raw.id,
                "Vehicle in HOLD: set mode to GUIDED to accept goto",
            ))
            .await;
            return;
        }

        // Conflict check and id reservation under the state lock; the
        // dedup re-check closes the race with a concurrent identical id.
        let helper_id = {
            let mut state = self.state.lock().await;
            if state.processed.contains(&raw.id) {
                drop(state);
                warn!("Duplicate command id {}", raw.id);
                self.emit(CommandAck::rejected(&raw.id, "Duplicate command id")).await;
                return;
            }
            let kind = detail.kind();
            if let Some((_, in_flight_id)) = state.in_flight.iter().find(|(k, _)| *k == kind) {
                let reason =
                    format!("A {kind} command ({in_flight_id}) is already in flight");
                drop(state);
                self.emit(CommandAck::rejected(&raw.id, &reason)).await;
                return;
            }
            state.processed.insert(raw.id.clone());
            state.processed_order.push_back(raw.id.clone());
            while state.processed_order.len() > Self::PROCESSED_CAP {
                if let Some(evicted) = state.processed_order.pop_front() {
                    state.processed.remove(&evicted);
                }
            }
            state.helper_seq += 1;
            format!("mode-switch-{}", state.helper_seq)
        };

        self.emit(CommandAck::accepted(&raw.id)).await;

        if hold_gated {
            let CommandDetail::Goto(params) = detail else { unreachable!() };
            self.start_mode_switch(&raw.id, params, &helper_id).await;
            return;
        }

        self.dispatch(&raw.id, &detail).await;
    }

    /// Internally issues `set_mode(GUIDED)` and parks the goto until
    /// telemetry confirms the mode or the deadline passes. The helper
    /// command is observable on the ack stream under its own id.
    async fn start_mode_switch(&self, goto_id: &str, params: GotoParams, helper_id: &str) {
        info!("Vehicle in HOLD, auto-switching to GUIDED for goto {goto_id}");
        self.emit(CommandAck::accepted(helper_id)).await;
        let helper_ack = {
            let mut vehicle = self.ctx.vehicle().write().await;
            vehicle.send_command(helper_id, &CommandDetail::SetMode(FlightMode::Guided)).await
        };
        match helper_ack {
            Ok(ack) => self.emit(ack).await,
            Err(e) => {
                self.emit(CommandAck::failed(helper_id, &e.to_string())).await;
                self.emit(CommandAck::rejected(goto_id, "Mode change failed, cannot send goto"))
                    .await;
                return;
            }
        }
        let mut state = self.state.lock().await;
        state.in_flight.push((CommandType::Goto, goto_id.to_string()));
        state.pending_switch = Some(PendingModeSwitch {
            goto_id: goto_id.to_string(),
            params,
            deadline: Instant::now() + Self::MODE_SWITCH_TIMEOUT,
        });
    }

    async fn dispatch(&self, id: &str, detail: &CommandDetail) {
        let result = {
            let mut vehicle = self.ctx.vehicle().write().await;
            vehicle.send_command(id, detail).await
        };
        let ack = match result {
            Ok(ack) => ack,
            Err(e) => CommandAck::failed(id, &e.to_string()),
        };
        if !ack.status.is_terminal() {
            let mut state = self.state.lock().await;
            state.in_flight.push((detail.kind(), id.to_string()));
        }
        self.emit(ack).await;
    }

    async fn is_duplicate(&self, id: &str) -> bool {
        self.state.lock().await.processed.contains(id)
    }

    /// Funnels completion acks the supervisor drained out of the backend.
    pub async fn finish_acks(&self, acks: Vec<CommandAck>) {
        for ack in acks {
            self.emit(ack).await;
        }
    }

    /// Evaluates deadline-bearing pending operations against a fresh
    /// snapshot. Called by the supervisor once per tick.
    pub async fn check_pending(&self, snapshot: &TelemetrySnapshot) {
        let mut state = self.state.lock().await;
        let Some(pending) = state.pending_switch.clone() else {
            return;
        };
        if snapshot.mode == FlightMode::Guided.to_string() {
            state.pending_switch = None;
            drop(state);
            // Dedup/in-flight bookkeeping already happened on receipt; the
            // parked goto now takes the normal dispatch path.
            let result = {
                let mut vehicle = self.ctx.vehicle().write().await;
                vehicle
                    .send_command(&pending.goto_id, &CommandDetail::Goto(pending.params))
                    .await
            };
            let ack = match result {
                Ok(ack) => ack,
                Err(e) => CommandAck::failed(&pending.goto_id, &e.to_string()),
            };
            self.emit(ack).await;
        } else if Instant::now() >= pending.deadline {
            state.pending_switch = None;
            drop(state);
            warn!("Mode switch for goto {} not confirmed in time", pending.goto_id);
            self.emit(CommandAck::failed(
                &pending.goto_id,
                "Mode change not confirmed before deadline",
            ))
            .await;
        }
    }

    /// The single ack funnel: clears in-flight tracking on terminal acks
    /// and publishes to the outbound channel. Every ack the engine produces
    /// goes through here exactly once.
    async fn emit(&self, ack: CommandAck) {
        if ack.status.is_terminal() {
            let mut state = self.state.lock().await;
            state.in_flight.retain(|(_, id)| *id != ack.id);
        }
        self.ctx.publish_ack(ack);
    }
}

/// Safety checks against the latest telemetry, mirroring what the vehicle
/// itself would refuse; rejecting here keeps precondition failures out of
/// the backends entirely.
fn command_allowed(
    detail: &CommandDetail,
    telemetry: Option<&TelemetrySnapshot>,
) -> Result<(), String> {
    let Some(telemetry) = telemetry else {
        // Nothing known about the vehicle yet: only connect-safe commands.
        return match detail.kind() {
            CommandType::Arm
            | CommandType::SetMode
            | CommandType::UploadMission
            | CommandType::StartMission => Ok(()),
            _ => Err("No telemetry yet; try again".to_string()),
        };
    };

    let armed = telemetry.armed;
    let rel_alt = telemetry.position.relative_alt;
    let speed = telemetry.velocity.speed;

    match detail.kind() {
        CommandType::Disarm => {
            if !armed {
                return Err("Already disarmed".to_string());
            }
            if rel_alt > 0.5 || speed > 0.5 {
                return Err("Cannot disarm while airborne. Land first.".to_string());
            }
            Ok(())
        }
        CommandType::Takeoff
        | CommandType::Goto
        | CommandType::Hover
        | CommandType::SetAlt
        | CommandType::Rtl
        | CommandType::PauseMission
        | CommandType::ContinueMission => {
            if armed { Ok(()) } else { Err("Not armed".to_string()) }
        }
        _ => Ok(()),
    }
}
