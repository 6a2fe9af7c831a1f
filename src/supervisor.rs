use crate::context::VehicleContext;
use crate::engine::CommandController;
use crate::vehicle::{LinkState, TelemetrySim, VehicleKind};
use crate::{info, telem, warn};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Drives the fixed-rate telemetry loop.
///
/// Each tick advances the active backend, publishes the resulting snapshot
/// and funnels any backend-produced acks through the command engine. The
/// supervisor is also the only place a backend swap happens after startup:
/// when the SITL link reports `Disconnected` the slot is replaced with a
/// fresh simulator between ticks, never mid-command.
pub struct Supervisor {
    ctx: Arc<VehicleContext>,
    engine: Arc<CommandController>,
}

impl Supervisor {
    pub fn new(ctx: Arc<VehicleContext>, engine: Arc<CommandController>) -> Self {
        Self { ctx, engine }
    }

    pub async fn run(&self, token: CancellationToken) {
        let period = self.ctx.config().tick_period();
        let dt = self.ctx.config().tick_dt();
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!("Telemetry loop running at {} Hz", self.ctx.config().telemetry_rate);

        let mut last_link = {
            let vehicle = self.ctx.vehicle().read().await;
            vehicle.link()
        };

        loop {
            tokio::select! {
                () = token.cancelled() => {
                    info!("Telemetry loop shutting down");
                    return;
                }
                _ = interval.tick() => {}
            }

            let (snapshot, acks, link, kind) = {
                let mut vehicle = self.ctx.vehicle().write().await;
                let acks = vehicle.tick(dt);
                (vehicle.telemetry(), acks, vehicle.link(), vehicle.kind())
            };
            // Lock released: ack resolution and mode-switch evaluation must
            // not hold the vehicle slot.

            self.ctx.store_telemetry(snapshot.clone()).await;
            self.engine.finish_acks(acks).await;
            self.engine.check_pending(&snapshot).await;
            telem!(
                "{} armed={} rel_alt={:.1}",
                snapshot.mode,
                snapshot.armed,
                snapshot.position.relative_alt
            );
            self.ctx.publish_telemetry(snapshot);

            if link != last_link {
                info!("Link state changed: {last_link:?} -> {link:?}");
                self.ctx.publish_conn(link, kind);
                last_link = link;
            }

            if kind == VehicleKind::Sitl && link == LinkState::Disconnected {
                self.fall_back_to_sim().await;
                last_link = LinkState::Connected;
            }
        }
    }

    /// Replaces the dead SITL backend with a seeded simulator. Runs between
    /// ticks with the slot's write lock held, so no command can observe a
    /// half-swapped backend.
    async fn fall_back_to_sim(&self) {
        warn!("SITL link lost, falling back to simulator");
        let sim = TelemetrySim::new(self.ctx.config().sim_seed);
        {
            let mut vehicle = self.ctx.vehicle().write().await;
            *vehicle = Box::new(sim);
        }
        self.ctx.publish_conn(LinkState::Connected, VehicleKind::Sim);
    }
}
