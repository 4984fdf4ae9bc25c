//! Gateway composition root
//!
//! Builds every component in dependency order and runs the serial, telemetry
//! and network tasks until cancelled.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::GatewayConfig;
use crate::core::materializer::{StatusMaterializer, STATUS_COIL_COUNT};
use crate::core::metrics::{GatewayMetrics, METRICS_BLOCK};
use crate::core::queue::command_queue;
use crate::core::register_map::RegisterMap;
use crate::error::Result;
use crate::interceptor::{RequestInterceptor, StatusLayout};
use crate::persistence::{record_restart, RestartCounterStore};
use crate::protocol::server::GatewayServer;
use crate::serial::fieldbus::FieldBus;
use crate::serial::forwarder::SerialForwarder;
use crate::serial::poller::RangePoller;
use crate::telemetry::{TelemetryHook, TelemetryPeer, TelemetryPusher, TelemetrySnapshot};

/// A snapshot waiting while a push is in flight; later ones are dropped
const TELEMETRY_BACKLOG: usize = 1;

type TelemetryTask<P> = (TelemetryPusher<P>, mpsc::Receiver<TelemetrySnapshot>);

pub struct Gateway<B: FieldBus + 'static, P: TelemetryPeer + 'static> {
    map: Arc<RegisterMap>,
    metrics: Arc<GatewayMetrics>,
    server: Arc<GatewayServer>,
    forwarder: SerialForwarder<B>,
    telemetry: Option<TelemetryTask<P>>,
}

impl<B: FieldBus + 'static, P: TelemetryPeer + 'static> Gateway<B, P> {
    /// Wire up the gateway. Only configuration and queue construction errors
    /// are fatal.
    pub fn build(
        config: GatewayConfig,
        bus: B,
        peer: Option<P>,
        restart_store: Arc<dyn RestartCounterStore>,
    ) -> Result<Self> {
        config.validate()?;

        let restarts = match record_restart(restart_store.as_ref()) {
            Ok(count) => count,
            Err(e) => {
                warn!("Restart counter unavailable: {}", e);
                0
            },
        };
        let metrics = Arc::new(GatewayMetrics::new(restarts));

        let regs = &config.registers;
        let (telemetry_tx, telemetry_rx) = mpsc::channel(TELEMETRY_BACKLOG);
        let mut builder = RegisterMap::builder(regs.pending_sentinel)
            .ranges(&regs.ranges)?
            .range(METRICS_BLOCK)?
            .coils(regs.coil_base, STATUS_COIL_COUNT)
            .hook(
                regs.status_register,
                Arc::new(StatusMaterializer::new(
                    regs.coil_base,
                    regs.state_flag_enabled,
                )),
            )?;
        if peer.is_some() {
            builder = builder.hook(
                config.telemetry.trigger_register,
                Arc::new(TelemetryHook::new(
                    config.telemetry.block(),
                    regs.pending_sentinel,
                    telemetry_tx,
                )),
            )?;
        }
        let map = Arc::new(builder.build());
        metrics.publish(&map);

        let (commands_tx, commands_rx) = command_queue(
            config.queue.capacity,
            Duration::from_millis(config.queue.enqueue_timeout_ms),
        )?;

        let mut forwarder = SerialForwarder::new(bus, commands_rx, map.clone(), metrics.clone());
        if config.poller.enabled {
            forwarder = forwarder.with_poller(RangePoller::new(
                regs.ranges.clone(),
                Duration::from_millis(config.poller.interval_ms),
            ));
        }

        let interceptor = RequestInterceptor::new(
            map.clone(),
            commands_tx,
            metrics.clone(),
            restart_store,
            StatusLayout {
                status_register: regs.status_register,
                coil_base: regs.coil_base,
            },
        );
        let server = Arc::new(GatewayServer::new(
            interceptor,
            config.server.max_connections,
        ));

        let telemetry = peer.map(|peer| {
            let pusher = TelemetryPusher::new(
                peer,
                Duration::from_millis(config.telemetry.budget_ms),
                Duration::from_millis(config.telemetry.retry_interval_ms),
            );
            (pusher, telemetry_rx)
        });

        info!(
            "Gateway built: {} registers, restart #{}, telemetry {}",
            map.len(),
            restarts,
            if telemetry.is_some() { "on" } else { "off" }
        );

        Ok(Self {
            map,
            metrics,
            server,
            forwarder,
            telemetry,
        })
    }

    pub fn map(&self) -> &Arc<RegisterMap> {
        &self.map
    }

    pub fn metrics(&self) -> &Arc<GatewayMetrics> {
        &self.metrics
    }

    /// Serve clients on `listener` until `token` is cancelled
    pub async fn run(self, listener: TcpListener, token: CancellationToken) -> Result<()> {
        let serial = tokio::spawn(self.forwarder.run(token.child_token()));
        let telemetry = self
            .telemetry
            .map(|(pusher, rx)| tokio::spawn(pusher.run(rx, token.child_token())));

        let result = self.server.serve(listener, token.clone()).await;
        token.cancel();

        if let Err(e) = serial.await {
            error!("Serial forwarder task failed: {}", e);
        }
        if let Some(task) = telemetry {
            if let Err(e) = task.await {
                error!("Telemetry task failed: {}", e);
            }
        }
        info!("Gateway stopped");
        result
    }
}
