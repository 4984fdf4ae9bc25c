//! Serial forwarder
//!
//! Owns the field-bus client. Executes queued write commands one at a time and
//! runs poll rounds in between; a waiting command always goes first. Failed
//! commands are counted and dropped, never retried here.

use std::future;
use std::sync::Arc;

use tokio::time::{interval, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::fieldbus::FieldBus;
use super::poller::RangePoller;
use crate::core::command::WriteCommand;
use crate::core::metrics::GatewayMetrics;
use crate::core::queue::CommandReceiver;
use crate::core::register_map::RegisterMap;

enum Event {
    Command(WriteCommand),
    Poll,
    Shutdown,
}

pub struct SerialForwarder<B: FieldBus> {
    bus: B,
    commands: CommandReceiver,
    map: Arc<RegisterMap>,
    metrics: Arc<GatewayMetrics>,
    poller: Option<RangePoller>,
}

impl<B: FieldBus> SerialForwarder<B> {
    pub fn new(
        bus: B,
        commands: CommandReceiver,
        map: Arc<RegisterMap>,
        metrics: Arc<GatewayMetrics>,
    ) -> Self {
        Self {
            bus,
            commands,
            map,
            metrics,
            poller: None,
        }
    }

    pub fn with_poller(mut self, poller: RangePoller) -> Self {
        self.poller = Some(poller);
        self
    }

    /// Serve the queue until cancelled or every producer is gone
    pub async fn run(mut self, token: CancellationToken) {
        info!(
            "Serial forwarder started (poller {})",
            if self.poller.is_some() { "on" } else { "off" }
        );
        let mut ticker = self.poller.as_ref().map(|p| {
            let mut ticker = interval(p.interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });

        loop {
            let event = tokio::select! {
                biased;
                _ = token.cancelled() => Event::Shutdown,
                next = self.commands.recv() => match next {
                    Some(command) => Event::Command(command),
                    None => Event::Shutdown,
                },
                _ = tick(&mut ticker) => Event::Poll,
            };

            match event {
                Event::Command(command) => self.execute(command).await,
                Event::Poll => self.poll().await,
                Event::Shutdown => break,
            }
        }
        info!("Serial forwarder stopped");
    }

    /// Write one command to the device and confirm it in the register map
    pub async fn execute(&mut self, command: WriteCommand) {
        let started = Instant::now();
        match self.bus.write(command.address(), command.values()).await {
            Ok(()) => {
                let elapsed = started.elapsed();
                self.metrics.record_write(elapsed);
                if let Err(e) = self.map.set_range(command.address(), command.values()) {
                    error!("Confirmed write not stored: {}", e);
                }
                debug!(
                    address = command.address(),
                    len = command.len(),
                    "Serial write confirmed in {:?}",
                    elapsed
                );
            },
            Err(e) => {
                // Entry stays pending until a later write or poll corrects it
                self.metrics.record_write_error(e.kind);
                error!(
                    address = command.address(),
                    kind = %e.kind,
                    "Serial write failed: {}",
                    e
                );
            },
        }
        self.metrics.set_queue_depth(self.commands.len());
        self.metrics.publish(&self.map);
    }

    async fn poll(&mut self) {
        let Some(poller) = self.poller.as_ref() else {
            return;
        };
        let commands = &self.commands;
        poller
            .poll_round(&mut self.bus, &self.map, &self.metrics, || {
                !commands.is_empty()
            })
            .await;
        self.metrics.publish(&self.map);
    }
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        },
        None => future::pending::<()>().await,
    }
}
