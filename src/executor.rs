//! Drives a circuit through its setup and online phases.
//!
//! The executor owns the gates of one party's circuit copy. Each phase
//! dispatches the corresponding evaluation method on every gate and lets
//! them run concurrently in a single task; gates suspend on wire readiness,
//! message futures and OT stages, so no ordering between gates is imposed
//! here. The incoming message dispatch loop is raced against each phase, and
//! any failure poisons all outstanding futures so that every waiter aborts
//! promptly.

use std::future::Future;
use std::sync::Arc;

use futures::future::{select, try_join_all, Either};
use tracing::debug;

use crate::channel::Channel;
use crate::gates::BooleanGate;
use crate::ot;
use crate::provider::Provider;
use crate::Error;

/// The per-party runtime of one circuit execution.
///
/// Gates are added in circuit order (the same order at every party) and the
/// whole computation is driven by [`Executor::run`], or by
/// [`Executor::run_setup`] and [`Executor::run_online`] separately. An
/// executor drives a single execution; it is not reusable.
pub struct Executor<C: Channel> {
    provider: Arc<Provider<C>>,
    gates: Vec<Box<dyn BooleanGate>>,
}

impl<C: Channel> Executor<C> {
    /// Creates an executor without any gates.
    pub fn new(provider: Arc<Provider<C>>) -> Self {
        Self {
            provider,
            gates: vec![],
        }
    }

    /// The provider this executor runs against.
    pub fn provider(&self) -> &Arc<Provider<C>> {
        &self.provider
    }

    /// Appends a gate. Gates must be added in the same order at all
    /// parties.
    pub fn add_gate(&mut self, gate: Box<dyn BooleanGate>) {
        self.gates.push(gate);
    }

    /// Runs the input-independent phase of every gate, preceded by the
    /// bulk base-OT exchanges the registered transfers require.
    pub async fn run_setup(&mut self) -> Result<(), Error> {
        debug!(num_gates = self.gates.len(), "running setup phase");
        let provider = Arc::clone(&self.provider);
        // Slots must exist before the dispatch loop handles any frame.
        let exchanges = ot::prepare_base_exchanges(&provider);
        let gates = &mut self.gates;
        race_dispatch(&provider, async {
            try_join_all(
                exchanges
                    .into_iter()
                    .map(|exchange| ot::run_base_exchange(&provider, exchange)),
            )
            .await?;
            try_join_all(gates.iter_mut().map(|gate| gate.evaluate_setup())).await?;
            Ok(())
        })
        .await
    }

    /// Runs the input-dependent phase of every gate. Must only be called
    /// after [`Executor::run_setup`] succeeded.
    pub async fn run_online(&mut self) -> Result<(), Error> {
        debug!(num_gates = self.gates.len(), "running online phase");
        let provider = Arc::clone(&self.provider);
        let gates = &mut self.gates;
        race_dispatch(&provider, async {
            try_join_all(gates.iter_mut().map(|gate| gate.evaluate_online())).await?;
            Ok(())
        })
        .await
    }

    /// Runs both phases. On success all output futures of the circuit are
    /// completed.
    pub async fn run(&mut self) -> Result<(), Error> {
        self.run_setup().await?;
        self.run_online().await
    }
}

/// Races a phase against the incoming message dispatch loop.
///
/// The loop ends with an error on a protocol violation or transport
/// failure (a stalled peer included), or successfully once every peer has
/// cleanly closed its end. Neither ends the phase by itself: peers that
/// already sent everything this phase needs may finish and disconnect
/// first, so the phase is given the chance to complete from the delivered
/// messages. Poisoning releases every slot the loop can no longer fill, so
/// a phase that cannot complete fails promptly instead of hanging.
async fn race_dispatch<C: Channel>(
    provider: &Provider<C>,
    drive: impl Future<Output = Result<(), Error>>,
) -> Result<(), Error> {
    tokio::pin!(drive);
    let pump = provider.dispatch_incoming();
    tokio::pin!(pump);
    match select(drive, pump).await {
        Either::Left((res, _)) => {
            if res.is_err() {
                provider.poison();
            }
            res
        }
        Either::Right((pump_res, drive)) => {
            provider.poison();
            match (drive.await, pump_res) {
                (Ok(()), _) => Ok(()),
                (Err(_), Err(pump_err)) => Err(pump_err),
                (Err(drive_err), Ok(())) => Err(drive_err),
            }
        }
    }
}
