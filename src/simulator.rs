//! Line simulator for `--simulate` runs.
//!
//! Plays the controller's side against a [`MockPlc`]: boxes arrive at the
//! identification station, slots raise their sampling trigger, the measurement
//! blocks carry noisy readings. Now and then the controller drops a sampling
//! trigger early, which exercises the external-stop path.

use crate::address::{AddressLayout, Slot};
use crate::link::MockPlc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

/// Per-tick probabilities.
#[derive(Debug, Clone, Copy)]
pub struct SimulationRates {
    /// A box arrives at the identification station.
    pub arrival: f64,
    /// An idle slot raises its sampling trigger.
    pub sampling_start: f64,
    /// A raised sampling trigger is released by the controller.
    pub early_release: f64,
}

impl Default for SimulationRates {
    fn default() -> Self {
        Self {
            arrival: 0.05,
            sampling_start: 0.01,
            early_release: 0.002,
        }
    }
}

/// Drives a [`MockPlc`] like a production line would.
pub struct LineSimulator {
    plc: MockPlc,
    layout: AddressLayout,
    rates: SimulationRates,
    rng: StdRng,
    boxes: u32,
}

impl LineSimulator {
    /// Create a mock controller whose data block covers every field of `layout`.
    pub fn plc_for(layout: &AddressLayout) -> MockPlc {
        let extent = layout
            .occupied_ranges()
            .unwrap_or_default()
            .iter()
            .map(|(_, _, end)| *end)
            .max()
            .unwrap_or(0);
        let plc = MockPlc::new();
        plc.add_region(layout.region, extent as usize);
        plc
    }

    /// Simulate the line behind `plc`. Equal seeds give equal runs.
    pub fn new(plc: MockPlc, layout: AddressLayout, seed: u64) -> Self {
        Self {
            plc,
            layout,
            rates: SimulationRates::default(),
            rng: StdRng::seed_from_u64(seed),
            boxes: 0,
        }
    }

    /// Override the event probabilities.
    pub fn with_rates(mut self, rates: SimulationRates) -> Self {
        self.rates = rates;
        self
    }

    /// Number of boxes sent to the identification station so far.
    pub fn boxes(&self) -> u32 {
        self.boxes
    }

    /// Advance the line by one tick.
    pub fn step(&mut self) {
        let region = self.layout.region;
        let trigger = self.layout.identification_trigger;

        if !self.plc.bit(region, trigger) && self.rng.gen_bool(self.rates.arrival) {
            self.boxes += 1;
            let highest = i16::try_from(self.layout.slot_count).unwrap_or(i16::MAX);
            let identifier = self.rng.gen_range(1..=highest);
            let label = format!("BOX-{:05}", self.boxes);
            self.plc
                .set_word16(region, self.layout.identifier_offset, identifier);
            self.plc.set_text(
                region,
                self.layout.label_offset,
                self.layout.label_length,
                &label,
            );
            self.plc.set_bit(region, trigger, true);
            debug!(identifier, %label, "Simulated box arrival");
        }

        let slots: Vec<Slot> = self.layout.slots().collect();
        for slot in slots {
            let bit = self.layout.sampling_trigger(slot);
            let raised = self.plc.bit(region, bit);
            if !raised && self.rng.gen_bool(self.rates.sampling_start) {
                self.plc.set_bit(region, bit, true);
            } else if raised && self.rng.gen_bool(self.rates.early_release) {
                self.plc.set_bit(region, bit, false);
            }

            let reading = [
                self.rng.gen_range(80.0..120.0),
                self.rng.gen_range(225.0..235.0),
                self.rng.gen_range(20.0..40.0),
                self.rng.gen_range(20.0..40.0),
            ];
            self.plc
                .set_floats4(region, self.layout.data_offset(slot), reading);
        }
    }

    /// Step every `tick` until `shutdown` turns `true`.
    pub async fn run(mut self, tick: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(tick);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.step(),
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}
