//! Simulation laws: per-PV evolution rules, modeled as a closed, tagged
//! variant rather than a stored function pointer, so every rule the
//! registry can apply is enumerable and exhaustively testable.

use rand::Rng;

use super::PvIndex;

/// A closed set of per-tick evolution rules. `None` means the PV never
/// changes on its own (setpoints, readbacks and status PVs are all
/// `None` here; readbacks/status are instead driven by
/// [`super::Registry::step_motors`]).
#[derive(Debug, Clone)]
pub enum SimLaw {
    None,
    /// `350 + noise*4.0`, clamped to the PV's own range.
    RingCurrent,
    /// `10^(-8.3 + noise*0.2)`, clamped to the PV's own range.
    Vacuum,
    /// Brownian drift: `d += noise*0.01`, value is `23 + d`.
    Temperature { drift: f64 },
    /// Proportional to another PV (normalized by 350.0), plus noise.
    DetectorProportional { base: f64, ring_current: Option<PvIndex> },
    /// Instantaneous follow of a command PV's value.
    ShutterFollow { command: Option<PvIndex> },
}

/// Draws a uniform sample on `[-0.5, 0.5)`.
fn noise(rng: &mut impl Rng) -> f64 {
    rng.gen_range(-0.5..0.5)
}

impl SimLaw {
    /// Computes the next value for a PV whose current value is `current`
    /// and whose bounds are `(min, max)`. `snapshot` is every PV's value
    /// as observed at the start of this tick, used for cross-PV reads so
    /// that a tick's dependencies always see a consistent snapshot rather
    /// than a partially-updated vector.
    pub fn apply(
        &mut self,
        current: f64,
        min: f64,
        max: f64,
        snapshot: &[f64],
        rng: &mut impl Rng,
    ) -> f64 {
        match self {
            SimLaw::None => current,
            SimLaw::RingCurrent => (350.0 + noise(rng) * 4.0).clamp(min, max),
            SimLaw::Vacuum => {
                let exponent = -8.3 + noise(rng) * 0.2;
                10f64.powf(exponent).clamp(min, max)
            }
            SimLaw::Temperature { drift } => {
                *drift += noise(rng) * 0.01;
                (23.0 + *drift).clamp(min, max)
            }
            SimLaw::DetectorProportional { base, ring_current } => match ring_current
                .and_then(|idx| snapshot.get(idx.0))
            {
                Some(&ring) => {
                    let value = base * (ring / 350.0) + noise(rng) * (*base * 0.01);
                    value.clamp(min, max)
                }
                None => current,
            },
            SimLaw::ShutterFollow { command } => match command.and_then(|idx| snapshot.get(idx.0))
            {
                Some(&cmd) => cmd,
                None => current,
            },
        }
    }
}
