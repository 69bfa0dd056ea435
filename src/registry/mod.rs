//! Device registry: the PV store, the motor model, and the per-tick
//! simulation update.
//!
//! The registry owns two `Vec`s (PVs, motors); a motor holds small
//! integer indices into the PV vector rather than a pointer, so PV
//! storage can move without invalidating a motor. Lookup by name also
//! keeps a `HashMap` index, while [`Registry::list`] still walks the PV
//! vector in registration order, since client-facing enumeration order
//! must stay stable.

mod glob;
mod sim;

pub use sim::SimLaw;

use log::error;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::HashMap;

pub const CONVERGENCE_EPS: f64 = 1e-3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    AnalogIn,
    AnalogOut,
    BinaryIn,
    BinaryOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PvIndex(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MotorIndex(pub usize);

#[derive(Debug, Clone)]
pub struct Pv {
    pub name: String,
    pub kind: Kind,
    pub value: f64,
    pub min: f64,
    pub max: f64,
    pub writable: bool,
    law: SimLaw,
}

impl Pv {
    fn in_range(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

#[derive(Debug, Clone)]
pub struct Motor {
    pub name: String,
    pub setpoint: PvIndex,
    pub readback: PvIndex,
    pub status: PvIndex,
    pub velocity: f64,
    pub target: f64,
    pub moving: bool,
    /// When set, writing the setpoint updates the readback immediately,
    /// bypassing the motor rule entirely, instead of converging at
    /// `velocity` like an ordinary move.
    pub instant_readback: bool,
}

pub struct Registry {
    pvs: Vec<Pv>,
    motors: Vec<Motor>,
    by_name: HashMap<String, PvIndex>,
    motor_by_setpoint: HashMap<usize, MotorIndex>,
    max_pvs: usize,
    max_motors: usize,
    rng: StdRng,
}

impl Registry {
    pub fn new(max_pvs: usize, max_motors: usize) -> Self {
        Self {
            pvs: Vec::new(),
            motors: Vec::new(),
            by_name: HashMap::new(),
            motor_by_setpoint: HashMap::new(),
            max_pvs,
            max_motors,
            rng: StdRng::from_rng(rand::thread_rng()).expect("seeding simulator rng"),
        }
    }

    fn register_pv(
        &mut self,
        name: &str,
        kind: Kind,
        value: f64,
        min: f64,
        max: f64,
        writable: bool,
        law: SimLaw,
    ) -> Option<PvIndex> {
        if self.pvs.len() >= self.max_pvs {
            error!("PV registry exhausted, refusing to register {name}");
            return None;
        }
        if self.by_name.contains_key(name) {
            error!("duplicate PV name {name}, refusing to register");
            return None;
        }
        let idx = PvIndex(self.pvs.len());
        self.pvs.push(Pv {
            name: name.to_owned(),
            kind,
            value,
            min,
            max,
            writable,
            law,
        });
        self.by_name.insert(name.to_owned(), idx);
        Some(idx)
    }

    #[allow(clippy::too_many_arguments)]
    fn register_motor(
        &mut self,
        name: &str,
        initial: f64,
        min: f64,
        max: f64,
        velocity: f64,
        instant_readback: bool,
    ) -> Option<MotorIndex> {
        if self.motors.len() >= self.max_motors {
            error!("motor registry exhausted, refusing to register {name}");
            return None;
        }
        let setpoint = self.register_pv(name, Kind::AnalogOut, initial, min, max, true, SimLaw::None)?;
        let readback = self.register_pv(
            &format!("{name}.RBV"),
            Kind::AnalogIn,
            initial,
            min,
            max,
            false,
            SimLaw::None,
        )?;
        let status = self.register_pv(
            &format!("{name}.DMOV"),
            Kind::BinaryIn,
            0.0,
            0.0,
            1.0,
            false,
            SimLaw::None,
        )?;
        let idx = MotorIndex(self.motors.len());
        self.motors.push(Motor {
            name: name.to_owned(),
            setpoint,
            readback,
            status,
            velocity,
            target: initial,
            moving: false,
            instant_readback,
        });
        self.motor_by_setpoint.insert(setpoint.0, idx);
        Some(idx)
    }

    /// Populates the catalog in a fixed, deterministic order: sensors
    /// first, then the shutter pair, then each motor's setpoint/readback/
    /// status triple.
    pub fn init(&mut self) {
        self.register_pv(
            "BL02:RING:CURRENT",
            Kind::AnalogIn,
            350.0,
            0.0,
            400.0,
            false,
            SimLaw::RingCurrent,
        );
        self.register_pv(
            "BL02:VAC:PRESSURE",
            Kind::AnalogIn,
            5e-9,
            1e-10,
            1e-8,
            false,
            SimLaw::Vacuum,
        );
        self.register_pv(
            "BL02:TEMP:HUTCH",
            Kind::AnalogIn,
            23.0,
            20.0,
            26.0,
            false,
            SimLaw::Temperature { drift: 0.0 },
        );

        let ring_current = self.find_pv("BL02:RING:CURRENT");
        self.register_pv(
            "BL02:DET:I0",
            Kind::AnalogIn,
            5e5,
            0.0,
            1e6,
            false,
            SimLaw::DetectorProportional { base: 5e5, ring_current },
        );
        self.register_pv(
            "BL02:DET:IT",
            Kind::AnalogIn,
            4.5e5,
            0.0,
            1e6,
            false,
            SimLaw::DetectorProportional { base: 4.5e5, ring_current },
        );
        self.register_pv(
            "BL02:DET:IF",
            Kind::AnalogIn,
            5e4,
            0.0,
            1e5,
            false,
            SimLaw::DetectorProportional { base: 5e4, ring_current },
        );

        self.register_pv(
            "BL02:SHUTTER:CMD",
            Kind::BinaryOut,
            0.0,
            0.0,
            1.0,
            true,
            SimLaw::None,
        );
        let shutter_cmd = self.find_pv("BL02:SHUTTER:CMD");
        self.register_pv(
            "BL02:SHUTTER:STATUS",
            Kind::BinaryIn,
            0.0,
            0.0,
            1.0,
            false,
            SimLaw::ShutterFollow { command: shutter_cmd },
        );

        self.register_motor("BL02:MONO:ENERGY", 7000.0, 5000.0, 20000.0, 500.0, true);
        self.register_motor("BL02:SAMPLE:X", 0.0, -50000.0, 50000.0, 1000.0, false);
    }

    pub fn find_pv(&self, name: &str) -> Option<PvIndex> {
        self.by_name.get(name).copied()
    }

    pub fn find_motor(&self, name: &str) -> Option<MotorIndex> {
        self.find_pv(name).and_then(|idx| self.motor_by_setpoint.get(&idx.0)).copied()
    }

    pub fn get(&self, idx: PvIndex) -> f64 {
        self.pvs[idx.0].value
    }

    pub fn pv(&self, idx: PvIndex) -> &Pv {
        &self.pvs[idx.0]
    }

    pub fn motor(&self, idx: MotorIndex) -> &Motor {
        &self.motors[idx.0]
    }

    /// Writes a PV's value. Fails (without mutation) if the PV is
    /// read-only or the value lies outside `[min, max]`.
    pub fn set(&mut self, idx: PvIndex, value: f64) -> bool {
        let in_range = {
            let pv = &self.pvs[idx.0];
            pv.writable && pv.in_range(value)
        };
        if !in_range {
            return false;
        }
        self.pvs[idx.0].value = value;
        if let Some(&motor_idx) = self.motor_by_setpoint.get(&idx.0) {
            let motor = &self.motors[motor_idx.0];
            if motor.instant_readback {
                let rb = motor.readback;
                let clamped = value.clamp(self.pvs[rb.0].min, self.pvs[rb.0].max);
                self.pvs[rb.0].value = clamped;
            }
        }
        true
    }

    /// Commands a motor to a new target. Fails on an unknown motor or an
    /// out-of-range target, both reported the same way to the caller so
    /// a client can't distinguish "no such motor" from "exists but
    /// rejected" by return value alone. A motor with its
    /// `instant_readback` bit set snaps straight to idle at the target
    /// instead of converging at `velocity`, matching the immediate
    /// readback its setpoint already gets on a plain write.
    pub fn motor_move(&mut self, name: &str, target: f64) -> bool {
        let Some(idx) = self.find_motor(name) else {
            return false;
        };
        let setpoint = self.motors[idx.0].setpoint;
        if !self.pvs[setpoint.0].in_range(target) {
            return false;
        }
        self.pvs[setpoint.0].value = target;
        let instant_readback = self.motors[idx.0].instant_readback;
        let (readback, status) = (self.motors[idx.0].readback, self.motors[idx.0].status);
        let motor = &mut self.motors[idx.0];
        motor.target = target;
        motor.moving = !instant_readback;
        if instant_readback {
            self.pvs[readback.0].value = target;
            self.pvs[status.0].value = 0.0;
        }
        true
    }

    pub fn motor_status_string(&self, idx: MotorIndex) -> &'static str {
        if self.motors[idx.0].moving {
            "MOVING"
        } else {
            "IDLE"
        }
    }

    /// Matches PV names against the `LIST` glob grammar, in registration
    /// order. Buffer-size truncation happens downstream, in
    /// [`crate::protocol::format_response`], the one place a wire-size
    /// bound is otherwise enforced.
    pub fn list(&self, pattern: &str) -> Vec<String> {
        self.pvs
            .iter()
            .filter(|pv| glob::glob_match(pattern, &pv.name))
            .map(|pv| pv.name.clone())
            .collect()
    }

    /// Advances every sensor and motor by one tick.
    pub fn update(&mut self, dt_seconds: f64) {
        let snapshot: Vec<f64> = self.pvs.iter().map(|pv| pv.value).collect();
        for pv in &mut self.pvs {
            let next = pv.law.apply(pv.value, pv.min, pv.max, &snapshot, &mut self.rng);
            pv.value = next.clamp(pv.min, pv.max);
        }
        self.step_motors(dt_seconds);
    }

    fn step_motors(&mut self, dt_seconds: f64) {
        for motor in &mut self.motors {
            if !motor.moving {
                continue;
            }
            let readback = &mut self.pvs[motor.readback.0];
            let diff = motor.target - readback.value;
            if diff.abs() < CONVERGENCE_EPS {
                readback.value = motor.target;
                motor.moving = false;
            } else {
                let step = motor.velocity * dt_seconds;
                if diff.abs() < step {
                    readback.value = motor.target;
                    motor.moving = false;
                } else {
                    readback.value += diff.signum() * step;
                }
            }
            let status_value = if motor.moving { 1.0 } else { 0.0 };
            self.pvs[motor.status.0].value = status_value;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh() -> Registry {
        let mut r = Registry::new(128, 16);
        r.init();
        r
    }

    #[test]
    fn pv_values_stay_in_range_across_many_ticks() {
        let mut r = fresh();
        for _ in 0..1000 {
            r.update(0.01);
            for pv in &r.pvs {
                assert!(
                    pv.value >= pv.min && pv.value <= pv.max,
                    "{} out of range: {}",
                    pv.name,
                    pv.value
                );
            }
        }
    }

    #[test]
    fn set_rejects_out_of_range_without_mutating() {
        let mut r = fresh();
        let idx = r.find_pv("BL02:MONO:ENERGY").unwrap();
        let before = r.get(idx);
        assert!(!r.set(idx, 50000.0));
        assert_eq!(r.get(idx), before);
    }

    #[test]
    fn set_accepts_exact_boundary() {
        let mut r = fresh();
        let idx = r.find_pv("BL02:MONO:ENERGY").unwrap();
        assert!(r.set(idx, 20000.0));
        assert_eq!(r.get(idx), 20000.0);
    }

    #[test]
    fn set_rejects_read_only_pv() {
        let mut r = fresh();
        let idx = r.find_pv("BL02:RING:CURRENT").unwrap();
        let before = r.get(idx);
        assert!(!r.set(idx, 100.0));
        assert_eq!(r.get(idx), before);
    }

    #[test]
    fn mono_energy_readback_is_instantaneous() {
        let mut r = fresh();
        let setpoint = r.find_pv("BL02:MONO:ENERGY").unwrap();
        assert!(r.set(setpoint, 7112.0));
        let rbv = r.find_pv("BL02:MONO:ENERGY.RBV").unwrap();
        assert_eq!(r.get(rbv), 7112.0);
    }

    #[test]
    fn mono_energy_move_also_snaps_readback_instantly() {
        let mut r = fresh();
        assert!(r.motor_move("BL02:MONO:ENERGY", 7112.0));
        let idx = r.find_motor("BL02:MONO:ENERGY").unwrap();
        assert_eq!(r.motor_status_string(idx), "IDLE");
        let rbv = r.find_pv("BL02:MONO:ENERGY.RBV").unwrap();
        assert_eq!(r.get(rbv), 7112.0);
        let dmov = r.find_pv("BL02:MONO:ENERGY.DMOV").unwrap();
        assert_eq!(r.get(dmov), 0.0);
    }

    #[test]
    fn motor_move_transitions_to_idle_and_converges() {
        let mut r = fresh();
        assert!(r.motor_move("BL02:SAMPLE:X", 1000.0));
        let idx = r.find_motor("BL02:SAMPLE:X").unwrap();
        assert_eq!(r.motor_status_string(idx), "MOVING");
        for _ in 0..200 {
            r.update(0.01);
        }
        assert_eq!(r.motor_status_string(idx), "IDLE");
        let rbv = r.find_pv("BL02:SAMPLE:X.RBV").unwrap();
        assert!((r.get(rbv) - 1000.0).abs() < CONVERGENCE_EPS);
        let dmov = r.find_pv("BL02:SAMPLE:X.DMOV").unwrap();
        assert_eq!(r.get(dmov), 0.0);
    }

    #[test]
    fn motor_move_rejects_out_of_range_target() {
        let mut r = fresh();
        assert!(!r.motor_move("BL02:SAMPLE:X", 1_000_000.0));
    }

    #[test]
    fn motor_move_rejects_unknown_motor() {
        let mut r = fresh();
        assert!(!r.motor_move("NOPE", 10.0));
    }

    #[test]
    fn shutter_status_follows_command() {
        let mut r = fresh();
        let cmd = r.find_pv("BL02:SHUTTER:CMD").unwrap();
        assert!(r.set(cmd, 1.0));
        r.update(0.01);
        let status = r.find_pv("BL02:SHUTTER:STATUS").unwrap();
        assert_eq!(r.get(status), 1.0);
    }

    #[test]
    fn list_matches_glob_in_registration_order() {
        let r = fresh();
        let all = r.list("*");
        assert_eq!(all[0], "BL02:RING:CURRENT");
        assert!(all.contains(&"BL02:SAMPLE:X.DMOV".to_string()));

        let detectors = r.list("BL02:DET:*");
        assert_eq!(
            detectors,
            vec!["BL02:DET:I0", "BL02:DET:IT", "BL02:DET:IF"]
        );
    }

    #[test]
    fn registry_refuses_registration_past_capacity() {
        let mut r = Registry::new(2, 1);
        assert!(r
            .register_pv("A", Kind::AnalogIn, 0.0, 0.0, 1.0, false, SimLaw::None)
            .is_some());
        assert!(r
            .register_pv("B", Kind::AnalogIn, 0.0, 0.0, 1.0, false, SimLaw::None)
            .is_some());
        assert!(r
            .register_pv("C", Kind::AnalogIn, 0.0, 0.0, 1.0, false, SimLaw::None)
            .is_none());
    }
}
