//! The sample store.
//!
//! An ordered, title-unique registry of samples with per-attribute
//! locking, a current-selection state persisted in the configuration
//! tree, and the X-then-Y stage motion used to bring a sample into the
//! beam. The store lives on the event thread; motion progress arrives
//! as motor signals and is re-emitted as sample signals.

use beamctl_common::accounting::Accounting;
use beamctl_common::config::{Config, ConfigKey, ConfigStep, ConfigValue};
use beamctl_common::error::{CommandError, StoreError};
use beamctl_common::sample::{Sample, SampleAttr, SampleCategory, SampleValue};
use beamctl_common::ckey;

use crate::manager::DeviceManager;
use crate::motor::{MotorRole, MotorSet, MotorSignal, MotorSignalKind};

/// Which stage axes a sample switch drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveDirection {
    Both,
    X,
    Y,
}

impl MoveDirection {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "both" => Some(Self::Both),
            "x" => Some(Self::X),
            "y" => Some(Self::Y),
            _ => None,
        }
    }
}

/// Signals emitted while driving the stage to a sample.
#[derive(Debug, Clone, PartialEq)]
pub enum SampleSignal {
    MovingToSample {
        sample: String,
        motor: String,
        position: f64,
        start: f64,
        end: f64,
    },
    MovingFinished {
        success: bool,
        sample: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MovePhase {
    X,
    Y,
}

#[derive(Debug)]
struct MoveState {
    sample: String,
    direction: MoveDirection,
    phase: MovePhase,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PanicState {
    None,
    /// Waiting for the in-flight stop to settle.
    Panicking,
    Panicked,
}

/// The sample registry.
#[derive(Debug)]
pub struct SampleStore {
    samples: Vec<Sample>,
    current: Option<String>,
    move_state: Option<MoveState>,
    panic: PanicState,
}

impl Default for SampleStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SampleStore {
    pub fn new() -> Self {
        Self {
            samples: Vec::new(),
            current: None,
            move_state: None,
            panic: PanicState::None,
        }
    }

    // ─── Registry ──────────────────────────────────────────────────

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn contains(&self, title: &str) -> bool {
        self.samples.iter().any(|s| s.title == title)
    }

    pub fn get(&self, title: &str) -> Option<&Sample> {
        self.samples.iter().find(|s| s.title == title)
    }

    pub fn samples(&self) -> impl Iterator<Item = &Sample> {
        self.samples.iter()
    }

    /// Samples of one category, sorted by title.
    pub fn of_category(&self, category: SampleCategory) -> Vec<&Sample> {
        let mut out: Vec<&Sample> = self
            .samples
            .iter()
            .filter(|s| s.category == category)
            .collect();
        out.sort_by(|a, b| a.title.cmp(&b.title));
        out
    }

    /// A title not yet taken, derived from `prefix`.
    pub fn free_sample_name(&self, prefix: &str) -> String {
        if !self.contains(prefix) {
            return prefix.to_string();
        }
        let mut i = 0usize;
        loop {
            let candidate = format!("{prefix}_{i}");
            if !self.contains(&candidate) {
                return candidate;
            }
            i += 1;
        }
    }

    pub fn add_sample(&mut self, sample: Sample, config: &mut Config) -> Result<(), StoreError> {
        if self.contains(&sample.title) {
            return Err(StoreError::Duplicate(sample.title));
        }
        self.samples.push(sample);
        self.save_to_config(config);
        Ok(())
    }

    pub fn remove_sample(&mut self, title: &str, config: &mut Config) -> Result<(), StoreError> {
        let idx = self
            .samples
            .iter()
            .position(|s| s.title == title)
            .ok_or_else(|| StoreError::NotFound(title.to_string()))?;
        self.samples.remove(idx);
        if self.current.as_deref() == Some(title) {
            self.current = None;
        }
        self.save_to_config(config);
        Ok(())
    }

    /// Change one attribute, honoring locks and title uniqueness.
    pub fn update_sample(
        &mut self,
        title: &str,
        attr: SampleAttr,
        value: SampleValue,
        config: &mut Config,
    ) -> Result<(), StoreError> {
        if attr == SampleAttr::Title {
            if let SampleValue::Str(new_title) = &value {
                if new_title != title && self.contains(new_title) {
                    return Err(StoreError::Duplicate(new_title.clone()));
                }
            }
        }
        let sample = self
            .samples
            .iter_mut()
            .find(|s| s.title == title)
            .ok_or_else(|| StoreError::NotFound(title.to_string()))?;
        sample.set(attr, value)?;
        let renamed = sample.title.clone();
        if attr == SampleAttr::Title && self.current.as_deref() == Some(title) {
            self.current = Some(renamed);
        }
        self.save_to_config(config);
        Ok(())
    }

    pub fn set_locked(
        &mut self,
        title: &str,
        attr: SampleAttr,
        locked: bool,
        config: &mut Config,
    ) -> Result<(), StoreError> {
        let sample = self
            .samples
            .iter_mut()
            .find(|s| s.title == title)
            .ok_or_else(|| StoreError::NotFound(title.to_string()))?;
        sample.set_locked(attr, locked);
        self.save_to_config(config);
        Ok(())
    }

    // ─── Current selection ─────────────────────────────────────────

    pub fn current(&self) -> Option<&Sample> {
        self.current.as_deref().and_then(|t| self.get(t))
    }

    pub fn current_title(&self) -> Option<&str> {
        self.current.as_deref()
    }

    pub fn set_current(
        &mut self,
        title: Option<&str>,
        config: &mut Config,
    ) -> Result<(), StoreError> {
        if let Some(title) = title {
            if !self.contains(title) {
                return Err(StoreError::NotFound(title.to_string()));
            }
            self.current = Some(title.to_string());
        } else {
            self.current = None;
        }
        config.insert(
            ckey!["services", "samplestore", "active"],
            ConfigValue::from(self.current.clone()),
        );
        Ok(())
    }

    // ─── Config persistence ────────────────────────────────────────

    pub fn load_from_config(&mut self, config: &Config) {
        self.samples.clear();
        let list_key = ckey!["services", "samplestore", "list"];
        for child in config.keys_at(&list_key) {
            let entries: Vec<(ConfigKey, ConfigValue)> = config
                .items_under(&child)
                .into_iter()
                .map(|(k, v)| (ConfigKey(k.0[child.len()..].to_vec()), v))
                .collect();
            match Sample::from_entries(&entries) {
                Ok(sample) => self.samples.push(sample),
                Err(error) => {
                    tracing::warn!(node = %child, %error, "skipping malformed sample entry");
                }
            }
        }
        self.samples.sort_by(|a, b| a.title.cmp(&b.title));
        let active = config
            .get_str(&ckey!["services", "samplestore", "active"])
            .map(ToString::to_string);
        self.current = active.filter(|t| self.contains(t));
    }

    pub fn save_to_config(&self, config: &mut Config) {
        let list_key = ckey!["services", "samplestore", "list"];
        let mut entries: Vec<(ConfigKey, ConfigValue)> = Vec::new();
        for sample in &self.samples {
            for (rel, value) in sample.to_entries() {
                let mut steps = vec![ConfigStep::Name(sample.title.clone())];
                steps.extend(rel.0);
                entries.push((ConfigKey(steps), value));
            }
        }
        config.update_at(&list_key, entries);
        config.insert(
            ckey!["services", "samplestore", "active"],
            ConfigValue::from(self.current.clone()),
        );
    }

    // ─── Stage motion ──────────────────────────────────────────────

    fn stage_motor<'a>(
        motors: &'a MotorSet,
        role: MotorRole,
    ) -> Result<&'a crate::motor::Motor, CommandError> {
        motors.by_role(role).ok_or_else(|| {
            CommandError::Precondition(format!("no motor bound to role {role:?}"))
        })
    }

    /// Whether a sample switch is currently driving the stage.
    pub fn is_moving(&self) -> bool {
        self.move_state.is_some()
    }

    /// Drive the stage to a sample's stored position, X first, then Y.
    pub fn move_to_sample(
        &mut self,
        devices: &DeviceManager,
        motors: &MotorSet,
        accounting: &Accounting,
        config: &mut Config,
        title: &str,
        direction: MoveDirection,
    ) -> Result<(), CommandError> {
        if self.panic != PanicState::None {
            return Err(CommandError::Precondition(
                "cannot move to sample: panicking".to_string(),
            ));
        }
        if self.move_state.is_some() {
            return Err(CommandError::Precondition(
                "a sample move is already in progress".to_string(),
            ));
        }
        let xmotor = Self::stage_motor(motors, MotorRole::SampleX)?;
        let ymotor = Self::stage_motor(motors, MotorRole::SampleY)?;
        if xmotor.is_moving(devices) || ymotor.is_moving(devices) {
            return Err(CommandError::Precondition(
                "cannot move to sample: stage motors are not idle".to_string(),
            ));
        }
        let sample = self
            .get(title)
            .ok_or_else(|| CommandError::Precondition(format!("unknown sample \"{title}\"")))?
            .clone();
        self.set_current(Some(title), config)
            .map_err(|e| CommandError::Precondition(e.to_string()))?;
        let (motor, target, phase) = match direction {
            MoveDirection::Both | MoveDirection::X => {
                (xmotor, sample.positionx.val, MovePhase::X)
            }
            MoveDirection::Y => (ymotor, sample.positiony.val, MovePhase::Y),
        };
        motor.move_to(devices, accounting, target)?;
        self.move_state = Some(MoveState {
            sample: title.to_string(),
            direction,
            phase,
        });
        Ok(())
    }

    /// Feed one motor signal through the sample-move state machine.
    pub fn on_motor_signal(
        &mut self,
        devices: &DeviceManager,
        motors: &MotorSet,
        accounting: &Accounting,
        signal: &MotorSignal,
    ) -> Vec<SampleSignal> {
        let Some(state) = &self.move_state else {
            return Vec::new();
        };
        let xname = motors.by_role(MotorRole::SampleX).map(|m| m.name.clone());
        let yname = motors.by_role(MotorRole::SampleY).map(|m| m.name.clone());
        let is_x = Some(&signal.motor) == xname.as_ref();
        let is_y = Some(&signal.motor) == yname.as_ref();
        if !is_x && !is_y {
            return Vec::new();
        }
        let sample_title = state.sample.clone();
        match &signal.kind {
            MotorSignalKind::Moving {
                position,
                start,
                target,
            } => vec![SampleSignal::MovingToSample {
                sample: sample_title,
                motor: signal.motor.clone(),
                position: *position,
                start: *start,
                end: *target,
            }],
            MotorSignalKind::Stopped { success, .. } => {
                if !success {
                    self.move_state = None;
                    self.finish_panic_if_pending();
                    return vec![SampleSignal::MovingFinished {
                        success: false,
                        sample: sample_title,
                    }];
                }
                if self.panic == PanicState::Panicking {
                    self.move_state = None;
                    self.finish_panic_if_pending();
                    return vec![SampleSignal::MovingFinished {
                        success: false,
                        sample: sample_title,
                    }];
                }
                let state = self.move_state.as_mut().expect("state checked above");
                if state.phase == MovePhase::X && state.direction == MoveDirection::Both {
                    // X landed, drive Y next.
                    state.phase = MovePhase::Y;
                    let target = self
                        .get(&sample_title)
                        .map(|s| s.positiony.val)
                        .unwrap_or(0.0);
                    let start_y = Self::stage_motor(motors, MotorRole::SampleY)
                        .and_then(|m| m.move_to(devices, accounting, target));
                    if let Err(error) = start_y {
                        tracing::error!(%error, "cannot start the Y leg of a sample move");
                        self.move_state = None;
                        return vec![SampleSignal::MovingFinished {
                            success: false,
                            sample: sample_title,
                        }];
                    }
                    Vec::new()
                } else {
                    self.move_state = None;
                    vec![SampleSignal::MovingFinished {
                        success: true,
                        sample: sample_title,
                    }]
                }
            }
            _ => Vec::new(),
        }
    }

    /// Cancel an in-flight sample move, stopping both stage motors.
    pub fn stop(&mut self, devices: &DeviceManager, motors: &MotorSet) {
        if self.move_state.is_none() {
            return;
        }
        for role in [MotorRole::SampleX, MotorRole::SampleY] {
            if let Some(motor) = motors.by_role(role) {
                let _ = motor.stop(devices);
            }
        }
    }

    /// Panic handler: stop the stage and defer completion until any
    /// in-flight stop has settled.
    pub fn panic(&mut self, devices: &DeviceManager, motors: &MotorSet) {
        if self.move_state.is_some() {
            self.panic = PanicState::Panicking;
            self.stop(devices, motors);
        } else {
            self.panic = PanicState::Panicked;
        }
    }

    fn finish_panic_if_pending(&mut self) {
        if self.panic == PanicState::Panicking {
            self.panic = PanicState::Panicked;
        }
    }

    /// Whether panic propagation has completed.
    pub fn panic_settled(&self) -> bool {
        self.panic != PanicState::Panicking
    }

    /// Leave the panic state (after the operator resets the fleet).
    pub fn clear_panic(&mut self) {
        self.panic = PanicState::None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beamctl_common::sample::Measured;

    fn store_with(titles: &[&str]) -> (SampleStore, Config) {
        let mut store = SampleStore::new();
        let mut config = Config::new();
        for title in titles {
            store
                .add_sample(Sample::new(*title), &mut config)
                .unwrap();
        }
        (store, config)
    }

    #[test]
    fn titles_are_unique() {
        let (mut store, mut config) = store_with(&["GC36"]);
        assert!(matches!(
            store.add_sample(Sample::new("GC36"), &mut config),
            Err(StoreError::Duplicate(_))
        ));
    }

    #[test]
    fn renaming_onto_an_existing_title_is_rejected() {
        let (mut store, mut config) = store_with(&["A", "B"]);
        let result = store.update_sample(
            "A",
            SampleAttr::Title,
            SampleValue::Str("B".to_string()),
            &mut config,
        );
        assert!(matches!(result, Err(StoreError::Duplicate(_))));
    }

    #[test]
    fn locked_attributes_survive_the_store_roundtrip() {
        let (mut store, mut config) = store_with(&["AgBeh"]);
        store
            .update_sample(
                "AgBeh",
                SampleAttr::Thickness,
                SampleValue::Measured(Measured::new(0.1, 0.01)),
                &mut config,
            )
            .unwrap();
        store
            .set_locked("AgBeh", SampleAttr::Thickness, true, &mut config)
            .unwrap();
        store.set_current(Some("AgBeh"), &mut config).unwrap();

        let mut restored = SampleStore::new();
        restored.load_from_config(&config);
        assert_eq!(restored.len(), 1);
        let sample = restored.get("AgBeh").unwrap();
        assert!(sample.is_locked(SampleAttr::Thickness));
        assert_eq!(sample.thickness, Measured::new(0.1, 0.01));
        assert_eq!(restored.current_title(), Some("AgBeh"));
        // Locked stays locked through the generic update path.
        assert!(matches!(
            restored.update_sample(
                "AgBeh",
                SampleAttr::Thickness,
                SampleValue::Measured(Measured::exact(0.2)),
                &mut config,
            ),
            Err(StoreError::Locked { .. })
        ));
    }

    #[test]
    fn free_sample_name_avoids_collisions() {
        let (store, _) = store_with(&["Untitled", "Untitled_0"]);
        assert_eq!(store.free_sample_name("Untitled"), "Untitled_1");
        assert_eq!(store.free_sample_name("Fresh"), "Fresh");
    }

    #[test]
    fn category_projection_is_sorted_and_filtered() {
        let mut store = SampleStore::new();
        let mut config = Config::new();
        for (title, category) in [
            ("Zeta", SampleCategory::Sample),
            ("Alpha", SampleCategory::Sample),
            ("EB", SampleCategory::EmptyBeam),
        ] {
            let mut sample = Sample::new(title);
            sample.category = category;
            store.add_sample(sample, &mut config).unwrap();
        }
        let samples: Vec<&str> = store
            .of_category(SampleCategory::Sample)
            .iter()
            .map(|s| s.title.as_str())
            .collect();
        assert_eq!(samples, vec!["Alpha", "Zeta"]);
    }
}
