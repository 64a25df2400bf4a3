//! Per-variable cache entries with freshness tracking.

use std::time::{Duration, Instant};

use crate::varname::VarName;

/// A dynamically typed variable value.
#[derive(Debug, Clone, PartialEq)]
pub enum VarValue {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl VarValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(x) => Some(*x),
            Self::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl std::fmt::Display for VarValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => f.write_str("none"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Str(s) => f.write_str(s),
        }
    }
}

impl From<bool> for VarValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for VarValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for VarValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for VarValue {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for VarValue {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

/// Static description of one variable of a device.
#[derive(Debug, Clone)]
pub struct VarSpec {
    pub name: VarName,
    /// Queried before the others at startup; startup is done once every
    /// urgent variable has a valid value.
    pub urgent: bool,
    /// Automatic re-query interval; `None` means query once and then
    /// only on demand.
    pub timeout: Option<Duration>,
    /// Variables whose updates re-derive this one. A variable with
    /// dependencies is never queried directly.
    pub depends_from: Vec<VarName>,
}

impl VarSpec {
    pub fn new(name: VarName) -> Self {
        Self {
            name,
            urgent: false,
            timeout: None,
            depends_from: Vec::new(),
        }
    }

    pub fn urgent(mut self) -> Self {
        self.urgent = true;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn depends_on(mut self, name: VarName) -> Self {
        self.depends_from.push(name);
        self
    }
}

/// One live cache entry of the back-end's variable table.
#[derive(Debug)]
pub struct Variable {
    spec: VarSpec,
    value: Option<VarValue>,
    timestamp: Option<Instant>,
    last_queried: Option<Instant>,
    boosted_timeout: Option<Duration>,
    pending_signals: u32,
}

impl Variable {
    pub fn new(spec: VarSpec) -> Self {
        Self {
            spec,
            value: None,
            timestamp: None,
            last_queried: None,
            boosted_timeout: None,
            pending_signals: 0,
        }
    }

    pub fn spec(&self) -> &VarSpec {
        &self.spec
    }

    pub fn name(&self) -> &VarName {
        &self.spec.name
    }

    pub fn value(&self) -> Option<&VarValue> {
        self.value.as_ref()
    }

    /// Timestamp of the last update.
    pub fn timestamp(&self) -> Option<Instant> {
        self.timestamp
    }

    pub fn has_valid_value(&self) -> bool {
        self.value.is_some()
    }

    /// A value is fresh relative to `reference` iff it was updated
    /// strictly after it.
    pub fn fresh_since(&self, reference: Instant) -> bool {
        matches!(self.timestamp, Some(ts) if ts > reference)
    }

    /// The auto-query interval currently in force.
    pub fn effective_timeout(&self) -> Option<Duration> {
        self.boosted_timeout.or(self.spec.timeout)
    }

    /// Temporarily raise the query rate (e.g. during motion).
    pub fn boost_timeout(&mut self, timeout: Duration) {
        self.boosted_timeout = Some(timeout);
    }

    /// Return to the spec-declared query rate.
    pub fn reset_timeout(&mut self) {
        self.boosted_timeout = None;
    }

    /// Whether an automatic query is due at `now`.
    ///
    /// Derived variables are never queried directly; everything else is
    /// due once at startup, and afterwards whenever its interval has
    /// elapsed since the last query.
    pub fn is_due(&self, now: Instant) -> bool {
        if !self.spec.depends_from.is_empty() {
            return false;
        }
        match self.last_queried {
            None => true,
            Some(at) => match self.effective_timeout() {
                Some(interval) => now.duration_since(at) >= interval,
                None => false,
            },
        }
    }

    pub fn mark_queried(&mut self, now: Instant) {
        self.last_queried = Some(now);
    }

    /// Make the very next update emit an event even if unchanged.
    pub fn add_pending_signal(&mut self) {
        self.pending_signals += 1;
    }

    /// Apply an update; returns whether an event must be emitted.
    ///
    /// The timestamp always advances. An unchanged, unforced update with
    /// no outstanding signal request is silent; any pending signal is
    /// consumed by the update.
    pub fn apply_update(&mut self, value: VarValue, force: bool, now: Instant) -> bool {
        let changed = self.value.as_ref() != Some(&value);
        self.value = Some(value);
        self.timestamp = Some(now);
        let signalled = self.pending_signals > 0;
        if signalled {
            self.pending_signals -= 1;
        }
        changed || force || signalled
    }

    /// Drop the cached value (device disconnected).
    pub fn invalidate(&mut self) {
        self.value = None;
        self.timestamp = None;
        self.last_queried = None;
        self.boosted_timeout = None;
        self.pending_signals = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn var(name: &str) -> Variable {
        Variable::new(VarSpec::new(VarName::plain(name)))
    }

    #[test]
    fn timestamps_advance_on_every_update() {
        let mut v = var("pressure");
        assert!(v.apply_update(VarValue::Float(0.01), false, Instant::now()));
        let first = v.timestamp().unwrap();
        std::thread::sleep(Duration::from_millis(2));
        v.apply_update(VarValue::Float(0.01), false, Instant::now());
        let second = v.timestamp().unwrap();
        assert!(second > first);
    }

    #[test]
    fn unchanged_update_is_silent_unless_signalled_or_forced() {
        let mut v = var("pressure");
        assert!(v.apply_update(VarValue::Float(1.0), false, Instant::now()));
        assert!(!v.apply_update(VarValue::Float(1.0), false, Instant::now()));
        assert!(v.apply_update(VarValue::Float(1.0), true, Instant::now()));
        v.add_pending_signal();
        assert!(v.apply_update(VarValue::Float(1.0), false, Instant::now()));
        // The pending signal was consumed.
        assert!(!v.apply_update(VarValue::Float(1.0), false, Instant::now()));
    }

    #[test]
    fn freshness_is_relative_to_a_reference_time() {
        let mut v = var("actualspeed");
        let before = Instant::now();
        std::thread::sleep(Duration::from_millis(2));
        v.apply_update(VarValue::Int(0), false, Instant::now());
        assert!(v.fresh_since(before));
        std::thread::sleep(Duration::from_millis(2));
        assert!(!v.fresh_since(Instant::now()));
    }

    #[test]
    fn due_logic_honors_intervals_and_dependencies() {
        let now = Instant::now();
        let mut plain = var("load");
        assert!(plain.is_due(now), "never-queried variables are due once");
        plain.mark_queried(now);
        assert!(!plain.is_due(now), "no interval: due only once");

        let mut periodic = Variable::new(
            VarSpec::new(VarName::plain("pressure")).timeout(Duration::from_millis(10)),
        );
        periodic.mark_queried(now);
        assert!(!periodic.is_due(now));
        assert!(periodic.is_due(now + Duration::from_millis(11)));

        let derived = Variable::new(
            VarSpec::new(VarName::plain("maxspeed"))
                .depends_on(VarName::plain("maxspeed:raw")),
        );
        assert!(!derived.is_due(now), "derived variables are not queried");
    }

    #[test]
    fn boost_overrides_and_reset_restores_the_interval() {
        let now = Instant::now();
        let mut v = var("actualposition");
        v.mark_queried(now);
        assert!(!v.is_due(now + Duration::from_secs(3600)));
        v.boost_timeout(Duration::from_millis(100));
        assert!(v.is_due(now + Duration::from_millis(150)));
        v.reset_timeout();
        assert!(!v.is_due(now + Duration::from_secs(3600)));
    }
}
