//! Structured variable names.
//!
//! Multi-axis controllers expose one copy of each variable per axis. On
//! the wire of internal messages the string form `base$axis` is kept for
//! debuggability, but internally a name is a `{base, axis}` pair. Raw
//! device-unit companions of physical variables carry a `:raw` suffix on
//! the base name.

use std::fmt;
use std::str::FromStr;

/// Name of a device variable, optionally bound to one axis.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VarName {
    base: String,
    axis: Option<u8>,
}

impl VarName {
    /// A per-device variable.
    pub fn plain(base: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            axis: None,
        }
    }

    /// A per-axis variable.
    pub fn per_axis(base: impl Into<String>, axis: u8) -> Self {
        Self {
            base: base.into(),
            axis: Some(axis),
        }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn axis(&self) -> Option<u8> {
        self.axis
    }

    /// The same name rebound to another axis.
    pub fn on_axis(&self, axis: u8) -> Self {
        Self {
            base: self.base.clone(),
            axis: Some(axis),
        }
    }

    /// The raw-device-units companion of this name.
    pub fn raw(&self) -> Self {
        Self {
            base: format!("{}:raw", self.base),
            axis: self.axis,
        }
    }

    /// Whether this is a raw companion variable.
    pub fn is_raw(&self) -> bool {
        self.base.ends_with(":raw")
    }

    /// Base name with any `:raw` suffix stripped.
    pub fn physical_base(&self) -> &str {
        self.base.strip_suffix(":raw").unwrap_or(&self.base)
    }
}

impl fmt::Display for VarName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.axis {
            Some(axis) => write!(f, "{}${axis}", self.base),
            None => f.write_str(&self.base),
        }
    }
}

impl FromStr for VarName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('$') {
            Some((base, axis)) => {
                let axis: u8 = axis
                    .parse()
                    .map_err(|_| format!("invalid axis index in variable name '{s}'"))?;
                Ok(Self::per_axis(base, axis))
            }
            None => Ok(Self::plain(s)),
        }
    }
}

impl From<&str> for VarName {
    fn from(s: &str) -> Self {
        s.parse().unwrap_or_else(|_| Self::plain(s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_matches_the_wire_form() {
        assert_eq!(VarName::plain("pressure").to_string(), "pressure");
        assert_eq!(
            VarName::per_axis("actualposition", 2).to_string(),
            "actualposition$2"
        );
        assert_eq!(
            VarName::per_axis("actualposition", 2).raw().to_string(),
            "actualposition:raw$2"
        );
    }

    #[test]
    fn parse_roundtrips() {
        for s in ["pressure", "actualposition$2", "maxspeed:raw$5"] {
            let name: VarName = s.parse().unwrap();
            assert_eq!(name.to_string(), s);
        }
    }

    #[test]
    fn raw_companions_are_recognized() {
        let name = VarName::per_axis("maxspeed", 1).raw();
        assert!(name.is_raw());
        assert_eq!(name.physical_base(), "maxspeed");
        assert!(!VarName::plain("maxspeed").is_raw());
    }
}
