//! Sample metadata with per-attribute locking.
//!
//! A sample records where it sits on the stage, how thick it is, its
//! measured transmission and bookkeeping attributes. Any attribute can
//! be locked individually; a locked attribute rejects mutation until it
//! is unlocked again.

use std::collections::BTreeSet;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::config::{ConfigKey, ConfigValue};
use crate::error::StoreError;

/// A value with its standard error.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Measured {
    pub val: f64,
    pub err: f64,
}

impl Measured {
    pub const fn new(val: f64, err: f64) -> Self {
        Self { val, err }
    }

    pub const fn exact(val: f64) -> Self {
        Self { val, err: 0.0 }
    }
}

/// What kind of measurement the sample belongs to.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default,
)]
pub enum SampleCategory {
    #[serde(rename = "calibration sample")]
    Calibrant,
    #[serde(rename = "normalization sample")]
    NormalizationSample,
    #[serde(rename = "sample")]
    #[default]
    Sample,
    #[serde(rename = "sample+can")]
    SampleAndCan,
    #[serde(rename = "can")]
    Can,
    #[serde(rename = "sample+buffer")]
    SampleAndBuffer,
    #[serde(rename = "buffer")]
    Buffer,
    #[serde(rename = "sample environment")]
    SampleEnvironment,
    #[serde(rename = "Empty beam")]
    EmptyBeam,
    #[serde(rename = "Dark")]
    Dark,
    #[serde(rename = "none")]
    None,
}

impl SampleCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Calibrant => "calibration sample",
            Self::NormalizationSample => "normalization sample",
            Self::Sample => "sample",
            Self::SampleAndCan => "sample+can",
            Self::Can => "can",
            Self::SampleAndBuffer => "sample+buffer",
            Self::Buffer => "buffer",
            Self::SampleEnvironment => "sample environment",
            Self::EmptyBeam => "Empty beam",
            Self::Dark => "Dark",
            Self::None => "none",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "calibration sample" => Some(Self::Calibrant),
            "normalization sample" => Some(Self::NormalizationSample),
            "sample" => Some(Self::Sample),
            "sample+can" => Some(Self::SampleAndCan),
            "can" => Some(Self::Can),
            "sample+buffer" => Some(Self::SampleAndBuffer),
            "buffer" => Some(Self::Buffer),
            "sample environment" => Some(Self::SampleEnvironment),
            "Empty beam" => Some(Self::EmptyBeam),
            "Dark" => Some(Self::Dark),
            "none" => Some(Self::None),
            _ => Option::None,
        }
    }
}

/// The environment the sample is measured in.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default,
)]
pub enum SampleSituation {
    #[serde(rename = "air")]
    Air,
    #[serde(rename = "vacuum")]
    #[default]
    Vacuum,
    #[serde(rename = "sealed can")]
    SealedCan,
}

impl SampleSituation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Air => "air",
            Self::Vacuum => "vacuum",
            Self::SealedCan => "sealed can",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "air" => Some(Self::Air),
            "vacuum" => Some(Self::Vacuum),
            "sealed can" => Some(Self::SealedCan),
            _ => None,
        }
    }
}

/// Lockable attributes of a sample.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum SampleAttr {
    Title,
    PositionX,
    PositionY,
    Thickness,
    Transmission,
    DistMinus,
    PreparedBy,
    PrepareTime,
    Description,
    Category,
    Situation,
    Project,
    MaskOverride,
}

impl SampleAttr {
    pub const ALL: [SampleAttr; 13] = [
        Self::Title,
        Self::PositionX,
        Self::PositionY,
        Self::Thickness,
        Self::Transmission,
        Self::DistMinus,
        Self::PreparedBy,
        Self::PrepareTime,
        Self::Description,
        Self::Category,
        Self::Situation,
        Self::Project,
        Self::MaskOverride,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Title => "title",
            Self::PositionX => "positionx",
            Self::PositionY => "positiony",
            Self::Thickness => "thickness",
            Self::Transmission => "transmission",
            Self::DistMinus => "distminus",
            Self::PreparedBy => "preparedby",
            Self::PrepareTime => "preparetime",
            Self::Description => "description",
            Self::Category => "category",
            Self::Situation => "situation",
            Self::Project => "project",
            Self::MaskOverride => "maskoverride",
        }
    }
}

/// A dynamically typed attribute value, used by the store's generic
/// update path.
#[derive(Debug, Clone, PartialEq)]
pub enum SampleValue {
    Str(String),
    OptStr(Option<String>),
    Measured(Measured),
    Date(Option<NaiveDate>),
    Category(SampleCategory),
    Situation(SampleSituation),
}

/// One sample of the sample store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub title: String,
    pub positionx: Measured,
    pub positiony: Measured,
    pub thickness: Measured,
    pub transmission: Measured,
    pub distminus: Measured,
    pub preparedby: String,
    pub preparetime: Option<NaiveDate>,
    pub description: String,
    pub category: SampleCategory,
    pub situation: SampleSituation,
    pub project: Option<String>,
    pub maskoverride: Option<String>,
    #[serde(default)]
    locked: BTreeSet<SampleAttr>,
}

impl Sample {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            positionx: Measured::default(),
            positiony: Measured::default(),
            thickness: Measured::exact(1.0),
            transmission: Measured::exact(1.0),
            distminus: Measured::default(),
            preparedby: "Anonymous".to_string(),
            preparetime: None,
            description: String::new(),
            category: SampleCategory::default(),
            situation: SampleSituation::default(),
            project: None,
            maskoverride: None,
            locked: BTreeSet::new(),
        }
    }

    pub fn is_locked(&self, attr: SampleAttr) -> bool {
        self.locked.contains(&attr)
    }

    /// Lock or unlock a single attribute.
    pub fn set_locked(&mut self, attr: SampleAttr, locked: bool) {
        if locked {
            self.locked.insert(attr);
        } else {
            self.locked.remove(&attr);
        }
    }

    /// Read an attribute generically.
    pub fn get(&self, attr: SampleAttr) -> SampleValue {
        match attr {
            SampleAttr::Title => SampleValue::Str(self.title.clone()),
            SampleAttr::PositionX => SampleValue::Measured(self.positionx),
            SampleAttr::PositionY => SampleValue::Measured(self.positiony),
            SampleAttr::Thickness => SampleValue::Measured(self.thickness),
            SampleAttr::Transmission => SampleValue::Measured(self.transmission),
            SampleAttr::DistMinus => SampleValue::Measured(self.distminus),
            SampleAttr::PreparedBy => SampleValue::Str(self.preparedby.clone()),
            SampleAttr::PrepareTime => SampleValue::Date(self.preparetime),
            SampleAttr::Description => SampleValue::Str(self.description.clone()),
            SampleAttr::Category => SampleValue::Category(self.category),
            SampleAttr::Situation => SampleValue::Situation(self.situation),
            SampleAttr::Project => SampleValue::OptStr(self.project.clone()),
            SampleAttr::MaskOverride => SampleValue::OptStr(self.maskoverride.clone()),
        }
    }

    /// Write an attribute generically, honoring its lock.
    pub fn set(&mut self, attr: SampleAttr, value: SampleValue) -> Result<(), StoreError> {
        if self.is_locked(attr) {
            return Err(StoreError::Locked {
                entry: self.title.clone(),
                attribute: attr.as_str().to_string(),
            });
        }
        let wrong = || StoreError::WrongType(attr.as_str().to_string());
        match (attr, value) {
            (SampleAttr::Title, SampleValue::Str(s)) => self.title = s,
            (SampleAttr::PositionX, SampleValue::Measured(m)) => self.positionx = m,
            (SampleAttr::PositionY, SampleValue::Measured(m)) => self.positiony = m,
            (SampleAttr::Thickness, SampleValue::Measured(m)) => self.thickness = m,
            (SampleAttr::Transmission, SampleValue::Measured(m)) => {
                self.transmission = m
            }
            (SampleAttr::DistMinus, SampleValue::Measured(m)) => self.distminus = m,
            (SampleAttr::PreparedBy, SampleValue::Str(s)) => self.preparedby = s,
            (SampleAttr::PrepareTime, SampleValue::Date(d)) => self.preparetime = d,
            (SampleAttr::Description, SampleValue::Str(s)) => self.description = s,
            (SampleAttr::Category, SampleValue::Category(c)) => self.category = c,
            (SampleAttr::Situation, SampleValue::Situation(s)) => self.situation = s,
            (SampleAttr::Project, SampleValue::OptStr(p)) => self.project = p,
            (SampleAttr::MaskOverride, SampleValue::OptStr(m)) => {
                // An all-whitespace override means "no override".
                self.maskoverride =
                    m.filter(|s| !s.trim().is_empty());
            }
            _ => return Err(wrong()),
        }
        Ok(())
    }

    // ─── Config-tree persistence ───────────────────────────────────

    /// Flatten into config entries relative to the sample's node.
    pub fn to_entries(&self) -> Vec<(ConfigKey, ConfigValue)> {
        let mut out: Vec<(ConfigKey, ConfigValue)> = Vec::new();
        let root = ConfigKey::root();
        let mut scalar = |name: &str, value: ConfigValue| {
            out.push((root.child(name), value));
        };
        for (name, m) in [
            ("positionx", self.positionx),
            ("positiony", self.positiony),
            ("thickness", self.thickness),
            ("transmission", self.transmission),
            ("distminus", self.distminus),
        ] {
            scalar(&format!("{name}.val"), ConfigValue::Float(m.val));
            scalar(&format!("{name}.err"), ConfigValue::Float(m.err));
        }
        scalar("title", ConfigValue::Str(self.title.clone()));
        scalar("preparedby", ConfigValue::Str(self.preparedby.clone()));
        scalar("description", ConfigValue::Str(self.description.clone()));
        scalar("project", self.project.clone().into());
        scalar("maskoverride", self.maskoverride.clone().into());
        scalar("category", ConfigValue::Str(self.category.as_str().to_string()));
        scalar(
            "situation",
            ConfigValue::Str(self.situation.as_str().to_string()),
        );
        scalar(
            "preparetime",
            match self.preparetime {
                Some(d) => ConfigValue::Str(d.format("%Y-%m-%d").to_string()),
                None => ConfigValue::Null,
            },
        );
        for attr in SampleAttr::ALL {
            scalar(
                &format!("{}.locked", attr.as_str()),
                ConfigValue::Bool(self.is_locked(attr)),
            );
        }
        out
    }

    /// Rebuild a sample from config entries relative to its node.
    pub fn from_entries(
        entries: &[(ConfigKey, ConfigValue)],
    ) -> Result<Self, StoreError> {
        let lookup = |name: &str| -> Option<&ConfigValue> {
            entries
                .iter()
                .find(|(k, _)| k.len() == 1 && k.leaf().map(ToString::to_string).as_deref() == Some(name))
                .map(|(_, v)| v)
        };
        let float = |name: &str| -> f64 {
            lookup(name).and_then(ConfigValue::as_f64).unwrap_or(0.0)
        };
        let string = |name: &str| -> String {
            lookup(name)
                .and_then(ConfigValue::as_str)
                .unwrap_or_default()
                .to_string()
        };
        let title = string("title");
        if title.is_empty() {
            return Err(StoreError::Persistence(
                "sample entry without a title".to_string(),
            ));
        }
        let measured = |name: &str| -> Measured {
            Measured::new(float(&format!("{name}.val")), float(&format!("{name}.err")))
        };
        let optstr = |name: &str| -> Option<String> {
            lookup(name)
                .and_then(ConfigValue::as_str)
                .filter(|s| !s.is_empty() && *s != "__none__")
                .map(ToString::to_string)
        };
        let mut sample = Sample {
            title,
            positionx: measured("positionx"),
            positiony: measured("positiony"),
            thickness: measured("thickness"),
            transmission: measured("transmission"),
            distminus: measured("distminus"),
            preparedby: string("preparedby"),
            preparetime: lookup("preparetime")
                .and_then(ConfigValue::as_str)
                .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()),
            description: string("description"),
            category: SampleCategory::parse(&string("category")).unwrap_or_default(),
            situation: SampleSituation::parse(&string("situation")).unwrap_or_default(),
            project: optstr("project"),
            maskoverride: optstr("maskoverride"),
            locked: BTreeSet::new(),
        };
        for attr in SampleAttr::ALL {
            let locked = lookup(&format!("{}.locked", attr.as_str()))
                .and_then(ConfigValue::as_bool)
                .unwrap_or(false);
            sample.set_locked(attr, locked);
        }
        Ok(sample)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locked_attribute_rejects_mutation() {
        let mut sample = Sample::new("GC36");
        sample.set_locked(SampleAttr::Thickness, true);
        let err = sample
            .set(SampleAttr::Thickness, SampleValue::Measured(Measured::exact(0.1)))
            .unwrap_err();
        assert!(matches!(err, StoreError::Locked { .. }));
        sample.set_locked(SampleAttr::Thickness, false);
        sample
            .set(SampleAttr::Thickness, SampleValue::Measured(Measured::exact(0.1)))
            .unwrap();
        assert_eq!(sample.thickness.val, 0.1);
    }

    #[test]
    fn wrong_value_type_is_rejected() {
        let mut sample = Sample::new("GC36");
        assert!(matches!(
            sample.set(SampleAttr::PositionX, SampleValue::Str("oops".into())),
            Err(StoreError::WrongType(_))
        ));
    }

    #[test]
    fn blank_mask_override_clears_it() {
        let mut sample = Sample::new("GC36");
        sample
            .set(
                SampleAttr::MaskOverride,
                SampleValue::OptStr(Some("  ".to_string())),
            )
            .unwrap();
        assert_eq!(sample.maskoverride, None);
    }

    #[test]
    fn config_entries_roundtrip_preserves_locks() {
        let mut sample = Sample::new("AgBeh");
        sample.positionx = Measured::new(12.3456, 0.002);
        sample.positiony = Measured::new(-3.25, 0.002);
        sample.transmission = Measured::new(0.82, 0.01);
        sample.category = SampleCategory::Calibrant;
        sample.situation = SampleSituation::Air;
        sample.preparetime = NaiveDate::from_ymd_opt(2024, 5, 17);
        sample.project = Some("MS01".to_string());
        sample.set_locked(SampleAttr::PositionX, true);
        sample.set_locked(SampleAttr::Category, true);

        let restored = Sample::from_entries(&sample.to_entries()).unwrap();
        assert_eq!(restored, sample);
    }

    #[test]
    fn serde_roundtrip_preserves_everything() {
        let mut sample = Sample::new("GC36");
        sample.set_locked(SampleAttr::Thickness, true);
        sample.preparetime = NaiveDate::from_ymd_opt(2023, 11, 2);
        let json = serde_json::to_string(&sample).unwrap();
        let back: Sample = serde_json::from_str(&json).unwrap();
        assert_eq!(back, sample);
        assert!(back.is_locked(SampleAttr::Thickness));
    }
}
