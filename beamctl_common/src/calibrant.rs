//! Calibrant descriptions.
//!
//! A Q calibrant carries its known scattering peaks and calibrates the
//! scattering-vector axis; an intensity calibrant points at a reference
//! curve file and calibrates the absolute intensity scale. Both match
//! sample titles through a regular expression.

use chrono::NaiveDate;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// One known peak of a Q calibrant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrantPeak {
    pub name: String,
    /// Peak position in 1/nm.
    pub q: f64,
    /// Uncertainty of the peak position.
    pub sigma_q: f64,
}

/// Data specific to the calibrant kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum CalibrantKind {
    Q { peaks: Vec<CalibrantPeak> },
    Intensity { datafile: Option<String> },
}

/// A calibration reference sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Calibrant {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub calibration_date: Option<NaiveDate>,
    /// Regular expression matched against sample titles.
    pub regex: String,
    #[serde(flatten)]
    pub kind: CalibrantKind,
}

impl Calibrant {
    /// A new Q calibrant matching exactly its own name.
    pub fn q(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            regex: format!("^{name}$"),
            name,
            description: String::new(),
            calibration_date: None,
            kind: CalibrantKind::Q { peaks: Vec::new() },
        }
    }

    /// A new intensity calibrant matching exactly its own name.
    pub fn intensity(name: impl Into<String>, datafile: Option<String>) -> Self {
        let name = name.into();
        Self {
            regex: format!("^{name}$"),
            name,
            description: String::new(),
            calibration_date: None,
            kind: CalibrantKind::Intensity { datafile },
        }
    }

    /// Whether this calibrant's regex matches the given sample title.
    pub fn matches_title(&self, title: &str) -> bool {
        match Regex::new(&self.regex) {
            Ok(re) => re.is_match(title),
            Err(error) => {
                tracing::warn!(
                    calibrant = %self.name,
                    regex = %self.regex,
                    %error,
                    "invalid calibrant regex"
                );
                false
            }
        }
    }

    pub fn peaks(&self) -> &[CalibrantPeak] {
        match &self.kind {
            CalibrantKind::Q { peaks } => peaks,
            CalibrantKind::Intensity { .. } => &[],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_regex_matches_only_the_exact_name() {
        let cal = Calibrant::q("AgBeh");
        assert!(cal.matches_title("AgBeh"));
        assert!(!cal.matches_title("AgBeh_old"));
    }

    #[test]
    fn custom_regex_matches_title_families() {
        let mut cal = Calibrant::q("Silver behenate");
        cal.regex = "^AgBeh.*$".to_string();
        assert!(cal.matches_title("AgBeh"));
        assert!(cal.matches_title("AgBeh_capillary"));
        assert!(!cal.matches_title("GC36"));
    }

    #[test]
    fn serde_roundtrip_preserves_both_kinds() {
        let mut q = Calibrant::q("AgBeh");
        if let CalibrantKind::Q { peaks } = &mut q.kind {
            peaks.push(CalibrantPeak {
                name: "(001)".to_string(),
                q: 1.0763,
                sigma_q: 0.0005,
            });
        }
        q.calibration_date = NaiveDate::from_ymd_opt(2024, 2, 29);
        let back: Calibrant = serde_json::from_str(&serde_json::to_string(&q).unwrap()).unwrap();
        assert_eq!(back, q);

        let i = Calibrant::intensity("GC36", Some("gc36_reference.dat".to_string()));
        let back: Calibrant = serde_json::from_str(&serde_json::to_string(&i).unwrap()).unwrap();
        assert_eq!(back, i);
        assert!(back.peaks().is_empty());
    }
}
