//! The calibrant registry.
//!
//! Calibrants are persisted inside the configuration tree, one
//! serialized entry per calibrant, and looked up by matching their
//! title regex against sample titles.

use beamctl_common::calibrant::Calibrant;
use beamctl_common::ckey;
use beamctl_common::config::{Config, ConfigKey, ConfigValue};
use beamctl_common::error::StoreError;

/// The calibrant registry.
#[derive(Debug, Default)]
pub struct CalibrantStore {
    calibrants: Vec<Calibrant>,
}

impl CalibrantStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.calibrants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calibrants.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Calibrant> {
        self.calibrants.iter().find(|c| c.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Calibrant> {
        self.calibrants.iter()
    }

    pub fn add(&mut self, calibrant: Calibrant, config: &mut Config) -> Result<(), StoreError> {
        if self.get(&calibrant.name).is_some() {
            return Err(StoreError::Duplicate(calibrant.name));
        }
        self.calibrants.push(calibrant);
        self.save_to_config(config);
        Ok(())
    }

    pub fn remove(&mut self, name: &str, config: &mut Config) -> Result<(), StoreError> {
        let idx = self
            .calibrants
            .iter()
            .position(|c| c.name == name)
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;
        self.calibrants.remove(idx);
        self.save_to_config(config);
        Ok(())
    }

    /// The calibrant whose regex matches the sample title, if any.
    pub fn for_sample_title(&self, title: &str) -> Option<&Calibrant> {
        self.calibrants.iter().find(|c| c.matches_title(title))
    }

    pub fn load_from_config(&mut self, config: &Config) {
        self.calibrants.clear();
        let list_key = ckey!["services", "calibrants"];
        for child in config.keys_at(&list_key) {
            let Some(serialized) = config.get_str(&child) else {
                continue;
            };
            match serde_json::from_str::<Calibrant>(serialized) {
                Ok(calibrant) => self.calibrants.push(calibrant),
                Err(error) => {
                    tracing::warn!(node = %child, %error, "skipping malformed calibrant entry");
                }
            }
        }
        self.calibrants.sort_by(|a, b| a.name.cmp(&b.name));
    }

    pub fn save_to_config(&self, config: &mut Config) {
        let list_key = ckey!["services", "calibrants"];
        let mut entries: Vec<(ConfigKey, ConfigValue)> = Vec::new();
        for calibrant in &self.calibrants {
            match serde_json::to_string(calibrant) {
                Ok(serialized) => entries.push((
                    ConfigKey::root().child(calibrant.name.as_str()),
                    ConfigValue::Str(serialized),
                )),
                Err(error) => {
                    tracing::warn!(calibrant = %calibrant.name, %error, "cannot serialize calibrant");
                }
            }
        }
        config.update_at(&list_key, entries);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beamctl_common::calibrant::{CalibrantKind, CalibrantPeak};

    #[test]
    fn store_roundtrips_through_the_config_tree() {
        let mut store = CalibrantStore::new();
        let mut config = Config::new();
        let mut agbeh = Calibrant::q("AgBeh");
        agbeh.regex = "^AgBeh.*$".to_string();
        if let CalibrantKind::Q { peaks } = &mut agbeh.kind {
            peaks.push(CalibrantPeak {
                name: "(001)".to_string(),
                q: 1.0763,
                sigma_q: 0.0005,
            });
        }
        store.add(agbeh, &mut config).unwrap();
        store
            .add(
                Calibrant::intensity("GC36", Some("gc36.dat".to_string())),
                &mut config,
            )
            .unwrap();

        let mut restored = CalibrantStore::new();
        restored.load_from_config(&config);
        assert_eq!(restored.len(), 2);
        assert_eq!(restored.get("AgBeh").unwrap().peaks().len(), 1);
        assert_eq!(
            restored.for_sample_title("AgBeh_capillary").map(|c| c.name.as_str()),
            Some("AgBeh")
        );
        assert!(restored.for_sample_title("water").is_none());
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut store = CalibrantStore::new();
        let mut config = Config::new();
        store.add(Calibrant::q("AgBeh"), &mut config).unwrap();
        assert!(matches!(
            store.add(Calibrant::q("AgBeh"), &mut config),
            Err(StoreError::Duplicate(_))
        ));
    }
}
