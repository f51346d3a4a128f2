use regex::Regex;

use crate::domain::Location;
use crate::error::IngestError;

pub trait LocationResolver: Send + Sync {
    fn resolve_location(&self, url: &str) -> Option<Location>;
}

#[derive(Debug, Clone, Default)]
pub struct LocationRegistry {
    locations: Vec<(Location, Regex)>,
}

impl LocationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, location: Location, pattern: Option<&str>) -> Result<(), IngestError> {
        let pattern = match pattern {
            Some(pattern) => pattern.to_string(),
            None => format!("^{}", regex::escape(&location.url)),
        };
        let regex = Regex::new(&pattern)
            .map_err(|err| IngestError::InvalidLocationPattern(format!("{}: {err}", location.name)))?;
        self.locations.push((location, regex));
        Ok(())
    }

    pub fn with_location(mut self, name: &str, url: &str) -> Result<Self, IngestError> {
        self.register(
            Location {
                name: name.to_string(),
                url: url.to_string(),
            },
            None,
        )?;
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.locations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locations.is_empty()
    }
}

impl LocationResolver for LocationRegistry {
    fn resolve_location(&self, url: &str) -> Option<Location> {
        self.locations
            .iter()
            .filter_map(|(location, regex)| regex.find(url).map(|m| (location, m.len())))
            .max_by_key(|(_, len)| *len)
            .map(|(location, _)| location.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_match() {
        let registry = LocationRegistry::new()
            .with_location("archive", "http://data.example.org/")
            .unwrap();
        let location = registry
            .resolve_location("http://data.example.org/runs/1/a.tif")
            .unwrap();
        assert_eq!(location.name, "archive");
        assert!(registry.resolve_location("http://unknown.example/data.bin").is_none());
    }

    #[test]
    fn longest_match_wins() {
        let registry = LocationRegistry::new()
            .with_location("root", "http://data.example.org/")
            .unwrap()
            .with_location("beamline", "http://data.example.org/beamline/")
            .unwrap();
        let location = registry
            .resolve_location("http://data.example.org/beamline/x.h5")
            .unwrap();
        assert_eq!(location.name, "beamline");
    }

    #[test]
    fn explicit_pattern() {
        let mut registry = LocationRegistry::new();
        registry
            .register(
                Location {
                    name: "mirror".to_string(),
                    url: "sftp://mirror/".to_string(),
                },
                Some(r"^(sftp|https?)://mirror\d*/"),
            )
            .unwrap();
        assert!(registry.resolve_location("https://mirror2/file").is_some());
        assert!(registry.resolve_location("https://other/file").is_none());
    }

    #[test]
    fn invalid_pattern_is_rejected() {
        let mut registry = LocationRegistry::new();
        let result = registry.register(
            Location {
                name: "broken".to_string(),
                url: "x".to_string(),
            },
            Some("("),
        );
        assert!(result.is_err());
    }
}
