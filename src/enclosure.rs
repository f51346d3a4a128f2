use std::collections::BTreeMap;

use crate::copy::CopyRequest;
use crate::domain::{DataFile, Dataset, NewDataFile, NewReplica};
use crate::error::IngestError;
use crate::feed::Enclosure;
use crate::location::LocationResolver;
use crate::repository::Session;

pub const SHA512_ALGORITHM: &str = "sha-512";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnclosureOutcome {
    Replicated(CopyRequest),
    Rejected(DataFile),
}

pub struct EnclosureProcessor<'a, L: LocationResolver + ?Sized> {
    locations: &'a L,
}

impl<'a, L: LocationResolver + ?Sized> EnclosureProcessor<'a, L> {
    pub fn new(locations: &'a L) -> Self {
        Self { locations }
    }

    pub fn process(
        &self,
        session: &mut dyn Session,
        dataset: &Dataset,
        enclosure: &Enclosure,
    ) -> Result<EnclosureOutcome, IngestError> {
        let mut file = NewDataFile {
            filename: enclosure_filename(enclosure),
            mimetype: enclosure.mime.clone().filter(|mime| !mime.is_empty()),
            ..NewDataFile::default()
        };
        match parse_length(enclosure.length.as_deref()) {
            Ok(size) => file.size = size,
            Err(err) => tracing::debug!(href = %enclosure.href, %err, "ignoring enclosure length"),
        }
        match enclosure.hash.as_deref().map(sha512_from_hash) {
            Some(Ok(sum)) => file.sha512sum = Some(sum),
            Some(Err(err)) => tracing::debug!(href = %enclosure.href, %err, "ignoring enclosure hash"),
            None => {}
        }
        let datafile = session.insert_datafile(dataset.id, file)?;

        let url = enclosure.href.as_str();
        let Some(location) = self.locations.resolve_location(url) else {
            let err = IngestError::UnknownLocation(url.to_string());
            tracing::error!(dataset = %dataset.id, %err, "enclosure rejected");
            return Ok(EnclosureOutcome::Rejected(datafile));
        };

        let replica = session.insert_replica(NewReplica {
            datafile: datafile.id,
            url: url.to_string(),
            location: location.name,
            protocol: protocol_of(url).to_string(),
        })?;
        Ok(EnclosureOutcome::Replicated(CopyRequest {
            replica,
            file: datafile,
        }))
    }
}

pub fn enclosure_filename(enclosure: &Enclosure) -> String {
    if let Some(title) = enclosure.title.as_deref().filter(|title| !title.trim().is_empty()) {
        return title.to_string();
    }
    let path = enclosure
        .href
        .split(['?', '#'])
        .next()
        .unwrap_or_default();
    path.rsplit('/')
        .find(|segment| !segment.is_empty())
        .unwrap_or(path)
        .to_string()
}

pub fn parse_hashes(hash: &str) -> BTreeMap<String, String> {
    hash.split_whitespace()
        .map(|token| match token.split_once(':') {
            Some((algorithm, value)) => (algorithm.to_string(), value.to_string()),
            None => (token.to_string(), String::new()),
        })
        .collect()
}

pub fn sha512_from_hash(hash: &str) -> Result<String, IngestError> {
    parse_hashes(hash)
        .remove(SHA512_ALGORITHM)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| IngestError::MalformedEnclosure(format!("no {SHA512_ALGORITHM} in {hash:?}")))
}

pub fn parse_length(length: Option<&str>) -> Result<Option<u64>, IngestError> {
    match length.map(str::trim) {
        None | Some("") => Ok(None),
        Some(value) => value
            .parse::<u64>()
            .map(Some)
            .map_err(|_| IngestError::MalformedEnclosure(format!("length {value:?}"))),
    }
}

pub fn protocol_of(url: &str) -> &str {
    url.split_once("://").map_or(url, |(protocol, _)| protocol)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn enclosure(href: &str, title: Option<&str>) -> Enclosure {
        Enclosure {
            href: href.to_string(),
            title: title.map(str::to_string),
            ..Enclosure::default()
        }
    }

    #[test]
    fn sha512_token_is_selected() {
        assert_eq!(sha512_from_hash("sha-512:abcd md5:1234").unwrap(), "abcd");
    }

    #[test]
    fn missing_sha512_is_malformed() {
        let err = sha512_from_hash("md5:1234 garbage").unwrap_err();
        assert_matches!(err, IngestError::MalformedEnclosure(_));
        let hashes = parse_hashes("md5:1234 garbage");
        assert_eq!(hashes.get("garbage").map(String::as_str), Some(""));
    }

    #[test]
    fn filename_prefers_title() {
        let named = enclosure("http://host/a/b/data.bin", Some("renamed.bin"));
        assert_eq!(enclosure_filename(&named), "renamed.bin");
        let unnamed = enclosure("http://host/a/b/data.bin?token=1", None);
        assert_eq!(enclosure_filename(&unnamed), "data.bin");
    }

    #[test]
    fn length_parsing() {
        assert_eq!(parse_length(Some("1024")).unwrap(), Some(1024));
        assert_eq!(parse_length(None).unwrap(), None);
        assert!(parse_length(Some("big")).is_err());
    }

    #[test]
    fn protocol_is_scheme() {
        assert_eq!(protocol_of("https://host/x"), "https");
        assert_eq!(protocol_of("relative/path"), "relative/path");
    }
}
