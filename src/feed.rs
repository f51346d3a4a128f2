use std::thread;
use std::time::Duration;

use reqwest::Url;
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use roxmltree::Node;
use serde::{Deserialize, Serialize};

use crate::error::IngestError;

const ATOM_NS: &str = "http://www.w3.org/2005/Atom";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub rel: String,
    pub href: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Author {
    pub name: String,
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    pub scheme: Option<String>,
    pub term: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Enclosure {
    pub href: String,
    pub title: Option<String>,
    pub mime: Option<String>,
    pub length: Option<String>,
    pub hash: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub id: String,
    pub updated: String,
    pub title: String,
    pub author: Option<Author>,
    pub tags: Vec<Category>,
    pub enclosures: Vec<Enclosure>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FeedMetadata {
    pub id: Option<String>,
    pub title: Option<String>,
    pub updated: Option<String>,
    pub author: Option<Author>,
    pub links: Vec<Link>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedDocument {
    pub url: String,
    pub feed: FeedMetadata,
    pub entries: Vec<Entry>,
}

impl FeedDocument {
    pub fn next_href(&self) -> Option<&str> {
        self.feed
            .links
            .iter()
            .find(|link| link.rel == "next")
            .map(|link| link.href.as_str())
    }
}

pub trait FeedTransport: Send + Sync {
    fn fetch(&self, url: &str) -> Result<FeedDocument, IngestError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: Option<String>,
}

#[derive(Clone)]
pub struct AtomHttpTransport {
    client: Client,
    credentials: Option<Credentials>,
}

impl AtomHttpTransport {
    pub fn new(credentials: Option<Credentials>) -> Result<Self, IngestError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("atom-ingest/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| IngestError::FeedHttp(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|err| IngestError::FeedHttp(err.to_string()))?;
        Ok(Self {
            client,
            credentials,
        })
    }

    fn fetch_text(&self, url: &str) -> Result<String, IngestError> {
        if let Some(path) = url.strip_prefix("file://") {
            return std::fs::read_to_string(path)
                .map_err(|err| IngestError::FeedHttp(format!("{url}: {err}")));
        }

        let response = self.send_with_retries(|| {
            let request = self.client.get(url);
            match &self.credentials {
                Some(creds) => request.basic_auth(&creds.username, creds.password.as_deref()),
                None => request,
            }
        })?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response
                .text()
                .unwrap_or_else(|_| "feed request failed".to_string());
            return Err(IngestError::FeedStatus { status, message });
        }
        response
            .text()
            .map_err(|err| IngestError::FeedHttp(err.to_string()))
    }

    fn send_with_retries<F>(
        &self,
        mut make_req: F,
    ) -> Result<reqwest::blocking::Response, IngestError>
    where
        F: FnMut() -> reqwest::blocking::RequestBuilder,
    {
        const MAX_RETRIES: usize = 3;
        const BASE_DELAY_MS: u64 = 200;
        let mut attempt = 0usize;
        loop {
            match make_req().send() {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if attempt < MAX_RETRIES && is_retryable_status(status) {
                        thread::sleep(Duration::from_millis(BASE_DELAY_MS * (attempt as u64 + 1)));
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if attempt < MAX_RETRIES && (err.is_timeout() || err.is_connect()) {
                        thread::sleep(Duration::from_millis(BASE_DELAY_MS * (attempt as u64 + 1)));
                        attempt += 1;
                        continue;
                    }
                    return Err(IngestError::FeedHttp(err.to_string()));
                }
            }
        }
    }
}

impl FeedTransport for AtomHttpTransport {
    fn fetch(&self, url: &str) -> Result<FeedDocument, IngestError> {
        tracing::debug!(url, "fetching feed");
        let body = self.fetch_text(url)?;
        parse_atom(url, &body)
    }
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

pub fn parse_atom(base_url: &str, xml: &str) -> Result<FeedDocument, IngestError> {
    let doc = roxmltree::Document::parse(xml)
        .map_err(|err| IngestError::FeedParse(err.to_string()))?;
    let root = doc.root_element();
    if root.tag_name().name() != "feed" {
        return Err(IngestError::FeedParse(format!(
            "expected <feed> root element, found <{}>",
            root.tag_name().name()
        )));
    }

    let base = Url::parse(base_url).ok();
    let mut feed = FeedMetadata::default();
    let mut entries = Vec::new();
    for node in atom_children(root) {
        match node.tag_name().name() {
            "id" => feed.id = Some(text_of(node)),
            "title" => feed.title = Some(text_of(node)),
            "updated" => feed.updated = Some(text_of(node)),
            "author" if feed.author.is_none() => feed.author = parse_author(node),
            "link" => {
                if let Some(href) = node.attribute("href") {
                    feed.links.push(Link {
                        rel: node.attribute("rel").unwrap_or("alternate").to_string(),
                        href: resolve_href(base.as_ref(), href),
                    });
                }
            }
            "entry" => entries.push(parse_entry(node, base.as_ref())?),
            _ => {}
        }
    }

    // Atom entries inherit the feed author.
    for entry in entries.iter_mut().filter(|entry| entry.author.is_none()) {
        entry.author = feed.author.clone();
    }

    Ok(FeedDocument {
        url: base_url.to_string(),
        feed,
        entries,
    })
}

fn parse_entry(node: Node<'_, '_>, base: Option<&Url>) -> Result<Entry, IngestError> {
    let mut id = None;
    let mut entry = Entry {
        id: String::new(),
        updated: String::new(),
        title: String::new(),
        author: None,
        tags: Vec::new(),
        enclosures: Vec::new(),
    };
    for child in atom_children(node) {
        match child.tag_name().name() {
            "id" => id = Some(text_of(child)),
            "updated" => entry.updated = text_of(child),
            "title" => entry.title = text_of(child),
            "author" if entry.author.is_none() => entry.author = parse_author(child),
            "category" => {
                if let Some(term) = child.attribute("term") {
                    entry.tags.push(Category {
                        scheme: child.attribute("scheme").map(str::to_string),
                        term: term.to_string(),
                    });
                }
            }
            "link" if child.attribute("rel") == Some("enclosure") => {
                if let Some(href) = child.attribute("href") {
                    entry.enclosures.push(Enclosure {
                        href: resolve_href(base, href),
                        title: child.attribute("title").map(str::to_string),
                        mime: child.attribute("type").map(str::to_string),
                        length: child.attribute("length").map(str::to_string),
                        hash: child.attribute("hash").map(str::to_string),
                    });
                }
            }
            _ => {}
        }
    }
    entry.id = id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| IngestError::FeedParse("entry without <id>".to_string()))?;
    Ok(entry)
}

fn parse_author(node: Node<'_, '_>) -> Option<Author> {
    let mut name = None;
    let mut email = None;
    for child in atom_children(node) {
        match child.tag_name().name() {
            "name" => name = Some(text_of(child)),
            "email" => email = Some(text_of(child)).filter(|value| !value.is_empty()),
            _ => {}
        }
    }
    name.map(|name| Author { name, email })
}

fn atom_children<'a, 'input>(
    node: Node<'a, 'input>,
) -> impl Iterator<Item = Node<'a, 'input>> {
    node.children().filter(|child| {
        child.is_element() && matches!(child.tag_name().namespace(), None | Some(ATOM_NS))
    })
}

fn text_of(node: Node<'_, '_>) -> String {
    node.descendants()
        .filter(|child| child.is_text())
        .filter_map(|child| child.text())
        .collect::<String>()
        .trim()
        .to_string()
}

fn resolve_href(base: Option<&Url>, href: &str) -> String {
    base.and_then(|base| base.join(href).ok())
        .map(|url| url.to_string())
        .unwrap_or_else(|| href.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<feed xmlns="http://www.w3.org/2005/Atom">
  <id>urn:feed:1</id>
  <title>Instrument uploads</title>
  <updated>2012-05-01T10:00:00Z</updated>
  <author><name>Feed Owner</name></author>
  <link rel="self" href="/feed?page=1"/>
  <link rel="next" href="/feed?page=2"/>
  <entry>
    <id>urn:entry:2</id>
    <title>Second run</title>
    <updated>2012-05-01T09:00:00Z</updated>
    <author><name>Jane Doe</name><email>jane@example.org</email></author>
    <category scheme="http://example.org/schema/ExperimentID" term="exp-7"/>
    <category scheme="http://example.org/schema/ExperimentTitle" term="Beamline 7"/>
    <link rel="alternate" href="http://example.org/runs/2"/>
    <link rel="enclosure" href="http://data.example.org/runs/2/image.tif"
          type="image/tiff" length="1024" title="image.tif" hash="sha-512:abcd md5:1234"/>
  </entry>
  <entry>
    <id>urn:entry:1</id>
    <title>First run</title>
    <updated>2012-05-01T08:00:00Z</updated>
  </entry>
</feed>"#;

    #[test]
    fn parses_entries_and_enclosures() {
        let doc = parse_atom("http://feeds.example.org/feed", PAGE).unwrap();
        assert_eq!(doc.feed.title.as_deref(), Some("Instrument uploads"));
        assert_eq!(doc.entries.len(), 2);

        let entry = &doc.entries[0];
        assert_eq!(entry.id, "urn:entry:2");
        assert_eq!(entry.tags.len(), 2);
        assert_eq!(
            entry.author.as_ref().and_then(|a| a.email.as_deref()),
            Some("jane@example.org")
        );
        assert_eq!(entry.enclosures.len(), 1);
        let enclosure = &entry.enclosures[0];
        assert_eq!(enclosure.mime.as_deref(), Some("image/tiff"));
        assert_eq!(enclosure.length.as_deref(), Some("1024"));
        assert_eq!(enclosure.hash.as_deref(), Some("sha-512:abcd md5:1234"));
    }

    #[test]
    fn next_link_is_resolved_against_page_url() {
        let doc = parse_atom("http://feeds.example.org/feed", PAGE).unwrap();
        assert_eq!(doc.next_href(), Some("http://feeds.example.org/feed?page=2"));
    }

    #[test]
    fn relative_enclosure_href_is_resolved() {
        let xml = r#"<feed xmlns="http://www.w3.org/2005/Atom"><entry><id>e</id>
            <link rel="enclosure" href="../data/a.bin"/></entry></feed>"#;
        let doc = parse_atom("http://feeds.example.org/atom/page", xml).unwrap();
        assert_eq!(doc.entries[0].enclosures[0].href, "http://feeds.example.org/data/a.bin");
    }

    #[test]
    fn entries_inherit_feed_author() {
        let doc = parse_atom("http://feeds.example.org/feed", PAGE).unwrap();
        let author = doc.entries[1].author.as_ref().unwrap();
        assert_eq!(author.name, "Feed Owner");
        assert_eq!(author.email, None);
    }

    #[test]
    fn rejects_non_feed_documents() {
        let err = parse_atom("x", "<rss><channel/></rss>").unwrap_err();
        assert!(err.is_transport());
    }

    #[test]
    fn entry_without_id_is_rejected() {
        let xml = r#"<feed xmlns="http://www.w3.org/2005/Atom"><entry><title>x</title></entry></feed>"#;
        assert!(parse_atom("x", xml).is_err());
    }
}
