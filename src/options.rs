/// Session options and seed lists
///
/// Options are an ordered BSON document. The driver reads three keys
/// (`database`, `safe`, `consistency`) and carries every other key through
/// untouched.
use crate::error::{EnlaceError, EnlaceResult};
use crate::utils::parse_seeds;
use bson::{doc, Bson, Document};

pub const DATABASE: &str = "database";
pub const SAFE: &str = "safe";
pub const CONSISTENCY: &str = "consistency";

/// Ordered option mapping owned by one session
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Options(Document);

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of `insert`
    pub fn set<K: Into<String>, V: Into<Bson>>(mut self, key: K, value: V) -> Self {
        self.0.insert(key, value);
        self
    }

    pub fn insert<K: Into<String>, V: Into<Bson>>(&mut self, key: K, value: V) {
        self.0.insert(key, value);
    }

    pub fn get(&self, key: &str) -> Option<&Bson> {
        self.0.get(key)
    }

    /// A new mapping holding these options overlaid with `extra`; keys in
    /// `extra` win
    pub fn merge(&self, extra: &Options) -> Options {
        let mut merged = self.0.clone();
        for (key, value) in extra.0.iter() {
            merged.insert(key.clone(), value.clone());
        }
        Options(merged)
    }

    /// Name of the target database, if one was given as a string or symbol
    pub fn database(&self) -> Option<&str> {
        match self.0.get(DATABASE) {
            Some(Bson::String(name)) | Some(Bson::Symbol(name)) => Some(name.as_str()),
            _ => None,
        }
    }

    /// Write acknowledgement mode
    pub fn safe(&self) -> Safe {
        match self.0.get(SAFE) {
            Some(Bson::Boolean(true)) => Safe::On(doc! { "getlasterror": 1 }),
            Some(Bson::Document(extra)) => {
                let mut command = doc! { "getlasterror": 1 };
                for (key, value) in extra.iter() {
                    command.insert(key.clone(), value.clone());
                }
                Safe::On(command)
            }
            _ => Safe::Off,
        }
    }

    /// Read routing preference. Missing means strong.
    pub fn consistency(&self) -> EnlaceResult<Consistency> {
        match self.0.get(CONSISTENCY) {
            None | Some(Bson::Null) => Ok(Consistency::Strong),
            Some(Bson::String(value)) | Some(Bson::Symbol(value)) => match value.as_str() {
                "strong" => Ok(Consistency::Strong),
                "eventual" => Ok(Consistency::Eventual),
                other => Err(EnlaceError::configuration(format!(
                    "unknown consistency '{}', expected 'strong' or 'eventual'",
                    other
                ))),
            },
            Some(other) => Err(EnlaceError::configuration(format!(
                "consistency must be a string, got {}",
                other
            ))),
        }
    }

    pub fn as_document(&self) -> &Document {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Document> for Options {
    fn from(document: Document) -> Self {
        Options(document)
    }
}

impl From<Options> for Document {
    fn from(options: Options) -> Self {
        options.0
    }
}

/// Whether writes wait for `getlasterror`, and with which extra fields
#[derive(Debug, Clone, PartialEq)]
pub enum Safe {
    Off,
    /// Full `getlasterror` command to send after each write
    On(Document),
}

/// Read routing preference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Consistency {
    /// Reads go to the primary
    #[default]
    Strong,
    /// Reads may go to a secondary
    Eventual,
}

impl std::str::FromStr for Consistency {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "strong" => Ok(Consistency::Strong),
            "eventual" => Ok(Consistency::Eventual),
            other => Err(format!("unknown consistency '{}'", other)),
        }
    }
}

impl std::fmt::Display for Consistency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Consistency::Strong => write!(f, "strong"),
            Consistency::Eventual => write!(f, "eventual"),
        }
    }
}

/// Ordered `host:port` seed addresses. Malformed entries are kept as given
/// and fail when first dialed.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Seeds(Vec<String>);

impl Seeds {
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, address: &str) -> bool {
        self.0.iter().any(|seed| seed == address)
    }
}

impl From<&str> for Seeds {
    fn from(seeds: &str) -> Self {
        Seeds::from(parse_seeds(seeds))
    }
}

impl From<String> for Seeds {
    fn from(seeds: String) -> Self {
        Seeds::from(seeds.as_str())
    }
}

impl From<Vec<String>> for Seeds {
    fn from(seeds: Vec<String>) -> Self {
        let mut unique: Vec<String> = Vec::with_capacity(seeds.len());
        for seed in seeds {
            let seed = seed.trim().to_string();
            if !seed.is_empty() && !unique.contains(&seed) {
                unique.push(seed);
            }
        }
        Seeds(unique)
    }
}

impl From<&[&str]> for Seeds {
    fn from(seeds: &[&str]) -> Self {
        Seeds::from(seeds.iter().map(|s| s.to_string()).collect::<Vec<_>>())
    }
}

impl<const N: usize> From<[&str; N]> for Seeds {
    fn from(seeds: [&str; N]) -> Self {
        Seeds::from(&seeds[..])
    }
}
