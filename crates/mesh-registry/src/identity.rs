//! Service identity parsing and formatting

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Group used when a service does not name one explicitly
pub const DEFAULT_GROUP: &str = "main";

/// Version used when an identity does not carry one
pub const DEFAULT_VERSION: &str = "0";

/// Identity of a service as `group/name/version`
///
/// The combined form is what travels over the wire and what shows up in
/// artifact names. Parsing is lenient: a single segment is a bare name in
/// the default group, two segments are `group/name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ServiceIdentity {
    /// Deployment group, defaults to [`DEFAULT_GROUP`]
    pub group: String,
    /// Service name
    pub name: String,
    /// Version string, compared semantically
    pub version: String,
}

impl ServiceIdentity {
    /// Create an identity from its three parts
    pub fn new(
        group: impl Into<String>,
        name: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            group: group.into(),
            name: name.into(),
            version: version.into(),
        }
    }

    /// Parse a combined identity like `main/dispatcher/1.2`
    ///
    /// Accepts `name`, `group/name` and `group/name/version` forms.
    pub fn parse(text: &str) -> Result<Self> {
        let parts: Vec<&str> = text.split('/').filter(|p| !p.is_empty()).collect();
        let identity = match parts.as_slice() {
            [name] => Self::new(DEFAULT_GROUP, *name, DEFAULT_VERSION),
            [group, name] => Self::new(*group, *name, DEFAULT_VERSION),
            [group, name, version] => Self::new(*group, *name, *version),
            _ => return Err(Error::Config(format!("Invalid service identity: {text}"))),
        };
        if identity.name.is_empty() {
            return Err(Error::Config(format!("Invalid service identity: {text}")));
        }
        Ok(identity)
    }

    /// Parse an identity from an artifact file name
    ///
    /// Artifact names use `group_name-version.tar.gz`, where the group
    /// prefix is optional and the version starts at the first dash that is
    /// followed by a digit. `metrics-1.2.tar.gz` becomes
    /// `main/metrics/1.2`.
    pub fn from_artifact_name(file_name: &str) -> Result<Self> {
        let stem = file_name
            .strip_suffix(".tar.gz")
            .or_else(|| file_name.strip_suffix(".tgz"))
            .unwrap_or(file_name);
        let (group_name, version) = match split_version(stem) {
            Some((gn, v)) => (gn, v),
            None => (stem, DEFAULT_VERSION),
        };
        let (group, name) = match group_name.split_once('_') {
            Some((g, n)) => (g, n),
            None => (DEFAULT_GROUP, group_name),
        };
        if name.is_empty() {
            return Err(Error::Config(format!("Invalid artifact name: {file_name}")));
        }
        Ok(Self::new(group, name, version))
    }

    /// The combined `group/name/version` form
    pub fn combined(&self) -> String {
        format!("{}/{}/{}", self.group, self.name, self.version)
    }

    /// The `group/name` form, used as registry key
    pub fn without_version(&self) -> String {
        format!("{}/{}", self.group, self.name)
    }

    /// The artifact file name this identity corresponds to
    pub fn artifact_name(&self) -> String {
        if self.group == DEFAULT_GROUP {
            format!("{}-{}.tar.gz", self.name, self.version)
        } else {
            format!("{}_{}-{}.tar.gz", self.group, self.name, self.version)
        }
    }
}

/// Split `name-1.2.3` into `("name", "1.2.3")` at the first dash that is
/// followed by a digit
fn split_version(stem: &str) -> Option<(&str, &str)> {
    let bytes = stem.as_bytes();
    for (i, b) in bytes.iter().enumerate() {
        if *b == b'-' && bytes.get(i + 1).is_some_and(|c| c.is_ascii_digit()) {
            return Some((&stem[..i], &stem[i + 1..]));
        }
    }
    None
}

impl fmt::Display for ServiceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.combined())
    }
}

impl TryFrom<String> for ServiceIdentity {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<ServiceIdentity> for String {
    fn from(identity: ServiceIdentity) -> Self {
        identity.combined()
    }
}
