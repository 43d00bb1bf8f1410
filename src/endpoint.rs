use std::{
    ffi::OsString,
    fmt::Display,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

/// How endpoint ids are numbered.
///
/// Either way, a count of `N` gives exactly `N` endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Numbering {
    /// Ids `0, 1, .., N - 1`, i.e. `[0, N)`.
    #[default]
    ZeroBased,

    /// Ids `1, 2, .., N`, i.e. `[1, N]`.
    OneBased,
}

impl Numbering {
    /// The first id handed out.
    pub fn start(&self) -> u32 {
        match self {
            Numbering::ZeroBased => 0,
            Numbering::OneBased => 1,
        }
    }

    /// The ids for `count` endpoints, ascending.
    pub fn ids(&self, count: u32) -> Vec<u32> {
        match self {
            Numbering::ZeroBased => (0..count).collect(),
            Numbering::OneBased => (1..=count).collect(),
        }
    }
}

/// A virtual endpoint: an id and the path it is reachable at.
///
/// The path is always `<prefix><id>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointSpec {
    /// The numeric id.
    pub id: u32,

    /// Where consumers open it.
    pub path: PathBuf,
}

impl EndpointSpec {
    /// Create an endpoint spec from a prefix, e.g. `/dev/gps`, and an id.
    pub fn new<P: AsRef<Path>>(prefix: P, id: u32) -> Self {
        Self {
            id,
            path: endpoint_path(prefix, id),
        }
    }
}

impl Display for EndpointSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

/// The path of the endpoint with the given id.
pub fn endpoint_path<P: AsRef<Path>>(prefix: P, id: u32) -> PathBuf {
    let mut path = OsString::from(prefix.as_ref().as_os_str());
    path.push(id.to_string());
    PathBuf::from(path)
}

/// Describe the endpoints for `count` ids under `prefix`.
///
/// Nothing is touched on disk.
pub fn describe<P: AsRef<Path>>(prefix: P, numbering: Numbering, count: u32) -> Vec<EndpointSpec> {
    numbering
        .ids(count)
        .into_iter()
        .map(|id| EndpointSpec::new(prefix.as_ref(), id))
        .collect()
}
