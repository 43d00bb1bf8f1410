//! Clears the way for virtual endpoints.
//!
//! Anything left at an endpoint path by an earlier run is removed before the endpoint is
//! brought up again. Never the other way around: a leftover node would otherwise
//! make the new one fail or, worse, point consumers at a dead pty.
//!
//! Creating the nodes is left to the broadcast engine,
//! since allocating a virtual port and serving it go together.

use std::{
    io,
    path::{Path, PathBuf},
};

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::{endpoint::EndpointSpec, error::Error};

/// What to do when one endpoint out of many can not be provisioned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ProvisionPolicy {
    /// Log it, skip that endpoint and carry on with the rest.
    /// Only fails if no endpoint at all could be provisioned.
    #[default]
    BestEffort,

    /// The first failure aborts everything.
    FailFast,
}

/// Remove whatever is at `path`.
///
/// Nothing being there is fine.
/// Symlinks are removed, not followed.
pub fn remove_stale<P: AsRef<Path>>(path: P) -> io::Result<bool> {
    match std::fs::remove_file(path.as_ref()) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Is `name` the prefix's file name followed by one or more digits?
fn is_numbered(name: &str, stem: &str) -> bool {
    name.strip_prefix(stem)
        .map(|rest| !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit()))
        .unwrap_or(false)
}

/// Remove every `<prefix><digits>` entry, regardless of which ids are about to be used.
///
/// Catches leftovers of an earlier, larger topology,
/// e.g. `/dev/gps7` when we are now only going to use `/dev/gps0` to `/dev/gps3`.
/// Other entries in the same directory (`/dev/gpsd`, `/dev/gps`) are left alone.
pub fn sweep_stale<P: AsRef<Path>>(prefix: P) -> io::Result<Vec<PathBuf>> {
    let prefix = prefix.as_ref();

    let (dir, stem) = match (prefix.parent(), prefix.file_name()) {
        (Some(dir), Some(stem)) => (dir, stem.to_string_lossy().into_owned()),
        _ => return Ok(vec![]),
    };

    // The parent of a bare `gps` prefix is the empty path.
    let dir = if dir.as_os_str().is_empty() {
        Path::new(".")
    } else {
        dir
    };

    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(vec![]),
        Err(e) => return Err(e),
    };

    let mut removed = vec![];

    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();

        if !is_numbered(&name.to_string_lossy(), &stem) {
            continue;
        }

        let path = entry.path();
        match remove_stale(&path) {
            Ok(true) => removed.push(path),
            Ok(false) => {}
            Err(e) => warn!(?path, ?e, "Could not remove stale endpoint"),
        }
    }

    removed.sort();

    if !removed.is_empty() {
        info!(
            "Removed stale endpoints: {}",
            removed.iter().map(|p| p.display()).join(", ")
        );
    }

    Ok(removed)
}

/// Make sure nothing stands in the way of the given endpoints.
///
/// Endpoints are handled in ascending id order.
/// The returned list holds the endpoints ready to be brought up.
pub fn provision(
    endpoints: Vec<EndpointSpec>,
    policy: ProvisionPolicy,
) -> Result<Vec<EndpointSpec>, Error> {
    let requested = endpoints.len();
    let mut ready = Vec::with_capacity(requested);

    for endpoint in endpoints.into_iter().sorted() {
        match remove_stale(&endpoint.path) {
            Ok(true) => debug!(%endpoint, "Removed stale node"),
            Ok(false) => {}
            Err(e) => {
                let e = Error::Provision {
                    id: endpoint.id,
                    path: endpoint.path.clone(),
                    problem: e.to_string(),
                };

                match policy {
                    ProvisionPolicy::BestEffort => {
                        error!(%e, "Skipping endpoint");
                        continue;
                    }
                    ProvisionPolicy::FailFast => return Err(e),
                }
            }
        }

        ready.push(endpoint);
    }

    if ready.is_empty() && requested > 0 {
        return Err(Error::NoEndpoints);
    }

    Ok(ready)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::endpoint::{describe, Numbering};

    #[test]
    fn numbered_names() {
        assert!(is_numbered("gps0", "gps"));
        assert!(is_numbered("gps12", "gps"));
        assert!(!is_numbered("gps", "gps"));
        assert!(!is_numbered("gpsd", "gps"));
        assert!(!is_numbered("gps1a", "gps"));
        assert!(!is_numbered("ttyACM0", "gps"));
    }

    #[test]
    fn removing_nothing_is_fine() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!remove_stale(dir.path().join("gps0")).unwrap());
    }

    #[test]
    fn removes_dangling_symlink() {
        let dir = tempfile::tempdir().unwrap();
        let link = dir.path().join("gps0");
        std::os::unix::fs::symlink(dir.path().join("gone"), &link).unwrap();

        assert!(remove_stale(&link).unwrap());
        assert!(fs::symlink_metadata(&link).is_err());
    }

    #[test]
    fn sweep_only_touches_numbered() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["gps0", "gps3", "gps17", "gpsd", "gps", "other1"] {
            fs::write(dir.path().join(name), b"").unwrap();
        }

        let removed = sweep_stale(dir.path().join("gps")).unwrap();

        assert_eq!(
            removed,
            vec![
                dir.path().join("gps0"),
                dir.path().join("gps17"),
                dir.path().join("gps3"),
            ]
        );

        for kept in ["gpsd", "gps", "other1"] {
            assert!(dir.path().join(kept).exists());
        }
    }

    #[test]
    fn sweep_missing_dir_is_fine() {
        let dir = tempfile::tempdir().unwrap();
        let removed = sweep_stale(dir.path().join("nope").join("gps")).unwrap();
        assert!(removed.is_empty());
    }

    #[test]
    fn provision_clears_leftovers() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = dir.path().join("gps");

        fs::write(dir.path().join("gps1"), b"old").unwrap();

        let endpoints = describe(&prefix, Numbering::ZeroBased, 3);
        let ready = provision(endpoints.clone(), ProvisionPolicy::FailFast).unwrap();

        assert_eq!(ready, endpoints);
        assert!(!dir.path().join("gps1").exists());
    }

    #[test]
    fn provision_is_ordered() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = dir.path().join("gps");

        let mut endpoints = describe(&prefix, Numbering::OneBased, 4);
        endpoints.reverse();

        let ids: Vec<_> = provision(endpoints, ProvisionPolicy::BestEffort)
            .unwrap()
            .into_iter()
            .map(|e| e.id)
            .collect();

        assert_eq!(ids, vec![1, 2, 3, 4]);
    }

    #[test]
    fn best_effort_skips_blocked_endpoint() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = dir.path().join("gps");

        // A non-empty directory can not be removed as a file.
        fs::create_dir_all(dir.path().join("gps1").join("inner")).unwrap();

        let endpoints = describe(&prefix, Numbering::ZeroBased, 3);
        let ready = provision(endpoints, ProvisionPolicy::BestEffort).unwrap();

        let ids: Vec<_> = ready.into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![0, 2]);
    }

    #[test]
    fn fail_fast_stops_at_blocked_endpoint() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = dir.path().join("gps");

        fs::create_dir_all(dir.path().join("gps1").join("inner")).unwrap();

        let endpoints = describe(&prefix, Numbering::ZeroBased, 3);
        let err = provision(endpoints, ProvisionPolicy::FailFast).unwrap_err();

        assert!(matches!(err, Error::Provision { id: 1, .. }));
    }

    #[test]
    fn nothing_requested_is_not_an_error() {
        assert!(provision(vec![], ProvisionPolicy::BestEffort)
            .unwrap()
            .is_empty());
    }
}
