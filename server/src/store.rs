//! File-backed trace store and the server's access-control policy.
//!
//! Traces live under `<data_dir>/<shot_name>/<id>.trc`, where `<id>` is
//! the masked numeric signal id. A missing shot directory is a hard
//! not-found; a missing trace file inside an existing shot means
//! acquisition has not produced it yet, so the request parks until a
//! data-updated notification arrives.

use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::debug;

use daqhist_session::{
    AccessControl, AuthError, Privileges, StoreError, TraceData, TraceSource, TraceStore,
};
use daqhist_wire::{AccessOptions, SIGNAL_ID_MASK};

/// Streaming source over one trace file.
pub struct FileSource {
    file: File,
    len: u64,
}

impl TraceSource for FileSource {
    fn len(&self) -> u64 {
        self.len
    }

    fn access_options(&self) -> i32 {
        AccessOptions::ARCHIVED.bits()
    }

    fn read_at(&self, offset: u64, out: &mut [u8]) -> io::Result<usize> {
        self.file.read_at(out, offset)
    }
}

/// Trace store over a directory tree.
pub struct DirStore {
    root: PathBuf,
}

impl DirStore {
    /// Create a store rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl TraceStore for DirStore {
    fn open_trace(&self, shot: &str, id: i32) -> Result<TraceData, StoreError> {
        // Shot names come off the wire; refuse anything path-like.
        if shot.is_empty() || shot.contains(['/', '\\', '.']) {
            return Err(StoreError::AccessDenied(format!("invalid shot name {shot:?}")));
        }

        let shot_dir = self.root.join(shot);
        if !shot_dir.is_dir() {
            return Err(StoreError::NotFound {
                shot: shot.to_owned(),
                id,
            });
        }

        let path = shot_dir.join(format!("{}.trc", id & SIGNAL_ID_MASK));
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(shot, id, "trace not produced yet");
                return Ok(TraceData::NotReady);
            }
            Err(err) => return Err(err.into()),
        };
        let len = file.metadata()?.len();
        Ok(TraceData::Ready(Arc::new(FileSource { file, len })))
    }
}

/// Access policy accepting any named user.
///
/// Production deployments put a real credential backend behind the
/// `AccessControl` trait; the reference server only rejects anonymous
/// logins.
pub struct OpenAccess;

impl AccessControl for OpenAccess {
    fn login(&self, user: &str, _password: &str) -> Result<Privileges, AuthError> {
        if user.is_empty() {
            return Err(AuthError::BadCredentials);
        }
        Ok(Privileges { access_options: 0 })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_open_trace_states() {
        let dir = tempfile::tempdir().unwrap();
        let shot_dir = dir.path().join("SHOT1");
        std::fs::create_dir(&shot_dir).unwrap();
        let mut f = File::create(shot_dir.join("5.trc")).unwrap();
        f.write_all(&[1, 2, 3, 4]).unwrap();

        let store = DirStore::new(dir.path());

        // Present file: ready, correct length, id option bits masked off.
        match store.open_trace("SHOT1", 0x0100_0005).unwrap() {
            TraceData::Ready(src) => {
                assert_eq!(src.len(), 4);
                let mut out = [0u8; 2];
                assert_eq!(src.read_at(2, &mut out).unwrap(), 2);
                assert_eq!(out, [3, 4]);
            }
            TraceData::NotReady => panic!("expected ready"),
        }

        // Missing file in an existing shot: acquisition pending.
        assert!(matches!(
            store.open_trace("SHOT1", 99).unwrap(),
            TraceData::NotReady
        ));

        // Missing shot: hard not-found.
        assert!(matches!(
            store.open_trace("NOPE", 5),
            Err(StoreError::NotFound { .. })
        ));

        // Path traversal refused.
        assert!(matches!(
            store.open_trace("../etc", 5),
            Err(StoreError::AccessDenied(_))
        ));
    }

    #[test]
    fn test_open_access_rejects_anonymous() {
        assert!(OpenAccess.login("operator", "").is_ok());
        assert!(matches!(
            OpenAccess.login("", ""),
            Err(AuthError::BadCredentials)
        ));
    }
}
