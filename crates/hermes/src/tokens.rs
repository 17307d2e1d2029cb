//! Bearer-token identities for services and communicators.
//!
//! Every service and communicator name in the live configuration owns exactly
//! one opaque token. Tokens are minted once, kept verbatim across reloads for
//! as long as the name stays configured, and persisted as `name=token` lines
//! so that credentials handed out to clients survive restarts.

use crate::error::PersistenceError;
use std::collections::{BTreeSet, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use uuid::Uuid;

#[derive(Debug, Default)]
struct Inner {
    name_to_token: HashMap<String, String>,
    token_to_name: HashMap<String, String>,
}

impl Inner {
    fn insert(&mut self, name: String, token: String) {
        if let Some(old) = self.name_to_token.insert(name.clone(), token.clone()) {
            self.token_to_name.remove(&old);
        }
        if let Some(old_name) = self.token_to_name.insert(token, name) {
            self.name_to_token.remove(&old_name);
        }
    }

    fn mint(&self) -> String {
        loop {
            let token = Uuid::new_v4().to_string();
            if !self.token_to_name.contains_key(&token) {
                return token;
            }
        }
    }

    fn ensure<'a>(&mut self, names: impl IntoIterator<Item = &'a str>) -> Vec<String> {
        let mut minted = Vec::new();
        for name in names {
            if self.name_to_token.contains_key(name) {
                continue;
            }
            let token = self.mint();
            self.insert(name.to_string(), token);
            minted.push(name.to_string());
        }
        minted
    }

    fn prune(&mut self, keep: &BTreeSet<String>) -> Vec<String> {
        let stale: Vec<String> = self
            .name_to_token
            .keys()
            .filter(|name| !keep.contains(*name))
            .cloned()
            .collect();
        for name in &stale {
            if let Some(token) = self.name_to_token.remove(name) {
                self.token_to_name.remove(&token);
            }
        }
        stale
    }

    fn render(&self) -> String {
        let mut names: Vec<&String> = self.name_to_token.keys().collect();
        names.sort();
        let mut out = String::new();
        for name in names {
            out.push_str(name);
            out.push('=');
            out.push_str(&self.name_to_token[name]);
            out.push('\n');
        }
        out
    }

    fn parse(contents: &str) -> Result<Self, PersistenceError> {
        let mut inner = Self::default();
        for (idx, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let (name, token) = line
                .rsplit_once('=')
                .ok_or(PersistenceError::Malformed { line: idx + 1 })?;
            inner.insert(name.to_string(), token.trim().to_string());
        }
        Ok(inner)
    }
}

/// Names added and removed by one [`TokenStore::reconcile`] pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Reconciled {
    /// Names that received a freshly minted token.
    pub minted: Vec<String>,
    /// Names whose token was revoked.
    pub revoked: Vec<String>,
}

impl Reconciled {
    /// Returns `true` if the pass changed nothing.
    #[must_use]
    pub fn is_unchanged(&self) -> bool {
        self.minted.is_empty() && self.revoked.is_empty()
    }
}

/// Thread-safe `name <-> token` map backed by a flat file on disk.
///
/// Uses `std::sync::RwLock` so the per-request lookups are a cheap read lock
/// with no async overhead.
pub struct TokenStore {
    inner: RwLock<Inner>,
    path: PathBuf,
}

impl TokenStore {
    /// Create an empty store that persists to `path`. Nothing is read yet.
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            path,
        }
    }

    /// Path of the backing record.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        match self.inner.read() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::warn!("token store lock poisoned on read");
                poisoned.into_inner()
            }
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::warn!("token store lock poisoned on write");
                poisoned.into_inner()
            }
        }
    }

    /// Mint a token for every name that does not have one yet.
    ///
    /// Returns the names that were newly minted.
    pub fn ensure<'a>(&self, names: impl IntoIterator<Item = &'a str>) -> Vec<String> {
        self.write().ensure(names)
    }

    /// Revoke every token whose name is not in `keep`.
    ///
    /// Returns the names that were removed.
    pub fn prune(&self, keep: &BTreeSet<String>) -> Vec<String> {
        self.write().prune(keep)
    }

    /// Bring the store in line with `names`: mint missing tokens, revoke
    /// stale ones, then persist.
    ///
    /// Both steps run under one write lock, so lookups observe either the old
    /// or the new assignment and never a configured name without a token.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError`] if the record could not be written. The
    /// in-memory state is updated regardless.
    pub fn reconcile(&self, names: &BTreeSet<String>) -> Result<Reconciled, PersistenceError> {
        let changes = {
            let mut inner = self.write();
            let minted = inner.ensure(names.iter().map(String::as_str));
            let revoked = inner.prune(names);
            Reconciled { minted, revoked }
        };
        self.persist()?;
        Ok(changes)
    }

    /// Look up the name owning `token`.
    #[must_use]
    pub fn resolve_token(&self, token: &str) -> Option<String> {
        self.read().token_to_name.get(token).cloned()
    }

    /// Look up the token issued to `name`.
    #[must_use]
    pub fn resolve_name(&self, name: &str) -> Option<String> {
        self.read().name_to_token.get(name).cloned()
    }

    /// All names currently holding a token, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read().name_to_token.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of live identities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.read().name_to_token.len()
    }

    /// Returns `true` if no identity is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read().name_to_token.is_empty()
    }

    /// Rewrite the backing record with the current identities.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::Io`] if the temporary file cannot be
    /// written or renamed into place.
    pub fn persist(&self) -> Result<(), PersistenceError> {
        let contents = self.read().render();
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        // a uniquely named sibling, renamed over the record once written
        let mut tmp =
            tempfile::NamedTempFile::new_in(dir).map_err(|source| PersistenceError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
        if let Err(source) = tmp.write_all(contents.as_bytes()) {
            return Err(PersistenceError::Io {
                path: tmp.path().to_path_buf(),
                source,
            });
        }
        tmp.persist(&self.path).map_err(|e| PersistenceError::Io {
            path: self.path.clone(),
            source: e.error,
        })?;
        Ok(())
    }

    /// Replace the in-memory identities with the backing record.
    ///
    /// A missing record is treated as a first run and leaves the store empty.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError`] if the record exists but cannot be read
    /// or contains a malformed line.
    pub fn load(&self) -> Result<(), PersistenceError> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %self.path.display(), "no token record yet, starting empty");
                *self.write() = Inner::default();
                return Ok(());
            }
            Err(source) => {
                return Err(PersistenceError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        let parsed = Inner::parse(&contents)?;
        tracing::info!(count = parsed.name_to_token.len(), "loaded token record");
        *self.write() = parsed;
        Ok(())
    }
}
