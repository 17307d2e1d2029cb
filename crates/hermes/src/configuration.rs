//! The relay descriptor: services, communicators and recipients.

use crate::error::{AddressRangeFault, ConfigError, EntityKind};
use crate::metrics::counters;
use crate::registry::ConnectionRegistry;
use crate::tokens::TokenStore;
use arc_swap::ArcSwap;
use serde::Deserialize;
use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// An authenticated message source.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Service {
    /// Unique service name.
    pub name: String,
}

/// An authenticated long-lived delivery channel.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Communicator {
    /// Unique communicator name.
    pub name: String,
    /// Position in each recipient's `ids` holding this communicator's address.
    #[serde(rename = "id-index")]
    pub id_index: usize,
}

/// An addressable subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Recipient {
    /// Display name, not an identity.
    pub name: String,
    /// One address per communicator address space.
    #[serde(default)]
    pub ids: Vec<String>,
    /// Names of the services this recipient listens to.
    #[serde(default)]
    pub subscriptions: Vec<String>,
}

impl Recipient {
    /// Returns `true` if this recipient subscribes to `service`.
    #[must_use]
    pub fn subscribes_to(&self, service: &str) -> bool {
        self.subscriptions.iter().any(|s| s == service)
    }
}

/// One generation of the relay descriptor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Configuration {
    /// Message sources.
    #[serde(default)]
    pub services: Vec<Service>,
    /// Message subscribers.
    #[serde(default)]
    pub recipients: Vec<Recipient>,
    /// Delivery channels.
    #[serde(default)]
    pub communicators: Vec<Communicator>,
}

fn check_names<'a>(
    kind: EntityKind,
    names: impl Iterator<Item = &'a str>,
) -> Result<(), ConfigError> {
    let mut seen = HashSet::new();
    for name in names {
        let reason = if name.is_empty() {
            Some("names must be at least one character long")
        } else if name.contains('=') {
            Some("names must not contain '='")
        } else if name.contains(['\n', '\r']) {
            Some("names must not contain line breaks")
        } else if !seen.insert(name) {
            Some("names must be unique")
        } else {
            None
        };
        if let Some(reason) = reason {
            return Err(ConfigError::Validation {
                kind,
                name: name.to_string(),
                reason,
            });
        }
    }
    Ok(())
}

impl Configuration {
    /// Parse and validate a descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] or [`ConfigError::Validation`].
    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate the descriptor at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Read`] on I/O failure, otherwise as [`Self::parse`].
    pub fn read(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&contents)
    }

    /// Check service and communicator names.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] naming the first offending entry.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_names(
            EntityKind::Service,
            self.services.iter().map(|s| s.name.as_str()),
        )?;
        check_names(
            EntityKind::Communicator,
            self.communicators.iter().map(|c| c.name.as_str()),
        )
    }

    /// Look up a service by name.
    #[must_use]
    pub fn service(&self, name: &str) -> Option<&Service> {
        self.services.iter().find(|s| s.name == name)
    }

    /// Look up a communicator by name.
    #[must_use]
    pub fn communicator(&self, name: &str) -> Option<&Communicator> {
        self.communicators.iter().find(|c| c.name == name)
    }

    /// Recipients subscribed to `service`, in descriptor order.
    pub fn subscribers<'a>(&'a self, service: &'a str) -> impl Iterator<Item = &'a Recipient> + 'a {
        self.recipients
            .iter()
            .filter(move |r| r.subscribes_to(service))
    }

    /// Every name that must hold a token: services and communicators.
    #[must_use]
    pub fn identity_names(&self) -> BTreeSet<String> {
        self.services
            .iter()
            .map(|s| s.name.clone())
            .chain(self.communicators.iter().map(|c| c.name.clone()))
            .collect()
    }

    /// Recipient/communicator pairs where the recipient has no address at
    /// the communicator's index.
    #[must_use]
    pub fn address_faults(&self) -> Vec<AddressRangeFault> {
        let mut faults = Vec::new();
        for recipient in &self.recipients {
            for communicator in &self.communicators {
                if communicator.id_index >= recipient.ids.len() {
                    faults.push(AddressRangeFault {
                        recipient: recipient.name.clone(),
                        communicator: communicator.name.clone(),
                        index: communicator.id_index,
                        len: recipient.ids.len(),
                    });
                }
            }
        }
        faults
    }
}

/// A change notification for the descriptor file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigEvent {
    /// The file was written; reload it.
    Modified,
    /// The file is gone; the relay cannot continue.
    Removed,
}

/// Owns the published configuration generation and keeps the token store
/// reconciled with it.
///
/// Once a registry is attached, every reconciliation also cuts off sockets
/// bound to names the new generation no longer lists as communicators.
pub struct ConfigStore {
    path: PathBuf,
    current: ArcSwap<Configuration>,
    tokens: Arc<TokenStore>,
    registry: OnceLock<Arc<ConnectionRegistry>>,
}

impl ConfigStore {
    /// Load the token record and the descriptor at `path`, then reconcile.
    ///
    /// # Errors
    ///
    /// Any failure here is fatal: the record or descriptor cannot be read,
    /// the descriptor is invalid, or the reconciled record cannot be written.
    pub fn open(path: PathBuf, tokens: Arc<TokenStore>) -> Result<Self, ConfigError> {
        tokens.load()?;
        let config = Configuration::read(&path)?;
        let store = Self::with_configuration(path, config, tokens);
        store.reconcile_tokens()?;
        info!(path = %store.path.display(), "configuration loaded");
        Ok(store)
    }

    /// Build a store around an already validated generation without touching
    /// disk.
    #[must_use]
    pub fn with_configuration(path: PathBuf, config: Configuration, tokens: Arc<TokenStore>) -> Self {
        Self {
            path,
            current: ArcSwap::from_pointee(config),
            tokens,
            registry: OnceLock::new(),
        }
    }

    /// Revoke live bindings in `registry` on every later reconciliation.
    ///
    /// Only the first attached registry is kept.
    pub fn attach_registry(&self, registry: Arc<ConnectionRegistry>) {
        if self.registry.set(registry).is_err() {
            warn!("connection registry already attached, ignoring");
        }
    }

    /// Path of the descriptor file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The token store kept in sync with this configuration.
    #[must_use]
    pub fn tokens(&self) -> &Arc<TokenStore> {
        &self.tokens
    }

    /// Snapshot of the generation currently in effect.
    #[must_use]
    pub fn current(&self) -> Arc<Configuration> {
        self.current.load_full()
    }

    fn reconcile_tokens(&self) -> Result<(), ConfigError> {
        let current = self.current();
        for fault in current.address_faults() {
            warn!("configuration inconsistency: {}", fault);
        }
        let reconciled = self.tokens.reconcile(&current.identity_names());
        // the in-memory record is already updated even if persisting failed
        if let Some(registry) = self.registry.get() {
            for name in registry.retain_communicators(&current) {
                counters::revocations_total();
                info!(name = %name, "closed connection of revoked communicator");
            }
        }
        let changes = reconciled?;
        for name in &changes.minted {
            info!(name = %name, "issued token");
        }
        for name in &changes.revoked {
            info!(name = %name, "revoked token");
        }
        Ok(())
    }

    /// Re-read the descriptor and publish it if valid.
    ///
    /// On failure the previous generation stays in effect. A failure to
    /// persist the reconciled tokens is logged but does not undo the reload.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Read`], [`ConfigError::Parse`] or
    /// [`ConfigError::Validation`].
    pub fn reload(&self) -> Result<(), ConfigError> {
        let config = match Configuration::read(&self.path) {
            Ok(config) => config,
            Err(e) => {
                counters::config_reloads_total("rejected");
                return Err(e);
            }
        };
        self.current.store(Arc::new(config));
        if let Err(e) = self.reconcile_tokens() {
            warn!("token record not persisted, durability lost until next reload: {}", e);
        }
        counters::config_reloads_total("applied");
        info!(path = %self.path.display(), "configuration reloaded");
        Ok(())
    }

    /// Consume change events until the source closes or the file is removed.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ConfigurationLost`] on a removal event.
    pub async fn watch(&self, mut events: mpsc::UnboundedReceiver<ConfigEvent>) -> Result<(), ConfigError> {
        while let Some(event) = events.recv().await {
            match event {
                ConfigEvent::Modified => {
                    if let Err(e) = self.reload() {
                        error!("failed to reload configuration, keeping previous: {}", e);
                    }
                }
                ConfigEvent::Removed => {
                    return Err(ConfigError::ConfigurationLost(self.path.clone()));
                }
            }
        }
        Ok(())
    }
}
