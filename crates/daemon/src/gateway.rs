//! Share delivery.
//!
//! Sits between the HTTP layer and the share machinery: applies the
//! feature flag and interface access list, validates the share, counts the
//! use atomically and decides what the client gets back.

use crate::catalog::{media_file, CatalogError, CatalogObject, ObjectCatalog};
use crate::config::Config;
use crate::object::ObjectRef;
use crate::playlist::{assemble, Playlist, ShareCredentials};
use crate::share::{validate, validate_follow_up, AccessDenied, DenyReason, Share, ShareAction};
use crate::store::{ShareStore, StoreError};
use crate::unix_now;
use ipnet::IpNet;
use std::net::IpAddr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

/// Error type for gateway operations
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Denied(#[from] AccessDenied),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),
}

/// Feature switches and the interface access list.
#[derive(Debug, Clone, PartialEq)]
pub struct AccessPolicy {
    pub share_enabled: bool,
    pub access_control: bool,
    pub interface_ranges: Vec<IpNet>,
}

impl AccessPolicy {
    pub fn from_config(config: &Config) -> Result<Self, ipnet::AddrParseError> {
        let interface_ranges = config
            .access
            .interface_ranges
            .iter()
            .map(|range| range.trim().parse::<IpNet>())
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            share_enabled: config.features.share,
            access_control: config.features.access_control,
            interface_ranges,
        })
    }

    /// Whether `remote` may use shares at all.
    pub fn admits(&self, remote: IpAddr) -> bool {
        if !self.access_control {
            return true;
        }
        let remote = remote.to_canonical();
        self.interface_ranges.iter().any(|net| net.contains(&remote))
    }
}

impl Default for AccessPolicy {
    fn default() -> Self {
        Self {
            share_enabled: true,
            access_control: false,
            interface_ranges: Vec::new(),
        }
    }
}

/// Parameters of a share consume request.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumeRequest {
    pub share_id: i64,
    pub secret: String,
    /// Raw `action` parameter; unset or empty picks the share default.
    pub action: Option<String>,
}

/// What a successful consume hands back.
#[derive(Debug, Clone, PartialEq)]
pub enum ConsumeOutcome {
    /// Serve this file as a download.
    Download(CatalogObject),
    /// Containers are not downloadable as one file; show the object instead.
    View(ObjectRef),
    Playlist(Playlist),
}

pub struct DeliveryGateway {
    shares: Arc<dyn ShareStore>,
    catalog: Arc<dyn ObjectCatalog>,
    policy: AccessPolicy,
}

impl DeliveryGateway {
    pub fn new(
        shares: Arc<dyn ShareStore>,
        catalog: Arc<dyn ObjectCatalog>,
        policy: AccessPolicy,
    ) -> Self {
        Self {
            shares,
            catalog,
            policy,
        }
    }

    pub fn policy(&self) -> &AccessPolicy {
        &self.policy
    }

    fn deny(&self, share_id: i64, remote: IpAddr, reason: DenyReason) -> GatewayError {
        warn!(share_id, remote = %remote, reason = %reason, "share access denied");
        GatewayError::Denied(AccessDenied { reason })
    }

    fn gate(&self, share_id: i64, remote: IpAddr) -> Result<(), GatewayError> {
        if !self.policy.share_enabled {
            return Err(self.deny(share_id, remote, DenyReason::FeatureDisabled));
        }
        if !self.policy.admits(remote) {
            return Err(self.deny(share_id, remote, DenyReason::AddressNotAllowed));
        }
        Ok(())
    }

    fn load(&self, share_id: i64) -> Result<Option<Share>, GatewayError> {
        if share_id <= 0 {
            return Ok(None);
        }
        Ok(self.shares.share(share_id)?)
    }

    /// Validate and count one use of a share.
    ///
    /// The outcome is resolved before the use is counted, so a request that
    /// cannot be served never consumes quota. Losing the counter race at
    /// write time is reported as `Exhausted`.
    pub fn consume(
        &self,
        request: &ConsumeRequest,
        remote: IpAddr,
    ) -> Result<ConsumeOutcome, GatewayError> {
        let share_id = request.share_id;
        self.gate(share_id, remote)?;

        let now = unix_now();
        let share = self.load(share_id)?;
        let action = validate(
            share.as_ref(),
            &request.secret,
            request.action.as_deref(),
            now,
        )
        .map_err(|reason| self.deny(share_id, remote, reason))?;
        let Some(share) = share else {
            return Err(self.deny(share_id, remote, DenyReason::NotFound));
        };

        let outcome = match action {
            ShareAction::Download if share.object.object_type.is_direct_download() => {
                ConsumeOutcome::Download(media_file(self.catalog.as_ref(), &share.object)?)
            }
            ShareAction::Download => ConsumeOutcome::View(share.object),
            ShareAction::Stream => {
                let credentials = ShareCredentials {
                    share_id: share.id,
                    secret: &share.secret,
                };
                ConsumeOutcome::Playlist(assemble(
                    &share.object,
                    Some(credentials),
                    self.catalog.as_ref(),
                )?)
            }
        };

        if !self.shares.save_access(share.id, now)? {
            return Err(self.deny(share_id, remote, DenyReason::Exhausted));
        }

        info!(share_id, remote = %remote, action = %action, object = %share.object, "share consumed");
        Ok(outcome)
    }

    /// Check a per-track request carrying share credentials and return the
    /// file to serve. Does not count a use.
    pub fn authorize_track(
        &self,
        share_id: i64,
        secret: &str,
        object: &ObjectRef,
        remote: IpAddr,
    ) -> Result<CatalogObject, GatewayError> {
        self.gate(share_id, remote)?;

        let share = self.load(share_id)?;
        validate_follow_up(share.as_ref(), secret, unix_now())
            .map_err(|reason| self.deny(share_id, remote, reason))?;
        let Some(share) = share else {
            return Err(self.deny(share_id, remote, DenyReason::NotFound));
        };

        if !share.covers(object, self.catalog.as_ref())? {
            return Err(self.deny(share_id, remote, DenyReason::ActionNotPermitted));
        }

        Ok(media_file(self.catalog.as_ref(), object)?)
    }
}
