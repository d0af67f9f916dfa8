//! Tenant lifecycle: registering a tenant in the metadata store and
//! preparing (or tearing down) its backend namespace.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, instrument};

use strata_backend::Backend;
use strata_meta::{MetadataStore, Tenant};

use crate::service::validate_tenant_id;
use crate::{CasError, Result};

/// Attributes for a new tenant. `slug` defaults to the id; it doubles as
/// the tenant's backend storage namespace and must be unique.
#[derive(Debug, Clone)]
pub struct TenantAttrs {
    pub id: String,
    pub slug: Option<String>,
}

impl TenantAttrs {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            slug: None,
        }
    }

    pub fn with_slug(mut self, slug: impl Into<String>) -> Self {
        self.slug = Some(slug.into());
        self
    }
}

pub struct TenantProvisioner {
    backend: Arc<dyn Backend>,
    meta: Arc<MetadataStore>,
}

impl TenantProvisioner {
    pub fn new(backend: Arc<dyn Backend>, meta: Arc<MetadataStore>) -> Self {
        Self { backend, meta }
    }

    /// Register a tenant and prepare its namespace. Idempotent for an id
    /// that is already provisioned; a slug owned by a different tenant is
    /// rejected.
    #[instrument(skip(self), fields(tenant = %attrs.id))]
    pub async fn provision(&self, attrs: &TenantAttrs) -> Result<Tenant> {
        validate_tenant_id(&attrs.id)?;
        let slug = attrs.slug.clone().unwrap_or_else(|| attrs.id.clone());
        validate_slug(&slug)?;

        let tenant = Tenant {
            id: attrs.id.clone(),
            slug: slug.clone(),
            storage_namespace: slug.clone(),
            created_at: Utc::now(),
        };
        let stored = match self.meta.insert_tenant(&tenant) {
            Ok(stored) => stored,
            // the insert was a no-op and no row exists under this id: the
            // slug is taken by another tenant
            Err(strata_meta::MetaError::TenantNotFound(_)) => {
                return Err(CasError::InvalidInput(format!("slug already in use: {slug}")));
            }
            Err(e) => return Err(e.into()),
        };

        self.backend.create_namespace(&stored.storage_namespace).await?;
        info!(tenant = %stored.id, namespace = %stored.storage_namespace, "tenant provisioned");
        Ok(stored)
    }

    /// Remove a tenant. Refused while the tenant still owns content; the
    /// caller must delete every object first.
    #[instrument(skip(self))]
    pub async fn deprovision(&self, tenant_id: &str) -> Result<()> {
        validate_tenant_id(tenant_id)?;
        let tenant = self
            .meta
            .get_tenant(tenant_id)?
            .ok_or_else(|| CasError::TenantNotProvisioned(tenant_id.to_string()))?;

        let objects = self.meta.object_count(tenant_id)?;
        if objects > 0 {
            return Err(CasError::TenantNotEmpty {
                tenant: tenant_id.to_string(),
                objects,
            });
        }

        self.backend.remove_namespace(&tenant.storage_namespace).await?;
        self.meta.remove_tenant(tenant_id)?;
        info!(tenant = tenant_id, "tenant deprovisioned");
        Ok(())
    }
}

fn validate_slug(slug: &str) -> Result<()> {
    let ok = !slug.is_empty()
        && slug.len() <= 64
        && slug
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-');
    if !ok {
        return Err(CasError::InvalidInput(format!("malformed slug: {slug:?}")));
    }
    Ok(())
}
