//! Quota and credit arithmetic.
//!
//! Usage of a pool is the number of rows its billable jobs attempted
//! (`processed_rows + cache_hits`), not the credits they were billed. Credits
//! are only charged for the rows that land above the pool's quota.

use serde::{Deserialize, Serialize};

use geojobs_core::{DomainError, DomainResult, OrganizationId, TenantId, ValueObject};

use crate::job::GeocodingKind;

/// How a tenant's quota is enforced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaLimit {
    /// Jobs may not geocode more than the remaining quota.
    Hard,
    /// Overage is allowed and billed.
    Soft,
}

/// The pool a job's usage is charged against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "scope", content = "id")]
pub enum QuotaPool {
    Tenant(TenantId),
    Organization(OrganizationId),
}

impl core::fmt::Display for QuotaPool {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            QuotaPool::Tenant(id) => write!(f, "tenant:{id}"),
            QuotaPool::Organization(id) => write!(f, "organization:{id}"),
        }
    }
}

/// Price of a block of credits, e.g. 1500 (cents) per 1000 rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pricing {
    block_price: u64,
    block_size: u64,
}

impl ValueObject for Pricing {}

impl Pricing {
    pub fn new(block_price: u64, block_size: u64) -> DomainResult<Self> {
        if block_size == 0 {
            return Err(DomainError::validation("block_size", "must be greater than 0"));
        }
        Ok(Self {
            block_price,
            block_size,
        })
    }

    pub fn block_price(&self) -> u64 {
        self.block_price
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrganizationQuota {
    pub id: OrganizationId,
    pub quota: u64,
}

/// Quota settings of a tenant as seen by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaAccount {
    pub tenant_id: TenantId,
    /// The tenant's own allowance. Ignored when `organization` is set.
    pub quota: u64,
    pub limit: QuotaLimit,
    pub pricing: Pricing,
    pub organization: Option<OrganizationQuota>,
}

impl QuotaAccount {
    /// Pool this tenant's jobs are charged against.
    pub fn pool(&self) -> QuotaPool {
        match self.organization {
            Some(org) => QuotaPool::Organization(org.id),
            None => QuotaPool::Tenant(self.tenant_id),
        }
    }

    /// Allowance of the pool returned by [`QuotaAccount::pool`].
    pub fn effective_quota(&self) -> u64 {
        self.organization.map_or(self.quota, |org| org.quota)
    }

    /// Rows a new job may still geocode given the pool's current usage.
    pub fn max_geocodable_rows(&self, usage: u64) -> Option<u64> {
        max_geocodable_rows(self.limit, self.effective_quota(), usage)
    }
}

/// `None` means unbounded.
pub fn max_geocodable_rows(limit: QuotaLimit, quota: u64, usage: u64) -> Option<u64> {
    match limit {
        QuotaLimit::Soft => None,
        QuotaLimit::Hard => Some(quota.saturating_sub(usage)),
    }
}

/// Credits billed for a job that attempted `attempted` rows on top of
/// `prior_usage` rows already consumed from a pool of size `quota`.
///
/// Only the part of `attempted` above `max(prior_usage, quota)` is billed, so
/// rows that were already billed to earlier jobs are never billed twice.
pub fn calculate_used_credits(
    kind: GeocodingKind,
    attempted: u64,
    prior_usage: u64,
    quota: u64,
) -> u64 {
    if !kind.is_billable() {
        return 0;
    }
    let total = prior_usage.saturating_add(attempted);
    total.saturating_sub(prior_usage.max(quota))
}

pub fn price(used_credits: u64, pricing: &Pricing) -> f64 {
    used_credits as f64 * pricing.block_price as f64 / pricing.block_size as f64
}
