use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::ServiceError;
use crate::models::ProductAccessGrant;
use crate::repos::Store;

/// Records and revokes buyers' product entitlements
#[derive(Clone)]
pub struct AccessGranter {
    store: Arc<dyn Store>,
}

impl AccessGranter {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Idempotent: a second call for the same purchase returns the existing grant.
    ///
    /// A failed write here means the payment is already `succeeded` without an
    /// entitlement. That gap is logged at error level keyed by `purchase_id`
    /// and is repaired by provider retry or the reconciliation sweep.
    pub async fn grant(
        &self,
        user_id: Uuid,
        product_id: Uuid,
        purchase_id: Uuid,
    ) -> Result<ProductAccessGrant, ServiceError> {
        match self
            .store
            .insert_grant_if_absent(user_id, product_id, purchase_id, None)
            .await
        {
            Ok(upserted) => {
                if upserted.created {
                    tracing::info!(
                        purchase_id = %purchase_id,
                        user_id = %user_id,
                        product_id = %product_id,
                        grant_id = %upserted.value.id,
                        "Product access granted"
                    );
                } else {
                    tracing::debug!(purchase_id = %purchase_id, "Product access already granted");
                }
                Ok(upserted.value)
            }
            Err(e) => {
                tracing::error!(
                    purchase_id = %purchase_id,
                    user_id = %user_id,
                    product_id = %product_id,
                    error = %e,
                    "ACCESS GRANT FAILED for succeeded payment; purchase has no entitlement"
                );
                Err(e.into())
            }
        }
    }

    /// Revoke every active grant of a refunded purchase
    pub async fn revoke_for_purchase(&self, purchase_id: Uuid) -> Result<u64, ServiceError> {
        let revoked = self.store.revoke_grants_for_purchase(purchase_id).await?;
        if revoked > 0 {
            tracing::info!(purchase_id = %purchase_id, revoked, "Product access revoked");
        }
        Ok(revoked)
    }

    /// Count one download against an active grant
    pub async fn record_download(&self, grant_id: Uuid) -> Result<ProductAccessGrant, ServiceError> {
        let grant = self
            .store
            .find_grant(grant_id)
            .await?
            .ok_or_else(|| ServiceError::not_found("access grant", grant_id))?;

        if !grant.is_active(Utc::now()) {
            return Err(ServiceError::Validation(format!(
                "access grant {} is revoked or expired",
                grant_id
            )));
        }

        self.store
            .increment_download(grant_id)
            .await?
            .ok_or_else(|| {
                ServiceError::Validation(format!("access grant {} is revoked or expired", grant_id))
            })
    }
}
