use crate::TenantId;

/// Helper trait for tenant-scoped records.
///
/// This trait marks types that have an associated tenant ID, enabling tenant-aware
/// processing in infrastructure components (workers, stores, operator tooling).
///
/// ## Use Cases
///
/// - **Worker initialization**: Workers pinned to a specific tenant re-check every claimed
///   job and skip other tenants' records, on top of the store query filter
/// - **Tenant validation**: Ensure records handed back by a store belong to the expected tenant
pub trait TenantScoped {
    fn tenant_id(&self) -> TenantId;

    /// Whether this record belongs to `tenant_id`.
    fn belongs_to(&self, tenant_id: TenantId) -> bool {
        self.tenant_id() == tenant_id
    }
}
