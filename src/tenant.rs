use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::info;

use crate::booking::BookingService;
use crate::compactor;
use crate::engine::Engine;
use crate::limits::*;
use crate::observability::TENANTS_ACTIVE;
use crate::payment::PaymentGateway;

/// One booking service per tenant, each with its own engine, WAL and compactor.
/// Tenant = database name from the pgwire connection.
pub struct TenantManager {
    services: DashMap<String, Arc<BookingService>>,
    data_dir: PathBuf,
    compact_threshold: u64,
    payments: Arc<dyn PaymentGateway>,
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64, payments: Arc<dyn PaymentGateway>) -> Self {
        Self {
            services: DashMap::new(),
            data_dir,
            compact_threshold,
            payments,
        }
    }

    /// Get or lazily open the tenant's booking service.
    pub fn get_or_create(&self, tenant: &str) -> io::Result<Arc<BookingService>> {
        if let Some(service) = self.services.get(tenant) {
            return Ok(service.value().clone());
        }
        if tenant.len() > MAX_TENANT_NAME_LEN {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "tenant name too long"));
        }
        if self.services.len() >= MAX_TENANTS {
            return Err(io::Error::other("too many tenants"));
        }

        // The name is the WAL file stem, so it must be usable as-is.
        if tenant.is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty tenant name"));
        }
        if !tenant
            .chars()
            .all(|c| c.is_alphanumeric() || c == '_' || c == '-')
        {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "invalid tenant name"));
        }

        // Two first connections racing: only one opens the WAL.
        match self.services.entry(tenant.to_string()) {
            Entry::Occupied(e) => Ok(e.get().clone()),
            Entry::Vacant(slot) => {
                let wal_path = self.data_dir.join(format!("{tenant}.wal"));
                let engine = Arc::new(Engine::new(wal_path)?);

                let compactor_engine = engine.clone();
                let threshold = self.compact_threshold;
                tokio::spawn(async move {
                    compactor::run_compactor(compactor_engine, threshold).await;
                });

                let service = Arc::new(BookingService::new(engine, self.payments.clone()));
                slot.insert(service.clone());
                metrics::gauge!(TENANTS_ACTIVE).set(self.services.len() as f64);
                info!("tenant {tenant:?} opened");
                Ok(service)
            }
        }
    }
}
