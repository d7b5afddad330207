use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::compactor;
use crate::engine::Engine;
use crate::limits::*;
use crate::notifier::{self, InboxSink, NoticeSink, Outbox};
use crate::notify::NotifyHub;
use crate::observability::TENANTS_ACTIVE;

/// Manages per-clinic engines. Each clinic gets its own Engine, WAL, notice
/// dispatcher and compactor. Clinic = database name from the pgwire connection.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
    outbox_capacity: usize,
}

/// File-safe form of a clinic (database) name. Characters other than
/// alphanumerics, `_` and `-` are dropped, so a name can never leave the
/// data directory.
pub fn clinic_key(name: &str) -> io::Result<String> {
    if name.len() > MAX_TENANT_NAME_LEN {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "clinic name too long"));
    }
    let key: String = name
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
        .collect();
    if key.is_empty() {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty clinic name"));
    }
    Ok(key)
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64, outbox_capacity: usize) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
            outbox_capacity,
        }
    }

    /// Get or lazily open the engine for a clinic. Names that sanitize to the
    /// same key share one engine and one WAL.
    pub fn get_or_create(&self, clinic: &str) -> io::Result<Arc<Engine>> {
        let key = clinic_key(clinic)?;
        if let Some(engine) = self.engines.get(&key) {
            return Ok(engine.value().clone());
        }
        if self.engines.len() >= MAX_TENANTS {
            return Err(io::Error::other("too many clinics"));
        }

        // The entry lock makes exactly one racing connection build the engine.
        let engine = match self.engines.entry(key.clone()) {
            Entry::Occupied(existing) => return Ok(existing.get().clone()),
            Entry::Vacant(slot) => slot.insert(self.open(&key)?).value().clone(),
        };
        metrics::gauge!(TENANTS_ACTIVE).set(self.engines.len() as f64);
        tracing::info!(clinic = %key, "clinic opened");
        Ok(engine)
    }

    /// Replay the clinic's WAL and start its notice dispatcher and compactor.
    fn open(&self, key: &str) -> io::Result<Arc<Engine>> {
        let wal_path = self.data_dir.join(format!("{key}.wal"));
        let (outbox, notices) = Outbox::channel(self.outbox_capacity);
        let engine = Arc::new(Engine::new(wal_path, Arc::new(NotifyHub::new()), outbox)?);

        let sinks: Vec<Arc<dyn NoticeSink>> = vec![Arc::new(InboxSink::new(&engine))];
        tokio::spawn(notifier::run_dispatcher(notices, sinks));
        tokio::spawn(compactor::run_compactor(engine.clone(), self.compact_threshold));
        Ok(engine)
    }

    pub fn clinic_count(&self) -> usize {
        self.engines.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use std::fs;
    use ulid::Ulid;

    fn test_data_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("vetbook_test_tenant").join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn tenant_isolation() {
        let dir = test_data_dir("isolation");
        let tm = TenantManager::new(dir, 1000, 64);

        let eng_a = tm.get_or_create("clinic_a").unwrap();
        let eng_b = tm.get_or_create("clinic_b").unwrap();

        // Same ids in both clinics
        let admin = Ulid::new();
        eng_a
            .register_user(None, admin, "Admin", "admin@a.test", Role::Admin)
            .await
            .unwrap();
        eng_b
            .register_user(None, admin, "Admin", "admin@b.test", Role::Admin)
            .await
            .unwrap();
        eng_a
            .create_specialization(admin, Ulid::new(), "Surgery", None)
            .await
            .unwrap();

        assert_eq!(eng_a.list_specializations().len(), 1);
        assert!(eng_b.list_specializations().is_empty());
    }

    #[tokio::test]
    async fn tenant_lazy_creation() {
        let dir = test_data_dir("lazy");
        let tm = TenantManager::new(dir.clone(), 1000, 64);

        let entries: Vec<_> = fs::read_dir(&dir).unwrap().collect();
        assert!(entries.is_empty());

        let _eng = tm.get_or_create("my_clinic").unwrap();
        assert!(dir.join("my_clinic.wal").exists());
    }

    #[tokio::test]
    async fn tenant_same_engine_returned() {
        let dir = test_data_dir("same_eng");
        let tm = TenantManager::new(dir, 1000, 64);

        let eng1 = tm.get_or_create("foo").unwrap();
        let eng2 = tm.get_or_create("foo").unwrap();
        assert!(Arc::ptr_eq(&eng1, &eng2));
    }

    #[tokio::test]
    async fn tenant_name_sanitized() {
        let dir = test_data_dir("sanitize");
        let tm = TenantManager::new(dir.clone(), 1000, 64);

        let evil = tm.get_or_create("../evil").unwrap();
        assert!(dir.join("evil.wal").exists());
        // Same key, same engine: two engines never share a WAL file.
        let plain = tm.get_or_create("evil").unwrap();
        assert!(Arc::ptr_eq(&evil, &plain));
        assert_eq!(tm.clinic_count(), 1);

        let result = tm.get_or_create("../..");
        assert!(result.is_err());
    }

    #[test]
    fn clinic_keys() {
        assert_eq!(clinic_key("happy-paws_01").unwrap(), "happy-paws_01");
        assert_eq!(clinic_key("a/b c").unwrap(), "abc");
        assert_eq!(clinic_key("...").unwrap_err().kind(), io::ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn tenant_name_too_long() {
        let dir = test_data_dir("name_too_long");
        let tm = TenantManager::new(dir, 1000, 64);

        let long_name = "x".repeat(MAX_TENANT_NAME_LEN + 1);
        let err = tm.get_or_create(&long_name).err().unwrap();
        assert!(err.to_string().contains("clinic name too long"));
    }

    #[tokio::test]
    async fn tenant_count_limit() {
        let dir = test_data_dir("count_limit");
        let tm = TenantManager::new(dir, 1000, 4);

        for i in 0..MAX_TENANTS {
            tm.get_or_create(&format!("t{i}")).unwrap();
        }
        let err = tm.get_or_create("one_more").err().unwrap();
        assert!(err.to_string().contains("too many clinics"));
    }
}
