pub(crate) mod arena;
pub(crate) mod directory;
pub(crate) mod integration;
pub(crate) mod locked;
pub(crate) mod pool;
pub(crate) mod pool_allocator;
pub(crate) mod size_class;
pub(crate) mod stats;
pub(crate) mod vm;

#[cfg(test)]
crate::sync::static_rwlock! {
    pub static TEST_MUTEX: crate::sync::RwLock<()> = crate::sync::RwLock::new(());
}
