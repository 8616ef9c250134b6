pub(crate) mod arena;
pub(crate) mod chunk;
pub(crate) mod handle;
pub(crate) mod loom_tests;
pub(crate) mod source;
pub(crate) mod stats;
pub(crate) mod subpage;

#[cfg(test)]
crate::sync::static_rwlock! {
    pub static TEST_MUTEX: crate::sync::RwLock<()> = crate::sync::RwLock::new(());
}
