mod backend;
mod error;
mod facade;
mod sled_backend;

pub use backend::StorageBackend;
pub use error::StorageError;
pub use facade::{StorageEngine, StorageFacade};
pub use sled_backend::{SledMode, SledStorage};

#[cfg(test)]
pub(crate) fn open_temp_storage() -> (tempfile::TempDir, StorageFacade) {
    let dir = tempfile::TempDir::new().expect("temp dir should be created");
    let mut app_config = crate::config::AppConfig::default();
    app_config.storage.path = dir.path().join("data").to_string_lossy().to_string();
    let storage = StorageFacade::initialize(&app_config).expect("storage init should work");
    (dir, storage)
}
