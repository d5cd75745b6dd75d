pub mod executor;
pub mod kv;
pub mod notification;

#[cfg(not(target_arch = "wasm32"))]
pub mod sqlite_kv;

pub use self::executor::{RemoteExecutor, SubmitError};
pub use self::kv::{FileKv, KeyNamespace, KvError, KvKey, KvStore, MemoryKv, StorageErrorCode};
pub use self::notification::{LiveMessage, NotificationAction, NotificationError};

#[cfg(not(target_arch = "wasm32"))]
pub use self::sqlite_kv::SqliteKv;
