//! 状态存储层：按聚合加锁、按聚合落盘

pub mod persistence;
pub mod state;

use std::path::PathBuf;

use thiserror::Error;

pub use persistence::{Aggregate, JsonFile};
pub use state::{StateStore, TaskEvent};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}
