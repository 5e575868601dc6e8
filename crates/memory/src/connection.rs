use std::path::Path;

use types::{MemoryConfig, MemoryError};

use crate::errors::initialization_error;

/// Where the durable store lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum StoreLocation {
    Local { db_path: String },
    Remote { url: String, auth_token: String },
}

impl StoreLocation {
    /// `None` when persistence is disabled and the caller should fall back to
    /// the in-process store.
    pub(crate) fn from_config(config: &MemoryConfig) -> Result<Option<Self>, MemoryError> {
        if !config.enabled {
            return Ok(None);
        }

        let remote_url = config
            .remote_url
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty());
        if let Some(url) = remote_url {
            let auth_token = config
                .auth_token
                .as_deref()
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .ok_or_else(|| {
                    initialization_error(format!("remote store `{url}` requires an auth_token"))
                })?;
            return Ok(Some(Self::Remote {
                url: url.to_owned(),
                auth_token: auth_token.to_owned(),
            }));
        }

        let db_path = config.db_path.trim();
        if db_path.is_empty() {
            return Err(initialization_error(
                "local store requires a non-empty db_path".to_owned(),
            ));
        }
        Ok(Some(Self::Local {
            db_path: db_path.to_owned(),
        }))
    }

    pub(crate) fn describe(&self) -> String {
        match self {
            Self::Local { db_path } => format!("local:{db_path}"),
            Self::Remote { url, .. } => format!("remote:{url}"),
        }
    }
}

pub(crate) fn ensure_local_parent_directory(db_path: &str) -> Result<(), MemoryError> {
    let Some(parent) = Path::new(db_path)
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
    else {
        return Ok(());
    };
    std::fs::create_dir_all(parent).map_err(|error| {
        initialization_error(format!(
            "failed to create store directory `{}`: {error}",
            parent.display()
        ))
    })
}
