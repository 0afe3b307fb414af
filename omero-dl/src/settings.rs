use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Serialize;

const DEFAULT_WEB_URL: &str = "https://omero-cci-users.gu.se";
const DEFAULT_DOWNLOAD_DIR: &str = "Downloads/omero";
const DEFAULT_PAGE_SIZE: u32 = 200;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Settings {
    pub web_url: String,
    #[serde(skip_serializing)]
    pub session: Option<String>,
    pub download_dir: PathBuf,
    pub page_size: u32,
}

impl Settings {
    pub fn from_env() -> anyhow::Result<Self> {
        let home = dirs::home_dir().context("home directory is unavailable")?;
        Ok(Self::from_lookup(&home, |name| std::env::var(name).ok()))
    }

    fn from_lookup<F>(home: &Path, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let web_url = lookup("OMERO_WEB_URL")
            .map(|value| value.trim().trim_end_matches('/').to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| DEFAULT_WEB_URL.to_string());
        let session = lookup("OMERO_SESSION")
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());
        let download_dir = lookup("OMERO_DOWNLOAD_DIR")
            .filter(|value| !value.trim().is_empty())
            .map(|value| expand_with_home(&value, home))
            .unwrap_or_else(|| home.join(DEFAULT_DOWNLOAD_DIR));
        let page_size = lookup("OMERO_PAGE_SIZE")
            .and_then(|value| value.trim().parse::<u32>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_PAGE_SIZE);

        Self {
            web_url,
            session,
            download_dir,
            page_size,
        }
    }

    /// Session token, required by every command that talks to the server.
    pub fn require_session(&self) -> anyhow::Result<&str> {
        self.session
            .as_deref()
            .context("OMERO_SESSION is not set; export a session token from OMERO.web")
    }
}

fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(value)
}
