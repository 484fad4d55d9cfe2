use std::{collections::HashSet, net::IpAddr, path::Path, sync::Arc};

use anyhow::Context;
use arc_swap::ArcSwap;
use serde::Deserialize;

#[derive(Debug, Default, Deserialize)]
struct BlacklistFile {
    #[serde(default)]
    ips: Vec<String>,
}

/// Process-wide IP blacklist loaded from a JSON file of the form `{"ips": [...]}`.
#[derive(Debug, Default)]
pub struct Blacklist {
    ips: ArcSwap<HashSet<IpAddr>>,
}

impl Blacklist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_ips(ips: impl IntoIterator<Item = IpAddr>) -> Self {
        let b = Self::new();
        b.replace(ips.into_iter().collect());
        b
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        self.ips.load().contains(ip)
    }

    pub fn len(&self) -> usize {
        self.ips.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn replace(&self, ips: HashSet<IpAddr>) {
        self.ips.store(Arc::new(ips));
    }

    /// Reloads from `path`. A missing file clears the list; entries that are not IP
    /// addresses are skipped with a warning.
    pub fn load_file(&self, path: &Path) -> anyhow::Result<usize> {
        let data = match std::fs::read_to_string(path) {
            Ok(d) => d,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(path = %path.display(), "blacklist: file not found, list is empty");
                self.replace(HashSet::new());
                return Ok(0);
            }
            Err(err) => {
                return Err(err).with_context(|| format!("blacklist: read {}", path.display()));
            }
        };

        let file: BlacklistFile = serde_json::from_str(&data)
            .with_context(|| format!("blacklist: parse {}", path.display()))?;

        let mut ips = HashSet::with_capacity(file.ips.len());
        for raw in &file.ips {
            match raw.trim().parse::<IpAddr>() {
                Ok(ip) => {
                    ips.insert(ip);
                }
                Err(_) => tracing::warn!(entry = %raw, "blacklist: skipping invalid ip"),
            }
        }
        let n = ips.len();
        self.replace(ips);
        Ok(n)
    }
}
