//! Float Catalog: a compile-time table of known collections and their
//! per-base-name float ranges, supplemented by a remote JSON catalog
//! fetched at most once per process.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

use parking_lot::RwLock;
use serde::Deserialize;
use tracing::warn;

use crate::models::FloatRange;

/// Known collections, trimmed to the base names this service ships with
/// out of the box. The remote supplement in [`FloatCatalog::ensure_remote`]
/// fills in anything missing here.
fn known_ranges() -> &'static HashMap<&'static str, (f64, f64)> {
    static TABLE: OnceLock<HashMap<&'static str, (f64, f64)>> = OnceLock::new();
    TABLE.get_or_init(|| {
        HashMap::from([
            ("AK-47 | Redline", (0.10, 0.70)),
            ("AK-47 | Asiimov", (0.18, 1.00)),
            ("AWP | Asiimov", (0.18, 1.00)),
            ("M4A4 | Howl", (0.00, 0.80)),
            ("M4A1-S | Hyper Beast", (0.00, 1.00)),
            ("Desert Eagle | Blaze", (0.00, 0.50)),
            ("Glock-18 | Fade", (0.00, 0.08)),
            ("USP-S | Kill Confirmed", (0.00, 0.50)),
            ("Karambit | Doppler", (0.00, 0.08)),
            ("AK-47 | Vulcan", (0.00, 0.70)),
        ])
    })
}

#[derive(Deserialize)]
struct RemoteEntry {
    #[serde(rename = "baseName")]
    base_name: String,
    #[serde(rename = "minFloat")]
    min_float: f64,
    #[serde(rename = "maxFloat")]
    max_float: f64,
}

/// Reference table over known float ranges by base name. Cheap to clone
/// (an `Arc`-backed handle would be equally valid; this service keeps a
/// single process-wide instance behind a lazily initialised static).
pub struct FloatCatalog {
    remote: RwLock<HashMap<String, FloatRange>>,
    remote_attempted: AtomicBool,
    remote_unavailable: AtomicBool,
    source_url: Option<String>,
}

impl FloatCatalog {
    pub fn new(source_url: Option<String>) -> Self {
        Self {
            remote: RwLock::new(HashMap::new()),
            remote_attempted: AtomicBool::new(false),
            remote_unavailable: AtomicBool::new(false),
            source_url,
        }
    }

    /// Fetch and memoise the remote supplement. Safe to call concurrently
    /// from first callers; only the first attempt performs I/O, and a
    /// failed attempt sets a sticky unavailable flag rather than retrying.
    pub async fn ensure_remote(&self, client: &reqwest::Client) {
        if self.remote_attempted.swap(true, Ordering::SeqCst) {
            return;
        }

        let Some(url) = &self.source_url else {
            self.remote_unavailable.store(true, Ordering::SeqCst);
            return;
        };

        let fetch = async {
            let resp = client.get(url).send().await?;
            resp.json::<Vec<RemoteEntry>>().await
        };

        match fetch.await {
            Ok(entries) => {
                let mut table = self.remote.write();
                for entry in entries {
                    let incoming = match FloatRange::new(entry.min_float, entry.max_float) {
                        Some(r) => r,
                        None => continue,
                    };
                    table
                        .entry(entry.base_name)
                        .and_modify(|existing| *existing = existing.merge(&incoming))
                        .or_insert(incoming);
                }
            }
            Err(e) => {
                warn!(error = %e, "remote float catalog unavailable, sticking to local table");
                self.remote_unavailable.store(true, Ordering::SeqCst);
            }
        }
    }

    /// `baseName -> range | null`. Prefers the compile-time table, falls
    /// back to the memoised remote supplement.
    pub fn lookup(&self, base_name: &str) -> Option<FloatRange> {
        if let Some((min, max)) = known_ranges().get(base_name) {
            return FloatRange::new(*min, *max);
        }
        self.remote.read().get(base_name).copied()
    }

    pub fn remote_is_unavailable(&self) -> bool {
        self.remote_unavailable.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_base_name_resolves_without_remote() {
        let catalog = FloatCatalog::new(None);
        let range = catalog.lookup("AK-47 | Redline").unwrap();
        assert_eq!(range.min_float, 0.10);
        assert_eq!(range.max_float, 0.70);
    }

    #[test]
    fn unknown_base_name_without_remote_returns_none() {
        let catalog = FloatCatalog::new(None);
        assert!(catalog.lookup("Nonexistent Skin").is_none());
    }

    #[tokio::test]
    async fn remote_fetch_without_source_url_marks_unavailable() {
        let catalog = FloatCatalog::new(None);
        let client = reqwest::Client::new();
        catalog.ensure_remote(&client).await;
        assert!(catalog.remote_is_unavailable());
        // Second call is a no-op; still sticky.
        catalog.ensure_remote(&client).await;
        assert!(catalog.remote_is_unavailable());
    }
}
