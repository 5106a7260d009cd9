use std::{
    collections::HashMap,
    fs,
    io::Write,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tempfile::NamedTempFile;
use tokio::{sync::Mutex, task};
use tracing::{debug, info, warn};

use crate::{error::StorageError, hub::ModelCard};

/// Durable catalog of model cards.
///
/// Reads take a snapshot of the committed catalog and never wait on disk I/O.
/// Upserts are serialized through `write_gate`; each one stages the next
/// catalog in a temporary file and only swaps the in-memory snapshot after the
/// file has been promoted over the canonical store.
pub struct HubRegistry {
    store_path: PathBuf,
    persist_timeout: Duration,
    catalog: RwLock<Arc<Catalog>>,
    write_gate: Mutex<()>,
}

#[derive(Debug, Default, Clone)]
struct Catalog {
    cards: Vec<ModelCard>,
    positions: HashMap<String, usize>,
}

impl Catalog {
    fn from_cards(cards: Vec<ModelCard>) -> Result<Self, StorageError> {
        let mut positions = HashMap::with_capacity(cards.len());
        for (idx, card) in cards.iter().enumerate() {
            if positions.insert(card.id.clone(), idx).is_some() {
                return Err(StorageError::DuplicateId(card.id.clone()));
            }
        }
        Ok(Self { cards, positions })
    }

    /// Replacing keeps the card at its original position.
    fn with_upsert(&self, card: ModelCard) -> Self {
        let mut next = self.clone();
        match next.positions.get(&card.id) {
            Some(&idx) => next.cards[idx] = card,
            None => {
                next.positions.insert(card.id.clone(), next.cards.len());
                next.cards.push(card);
            }
        }
        next
    }

    fn get(&self, id: &str) -> Option<&ModelCard> {
        self.positions.get(id).map(|&idx| &self.cards[idx])
    }
}

impl HubRegistry {
    /// Loads the catalog stored at `store_path`. A missing or empty store yields an empty catalog.
    pub fn load(
        store_path: impl Into<PathBuf>,
        persist_timeout: Duration,
    ) -> Result<Self, StorageError> {
        let store_path = store_path.into();
        let mut cards = read_store(&store_path)?;

        // Older stores may lack timestamps; the store's mtime keeps them stable across restarts.
        let stamped_at = fs::metadata(&store_path)
            .and_then(|meta| meta.modified())
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        let mut stamped = 0;
        for card in &mut cards {
            if card.fill_created_at(stamped_at) {
                stamped += 1;
            }
        }
        if stamped > 0 {
            debug!(stamped, "filled missing createdAt from the store's modification time");
        }

        let catalog = Catalog::from_cards(cards)?;
        info!(
            path = %store_path.display(),
            count = catalog.cards.len(),
            "hub registry loaded"
        );

        Ok(Self {
            store_path,
            persist_timeout,
            catalog: RwLock::new(Arc::new(catalog)),
            write_gate: Mutex::new(()),
        })
    }

    pub fn store_path(&self) -> &Path {
        &self.store_path
    }

    /// All cards in insertion order.
    pub fn list(&self) -> Vec<ModelCard> {
        self.snapshot().cards.clone()
    }

    pub fn get(&self, id: &str) -> Option<ModelCard> {
        self.snapshot().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.snapshot().cards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Inserts `card` or replaces the card with the same id, returning the stored card.
    ///
    /// The card is visible to readers only once it has reached the store. On
    /// failure the previously committed catalog stays in place, both in memory
    /// and on disk.
    pub async fn upsert(&self, mut card: ModelCard) -> Result<ModelCard, StorageError> {
        let _gate = self.write_gate.lock().await;

        card.fill_defaults(Utc::now());
        let next = Arc::new(self.snapshot().with_upsert(card.clone()));

        let payload = serde_json::to_vec_pretty(&next.cards).map_err(StorageError::Encode)?;
        let staged = self.stage(payload).await?;
        self.promote(staged).await?;
        *self.catalog.write() = next;

        debug!(id = %card.id, "hub registry updated");
        Ok(card)
    }

    fn snapshot(&self) -> Arc<Catalog> {
        self.catalog.read().clone()
    }

    fn store_dir(&self) -> PathBuf {
        self.store_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Writes the payload to a synced temporary file next to the store.
    async fn stage(&self, payload: Vec<u8>) -> Result<NamedTempFile, StorageError> {
        let dir = self.store_dir();
        let job = task::spawn_blocking(move || -> Result<NamedTempFile, std::io::Error> {
            fs::create_dir_all(&dir)?;
            let mut staged = NamedTempFile::new_in(&dir)?;
            staged.write_all(&payload)?;
            staged.as_file().sync_all()?;
            Ok(staged)
        });

        // A staged file that misses the deadline is dropped, and deleted, by the blocking task.
        match tokio::time::timeout(self.persist_timeout, job).await {
            Err(_) => Err(StorageError::Timeout(self.persist_timeout)),
            Ok(Err(join_err)) => Err(StorageError::Task(join_err.to_string())),
            Ok(Ok(result)) => Ok(result?),
        }
    }

    /// Renames the staged file over the store. Runs off the async workers so
    /// readers never wait on the filesystem.
    async fn promote(&self, staged: NamedTempFile) -> Result<(), StorageError> {
        let store_path = self.store_path.clone();
        let dir = self.store_dir();

        task::spawn_blocking(move || -> Result<(), std::io::Error> {
            staged.persist(&store_path).map_err(|err| err.error)?;
            // The rename already happened; a failed directory sync only weakens crash durability.
            if let Err(err) = sync_dir(&dir) {
                warn!(error = %err, dir = %dir.display(), "failed to sync registry directory");
            }
            Ok(())
        })
        .await
        .map_err(|err| StorageError::Task(err.to_string()))??;
        Ok(())
    }
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> std::io::Result<()> {
    fs::File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}

fn read_store(path: &Path) -> Result<Vec<ModelCard>, StorageError> {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(StorageError::Read {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    if raw.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }
    serde_json::from_slice(&raw).map_err(|source| StorageError::Malformed {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn registry_in(dir: &TempDir) -> HubRegistry {
        HubRegistry::load(dir.path().join("registry.json"), TIMEOUT).unwrap()
    }

    #[test]
    fn missing_store_loads_empty() {
        let dir = TempDir::new().unwrap();
        let registry = registry_in(&dir);
        assert!(registry.is_empty());
        assert!(!registry.store_path().exists());
    }

    #[test]
    fn malformed_store_fails_to_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("registry.json");
        fs::write(&path, "{not json").unwrap();
        let err = HubRegistry::load(&path, TIMEOUT).err().unwrap();
        assert!(matches!(err, StorageError::Malformed { .. }));
    }

    #[test]
    fn duplicate_ids_fail_to_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("registry.json");
        fs::write(
            &path,
            r#"[{"id":"a","name":"one","files":[]},{"id":"a","name":"two","files":[]}]"#,
        )
        .unwrap();
        let err = HubRegistry::load(&path, TIMEOUT).err().unwrap();
        assert!(matches!(err, StorageError::DuplicateId(id) if id == "a"));
    }

    #[test]
    fn empty_store_file_loads_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("registry.json");
        fs::write(&path, "").unwrap();
        assert!(HubRegistry::load(&path, TIMEOUT).unwrap().is_empty());
    }

    #[tokio::test]
    async fn rewrites_keep_fields_from_older_stores() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("registry.json");
        fs::write(
            &path,
            r##"[{
                "id": "legacy",
                "name": "phi",
                "task": "text-generation",
                "targets": ["cpu"],
                "created_at": "2024-05-01T10:00:00Z",
                "downloads": 42,
                "readme_markdown": "# hi",
                "license_url": "https://example.com/license",
                "files": [{"filename": "m.gguf", "path": "/m.gguf", "format": "gguf"}]
            }]"##,
        )
        .unwrap();

        let registry = HubRegistry::load(&path, TIMEOUT).unwrap();
        registry.upsert(ModelCard::new("other", "gguf")).await.unwrap();

        let stored: serde_json::Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        let legacy = &stored[0];
        assert_eq!(legacy["id"], "legacy");
        assert_eq!(legacy["targets"], serde_json::json!(["cpu"]));
        assert_eq!(legacy["downloads"], 42);
        assert_eq!(legacy["readmeMarkdown"], "# hi");
        assert_eq!(legacy["license_url"], "https://example.com/license");
        assert_eq!(legacy["files"][0]["format"], "gguf");
        assert_eq!(stored[1]["name"], "other");
    }

    #[test]
    fn missing_timestamps_are_filled_at_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("registry.json");
        fs::write(
            &path,
            r#"[{"id":"old","name":"phi","created_at":null,"files":[]}]"#,
        )
        .unwrap();
        let modified = DateTime::<Utc>::from(fs::metadata(&path).unwrap().modified().unwrap());

        let first = HubRegistry::load(&path, TIMEOUT).unwrap().get("old").unwrap();
        let second = HubRegistry::load(&path, TIMEOUT).unwrap().get("old").unwrap();
        assert_eq!(first.created_at, Some(modified));
        assert_eq!(second.created_at, first.created_at);
    }

    #[tokio::test]
    async fn upsert_assigns_id_and_timestamp() {
        let dir = TempDir::new().unwrap();
        let registry = registry_in(&dir);
        let before = Utc::now();

        let stored = registry
            .upsert(ModelCard::new("Llama 3B", "gguf").with_file("m.gguf", "/data/m.gguf"))
            .await
            .unwrap();

        assert!(!stored.id.is_empty());
        let created = stored.created_at.unwrap();
        assert!(created >= before && created <= Utc::now());
        assert_eq!(registry.get(&stored.id), Some(stored));
    }

    #[tokio::test]
    async fn replace_keeps_original_position() {
        let dir = TempDir::new().unwrap();
        let registry = registry_in(&dir);
        let first = registry.upsert(ModelCard::new("first", "gguf")).await.unwrap();
        registry.upsert(ModelCard::new("second", "gguf")).await.unwrap();

        let mut replacement = first.clone();
        replacement.name = "first v2".into();
        registry.upsert(replacement).await.unwrap();

        let cards = registry.list();
        assert_eq!(cards.len(), 2);
        assert_eq!(cards[0].id, first.id);
        assert_eq!(cards[0].name, "first v2");
        assert_eq!(cards[1].name, "second");
    }

    #[tokio::test]
    async fn reload_yields_same_cards() {
        let dir = TempDir::new().unwrap();
        let registry = registry_in(&dir);
        for idx in 0..5 {
            registry
                .upsert(ModelCard::new(format!("model-{idx}"), "gguf"))
                .await
                .unwrap();
        }

        let reloaded = registry_in(&dir);
        assert_eq!(reloaded.list(), registry.list());
    }

    #[tokio::test]
    async fn failed_persist_leaves_catalog_untouched() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("registry.json");
        let registry = HubRegistry::load(&path, TIMEOUT).unwrap();
        registry.upsert(ModelCard::new("kept", "gguf")).await.unwrap();

        // A directory at the store path makes the final rename fail.
        fs::remove_file(&path).unwrap();
        fs::create_dir(&path).unwrap();

        let result = registry.upsert(ModelCard::new("lost", "gguf")).await;
        assert!(result.is_err());
        let names: Vec<_> = registry.list().into_iter().map(|c| c.name).collect();
        assert_eq!(names, vec!["kept"]);
    }

    #[tokio::test]
    async fn failed_staging_leaves_catalog_untouched() {
        let dir = TempDir::new().unwrap();
        let store_dir = dir.path().join("hub");
        let registry = HubRegistry::load(store_dir.join("registry.json"), TIMEOUT).unwrap();
        fs::write(&store_dir, "file, not a directory").unwrap();

        let result = registry.upsert(ModelCard::new("lost", "gguf")).await;
        assert!(matches!(result, Err(StorageError::Write(_))));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn missed_persist_deadline_rolls_back() {
        let dir = TempDir::new().unwrap();
        let store_dir = dir.path().join("hub");
        let registry = HubRegistry::load(store_dir.join("registry.json"), Duration::ZERO).unwrap();

        let result = registry.upsert(ModelCard::new("late", "gguf")).await;
        assert!(matches!(result, Err(StorageError::Timeout(_))));
        assert!(registry.is_empty());
        assert!(!registry.store_path().exists());

        // The abandoned staging task finishes on its own and removes its temp file.
        let mut leftovers = usize::MAX;
        for _ in 0..200 {
            leftovers = fs::read_dir(&store_dir).map(|d| d.count()).unwrap_or(0);
            if leftovers == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(leftovers, 0);
        assert!(!registry.store_path().exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_upserts_are_serialized() {
        let dir = TempDir::new().unwrap();
        let registry = Arc::new(registry_in(&dir));

        let mut handles = Vec::new();
        for idx in 0..16 {
            let writer = registry.clone();
            handles.push(tokio::spawn(async move {
                let mut card = ModelCard::new(format!("model-{idx}"), format!("fmt-{idx}"));
                card.id = format!("id-{idx}");
                writer.upsert(card).await.unwrap();
            }));
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                for card in registry.list() {
                    let suffix = card.id.trim_start_matches("id-");
                    assert_eq!(card.name, format!("model-{suffix}"));
                    assert_eq!(card.format, format!("fmt-{suffix}"));
                    assert!(card.created_at.is_some());
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(registry.len(), 16);
        assert_eq!(registry_in(&dir).len(), 16);
    }
}
