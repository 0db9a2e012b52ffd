//! In-memory groupware server
//!
//! A complete implementation of the remote contract kept entirely in
//! process memory. Every mutation bumps a server-wide sequence number;
//! a folder cursor is the highest sequence the folder has seen, so an
//! incremental sync replays exactly the changes made after it.
//!
//! The server also supports failure injection: items whose serialization
//! fails and folders whose change feed is unavailable.

use crate::error::{RemoteError, RemoteResult};
use crate::remote::{
    Cursor, Importer, ItemRef, RemoteFolder, RemoteItem, RemoteStore, StoreProvider, TimeWindow,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Serialized form of an item
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ItemPayload {
    subject: Option<String>,
    body: Vec<u8>,
    last_modified: DateTime<Utc>,
    read: bool,
    backup_origin: Option<String>,
}

#[derive(Debug, Clone)]
struct ItemData {
    sourcekey: String,
    subject: Option<String>,
    body: Vec<u8>,
    last_modified: DateTime<Utc>,
    read: bool,
    backup_origin: Option<String>,
    change_seq: u64,
    read_seq: u64,
    broken: bool,
}

#[derive(Debug, Default)]
struct FolderData {
    path: String,
    backup_origin: Option<String>,
    properties: Vec<u8>,
    permissions: Vec<u8>,
    rules: Option<Vec<u8>>,
    items: BTreeMap<String, ItemData>,
    /// sourcekey -> sequence of the deletion
    deleted: BTreeMap<String, u64>,
    last_seq: u64,
    feed_down: bool,
}

#[derive(Debug, Default)]
struct StoreData {
    folders: BTreeMap<String, FolderData>,
    settings: Vec<u8>,
    user: Vec<u8>,
    delegates: Vec<u8>,
    permissions: Vec<u8>,
}

impl StoreData {
    fn key_for_path(&self, path: &str) -> Option<String> {
        self.folders
            .iter()
            .find(|(_, f)| f.path == path)
            .map(|(key, _)| key.clone())
    }

    fn folder_by_path_mut(&mut self, path: &str) -> RemoteResult<&mut FolderData> {
        self.folders
            .values_mut()
            .find(|f| f.path == path)
            .ok_or_else(|| RemoteError::NotFound(format!("folder '{}'", path)))
    }
}

#[derive(Debug, Default)]
struct ServerState {
    seq: u64,
    next_key: u64,
    stores: BTreeMap<String, StoreData>,
}

impl ServerState {
    fn bump(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn new_key(&mut self) -> String {
        self.next_key += 1;
        format!("{:016X}", self.next_key)
    }

    fn store(&self, name: &str) -> RemoteResult<&StoreData> {
        self.stores
            .get(name)
            .ok_or_else(|| RemoteError::NotFound(format!("store '{}'", name)))
    }

    fn store_mut(&mut self, name: &str) -> RemoteResult<&mut StoreData> {
        self.stores
            .get_mut(name)
            .ok_or_else(|| RemoteError::NotFound(format!("store '{}'", name)))
    }

    fn folder_mut(&mut self, store: &str, key: &str) -> RemoteResult<&mut FolderData> {
        self.store_mut(store)?
            .folders
            .get_mut(key)
            .ok_or_else(|| RemoteError::NotFound(format!("folder {}", key)))
    }

    /// Create `path` and any missing parents, returning the folder key
    fn ensure_folder(&mut self, store: &str, path: &str) -> RemoteResult<String> {
        let path = normalize_path(path);
        if path.is_empty() {
            return Err(RemoteError::NotFound("empty folder path".into()));
        }

        let mut prefix = String::new();
        let mut key = String::new();
        for part in path.split('/') {
            if !prefix.is_empty() {
                prefix.push('/');
            }
            prefix.push_str(part);

            match self.store(store)?.key_for_path(&prefix) {
                Some(existing) => key = existing,
                None => {
                    let new_key = self.new_key();
                    let seq = self.bump();
                    let folder = FolderData {
                        path: prefix.clone(),
                        last_seq: seq,
                        ..Default::default()
                    };
                    self.store_mut(store)?.folders.insert(new_key.clone(), folder);
                    key = new_key;
                }
            }
        }
        Ok(key)
    }
}

fn normalize_path(path: &str) -> String {
    path.split('/')
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

fn encode_cursor(seq: u64) -> Cursor {
    Cursor::decode(&format!("{:016x}", seq))
}

fn decode_cursor(cursor: &Cursor) -> RemoteResult<u64> {
    u64::from_str_radix(cursor.encode(), 16).map_err(|_| RemoteError::Transport {
        context: "sync".into(),
        reason: format!("unrecognized cursor '{}'", cursor),
    })
}

/// Shared in-memory server holding any number of stores
#[derive(Clone, Default)]
pub struct MemoryServer {
    state: Arc<Mutex<ServerState>>,
}

impl MemoryServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty store (or return the existing one)
    pub fn add_store(&self, name: &str) -> MemoryStore {
        self.state.lock().stores.entry(name.to_string()).or_default();
        MemoryStore {
            state: Arc::clone(&self.state),
            name: name.to_string(),
        }
    }

    pub fn store(&self, name: &str) -> Option<MemoryStore> {
        if self.state.lock().stores.contains_key(name) {
            Some(MemoryStore {
                state: Arc::clone(&self.state),
                name: name.to_string(),
            })
        } else {
            None
        }
    }
}

impl StoreProvider for MemoryServer {
    type Store = MemoryStore;

    fn open(&self, store_ref: &str) -> RemoteResult<MemoryStore> {
        self.store(store_ref)
            .ok_or_else(|| RemoteError::NotFound(format!("store '{}'", store_ref)))
    }

    fn store_size(&self, store_ref: &str) -> u64 {
        let state = self.state.lock();
        state
            .stores
            .get(store_ref)
            .map(|s| {
                s.folders
                    .values()
                    .flat_map(|f| f.items.values())
                    .map(|i| i.body.len() as u64)
                    .sum()
            })
            .unwrap_or(0)
    }
}

/// Handle to one store on a [`MemoryServer`]
#[derive(Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<ServerState>>,
    name: String,
}

impl MemoryStore {
    fn handle(&self, key: String, path: String) -> MemoryFolder {
        MemoryFolder {
            state: Arc::clone(&self.state),
            store: self.name.clone(),
            sourcekey: key,
            path,
        }
    }

    /// Add a new item, creating the folder if needed; returns its sourcekey
    pub fn add_item(
        &self,
        path: &str,
        subject: &str,
        body: &[u8],
        modified: DateTime<Utc>,
    ) -> RemoteResult<String> {
        let mut state = self.state.lock();
        let folder_key = state.ensure_folder(&self.name, path)?;
        let sourcekey = state.new_key();
        let seq = state.bump();
        let folder = state.folder_mut(&self.name, &folder_key)?;
        folder.items.insert(
            sourcekey.clone(),
            ItemData {
                sourcekey: sourcekey.clone(),
                subject: Some(subject.to_string()),
                body: body.to_vec(),
                last_modified: modified,
                read: false,
                backup_origin: None,
                change_seq: seq,
                read_seq: 0,
                broken: false,
            },
        );
        folder.last_seq = seq;
        Ok(sourcekey)
    }

    /// Change an item's subject and modification time
    pub fn update_item(
        &self,
        path: &str,
        sourcekey: &str,
        subject: &str,
        modified: DateTime<Utc>,
    ) -> RemoteResult<()> {
        let mut state = self.state.lock();
        let seq = state.bump();
        let folder = state.store_mut(&self.name)?.folder_by_path_mut(path)?;
        let item = folder
            .items
            .get_mut(sourcekey)
            .ok_or_else(|| RemoteError::NotFound(format!("item {}", sourcekey)))?;
        item.subject = Some(subject.to_string());
        item.last_modified = modified;
        item.change_seq = seq;
        folder.last_seq = seq;
        Ok(())
    }

    pub fn set_read(&self, path: &str, sourcekey: &str, read: bool) -> RemoteResult<()> {
        let mut state = self.state.lock();
        let seq = state.bump();
        let folder = state.store_mut(&self.name)?.folder_by_path_mut(path)?;
        let item = folder
            .items
            .get_mut(sourcekey)
            .ok_or_else(|| RemoteError::NotFound(format!("item {}", sourcekey)))?;
        item.read = read;
        item.read_seq = seq;
        folder.last_seq = seq;
        Ok(())
    }

    pub fn remove_item(&self, path: &str, sourcekey: &str) -> RemoteResult<()> {
        let mut state = self.state.lock();
        let seq = state.bump();
        let folder = state.store_mut(&self.name)?.folder_by_path_mut(path)?;
        folder
            .items
            .remove(sourcekey)
            .ok_or_else(|| RemoteError::NotFound(format!("item {}", sourcekey)))?;
        folder.deleted.insert(sourcekey.to_string(), seq);
        folder.last_seq = seq;
        Ok(())
    }

    /// Remove a folder and its whole subtree
    pub fn remove_folder(&self, path: &str) -> RemoteResult<()> {
        let path = normalize_path(path);
        let child_prefix = format!("{}/", path);
        let mut state = self.state.lock();
        let store = state.store_mut(&self.name)?;
        let before = store.folders.len();
        store
            .folders
            .retain(|_, f| f.path != path && !f.path.starts_with(&child_prefix));
        if store.folders.len() == before {
            return Err(RemoteError::NotFound(format!("folder '{}'", path)));
        }
        Ok(())
    }

    /// Sourcekey of the folder at `path`
    pub fn folder_sourcekey(&self, path: &str) -> Option<String> {
        let state = self.state.lock();
        state.stores.get(&self.name)?.key_for_path(&normalize_path(path))
    }

    pub fn item_count(&self, path: &str) -> usize {
        let state = self.state.lock();
        state
            .stores
            .get(&self.name)
            .and_then(|s| s.folders.values().find(|f| f.path == normalize_path(path)))
            .map(|f| f.items.len())
            .unwrap_or(0)
    }

    /// Subjects of every item in a folder, sorted
    pub fn subjects(&self, path: &str) -> Vec<String> {
        let state = self.state.lock();
        let mut subjects: Vec<String> = state
            .stores
            .get(&self.name)
            .and_then(|s| s.folders.values().find(|f| f.path == normalize_path(path)))
            .map(|f| f.items.values().filter_map(|i| i.subject.clone()).collect())
            .unwrap_or_default();
        subjects.sort();
        subjects
    }

    /// Logical paths of every folder, sorted
    pub fn folder_paths(&self) -> Vec<String> {
        let state = self.state.lock();
        let mut paths: Vec<String> = state
            .stores
            .get(&self.name)
            .map(|s| s.folders.values().map(|f| f.path.clone()).collect())
            .unwrap_or_default();
        paths.sort();
        paths
    }

    /// Make an item fail to serialize
    pub fn break_item(&self, path: &str, sourcekey: &str) -> RemoteResult<()> {
        let mut state = self.state.lock();
        let folder = state.store_mut(&self.name)?.folder_by_path_mut(path)?;
        let item = folder
            .items
            .get_mut(sourcekey)
            .ok_or_else(|| RemoteError::NotFound(format!("item {}", sourcekey)))?;
        item.broken = true;
        Ok(())
    }

    /// Make a folder's change feed unavailable (or available again)
    pub fn set_feed_down(&self, path: &str, down: bool) -> RemoteResult<()> {
        let mut state = self.state.lock();
        state.store_mut(&self.name)?.folder_by_path_mut(path)?.feed_down = down;
        Ok(())
    }

    pub fn set_folder_permissions(&self, path: &str, data: &[u8]) -> RemoteResult<()> {
        let mut state = self.state.lock();
        state.store_mut(&self.name)?.folder_by_path_mut(path)?.permissions = data.to_vec();
        Ok(())
    }

    pub fn set_folder_rules(&self, path: &str, data: Option<&[u8]>) -> RemoteResult<()> {
        let mut state = self.state.lock();
        state.store_mut(&self.name)?.folder_by_path_mut(path)?.rules = data.map(<[u8]>::to_vec);
        Ok(())
    }

    pub fn folder_permissions(&self, path: &str) -> Option<Vec<u8>> {
        let state = self.state.lock();
        let store = state.stores.get(&self.name)?;
        let key = store.key_for_path(&normalize_path(path))?;
        Some(store.folders.get(&key)?.permissions.clone())
    }

    pub fn folder_rules(&self, path: &str) -> Option<Vec<u8>> {
        let state = self.state.lock();
        let store = state.stores.get(&self.name)?;
        let key = store.key_for_path(&normalize_path(path))?;
        store.folders.get(&key)?.rules.clone()
    }

    /// Set the store-level blobs: settings, user, delegates, permissions
    pub fn set_store_blobs(
        &self,
        settings: &[u8],
        user: &[u8],
        delegates: &[u8],
        permissions: &[u8],
    ) -> RemoteResult<()> {
        let mut state = self.state.lock();
        let store = state.store_mut(&self.name)?;
        store.settings = settings.to_vec();
        store.user = user.to_vec();
        store.delegates = delegates.to_vec();
        store.permissions = permissions.to_vec();
        Ok(())
    }

    /// Store-level blobs: settings, delegates, permissions
    pub fn store_blobs(&self) -> (Vec<u8>, Vec<u8>, Vec<u8>) {
        let state = self.state.lock();
        state
            .stores
            .get(&self.name)
            .map(|s| (s.settings.clone(), s.delegates.clone(), s.permissions.clone()))
            .unwrap_or_default()
    }
}

impl RemoteStore for MemoryStore {
    type Folder = MemoryFolder;

    fn name(&self) -> &str {
        &self.name
    }

    fn folders(&self, recursive: bool) -> RemoteResult<Vec<MemoryFolder>> {
        let state = self.state.lock();
        let store = state.store(&self.name)?;
        let mut folders: Vec<MemoryFolder> = store
            .folders
            .iter()
            .filter(|(_, f)| recursive || !f.path.contains('/'))
            .map(|(key, f)| self.handle(key.clone(), f.path.clone()))
            .collect();
        folders.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(folders)
    }

    fn folder(&self, path: &str) -> RemoteResult<Option<MemoryFolder>> {
        let path = normalize_path(path);
        let state = self.state.lock();
        Ok(state
            .store(&self.name)?
            .key_for_path(&path)
            .map(|key| self.handle(key, path)))
    }

    fn create_folder(&self, path: &str) -> RemoteResult<MemoryFolder> {
        let path = normalize_path(path);
        let key = self.state.lock().ensure_folder(&self.name, &path)?;
        Ok(self.handle(key, path))
    }

    fn move_folder(&self, folder: &MemoryFolder, path: &str) -> RemoteResult<MemoryFolder> {
        let new_path = normalize_path(path);
        let mut state = self.state.lock();
        let old_path = state.folder_mut(&self.name, &folder.sourcekey)?.path.clone();

        if let Some(pos) = new_path.rfind('/') {
            state.ensure_folder(&self.name, &new_path[..pos])?;
        }

        let child_prefix = format!("{}/", old_path);
        let store = state.store_mut(&self.name)?;
        for f in store.folders.values_mut() {
            if f.path == old_path {
                f.path = new_path.clone();
            } else if let Some(rest) = f.path.strip_prefix(&child_prefix) {
                f.path = format!("{}/{}", new_path, rest);
            }
        }
        Ok(self.handle(folder.sourcekey.clone(), new_path))
    }

    fn settings_dump(&self) -> RemoteResult<Vec<u8>> {
        Ok(self.state.lock().store(&self.name)?.settings.clone())
    }

    fn user_dump(&self) -> RemoteResult<Vec<u8>> {
        Ok(self.state.lock().store(&self.name)?.user.clone())
    }

    fn delegates_dump(&self) -> RemoteResult<Vec<u8>> {
        Ok(self.state.lock().store(&self.name)?.delegates.clone())
    }

    fn permissions_dump(&self) -> RemoteResult<Vec<u8>> {
        Ok(self.state.lock().store(&self.name)?.permissions.clone())
    }

    fn load_settings(&self, data: &[u8]) -> RemoteResult<()> {
        self.state.lock().store_mut(&self.name)?.settings = data.to_vec();
        Ok(())
    }

    fn load_delegates(&self, data: &[u8]) -> RemoteResult<()> {
        self.state.lock().store_mut(&self.name)?.delegates = data.to_vec();
        Ok(())
    }

    fn load_permissions(&self, data: &[u8]) -> RemoteResult<()> {
        self.state.lock().store_mut(&self.name)?.permissions = data.to_vec();
        Ok(())
    }
}

/// Item snapshot handed to importers
struct ItemView(ItemData);

impl RemoteItem for ItemView {
    fn sourcekey(&self) -> &str {
        &self.0.sourcekey
    }

    fn subject(&self) -> Option<&str> {
        self.0.subject.as_deref()
    }

    fn last_modified(&self) -> Option<DateTime<Utc>> {
        Some(self.0.last_modified)
    }

    fn read_flag(&self) -> bool {
        self.0.read
    }

    fn backup_origin(&self) -> Option<&str> {
        self.0.backup_origin.as_deref()
    }

    fn serialize(&self, with_attachments: bool) -> RemoteResult<Vec<u8>> {
        if self.0.broken {
            return Err(RemoteError::Serialize {
                sourcekey: self.0.sourcekey.clone(),
                reason: "item cannot be converted".into(),
            });
        }
        let payload = ItemPayload {
            subject: self.0.subject.clone(),
            body: if with_attachments {
                self.0.body.clone()
            } else {
                Vec::new()
            },
            last_modified: self.0.last_modified,
            read: self.0.read,
            backup_origin: self.0.backup_origin.clone(),
        };
        bincode::serialize(&payload).map_err(|e| RemoteError::Serialize {
            sourcekey: self.0.sourcekey.clone(),
            reason: e.to_string(),
        })
    }
}

enum FeedEvent {
    Update(ItemData),
    Read(String, bool),
    Delete(String),
}

/// Handle to one folder of a [`MemoryStore`]
#[derive(Clone)]
pub struct MemoryFolder {
    state: Arc<Mutex<ServerState>>,
    store: String,
    sourcekey: String,
    path: String,
}

impl MemoryFolder {
    fn with_folder<T>(&self, f: impl FnOnce(&mut FolderData) -> RemoteResult<T>) -> RemoteResult<T> {
        let mut state = self.state.lock();
        let folder = state.folder_mut(&self.store, &self.sourcekey)?;
        f(folder)
    }
}

impl RemoteFolder for MemoryFolder {
    fn sourcekey(&self) -> &str {
        &self.sourcekey
    }

    fn path(&self) -> &str {
        &self.path
    }

    fn backup_origin(&self) -> RemoteResult<Option<String>> {
        self.with_folder(|f| Ok(f.backup_origin.clone()))
    }

    fn set_backup_origin(&self, sourcekey: &str) -> RemoteResult<()> {
        self.with_folder(|f| {
            f.backup_origin = Some(sourcekey.to_string());
            Ok(())
        })
    }

    fn sync(
        &self,
        importer: &mut dyn Importer,
        cursor: Option<&Cursor>,
        window: Option<&TimeWindow>,
    ) -> RemoteResult<Cursor> {
        let since = cursor.map(decode_cursor).transpose()?;

        // Collect under the lock, replay without it
        let (events, last_seq) = self.with_folder(|f| {
            if f.feed_down {
                return Err(RemoteError::Transport {
                    context: f.path.clone(),
                    reason: "change feed unavailable".into(),
                });
            }

            let from = since.unwrap_or(0);
            let mut events = Vec::new();
            for item in f.items.values() {
                if item.change_seq > from || since.is_none() {
                    if window.map_or(true, |w| w.contains(item.last_modified)) {
                        events.push(FeedEvent::Update(item.clone()));
                    }
                } else if item.read_seq > from {
                    events.push(FeedEvent::Read(item.sourcekey.clone(), item.read));
                }
            }
            if since.is_some() {
                for (key, seq) in &f.deleted {
                    if *seq > from {
                        events.push(FeedEvent::Delete(key.clone()));
                    }
                }
            }
            Ok((events, f.last_seq.max(from)))
        })?;

        for event in events {
            match event {
                FeedEvent::Update(item) => importer.update(&ItemView(item)),
                FeedEvent::Read(key, read) => importer.read(&key, read),
                FeedEvent::Delete(key) => importer.delete(&key),
            }
        }

        Ok(encode_cursor(last_seq))
    }

    fn properties_dump(&self) -> RemoteResult<Vec<u8>> {
        self.with_folder(|f| {
            if f.properties.is_empty() {
                Ok(format!("displayname={}", f.path.rsplit('/').next().unwrap_or("")).into_bytes())
            } else {
                Ok(f.properties.clone())
            }
        })
    }

    fn permissions_dump(&self) -> RemoteResult<Vec<u8>> {
        self.with_folder(|f| Ok(f.permissions.clone()))
    }

    fn rules_dump(&self) -> RemoteResult<Option<Vec<u8>>> {
        self.with_folder(|f| Ok(f.rules.clone()))
    }

    fn load_permissions(&self, data: &[u8]) -> RemoteResult<()> {
        self.with_folder(|f| {
            f.permissions = data.to_vec();
            Ok(())
        })
    }

    fn load_rules(&self, data: &[u8]) -> RemoteResult<()> {
        self.with_folder(|f| {
            f.rules = Some(data.to_vec());
            Ok(())
        })
    }

    fn items(&self) -> RemoteResult<Vec<ItemRef>> {
        self.with_folder(|f| {
            Ok(f.items
                .values()
                .map(|i| ItemRef {
                    id: i.sourcekey.clone(),
                    sourcekey: i.sourcekey.clone(),
                    backup_origin: i.backup_origin.clone(),
                })
                .collect())
        })
    }

    fn create_item(&self, blob: &[u8]) -> RemoteResult<ItemRef> {
        let payload: ItemPayload =
            bincode::deserialize(blob).map_err(|e| RemoteError::InvalidPayload(e.to_string()))?;

        let mut state = self.state.lock();
        let sourcekey = state.new_key();
        let seq = state.bump();
        let folder = state.folder_mut(&self.store, &self.sourcekey)?;
        folder.items.insert(
            sourcekey.clone(),
            ItemData {
                sourcekey: sourcekey.clone(),
                subject: payload.subject,
                body: payload.body,
                last_modified: payload.last_modified,
                read: payload.read,
                backup_origin: payload.backup_origin.clone(),
                change_seq: seq,
                read_seq: 0,
                broken: false,
            },
        );
        folder.last_seq = seq;

        Ok(ItemRef {
            id: sourcekey.clone(),
            sourcekey,
            backup_origin: payload.backup_origin,
        })
    }

    fn delete_item(&self, id: &str) -> RemoteResult<()> {
        let mut state = self.state.lock();
        let seq = state.bump();
        let folder = state.folder_mut(&self.store, &self.sourcekey)?;
        if folder.items.remove(id).is_none() {
            return Err(RemoteError::ItemFailed {
                folder: folder.path.clone(),
                reason: format!("no item {}", id),
            });
        }
        folder.deleted.insert(id.to_string(), seq);
        folder.last_seq = seq;
        Ok(())
    }

    fn set_item_backup_origin(&self, id: &str, sourcekey: &str) -> RemoteResult<()> {
        self.with_folder(|f| {
            let path = f.path.clone();
            let item = f.items.get_mut(id).ok_or_else(|| RemoteError::ItemFailed {
                folder: path,
                reason: format!("no item {}", id),
            })?;
            item.backup_origin = Some(sourcekey.to_string());
            Ok(())
        })
    }
}
