use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use uuid::Uuid;

/// Largest file a write handle will buffer
pub const MAX_WRITE_SIZE: usize = 1 << 30;

/// Handles one channel may hold open at once
pub const MAX_OPEN_HANDLES: usize = 64;

/// Types of file handles
#[derive(Debug, Clone)]
pub enum HandleType {
    /// Directory handle for listing
    Dir { path: String, read_done: bool },
    /// Read handle with the whole file content
    Read { path: String, content: Bytes },
    /// Write handle with accumulating buffer, stored on close
    Write { path: String, buffer: Vec<u8> },
}

/// Open handles of one SFTP channel
pub struct HandleManager {
    handles: RwLock<HashMap<String, HandleType>>,
}

impl HandleManager {
    pub fn new() -> Self {
        Self {
            handles: RwLock::new(HashMap::new()),
        }
    }

    /// Returns `None` once [`MAX_OPEN_HANDLES`] are open
    fn insert(&self, data: HandleType) -> Option<String> {
        let mut handles = self.handles.write();
        if handles.len() >= MAX_OPEN_HANDLES {
            return None;
        }
        let handle = Uuid::new_v4().to_string();
        handles.insert(handle.clone(), data);
        Some(handle)
    }

    pub fn create_dir_handle(&self, path: String) -> Option<String> {
        self.insert(HandleType::Dir {
            path,
            read_done: false,
        })
    }

    pub fn create_read_handle(&self, path: String, content: Bytes) -> Option<String> {
        self.insert(HandleType::Read { path, content })
    }

    /// `initial` is the current content when the file is opened without truncation
    pub fn create_write_handle(&self, path: String, initial: Vec<u8>) -> Option<String> {
        self.insert(HandleType::Write {
            path,
            buffer: initial,
        })
    }

    pub fn get(&self, handle: &str) -> Option<HandleType> {
        self.handles.read().get(handle).cloned()
    }

    /// Mark a directory handle as fully listed
    pub fn finish_dir(&self, handle: &str) {
        if let Some(HandleType::Dir { read_done, .. }) = self.handles.write().get_mut(handle) {
            *read_done = true;
        }
    }

    /// Write `data` at `offset` into a write handle's buffer, zero-filling
    /// any gap. Returns false if `handle` is not an open write handle or the
    /// write would grow the buffer past [`MAX_WRITE_SIZE`].
    pub fn write_at(&self, handle: &str, offset: u64, data: &[u8]) -> bool {
        let mut handles = self.handles.write();
        let Some(HandleType::Write { buffer, .. }) = handles.get_mut(handle) else {
            return false;
        };

        let start = offset as usize;
        let Some(end) = start
            .checked_add(data.len())
            .filter(|end| *end <= MAX_WRITE_SIZE)
        else {
            return false;
        };
        if end > buffer.len() {
            buffer.resize(end, 0);
        }
        buffer[start..end].copy_from_slice(data);
        true
    }

    pub fn remove(&self, handle: &str) -> Option<HandleType> {
        self.handles.write().remove(handle)
    }

    /// Drop every handle, returning how many unflushed write handles were discarded
    pub fn release_all(&self) -> usize {
        self.handles
            .write()
            .drain()
            .filter(|(_, h)| matches!(h, HandleType::Write { .. }))
            .count()
    }

    pub fn len(&self) -> usize {
        self.handles.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for HandleManager {
    fn default() -> Self {
        Self::new()
    }
}
