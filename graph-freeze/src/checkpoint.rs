//! Checkpoint storage using SQLite.
//!
//! A checkpoint maps variable names to tensor values. Each tensor is one row
//! holding its dtype tag, its shape as JSON and its raw element bytes.

use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{GraphError, Result};
use crate::session::Session;
use crate::tensor::{DataType, Tensor};

/// SQLite-backed variable snapshot.
pub struct CheckpointStore {
    conn: Connection,
}

impl CheckpointStore {
    /// Open a checkpoint, creating the file and schema if needed.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS tensors (
                name TEXT PRIMARY KEY,
                dtype INTEGER NOT NULL,
                shape TEXT NOT NULL,
                data BLOB NOT NULL,
                saved_at TEXT NOT NULL
            )",
            [],
        )?;

        Ok(Self { conn })
    }

    /// Open an existing checkpoint read-only. A missing file is an error.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(GraphError::CheckpointNotFound(path.to_path_buf()));
        }
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Ok(Self { conn })
    }

    /// Store tensors in one transaction, replacing existing keys.
    pub fn save_tensors(&self, tensors: &[(&str, &Tensor)]) -> Result<()> {
        self.write(tensors, false)
    }

    /// Replace the whole checkpoint with `tensors` in one transaction.
    pub fn write_snapshot(&self, tensors: &[(&str, &Tensor)]) -> Result<()> {
        self.write(tensors, true)
    }

    fn write(&self, tensors: &[(&str, &Tensor)], clear: bool) -> Result<()> {
        let timestamp = chrono::Utc::now().to_rfc3339();
        let tx = self.conn.unchecked_transaction()?;
        if clear {
            tx.execute("DELETE FROM tensors", [])?;
        }
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO tensors (name, dtype, shape, data, saved_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for (name, tensor) in tensors {
                let shape = serde_json::to_string(tensor.shape())?;
                stmt.execute(params![
                    name,
                    tensor.dtype().as_datatype_enum(),
                    shape,
                    tensor.to_bytes(),
                    timestamp
                ])?;
            }
        }
        tx.commit()?;
        debug!(count = tensors.len(), clear, "saved tensors to checkpoint");
        Ok(())
    }

    /// Load one tensor by name.
    pub fn load_tensor(&self, name: &str) -> Result<Tensor> {
        let row: Option<(u32, String, Vec<u8>)> = self
            .conn
            .query_row(
                "SELECT dtype, shape, data FROM tensors WHERE name = ?1",
                [name],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        let (dtype, shape, data) = row.ok_or_else(|| GraphError::KeyNotFound(name.to_string()))?;
        let dtype = DataType::from_datatype_enum(dtype)?;
        let shape: Vec<usize> = serde_json::from_str(&shape)?;
        Tensor::from_bytes(dtype, &shape, &data)
    }

    /// Names of every stored tensor, sorted.
    pub fn tensor_names(&self) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare("SELECT name FROM tensors ORDER BY name")?;
        let names = stmt.query_map([], |row| row.get(0))?;

        let mut out = Vec::new();
        for name in names {
            out.push(name?);
        }
        Ok(out)
    }

    /// Get checkpoint statistics for reporting.
    pub fn get_stats(&self) -> Result<CheckpointStats> {
        let tensor_count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM tensors", [], |row| row.get(0))?;

        let last_saved_at: Option<String> = self
            .conn
            .query_row("SELECT MAX(saved_at) FROM tensors", [], |row| row.get(0))?;

        let db_size = if let Some(path) = self.conn.path() {
            std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
        } else {
            0
        };

        Ok(CheckpointStats {
            tensor_count,
            last_saved_at,
            db_size_bytes: db_size,
        })
    }
}

/// Statistics about a checkpoint file.
#[derive(Debug)]
pub struct CheckpointStats {
    pub tensor_count: i64,
    pub last_saved_at: Option<String>,
    pub db_size_bytes: u64,
}

/// Names of the tensors and ops a saver subgraph exposes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaverDef {
    /// Tensor fed with the checkpoint path.
    pub filename_tensor_name: String,
    /// Tensor fetched to trigger a save.
    pub save_tensor_name: String,
    /// Op run to restore every variable.
    pub restore_op_name: String,
}

impl Default for SaverDef {
    fn default() -> Self {
        Self {
            filename_tensor_name: "save/Const:0".to_string(),
            save_tensor_name: "save/control_dependency:0".to_string(),
            restore_op_name: "save/restore_all".to_string(),
        }
    }
}

impl SaverDef {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(serde_json::from_str(&std::fs::read_to_string(path)?)?)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

/// Saves and restores a session's variables through the graph's saver ops.
pub struct Saver {
    def: SaverDef,
}

impl Saver {
    pub fn new(def: SaverDef) -> Self {
        Self { def }
    }

    pub fn saver_def(&self) -> &SaverDef {
        &self.def
    }

    /// Write every variable to the checkpoint at `path`.
    pub fn save<P: AsRef<Path>>(&self, session: &mut Session, path: P) -> Result<PathBuf> {
        let path = path.as_ref();
        session
            .runner()
            .feed(&self.def.filename_tensor_name, Tensor::scalar_string(path.to_string_lossy()))
            .fetch(&self.def.save_tensor_name)
            .run()?;
        info!(path = %path.display(), "saved checkpoint");
        Ok(path.to_path_buf())
    }

    /// Assign every variable from the checkpoint at `path`.
    pub fn restore<P: AsRef<Path>>(&self, session: &mut Session, path: P) -> Result<()> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(GraphError::CheckpointNotFound(path.to_path_buf()));
        }
        session
            .runner()
            .feed(&self.def.filename_tensor_name, Tensor::scalar_string(path.to_string_lossy()))
            .add_target(&self.def.restore_op_name)
            .run()?;
        info!(path = %path.display(), "restored checkpoint");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use tempfile::tempdir;

    #[test]
    fn test_checkpoint_creation() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::create(dir.path().join("model.sd")).unwrap();
        assert_eq!(store.get_stats().unwrap().tensor_count, 0);
        assert!(store.tensor_names().unwrap().is_empty());
    }

    #[test]
    fn test_save_and_load_tensor() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::create(dir.path().join("model.sd")).unwrap();

        let bias = Tensor::from(array![[1, 1], [1, 1]]);
        store.save_tensors(&[("bias", &bias)]).unwrap();

        assert_eq!(store.load_tensor("bias").unwrap(), bias);
        let stats = store.get_stats().unwrap();
        assert_eq!(stats.tensor_count, 1);
        assert!(stats.last_saved_at.is_some());
    }

    #[test]
    fn test_save_replaces_existing_key() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::create(dir.path().join("model.sd")).unwrap();

        store.save_tensors(&[("bias", &Tensor::from(array![[1, 1], [1, 1]]))]).unwrap();
        let updated = Tensor::from(array![[5, 6], [7, 8]]);
        store.save_tensors(&[("bias", &updated), ("scale", &Tensor::from(array![[2.0f32]]))]).unwrap();

        assert_eq!(store.load_tensor("bias").unwrap(), updated);
        assert_eq!(store.tensor_names().unwrap(), vec!["bias", "scale"]);
    }

    #[test]
    fn test_missing_key() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::create(dir.path().join("model.sd")).unwrap();
        assert!(matches!(store.load_tensor("bias").unwrap_err(), GraphError::KeyNotFound(_)));
    }

    #[test]
    fn test_open_missing_file() {
        let dir = tempdir().unwrap();
        let err = CheckpointStore::open(dir.path().join("absent.sd")).err().unwrap();
        assert!(matches!(err, GraphError::CheckpointNotFound(_)));
    }

    #[test]
    fn test_snapshot_drops_stale_keys() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::create(dir.path().join("model.sd")).unwrap();

        let old = Tensor::from(array![[1, 1], [1, 1]]);
        store.save_tensors(&[("bias", &old), ("scale", &old)]).unwrap();
        let bias = Tensor::from(array![[3, 3], [3, 3]]);
        store.write_snapshot(&[("bias", &bias)]).unwrap();

        assert_eq!(store.tensor_names().unwrap(), vec!["bias"]);
        assert_eq!(store.load_tensor("bias").unwrap(), bias);
    }

    #[test]
    fn test_open_is_read_only() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("model.sd");
        let bias = Tensor::from(array![[1, 1], [1, 1]]);
        CheckpointStore::create(&path).unwrap().save_tensors(&[("bias", &bias)]).unwrap();

        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_readonly(true);
        std::fs::set_permissions(&path, perms).unwrap();

        let store = CheckpointStore::open(&path).unwrap();
        assert_eq!(store.load_tensor("bias").unwrap(), bias);
        assert!(store.save_tensors(&[("scale", &bias)]).is_err());
        assert_eq!(store.get_stats().unwrap().tensor_count, 1);
    }

    #[test]
    fn test_corrupt_shape_row() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("model.sd");
        let store = CheckpointStore::create(&path).unwrap();
        store.save_tensors(&[("bias", &Tensor::from(array![[1, 1], [1, 1]]))]).unwrap();
        let huge = format!("[{},{}]", 1u64 << 40, 1u64 << 40);
        store
            .conn
            .execute("UPDATE tensors SET shape = ?1 WHERE name = 'bias'", [huge])
            .unwrap();
        assert!(matches!(store.load_tensor("bias").unwrap_err(), GraphError::Decode(_)));
    }

    #[test]
    fn test_saver_def_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("saver.json");
        SaverDef::default().save(&path).unwrap();
        assert_eq!(SaverDef::load(&path).unwrap(), SaverDef::default());
    }
}
